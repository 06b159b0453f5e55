//! Clip file naming and encoding.
//!
//! Layout: `<clipRoot>/<YYYY-MM-DD>/<sourceID>/<HHMMSS>_<speciesSlug>_<confInt>.wav`,
//! dated in local time. Same-second collisions get a monotonic `_N` suffix.

use crate::audio::decode::encode_wav;
use crate::detection::Detection;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Lowercased scientific name with everything non-alphanumeric collapsed to
/// single hyphens.
pub fn species_slug(scientific_name: &str) -> String {
    let mut slug = String::with_capacity(scientific_name.len());
    let mut last_hyphen = true;
    for c in scientific_name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Reserve a collision-free path for this detection's clip.
pub fn clip_path(root: &Path, detection: &Detection) -> PathBuf {
    let local = detection.event_time.with_timezone(&chrono::Local);
    let dir = root
        .join(local.format("%Y-%m-%d").to_string())
        .join(&detection.source);
    let stem = format!(
        "{}_{}_{}",
        local.format("%H%M%S"),
        species_slug(&detection.scientific_name),
        (detection.confidence * 100.0).round() as u32
    );
    let mut path = dir.join(format!("{stem}.wav"));
    let mut suffix = 0u32;
    while path.exists() {
        suffix += 1;
        path = dir.join(format!("{stem}_{suffix}.wav"));
    }
    path
}

/// Encode canonical PCM to its clip file, applying the configured gain.
pub fn write_clip(root: &Path, detection: &Detection, pcm: &[f32], gain_db: f32) -> Result<PathBuf> {
    let path = clip_path(root, detection);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating clip dir {}", parent.display()))?;
    }
    if gain_db != 0.0 {
        let gain = 10f32.powf(gain_db / 20.0);
        let boosted: Vec<f32> = pcm.iter().map(|&s| s * gain).collect();
        encode_wav(&path, &boosted)?;
    } else {
        encode_wav(&path, pcm)?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::ClipHandle;
    use chrono::Utc;

    fn detection() -> Detection {
        Detection {
            source: "yard".to_string(),
            event_time: Utc::now(),
            species_code: "amecro".to_string(),
            scientific_name: "Corvus brachyrhynchos".to_string(),
            common_name: "American Crow".to_string(),
            confidence: 0.953,
            threshold: 0.8,
            latitude: None,
            longitude: None,
            clip: ClipHandle::None,
            clip_missed: false,
            verified: None,
            comment: None,
        }
    }

    #[test]
    fn slug_collapses_punctuation() {
        assert_eq!(species_slug("Corvus brachyrhynchos"), "corvus-brachyrhynchos");
        assert_eq!(species_slug("  Strix (aluco)! "), "strix-aluco");
    }

    #[test]
    fn path_layout_and_collision_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let d = detection();
        let first = clip_path(dir.path(), &d);
        let date = d.event_time.with_timezone(&chrono::Local).format("%Y-%m-%d").to_string();
        assert!(first.starts_with(dir.path().join(date).join("yard")));
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_corvus-brachyrhynchos_95.wav"));

        std::fs::create_dir_all(first.parent().unwrap()).unwrap();
        std::fs::write(&first, b"taken").unwrap();
        let second = clip_path(dir.path(), &d);
        assert_ne!(first, second);
        assert!(second.file_name().unwrap().to_string_lossy().ends_with("_1.wav"));
    }

    #[test]
    fn write_clip_applies_gain() {
        let dir = tempfile::tempdir().unwrap();
        let d = detection();
        let pcm = vec![0.1f32; crate::audio::SAMPLE_RATE as usize];
        let path = write_clip(dir.path(), &d, &pcm, 6.0).unwrap();
        let decoded = crate::audio::decode::decode_wav(&path).unwrap();
        // +6 dB is very nearly a doubling.
        assert!((decoded[100] - 0.1995).abs() < 0.01, "got {}", decoded[100]);
    }
}
