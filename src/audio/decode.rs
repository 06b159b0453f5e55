//! Offline audio file decoding and clip encoding.
//!
//! WAV files at the canonical layout are read directly with hound; anything
//! else (other rates, channel counts, or compressed containers) goes through
//! the same ffmpeg decode invocation the network capture uses.

use crate::audio::resampler::CanonicalResampler;
use crate::audio::SAMPLE_RATE;
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};

/// Decode any supported audio file to canonical mono f32.
pub fn decode_file(path: &Path) -> Result<Vec<f32>> {
    let is_wav = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);
    if is_wav {
        decode_wav(path)
    } else {
        decode_with_ffmpeg(path)
    }
}

/// Read a WAV file, downmixing and resampling to the canonical format.
pub fn decode_wav(path: &Path) -> Result<Vec<f32>> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        bail!("{}: zero channels", path.display());
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => {
            reader.samples::<f32>().collect::<std::result::Result<_, _>>()?
        }
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    if spec.sample_rate == SAMPLE_RATE && channels == 1 {
        return Ok(interleaved);
    }

    // Reuse the capture-path converter; pad one resampler chunk of silence
    // so the FFT latency tail is flushed, then trim to the expected length.
    let mut resampler = CanonicalResampler::new(spec.sample_rate, channels)?;
    let expected =
        (interleaved.len() / channels) as u64 * SAMPLE_RATE as u64 / spec.sample_rate as u64;
    let mut out = Vec::with_capacity(expected as usize);
    for frame in resampler.push_interleaved(&interleaved)? {
        out.extend_from_slice(&frame);
    }
    let pad = vec![0.0f32; (spec.sample_rate as usize / 2) * channels];
    while (out.len() as u64) < expected {
        let frames = resampler.push_interleaved(&pad)?;
        if frames.is_empty() {
            break;
        }
        for frame in frames {
            out.extend_from_slice(&frame);
        }
    }
    out.truncate(expected as usize);
    Ok(out)
}

/// Decode through ffmpeg to canonical s16le PCM.
fn decode_with_ffmpeg(path: &Path) -> Result<Vec<f32>> {
    let output = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-nostdin")
        .arg("-i")
        .arg(path)
        .arg("-f")
        .arg("s16le")
        .arg("-ar")
        .arg(SAMPLE_RATE.to_string())
        .arg("-ac")
        .arg("1")
        .arg("pipe:1")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("running ffmpeg for {}", path.display()))?;
    if !output.status.success() {
        bail!(
            "ffmpeg failed on {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let ints: Vec<i16> = bytemuck::pod_collect_to_vec(&output.stdout[..output.stdout.len() & !1]);
    Ok(ints.iter().map(|&v| f32::from(v) / 32_768.0).collect())
}

/// Write canonical mono PCM as 16-bit WAV.
pub fn encode_wav(path: &Path, pcm: &[f32]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer =
        hound::WavWriter::create(path, spec).with_context(|| format!("creating {}", path.display()))?;
    for &s in pcm {
        let v = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
        writer.write_sample(v)?;
    }
    writer.finalize().context("finalizing wav")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_roundtrip_preserves_length_and_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let pcm: Vec<f32> = (0..SAMPLE_RATE as usize)
            .map(|i| (i as f32 * 0.01).sin() * 0.5)
            .collect();
        encode_wav(&path, &pcm).unwrap();
        let decoded = decode_wav(&path).unwrap();
        assert_eq!(decoded.len(), pcm.len());
        // 16-bit quantization: equal to within one LSB step.
        for (a, b) in pcm.iter().zip(&decoded) {
            assert!((a - b).abs() < 2.0 / 32_768.0);
        }
    }

    #[test]
    fn stereo_wav_is_downmixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..SAMPLE_RATE {
            writer.write_sample(16_000i16).unwrap(); // L
            writer.write_sample(0i16).unwrap(); // R
        }
        writer.finalize().unwrap();

        let decoded = decode_wav(&path).unwrap();
        assert_eq!(decoded.len(), SAMPLE_RATE as usize);
        let mid = decoded[decoded.len() / 2];
        assert!((mid - 0.244).abs() < 0.01, "expected ~half of L, got {mid}");
    }
}
