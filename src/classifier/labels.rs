//! Species label tables: code to scientific and locale-resolved common name.
//!
//! The labels directory holds `codes.txt` (one species code per model output
//! index) and `labels_<locale>.txt` files with `code,scientific,common`
//! lines. Both are static, loaded once at startup; a malformed table is a
//! fatal configuration error.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesLabel {
    pub scientific: String,
    pub common: String,
}

#[derive(Debug, Default)]
pub struct LabelTable {
    by_code: HashMap<String, SpeciesLabel>,
}

impl LabelTable {
    /// Load `labels_<locale>.txt` from the labels directory, falling back to
    /// the English table when the requested locale has no file.
    pub fn load(labels_dir: &Path, locale: &str) -> Result<LabelTable> {
        let mut path = labels_dir.join(format!("labels_{locale}.txt"));
        if !path.exists() && locale != "en" {
            warn!(locale, "no label table for locale, falling back to en");
            path = labels_dir.join("labels_en.txt");
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading label table {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<LabelTable> {
        let mut by_code = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(3, ',');
            let (code, scientific, common) = match (parts.next(), parts.next(), parts.next()) {
                (Some(c), Some(s), Some(n)) => (c.trim(), s.trim(), n.trim()),
                _ => bail!("line {}: expected code,scientific,common", lineno + 1),
            };
            if code.is_empty() || scientific.is_empty() {
                bail!("line {}: empty code or scientific name", lineno + 1);
            }
            by_code.insert(
                code.to_string(),
                SpeciesLabel { scientific: scientific.to_string(), common: common.to_string() },
            );
        }
        if by_code.is_empty() {
            bail!("label table contains no entries");
        }
        Ok(LabelTable { by_code })
    }

    pub fn resolve(&self, code: &str) -> Option<&SpeciesLabel> {
        self.by_code.get(code)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

/// Load `codes.txt`: one species code per model output index.
pub fn load_codes(labels_dir: &Path) -> Result<Vec<String>> {
    let path = labels_dir.join("codes.txt");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading model codes {}", path.display()))?;
    let codes: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect();
    if codes.is_empty() {
        bail!("{}: no codes", path.display());
    }
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resolves_codes() {
        let table = LabelTable::parse(
            "# comment\namecro,Corvus brachyrhynchos,American Crow\nnorcar,Cardinalis cardinalis,Northern Cardinal\n",
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        let label = table.resolve("amecro").unwrap();
        assert_eq!(label.scientific, "Corvus brachyrhynchos");
        assert_eq!(label.common, "American Crow");
        assert!(table.resolve("nosuch").is_none());
    }

    #[test]
    fn parse_rejects_short_lines() {
        assert!(LabelTable::parse("amecro,Corvus\n").is_err());
        assert!(LabelTable::parse("").is_err());
    }

    #[test]
    fn load_falls_back_to_english() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("labels_en.txt"), "amecro,Corvus brachyrhynchos,American Crow\n")
            .unwrap();
        let table = LabelTable::load(dir.path(), "fi").unwrap();
        assert!(table.resolve("amecro").is_some());
    }

    #[test]
    fn codes_preserve_model_output_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("codes.txt"), "amecro\nnorcar\n\n# tail\n").unwrap();
        let codes = load_codes(dir.path()).unwrap();
        assert_eq!(codes, vec!["amecro", "norcar"]);
    }
}
