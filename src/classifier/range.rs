//! Species range model: location/season plausibility scores.
//!
//! The table is a site-specific export: a JSON map from species code to 48
//! weekly occurrence scores (four weeks per month), produced for the
//! configured coordinates. The "latest" variant interpolates between
//! adjacent weeks; "legacy" reads the raw week bucket. Species absent from
//! the table are unmodeled and pass.

use crate::config::RangeVariant;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use std::path::Path;

/// Weeks per modeled year: 4 buckets per month.
pub const WEEKS: usize = 48;

#[derive(Debug)]
pub struct RangeModel {
    scores: HashMap<String, Vec<f32>>,
    variant: RangeVariant,
    floor: f32,
}

impl RangeModel {
    pub fn load(table: &Path, variant: RangeVariant, floor: f32) -> Result<RangeModel> {
        let text = std::fs::read_to_string(table)
            .with_context(|| format!("reading range table {}", table.display()))?;
        let scores: HashMap<String, Vec<f32>> = serde_json::from_str(&text)
            .with_context(|| format!("parsing range table {}", table.display()))?;
        for (code, weeks) in &scores {
            if weeks.len() != WEEKS {
                bail!("range table {}: species {code} has {} weeks, expected {WEEKS}", table.display(), weeks.len());
            }
        }
        Ok(RangeModel { scores, variant, floor })
    }

    #[cfg(test)]
    pub fn from_scores(
        scores: HashMap<String, Vec<f32>>,
        variant: RangeVariant,
        floor: f32,
    ) -> RangeModel {
        RangeModel { scores, variant, floor }
    }

    /// Modeled occurrence probability for a species on a date; None when the
    /// species is not in the table.
    pub fn score(&self, code: &str, at: DateTime<Utc>) -> Option<f32> {
        let weeks = self.scores.get(code)?;
        let (week, fraction) = week_of(at);
        Some(match self.variant {
            RangeVariant::Legacy => weeks[week],
            RangeVariant::Latest => {
                let next = weeks[(week + 1) % WEEKS];
                weeks[week] * (1.0 - fraction) + next * fraction
            }
        })
    }

    /// True when the species is plausible at this date (or unmodeled).
    pub fn admits(&self, code: &str, at: DateTime<Utc>) -> bool {
        match self.score(code, at) {
            Some(s) => s >= self.floor,
            None => true,
        }
    }

    /// Species codes admitted on `at`, sorted. Unmodeled species are not
    /// listed; only the table knows them.
    pub fn admitted(&self, at: DateTime<Utc>) -> Vec<(&str, f32)> {
        let mut out: Vec<(&str, f32)> = self
            .scores
            .keys()
            .filter_map(|code| {
                let s = self.score(code, at)?;
                (s >= self.floor).then_some((code.as_str(), s))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }
}

/// Map a date to its 48-week bucket plus the fraction consumed within it.
fn week_of(at: DateTime<Utc>) -> (usize, f32) {
    let month = at.month0() as usize; // 0..12
    let day = at.day0() as usize; // 0..31
    let bucket = (day / 7).min(3);
    let week = month * 4 + bucket;
    let fraction = ((day % 7) as f32 / 7.0).min(1.0);
    (week.min(WEEKS - 1), fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn model(variant: RangeVariant) -> RangeModel {
        let mut scores = HashMap::new();
        // High in the first half of the year, zero in the second.
        let mut weeks = vec![0.9f32; 24];
        weeks.extend(vec![0.0f32; 24]);
        scores.insert("amecro".to_string(), weeks);
        RangeModel::from_scores(scores, variant, 0.05)
    }

    #[test]
    fn admits_in_season_rejects_out_of_season() {
        let m = model(RangeVariant::Legacy);
        let spring = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let autumn = Utc.with_ymd_and_hms(2025, 10, 10, 12, 0, 0).unwrap();
        assert!(m.admits("amecro", spring));
        assert!(!m.admits("amecro", autumn));
    }

    #[test]
    fn unmodeled_species_pass() {
        let m = model(RangeVariant::Legacy);
        let any = Utc.with_ymd_and_hms(2025, 10, 10, 12, 0, 0).unwrap();
        assert!(m.admits("nosuch", any));
    }

    #[test]
    fn latest_variant_interpolates_across_the_boundary() {
        let m = model(RangeVariant::Latest);
        // Last modeled week of June (week 23) leads into week 24 (score 0);
        // partway through the week the interpolated score has decayed.
        let late_june = Utc.with_ymd_and_hms(2025, 6, 26, 12, 0, 0).unwrap();
        let s = m.score("amecro", late_june).unwrap();
        assert!(s < 0.9 && s > 0.0, "expected decayed score, got {s}");
    }

    #[test]
    fn week_buckets_cover_the_year() {
        let jan1 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let dec31 = Utc.with_ymd_and_hms(2025, 12, 31, 23, 0, 0).unwrap();
        assert_eq!(week_of(jan1).0, 0);
        assert_eq!(week_of(dec31).0, WEEKS - 1);
    }

    #[test]
    fn admitted_lists_only_in_season_species() {
        let m = model(RangeVariant::Legacy);
        let spring = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let autumn = Utc.with_ymd_and_hms(2025, 10, 10, 12, 0, 0).unwrap();
        assert_eq!(m.admitted(spring).len(), 1);
        assert!(m.admitted(autumn).is_empty());
    }
}
