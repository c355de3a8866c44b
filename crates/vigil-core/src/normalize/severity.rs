//! Canonical severity mapping.
//!
//! Native tokens are matched case-insensitively against a fixed table;
//! anything unknown falls back to MEDIUM and the caller is handed a
//! diagnostic reason so the gap is visible instead of silent.

use crate::schema::finding::SeverityLevel;
use std::ops::RangeInclusive;

/// Outcome of normalizing one native severity token.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSeverity {
    pub level: SeverityLevel,
    /// Set when the token was not in the canonical table; contains the
    /// reason string destined for `confidence.reason` and a diagnostic.
    pub unmapped_reason: Option<String>,
}

/// Map a native severity token to the unified level.
pub fn normalize_severity(native: &str) -> NormalizedSeverity {
    let token = native.trim().to_ascii_lowercase();
    let level = match token.as_str() {
        "critical" | "severe" => Some(SeverityLevel::Critical),
        "high" => Some(SeverityLevel::High),
        "medium" | "warning" => Some(SeverityLevel::Medium),
        "low" => Some(SeverityLevel::Low),
        "info" | "informational" | "note" => Some(SeverityLevel::Info),
        _ => None,
    };

    match level {
        Some(level) => NormalizedSeverity {
            level,
            unmapped_reason: None,
        },
        None => NormalizedSeverity {
            level: SeverityLevel::Medium,
            unmapped_reason: Some(format!("severity unmapped: {native}")),
        },
    }
}

/// CVSS band associated with a unified level.
pub fn cvss_band(level: SeverityLevel) -> RangeInclusive<f64> {
    match level {
        SeverityLevel::Critical => 9.0..=10.0,
        SeverityLevel::High => 7.0..=8.9,
        SeverityLevel::Medium => 4.0..=6.9,
        SeverityLevel::Low => 0.1..=3.9,
        SeverityLevel::Info => 0.0..=0.0,
    }
}

/// Clamp a tool-reported CVSS score into the band of its normalized level,
/// keeping scores consistent with the table.
pub fn clamp_to_band(score: f64, level: SeverityLevel) -> f64 {
    let band = cvss_band(level);
    score.clamp(*band.start(), *band.end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_tokens() {
        assert_eq!(
            normalize_severity("CRITICAL").level,
            SeverityLevel::Critical
        );
        assert_eq!(normalize_severity("severe").level, SeverityLevel::Critical);
        assert_eq!(normalize_severity("High").level, SeverityLevel::High);
        assert_eq!(normalize_severity("warning").level, SeverityLevel::Medium);
        assert_eq!(normalize_severity("low").level, SeverityLevel::Low);
        assert_eq!(normalize_severity("note").level, SeverityLevel::Info);
        assert_eq!(
            normalize_severity("informational").level,
            SeverityLevel::Info
        );
    }

    #[test]
    fn unknown_token_maps_to_medium_with_reason() {
        let norm = normalize_severity("weird");
        assert_eq!(norm.level, SeverityLevel::Medium);
        let reason = norm.unmapped_reason.unwrap();
        assert!(reason.contains("severity unmapped"));
        assert!(reason.contains("weird"));
    }

    #[test]
    fn known_token_has_no_reason() {
        assert!(normalize_severity("high").unmapped_reason.is_none());
    }

    #[test]
    fn bands_cover_expected_ranges() {
        assert_eq!(cvss_band(SeverityLevel::Critical), 9.0..=10.0);
        assert_eq!(cvss_band(SeverityLevel::Info), 0.0..=0.0);
    }

    #[test]
    fn clamp_pulls_score_into_band() {
        assert_eq!(clamp_to_band(2.0, SeverityLevel::High), 7.0);
        assert_eq!(clamp_to_band(9.9, SeverityLevel::High), 8.9);
        assert_eq!(clamp_to_band(7.5, SeverityLevel::High), 7.5);
    }
}
