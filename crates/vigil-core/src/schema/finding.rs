//! The unified finding schema.
//!
//! Every tool's native output is normalized into [`Finding`]. The
//! `finding_id` is a deterministic content hash, stable across re-runs on
//! unchanged input, which is what makes cross-tool dedup possible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Normalized severity level, most severe first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeverityLevel {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl SeverityLevel {
    /// Rank for sorting: lower means more severe.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
            Self::Info => 4,
        }
    }
}

impl std::fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Info => "INFO",
        };
        write!(f, "{s}")
    }
}

/// How easily the issue can be exploited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Exploitability {
    Easy,
    Moderate,
    Hard,
    #[default]
    Unknown,
}

/// Triage status of a finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    #[default]
    Pending,
    Verified,
    FalsePositive,
    WontFix,
}

/// Classified vulnerability type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityType {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwe_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owasp_category: Option<String>,
}

/// Where in the target the issue was found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Path relative to the project root, normalized to `/` separators.
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_start: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_end: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_start: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_end: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
}

/// Normalized severity with optional CVSS score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Severity {
    pub level: SeverityLevel,
    /// CVSS score in [0.0, 10.0].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cvss_score: Option<f64>,
    #[serde(default)]
    pub exploitability: Exploitability,
}

/// Confidence that the finding is real.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confidence {
    /// 0..=100
    pub score: u8,
    pub reason: String,
}

impl Confidence {
    pub fn new(score: u8, reason: impl Into<String>) -> Self {
        Self {
            score: score.min(100),
            reason: reason.into(),
        }
    }
}

/// The tool (and rule) that produced a finding, with its raw payload kept
/// verbatim for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTool {
    pub tool_id: String,
    pub rule_id: String,
    pub native_severity: String,
    pub raw_output: serde_json::Value,
}

/// Human-oriented description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Description {
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// Free-form finding metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingMetadata {
    pub detected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

impl Default for FindingMetadata {
    fn default() -> Self {
        Self {
            detected_at: Utc::now(),
            language: None,
            tags: BTreeSet::new(),
            references: Vec::new(),
        }
    }
}

/// A normalized vulnerability record shared across tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub finding_id: String,
    pub scan_session_id: String,
    pub vulnerability_type: VulnerabilityType,
    pub location: Location,
    pub severity: Severity,
    pub confidence: Confidence,
    /// Contributing tools, most credible first. Adapters emit exactly one
    /// entry; aggregation appends further contributors when collapsing
    /// duplicates.
    pub source_tools: Vec<SourceTool>,
    pub description: Description,
    pub metadata: FindingMetadata,
    #[serde(default)]
    pub verification_status: VerificationStatus,
}

impl Finding {
    /// The primary producing tool.
    pub fn primary_tool(&self) -> &SourceTool {
        &self.source_tools[0]
    }

    /// Mark this finding as derived from partial (timed out) output.
    pub fn mark_partial(mut self) -> Self {
        self.metadata.tags.insert("partial".to_string());
        self
    }

    /// Key used for cross-tool correlation of distinct findings.
    pub fn correlation_key(&self) -> (String, Option<u32>, String) {
        (
            canonical_path(&self.location.file_path),
            self.location.line_start,
            self.vulnerability_type.name.clone(),
        )
    }
}

/// Normalize a file path for hashing and correlation: forward slashes,
/// no leading `./`.
pub fn canonical_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized
        .strip_prefix("./")
        .unwrap_or(&normalized)
        .to_string()
}

/// Collapse a code snippet to a whitespace-free fingerprint with trailing
/// punctuation removed, so formatting-only changes do not alter finding ids.
pub fn code_fingerprint(snippet: &str) -> String {
    let stripped: String = snippet.chars().filter(|c| !c.is_whitespace()).collect();
    stripped
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_string()
}

/// Derive the deterministic finding id:
/// `sha256(tool_id ∥ rule_id ∥ canonical(file_path) ∥ line_start ∥ fingerprint)`.
pub fn derive_finding_id(
    tool_id: &str,
    rule_id: &str,
    file_path: &str,
    line_start: Option<u32>,
    code_snippet: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(rule_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_path(file_path).as_bytes());
    hasher.update([0x1f]);
    hasher.update(line_start.unwrap_or(0).to_be_bytes());
    hasher.update([0x1f]);
    if let Some(snippet) = code_snippet {
        hasher.update(code_fingerprint(snippet).as_bytes());
    }
    let digest = hasher.finalize();
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(SeverityLevel::Critical.rank() < SeverityLevel::High.rank());
        assert!(SeverityLevel::Low.rank() < SeverityLevel::Info.rank());
    }

    #[test]
    fn finding_id_is_deterministic() {
        let a = derive_finding_id("semgrep", "sql.injection", "app/db.py", Some(42), Some("cur.execute(q)"));
        let b = derive_finding_id("semgrep", "sql.injection", "app/db.py", Some(42), Some("cur.execute(q)"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn finding_id_ignores_whitespace_and_trailing_punctuation() {
        let a = derive_finding_id("t", "r", "a.py", Some(1), Some("foo( bar );"));
        let b = derive_finding_id("t", "r", "a.py", Some(1), Some("foo(bar)"));
        assert_eq!(a, b);
    }

    #[test]
    fn finding_id_distinguishes_location() {
        let a = derive_finding_id("t", "r", "a.py", Some(1), None);
        let b = derive_finding_id("t", "r", "a.py", Some(2), None);
        assert_ne!(a, b);
    }

    #[test]
    fn canonical_path_normalizes() {
        assert_eq!(canonical_path("./src\\main.rs"), "src/main.rs");
        assert_eq!(canonical_path("app/db.py"), "app/db.py");
    }

    #[test]
    fn confidence_clamps_to_100() {
        let c = Confidence::new(250, "test");
        assert_eq!(c.score, 100);
    }

    #[test]
    fn finding_roundtrip_preserves_id() {
        let finding = Finding {
            finding_id: derive_finding_id("t", "r", "a.py", Some(1), None),
            scan_session_id: "s".into(),
            vulnerability_type: VulnerabilityType {
                name: "SQL Injection".into(),
                cwe_id: Some(89),
                owasp_category: None,
            },
            location: Location {
                file_path: "a.py".into(),
                line_start: Some(1),
                ..Location::default()
            },
            severity: Severity {
                level: SeverityLevel::High,
                cvss_score: Some(8.1),
                exploitability: Exploitability::Easy,
            },
            confidence: Confidence::new(90, "rule match"),
            source_tools: vec![SourceTool {
                tool_id: "t".into(),
                rule_id: "r".into(),
                native_severity: "ERROR".into(),
                raw_output: serde_json::json!({"check_id": "r"}),
            }],
            description: Description {
                summary: "SQL injection".into(),
                ..Description::default()
            },
            metadata: FindingMetadata::default(),
            verification_status: VerificationStatus::Pending,
        };

        let json = serde_json::to_string(&finding).unwrap();
        let back: Finding = serde_json::from_str(&json).unwrap();
        assert_eq!(back.finding_id, finding.finding_id);
        assert_eq!(back, finding);
    }
}
