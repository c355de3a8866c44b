//! Scan requests.
//!
//! A scan request is the engine-owned, short-lived description of one tool
//! invocation against one target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of thing is being scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetKind {
    LocalPath,
    GitRepo,
    ContainerImage,
    HttpUrl,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LocalPath => "LOCAL_PATH",
            Self::GitRepo => "GIT_REPO",
            Self::ContainerImage => "CONTAINER_IMAGE",
            Self::HttpUrl => "HTTP_URL",
        };
        write!(f, "{s}")
    }
}

/// The scan target: kind plus locator and optional VCS coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanTarget {
    pub kind: TargetKind,
    /// Filesystem path, repository URL, image reference or HTTP URL
    /// depending on `kind`.
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Image digest for `ContainerImage` targets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ScanTarget {
    pub fn local_path(path: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::LocalPath,
            location: path.into(),
            branch: None,
            commit: None,
            digest: None,
        }
    }

    pub fn http_url(url: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::HttpUrl,
            location: url.into(),
            branch: None,
            commit: None,
            digest: None,
        }
    }

    pub fn container_image(image: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::ContainerImage,
            location: image.into(),
            branch: None,
            commit: None,
            digest: None,
        }
    }
}

/// Tool-facing options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Language hint for tools that need one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Custom rule set reference (tool-specific meaning).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<String>,
    /// Glob-style paths excluded from scanning.
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    /// Findings below this level are marked non-conformant by the
    /// validation node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity_floor: Option<crate::schema::finding::SeverityLevel>,
    /// CWE ids whose findings are marked non-conformant.
    #[serde(default)]
    pub cwe_exclusions: Vec<u32>,
    /// Adapter to fail over to, once, when the primary reports ToolMissing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_tool_id: Option<String>,
}

/// Whether this is a full or incremental scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanType {
    #[default]
    Full,
    Incremental,
}

/// Where the request came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default)]
    pub scan_type: ScanType,
    /// Opaque principal identifier of whoever triggered the scan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
}

/// Resource limits for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanLimits {
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_findings: Option<usize>,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            timeout_secs: 1800,
            max_findings: None,
        }
    }
}

/// A request for one tool run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub scan_id: String,
    pub target: ScanTarget,
    #[serde(default)]
    pub options: ScanOptions,
    #[serde(default)]
    pub context: ScanContext,
    #[serde(default)]
    pub limits: ScanLimits,
    #[serde(default)]
    pub network_allowed: bool,
    pub created_at: DateTime<Utc>,
}

impl ScanRequest {
    pub fn new(target: ScanTarget) -> Self {
        Self {
            scan_id: Uuid::new_v4().to_string(),
            target,
            options: ScanOptions::default(),
            context: ScanContext::default(),
            limits: ScanLimits::default(),
            network_allowed: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_scan_id(mut self, scan_id: impl Into<String>) -> Self {
        self.scan_id = scan_id.into();
        self
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_limits(mut self, limits: ScanLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_network_allowed(mut self, allowed: bool) -> Self {
        self.network_allowed = allowed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = ScanRequest::new(ScanTarget::local_path("/tmp/project"))
            .with_scan_id("scan-1")
            .with_network_allowed(true);
        let json = serde_json::to_string(&req).unwrap();
        let back: ScanRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req, back);
        assert_eq!(back.target.kind, TargetKind::LocalPath);
    }

    #[test]
    fn target_kind_wire_format() {
        assert_eq!(
            serde_json::to_string(&TargetKind::ContainerImage).unwrap(),
            "\"CONTAINER_IMAGE\""
        );
    }

    #[test]
    fn defaults_deny_network() {
        let req = ScanRequest::new(ScanTarget::http_url("http://localhost:8080"));
        assert!(!req.network_allowed);
        assert!(req.limits.max_findings.is_none());
    }
}
