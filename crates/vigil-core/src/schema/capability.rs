//! Tool capability descriptors.
//!
//! A capability descriptor is a tool's self-description: identity, what it
//! can detect, what input it needs, how it is executed. Descriptors are
//! produced once by `ToolAdapter::describe` at registration time and are
//! read-only thereafter.

use crate::error::{VigilError, VigilResult};
use crate::schema::request::TargetKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Category of security analysis a tool performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCategory {
    /// Static application security testing
    Sast,
    /// Software composition analysis
    Sca,
    /// Dynamic application security testing
    Dast,
    /// Interactive application security testing
    Iast,
    /// Secret and credential scanning
    Secrets,
    /// Container image scanning
    Container,
    /// Fuzz testing
    Fuzzing,
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Sast => "SAST",
            Self::Sca => "SCA",
            Self::Dast => "DAST",
            Self::Iast => "IAST",
            Self::Secrets => "SECRETS",
            Self::Container => "CONTAINER",
            Self::Fuzzing => "FUZZING",
        };
        write!(f, "{s}")
    }
}

/// Detection abilities of a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Languages the tool understands, lowercase.
    #[serde(default)]
    pub supported_languages: BTreeSet<String>,
    /// Vulnerability classes the tool can detect (e.g. "sql_injection").
    #[serde(default)]
    pub detection_types: BTreeSet<String>,
    /// CWE ids the tool's rules cover.
    #[serde(default)]
    pub cwe_coverage: BTreeSet<u32>,
}

/// Input a tool requires before it can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRequirements {
    #[serde(default)]
    pub requires_source_code: bool,
    #[serde(default)]
    pub requires_binary: bool,
    #[serde(default)]
    pub requires_running_app: bool,
    #[serde(default)]
    pub requires_dependency_manifest: bool,
    /// Version control systems the tool can work against.
    #[serde(default)]
    pub supported_vcs: BTreeSet<String>,
    /// Target kinds the tool accepts.
    #[serde(default)]
    pub accepted_targets: BTreeSet<TargetKind>,
}

impl Default for InputRequirements {
    fn default() -> Self {
        Self {
            requires_source_code: true,
            requires_binary: false,
            requires_running_app: false,
            requires_dependency_manifest: false,
            supported_vcs: BTreeSet::from(["git".to_string()]),
            accepted_targets: BTreeSet::from([TargetKind::LocalPath]),
        }
    }
}

/// Shape of a tool's native output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputFormat {
    /// Native format id, e.g. "json" or "sarif".
    pub native_format: String,
    /// Whether the tool can stream results before completion.
    #[serde(default)]
    pub supports_streaming: bool,
    /// Field names expected in the native output.
    #[serde(default)]
    pub result_fields: Vec<String>,
}

/// Minimum resources a tool needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub min_memory_mb: u32,
    pub min_cpu_cores: u32,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            min_memory_mb: 512,
            min_cpu_cores: 1,
        }
    }
}

/// How a tool is executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Default timeout for one run, in seconds.
    pub default_timeout_secs: u64,
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Whether the tool needs outbound network access.
    #[serde(default)]
    pub requires_network: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 600,
            resources: ResourceRequirements::default(),
            requires_network: false,
        }
    }
}

/// Adapter provenance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub license: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    pub adapter_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
}

/// Complete capability declaration for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCapability {
    /// Stable unique id, e.g. "semgrep".
    pub tool_id: String,
    pub tool_name: String,
    pub tool_version: String,
    pub category: ToolCategory,
    pub vendor: String,
    pub description: String,
    pub capabilities: Capabilities,
    pub input_requirements: InputRequirements,
    pub output_format: OutputFormat,
    pub execution: ExecutionConfig,
    pub metadata: ToolMetadata,
}

impl ToolCapability {
    /// Check descriptor invariants. Called at registration time; a
    /// descriptor that fails here never enters the registry.
    pub fn validate(&self) -> VigilResult<()> {
        if self.tool_id.trim().is_empty() {
            return Err(VigilError::Config("tool_id must not be empty".into()));
        }
        if self.execution.default_timeout_secs == 0 {
            return Err(VigilError::Config(format!(
                "tool {}: default_timeout_secs must be positive",
                self.tool_id
            )));
        }
        if self.capabilities.cwe_coverage.contains(&0) {
            return Err(VigilError::Config(format!(
                "tool {}: CWE ids must be positive",
                self.tool_id
            )));
        }
        if self.input_requirements.requires_running_app
            && !self
                .input_requirements
                .accepted_targets
                .contains(&TargetKind::HttpUrl)
        {
            return Err(VigilError::Config(format!(
                "tool {}: requires_running_app implies HTTP_URL targets",
                self.tool_id
            )));
        }
        Ok(())
    }

    /// Whether the tool supports a given language (case-insensitive).
    pub fn supports_language(&self, language: &str) -> bool {
        let needle = language.to_ascii_lowercase();
        self.capabilities
            .supported_languages
            .iter()
            .any(|l| l.eq_ignore_ascii_case(&needle))
    }

    /// Whether the tool can detect a given vulnerability class.
    pub fn detects(&self, detection_type: &str) -> bool {
        self.capabilities
            .detection_types
            .iter()
            .any(|d| d.eq_ignore_ascii_case(detection_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ToolCapability {
        ToolCapability {
            tool_id: "semgrep".into(),
            tool_name: "Semgrep".into(),
            tool_version: "1.50.0".into(),
            category: ToolCategory::Sast,
            vendor: "Semgrep Inc.".into(),
            description: "Lightweight static analysis".into(),
            capabilities: Capabilities {
                supported_languages: BTreeSet::from(["python".into(), "rust".into()]),
                detection_types: BTreeSet::from(["sql_injection".into()]),
                cwe_coverage: BTreeSet::from([89, 79]),
            },
            input_requirements: InputRequirements::default(),
            output_format: OutputFormat {
                native_format: "json".into(),
                supports_streaming: false,
                result_fields: vec!["check_id".into(), "path".into()],
            },
            execution: ExecutionConfig::default(),
            metadata: ToolMetadata::default(),
        }
    }

    #[test]
    fn valid_descriptor_passes() {
        assert!(descriptor().validate().is_ok());
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut cap = descriptor();
        cap.execution.default_timeout_secs = 0;
        assert!(cap.validate().is_err());
    }

    #[test]
    fn zero_cwe_rejected() {
        let mut cap = descriptor();
        cap.capabilities.cwe_coverage.insert(0);
        assert!(cap.validate().is_err());
    }

    #[test]
    fn running_app_requires_http_target() {
        let mut cap = descriptor();
        cap.input_requirements.requires_running_app = true;
        assert!(cap.validate().is_err());

        cap.input_requirements
            .accepted_targets
            .insert(TargetKind::HttpUrl);
        assert!(cap.validate().is_ok());
    }

    #[test]
    fn language_matching_is_case_insensitive() {
        let cap = descriptor();
        assert!(cap.supports_language("Python"));
        assert!(!cap.supports_language("cobol"));
    }

    #[test]
    fn category_serializes_screaming() {
        let json = serde_json::to_string(&ToolCategory::Container).unwrap();
        assert_eq!(json, "\"CONTAINER\"");
    }
}
