//! Syft adapter (SCA inventory).
//!
//! Syft produces an SBOM, not vulnerabilities; each discovered package is
//! recorded as an INFO-level inventory finding so downstream policy and
//! correlation can reason about the dependency surface.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::Path;
use vigil_core::adapter::base::{
    validate_against_descriptor, ExecutionContext, NativeOutput, ToolAdapter,
};
use vigil_core::adapter::process::{find_binary, run_command, CommandSpec};
use vigil_core::error::AdapterError;
use vigil_core::schema::capability::{
    Capabilities, ExecutionConfig, InputRequirements, OutputFormat, ResourceRequirements,
    ToolCapability, ToolCategory, ToolMetadata,
};
use vigil_core::schema::finding::{
    derive_finding_id, Confidence, Description, Exploitability, Finding, FindingMetadata,
    Location, Severity, SeverityLevel, SourceTool, VerificationStatus, VulnerabilityType,
};
use vigil_core::schema::request::{ScanRequest, TargetKind};

pub struct SyftAdapter;

impl SyftAdapter {
    pub fn new() -> Self {
        Self
    }

    fn package_record(
        &self,
        artifact: &serde_json::Value,
        request: &ScanRequest,
    ) -> Option<Finding> {
        let name = artifact.get("name")?.as_str()?;
        let version = artifact
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let pkg_type = artifact
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let manifest = artifact
            .pointer("/locations/0/path")
            .and_then(|v| v.as_str())
            .unwrap_or(&request.target.location);
        let coordinate = format!("{name}@{version}");

        Some(Finding {
            finding_id: derive_finding_id("syft", pkg_type, manifest, None, Some(&coordinate)),
            scan_session_id: request.scan_id.clone(),
            vulnerability_type: VulnerabilityType {
                name: format!("dependency inventory: {name}"),
                cwe_id: None,
                owasp_category: None,
            },
            location: Location {
                file_path: manifest.to_string(),
                code_snippet: Some(coordinate),
                ..Location::default()
            },
            severity: Severity {
                level: SeverityLevel::Info,
                cvss_score: Some(0.0),
                exploitability: Exploitability::Unknown,
            },
            confidence: Confidence::new(95, "package identified in SBOM"),
            source_tools: vec![SourceTool {
                tool_id: "syft".to_string(),
                rule_id: pkg_type.to_string(),
                native_severity: "informational".to_string(),
                raw_output: artifact.clone(),
            }],
            description: Description {
                summary: format!("{pkg_type} package {name} {version}"),
                detail: None,
                impact: None,
                remediation: None,
            },
            metadata: FindingMetadata {
                detected_at: Utc::now(),
                language: artifact
                    .get("language")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(String::from),
                tags: BTreeSet::from(["inventory".to_string(), "dependency".to_string()]),
                references: Vec::new(),
            },
            verification_status: VerificationStatus::Pending,
        })
    }
}

impl Default for SyftAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for SyftAdapter {
    fn describe(&self) -> ToolCapability {
        ToolCapability {
            tool_id: "syft".to_string(),
            tool_name: "Syft".to_string(),
            tool_version: "1.0.0".to_string(),
            category: ToolCategory::Sca,
            vendor: "Anchore".to_string(),
            description: "SBOM generator for filesystems and container images".to_string(),
            capabilities: Capabilities {
                supported_languages: [
                    "python",
                    "javascript",
                    "java",
                    "go",
                    "rust",
                    "ruby",
                    "php",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                detection_types: ["dependency_inventory"].iter().map(|s| s.to_string()).collect(),
                cwe_coverage: BTreeSet::new(),
            },
            input_requirements: InputRequirements {
                requires_source_code: false,
                requires_binary: false,
                requires_running_app: false,
                requires_dependency_manifest: true,
                supported_vcs: BTreeSet::from(["git".to_string()]),
                accepted_targets: BTreeSet::from([
                    TargetKind::LocalPath,
                    TargetKind::ContainerImage,
                ]),
            },
            output_format: OutputFormat {
                native_format: "json".to_string(),
                supports_streaming: false,
                result_fields: ["artifacts", "name", "version", "type"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            execution: ExecutionConfig {
                default_timeout_secs: 600,
                resources: ResourceRequirements {
                    min_memory_mb: 512,
                    min_cpu_cores: 1,
                },
                requires_network: false,
            },
            metadata: ToolMetadata {
                license: "Apache-2.0".to_string(),
                documentation_url: Some("https://github.com/anchore/syft".to_string()),
                adapter_version: "1.0.0".to_string(),
                registered_at: None,
            },
        }
    }

    fn validate(&self, request: &ScanRequest) -> Result<(), AdapterError> {
        validate_against_descriptor(&self.describe(), request)?;
        if request.target.kind == TargetKind::LocalPath
            && !Path::new(&request.target.location).is_dir()
        {
            return Err(AdapterError::invalid_input(
                "syft filesystem target must be a directory",
                "target.location",
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        request: &ScanRequest,
        ctx: &ExecutionContext,
    ) -> Result<NativeOutput, AdapterError> {
        if find_binary("syft").is_none() {
            return Err(AdapterError::tool_missing("syft"));
        }

        let spec = CommandSpec::new("syft")
            .arg("scan")
            .arg(&request.target.location)
            .args(["-o", "json"]);

        let output = run_command(&spec, ctx).await?;
        if output.exit_code != Some(0) {
            return Err(AdapterError::execution_failed(
                output.exit_code,
                output.stderr_tail(),
            ));
        }
        if output.stdout.trim().is_empty() {
            return Ok(NativeOutput::complete(serde_json::json!({"artifacts": []})));
        }
        let payload: serde_json::Value = serde_json::from_str(&output.stdout)
            .map_err(|e| AdapterError::ParseError(format!("syft output is not JSON: {e}")))?;
        Ok(NativeOutput::complete(payload))
    }

    fn parse(
        &self,
        output: &NativeOutput,
        request: &ScanRequest,
    ) -> Result<Vec<Finding>, AdapterError> {
        let artifacts = output
            .payload
            .get("artifacts")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AdapterError::ParseError("missing artifacts array".to_string()))?;

        Ok(artifacts
            .iter()
            .filter_map(|artifact| self.package_record(artifact, request))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::schema::request::ScanTarget;

    fn request() -> ScanRequest {
        ScanRequest::new(ScanTarget::local_path("/tmp/project")).with_scan_id("scan-9")
    }

    fn sample_payload() -> serde_json::Value {
        serde_json::json!({
            "artifacts": [{
                "name": "flask",
                "version": "2.0.1",
                "type": "python",
                "language": "python",
                "locations": [{"path": "requirements.txt"}]
            }, {
                "name": "left-pad",
                "version": "1.3.0",
                "type": "npm",
                "language": "javascript",
                "locations": [{"path": "package-lock.json"}]
            }]
        })
    }

    #[test]
    fn packages_become_info_findings() {
        let adapter = SyftAdapter::new();
        let output = NativeOutput::complete(sample_payload());
        let findings = adapter.parse(&output, &request()).unwrap();

        assert_eq!(findings.len(), 2);
        assert!(findings
            .iter()
            .all(|f| f.severity.level == SeverityLevel::Info));
        assert_eq!(findings[0].location.file_path, "requirements.txt");
        assert_eq!(
            findings[0].location.code_snippet.as_deref(),
            Some("flask@2.0.1")
        );
        assert!(findings[0].metadata.tags.contains("inventory"));
    }

    #[test]
    fn empty_sbom_is_empty() {
        let adapter = SyftAdapter::new();
        let output = NativeOutput::complete(serde_json::json!({"artifacts": []}));
        assert!(adapter.parse(&output, &request()).unwrap().is_empty());
    }

    #[test]
    fn distinct_packages_get_distinct_ids() {
        let adapter = SyftAdapter::new();
        let output = NativeOutput::complete(sample_payload());
        let findings = adapter.parse(&output, &request()).unwrap();
        assert_ne!(findings[0].finding_id, findings[1].finding_id);
    }
}
