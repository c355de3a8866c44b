//! Trivy adapter (container image and filesystem vulnerability scanning).
//!
//! Wraps `trivy image` / `trivy fs` with JSON output and maps
//! `Results[].Vulnerabilities[]` into unified findings.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use tracing::warn;
use vigil_core::adapter::base::{
    validate_against_descriptor, ExecutionContext, NativeOutput, ToolAdapter,
};
use vigil_core::adapter::process::{find_binary, run_command, CommandSpec};
use vigil_core::error::AdapterError;
use vigil_core::normalize::cwe::extract_cwe_id;
use vigil_core::normalize::severity::normalize_severity;
use vigil_core::schema::capability::{
    Capabilities, ExecutionConfig, InputRequirements, OutputFormat, ResourceRequirements,
    ToolCapability, ToolCategory, ToolMetadata,
};
use vigil_core::schema::finding::{
    derive_finding_id, Confidence, Description, Exploitability, Finding, FindingMetadata,
    Location, Severity, SourceTool, VerificationStatus, VulnerabilityType,
};
use vigil_core::schema::request::{ScanRequest, TargetKind};

pub struct TrivyAdapter;

impl TrivyAdapter {
    pub fn new() -> Self {
        Self
    }

    fn subcommand(kind: TargetKind) -> &'static str {
        match kind {
            TargetKind::ContainerImage => "image",
            _ => "fs",
        }
    }

    fn parse_vulnerability(
        &self,
        target: &str,
        entry: &serde_json::Value,
        request: &ScanRequest,
    ) -> Option<Finding> {
        let vuln_id = entry.get("VulnerabilityID")?.as_str()?;
        let pkg_name = entry
            .get("PkgName")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let installed = entry
            .get("InstalledVersion")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let native_severity = entry
            .get("Severity")
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN")
            .to_string();
        let title = entry
            .get("Title")
            .and_then(|v| v.as_str())
            .unwrap_or(vuln_id)
            .to_string();

        let normalized = normalize_severity(&native_severity);
        let confidence = match &normalized.unmapped_reason {
            Some(reason) => Confidence::new(50, reason.clone()),
            None => Confidence::new(85, "published vulnerability database match"),
        };

        let cvss_score = entry
            .pointer("/CVSS/nvd/V3Score")
            .or_else(|| entry.pointer("/CVSS/redhat/V3Score"))
            .and_then(|v| v.as_f64());

        let cwe_id = entry
            .get("CweIDs")
            .and_then(|v| v.as_array())
            .and_then(|items| items.iter().filter_map(|v| v.as_str()).find_map(extract_cwe_id));

        let coordinate = format!("{pkg_name}@{installed}");
        let references = entry
            .get("References")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .take(8)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let remediation = entry
            .get("FixedVersion")
            .and_then(|v| v.as_str())
            .map(|fixed| format!("upgrade {pkg_name} to {fixed}"));

        Some(Finding {
            finding_id: derive_finding_id("trivy", vuln_id, target, None, Some(&coordinate)),
            scan_session_id: request.scan_id.clone(),
            vulnerability_type: VulnerabilityType {
                name: title.clone(),
                cwe_id,
                owasp_category: None,
            },
            location: Location {
                file_path: target.to_string(),
                code_snippet: Some(coordinate),
                ..Location::default()
            },
            severity: Severity {
                level: normalized.level,
                cvss_score,
                exploitability: Exploitability::Unknown,
            },
            confidence,
            source_tools: vec![SourceTool {
                tool_id: "trivy".to_string(),
                rule_id: vuln_id.to_string(),
                native_severity,
                raw_output: entry.clone(),
            }],
            description: Description {
                summary: title,
                detail: entry
                    .get("Description")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                impact: None,
                remediation,
            },
            metadata: FindingMetadata {
                detected_at: Utc::now(),
                language: None,
                tags: BTreeSet::from(["dependency".to_string()]),
                references,
            },
            verification_status: VerificationStatus::Pending,
        })
    }
}

impl Default for TrivyAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for TrivyAdapter {
    fn describe(&self) -> ToolCapability {
        ToolCapability {
            tool_id: "trivy".to_string(),
            tool_name: "Trivy".to_string(),
            tool_version: "0.50.0".to_string(),
            category: ToolCategory::Container,
            vendor: "Aqua Security".to_string(),
            description: "Vulnerability scanner for container images, filesystems and repositories"
                .to_string(),
            capabilities: Capabilities {
                supported_languages: BTreeSet::new(),
                detection_types: ["known_cve", "vulnerable_dependency", "misconfiguration"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
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
                result_fields: ["Results", "VulnerabilityID", "PkgName", "Severity"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            execution: ExecutionConfig {
                default_timeout_secs: 900,
                resources: ResourceRequirements {
                    min_memory_mb: 1024,
                    min_cpu_cores: 1,
                },
                // Vulnerability database updates need the network.
                requires_network: true,
            },
            metadata: ToolMetadata {
                license: "Apache-2.0".to_string(),
                documentation_url: Some("https://aquasecurity.github.io/trivy/".to_string()),
                adapter_version: "1.0.0".to_string(),
                registered_at: None,
            },
        }
    }

    fn validate(&self, request: &ScanRequest) -> Result<(), AdapterError> {
        validate_against_descriptor(&self.describe(), request)
    }

    async fn execute(
        &self,
        request: &ScanRequest,
        ctx: &ExecutionContext,
    ) -> Result<NativeOutput, AdapterError> {
        if find_binary("trivy").is_none() {
            return Err(AdapterError::tool_missing("trivy"));
        }

        let spec = CommandSpec::new("trivy")
            .arg(Self::subcommand(request.target.kind))
            .args(["--format", "json"])
            .args(["--quiet"])
            .arg(&request.target.location);

        let output = run_command(&spec, ctx).await?;
        if output.exit_code != Some(0) {
            return Err(AdapterError::execution_failed(
                output.exit_code,
                output.stderr_tail(),
            ));
        }
        let payload: serde_json::Value = serde_json::from_str(&output.stdout)
            .map_err(|e| AdapterError::ParseError(format!("trivy output is not JSON: {e}")))?;
        Ok(NativeOutput::complete(payload))
    }

    fn parse(
        &self,
        output: &NativeOutput,
        request: &ScanRequest,
    ) -> Result<Vec<Finding>, AdapterError> {
        let results = match output.payload.get("Results").and_then(|v| v.as_array()) {
            Some(results) => results,
            // A clean scan can omit Results entirely.
            None => return Ok(Vec::new()),
        };

        let mut findings = Vec::new();
        for result in results {
            let target = result
                .get("Target")
                .and_then(|v| v.as_str())
                .unwrap_or(&request.target.location);
            let Some(vulnerabilities) = result.get("Vulnerabilities").and_then(|v| v.as_array())
            else {
                continue;
            };
            for entry in vulnerabilities {
                match self.parse_vulnerability(target, entry, request) {
                    Some(finding) => findings.push(finding),
                    None => warn!("skipping malformed trivy vulnerability entry"),
                }
            }
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::schema::finding::SeverityLevel;
    use vigil_core::schema::request::ScanTarget;

    fn request() -> ScanRequest {
        ScanRequest::new(ScanTarget::container_image("alpine:3.14"))
            .with_scan_id("scan-7")
            .with_network_allowed(true)
    }

    fn sample_payload() -> serde_json::Value {
        serde_json::json!({
            "Results": [{
                "Target": "alpine:3.14 (alpine 3.14.2)",
                "Vulnerabilities": [{
                    "VulnerabilityID": "CVE-2021-36159",
                    "PkgName": "apk-tools",
                    "InstalledVersion": "2.12.5-r1",
                    "FixedVersion": "2.12.6-r0",
                    "Severity": "CRITICAL",
                    "Title": "libfetch buffer over-read",
                    "Description": "libfetch before 2021-07-26 mishandles numeric strings",
                    "CweIDs": ["CWE-125"],
                    "CVSS": {"nvd": {"V3Score": 9.1}},
                    "References": ["https://nvd.nist.gov/vuln/detail/CVE-2021-36159"]
                }]
            }]
        })
    }

    #[test]
    fn parse_maps_cve_fields() {
        let adapter = TrivyAdapter::new();
        let output = NativeOutput::complete(sample_payload());
        let findings = adapter.parse(&output, &request()).unwrap();

        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.severity.level, SeverityLevel::Critical);
        assert_eq!(f.severity.cvss_score, Some(9.1));
        assert_eq!(f.vulnerability_type.cwe_id, Some(125));
        assert_eq!(f.primary_tool().rule_id, "CVE-2021-36159");
        assert_eq!(
            f.description.remediation.as_deref(),
            Some("upgrade apk-tools to 2.12.6-r0")
        );
        assert!(f.metadata.tags.contains("dependency"));
    }

    #[test]
    fn clean_scan_without_results_is_empty() {
        let adapter = TrivyAdapter::new();
        let output = NativeOutput::complete(serde_json::json!({"SchemaVersion": 2}));
        assert!(adapter.parse(&output, &request()).unwrap().is_empty());
    }

    #[test]
    fn unknown_severity_token_is_flagged() {
        let adapter = TrivyAdapter::new();
        let mut payload = sample_payload();
        payload["Results"][0]["Vulnerabilities"][0]["Severity"] = serde_json::json!("UNKNOWN");
        let output = NativeOutput::complete(payload);
        let findings = adapter.parse(&output, &request()).unwrap();

        assert_eq!(findings[0].severity.level, SeverityLevel::Medium);
        assert!(findings[0].confidence.reason.contains("severity unmapped"));
    }

    #[test]
    fn validate_requires_network() {
        let adapter = TrivyAdapter::new();
        let denied = ScanRequest::new(ScanTarget::container_image("alpine:3.14"));
        assert!(matches!(
            adapter.validate(&denied),
            Err(AdapterError::InvalidInput { .. })
        ));
        assert!(adapter.validate(&request()).is_ok());
    }

    #[test]
    fn finding_ids_stable_across_parses() {
        let adapter = TrivyAdapter::new();
        let output = NativeOutput::complete(sample_payload());
        let a = adapter.parse(&output, &request()).unwrap();
        let b = adapter.parse(&output, &request()).unwrap();
        assert_eq!(a[0].finding_id, b[0].finding_id);
    }
}
