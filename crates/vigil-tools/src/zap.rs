//! OWASP ZAP adapter (DAST).
//!
//! Drives a ZAP baseline scan against a running application and maps the
//! JSON report's `site[].alerts[]` into unified findings.

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

const BASELINE_SCRIPT: &str = "zap-baseline.py";

pub struct ZapAdapter;

impl ZapAdapter {
    pub fn new() -> Self {
        Self
    }

    /// ZAP risk codes: 3 high, 2 medium, 1 low, 0 informational.
    fn risk_token(riskcode: &str) -> &str {
        match riskcode {
            "3" => "high",
            "2" => "medium",
            "1" => "low",
            "0" => "info",
            other => other,
        }
    }

    /// ZAP reports its own confidence 0..=4 alongside risk.
    fn confidence_score(zap_confidence: &str) -> u8 {
        match zap_confidence {
            "4" => 95,
            "3" => 85,
            "2" => 70,
            "1" => 50,
            _ => 40,
        }
    }

    fn parse_alert(
        &self,
        site_name: &str,
        alert: &serde_json::Value,
        request: &ScanRequest,
    ) -> Option<Finding> {
        let name = alert.get("alert")?.as_str()?;
        let plugin_id = alert
            .get("pluginid")
            .and_then(|v| v.as_str())
            .unwrap_or("0");
        let riskcode = alert
            .get("riskcode")
            .and_then(|v| v.as_str())
            .unwrap_or("0")
            .to_string();
        let riskdesc = alert
            .get("riskdesc")
            .and_then(|v| v.as_str())
            .unwrap_or(&riskcode)
            .to_string();
        let zap_confidence = alert
            .get("confidence")
            .and_then(|v| v.as_str())
            .unwrap_or("2");

        let instance = alert.pointer("/instances/0");
        let uri = instance
            .and_then(|i| i.get("uri"))
            .and_then(|v| v.as_str())
            .unwrap_or(site_name);
        let evidence = instance
            .and_then(|i| i.get("evidence"))
            .and_then(|v| v.as_str())
            .map(String::from);

        let normalized = normalize_severity(Self::risk_token(&riskcode));
        let confidence = match &normalized.unmapped_reason {
            Some(reason) => Confidence::new(40, reason.clone()),
            None => Confidence::new(
                Self::confidence_score(zap_confidence),
                "observed against running application",
            ),
        };

        let cwe_id = alert
            .get("cweid")
            .and_then(|v| v.as_str())
            .and_then(|raw| raw.parse::<u32>().ok().filter(|id| *id > 0))
            .or_else(|| extract_cwe_id(&riskdesc));

        Some(Finding {
            finding_id: derive_finding_id("zap", plugin_id, uri, None, evidence.as_deref()),
            scan_session_id: request.scan_id.clone(),
            vulnerability_type: VulnerabilityType {
                name: name.to_string(),
                cwe_id,
                owasp_category: None,
            },
            location: Location {
                file_path: uri.to_string(),
                code_snippet: evidence,
                ..Location::default()
            },
            severity: Severity {
                level: normalized.level,
                cvss_score: None,
                exploitability: Exploitability::Moderate,
            },
            confidence,
            source_tools: vec![SourceTool {
                tool_id: "zap".to_string(),
                rule_id: plugin_id.to_string(),
                native_severity: riskdesc,
                raw_output: alert.clone(),
            }],
            description: Description {
                summary: name.to_string(),
                detail: alert.get("desc").and_then(|v| v.as_str()).map(String::from),
                impact: None,
                remediation: alert
                    .get("solution")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            },
            metadata: FindingMetadata {
                detected_at: Utc::now(),
                language: None,
                tags: BTreeSet::from(["dast".to_string()]),
                references: alert
                    .get("reference")
                    .and_then(|v| v.as_str())
                    .map(|refs| refs.lines().map(String::from).collect())
                    .unwrap_or_default(),
            },
            verification_status: VerificationStatus::Pending,
        })
    }
}

impl Default for ZapAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for ZapAdapter {
    fn describe(&self) -> ToolCapability {
        ToolCapability {
            tool_id: "zap".to_string(),
            tool_name: "OWASP ZAP".to_string(),
            tool_version: "2.14.0".to_string(),
            category: ToolCategory::Dast,
            vendor: "OWASP".to_string(),
            description: "Dynamic application security testing via baseline crawl and passive scan"
                .to_string(),
            capabilities: Capabilities {
                supported_languages: BTreeSet::new(),
                detection_types: [
                    "xss",
                    "sql_injection",
                    "missing_security_headers",
                    "insecure_cookies",
                    "open_redirect",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                cwe_coverage: [79, 89, 352, 601, 1021].into_iter().collect(),
            },
            input_requirements: InputRequirements {
                requires_source_code: false,
                requires_binary: false,
                requires_running_app: true,
                requires_dependency_manifest: false,
                supported_vcs: BTreeSet::new(),
                accepted_targets: BTreeSet::from([TargetKind::HttpUrl]),
            },
            output_format: OutputFormat {
                native_format: "json".to_string(),
                supports_streaming: false,
                result_fields: ["site", "alerts", "riskcode", "instances"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            execution: ExecutionConfig {
                default_timeout_secs: 3600,
                resources: ResourceRequirements {
                    min_memory_mb: 2048,
                    min_cpu_cores: 2,
                },
                requires_network: true,
            },
            metadata: ToolMetadata {
                license: "Apache-2.0".to_string(),
                documentation_url: Some("https://www.zaproxy.org/docs/".to_string()),
                adapter_version: "1.0.0".to_string(),
                registered_at: None,
            },
        }
    }

    fn validate(&self, request: &ScanRequest) -> Result<(), AdapterError> {
        validate_against_descriptor(&self.describe(), request)?;
        if !request.target.location.starts_with("http://")
            && !request.target.location.starts_with("https://")
        {
            return Err(AdapterError::invalid_input(
                "zap target must be an http(s) URL",
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
        if find_binary(BASELINE_SCRIPT).is_none() {
            return Err(AdapterError::tool_missing(BASELINE_SCRIPT));
        }

        // Report name carries the scan id so concurrent runs sharing a
        // workdir cannot clobber each other.
        let report = ctx
            .workdir
            .join(format!("zap-report-{}.json", request.scan_id));
        let report_path = report.to_string_lossy().to_string();
        let spec = CommandSpec::new(BASELINE_SCRIPT)
            .args(["-t", &request.target.location])
            .args(["-J", &report_path])
            .arg("-I");

        let output = run_command(&spec, ctx).await?;

        // Baseline exits 1/2 when alerts are raised; only >2 is an
        // operational failure.
        if let Some(code) = output.exit_code {
            if code > 2 {
                return Err(AdapterError::execution_failed(
                    Some(code),
                    output.stderr_tail(),
                ));
            }
        }

        let raw = tokio::fs::read_to_string(&report)
            .await
            .map_err(|e| AdapterError::execution_failed(None, format!("report missing: {e}")))?;
        let payload: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| AdapterError::ParseError(format!("zap report is not JSON: {e}")))?;
        Ok(NativeOutput::complete(payload))
    }

    fn parse(
        &self,
        output: &NativeOutput,
        request: &ScanRequest,
    ) -> Result<Vec<Finding>, AdapterError> {
        let sites = output
            .payload
            .get("site")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AdapterError::ParseError("missing site array".to_string()))?;

        let mut findings = Vec::new();
        for site in sites {
            let site_name = site
                .get("@name")
                .and_then(|v| v.as_str())
                .unwrap_or(&request.target.location);
            let Some(alerts) = site.get("alerts").and_then(|v| v.as_array()) else {
                continue;
            };
            for alert in alerts {
                match self.parse_alert(site_name, alert, request) {
                    Some(finding) => findings.push(finding),
                    None => warn!("skipping malformed zap alert"),
                }
            }
        }
        Ok(findings)
    }
}
