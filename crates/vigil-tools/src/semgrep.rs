//! Semgrep adapter (SAST).
//!
//! Runs `semgrep scan --json` against a source tree and maps its `results`
//! array into unified findings.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::warn;
use vigil_core::adapter::base::{
    validate_against_descriptor, ExecutionContext, NativeOutput, ToolAdapter,
};
use vigil_core::adapter::process::{find_binary, run_command, CommandSpec};
use vigil_core::error::AdapterError;
use vigil_core::normalize::cwe::extract_cwe_id;
use vigil_core::normalize::severity::{clamp_to_band, normalize_severity};
use vigil_core::schema::capability::{
    Capabilities, ExecutionConfig, InputRequirements, OutputFormat, ResourceRequirements,
    ToolCapability, ToolCategory, ToolMetadata,
};
use vigil_core::schema::finding::{
    derive_finding_id, Confidence, Description, Exploitability, Finding, FindingMetadata,
    Location, Severity, SourceTool, VerificationStatus, VulnerabilityType,
};
use vigil_core::schema::request::{ScanRequest, TargetKind};

/// Directories excluded from every scan on top of request excludes.
const DEFAULT_EXCLUDES: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    "*.min.js",
    "*.bundle.js",
];

pub struct SemgrepAdapter;

impl SemgrepAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Semgrep reports ERROR/WARNING/INFO; fold them onto the canonical
    /// severity vocabulary before normalization. Unrecognized tokens pass
    /// through so the normalizer records them as unmapped.
    fn severity_token(native: &str) -> &str {
        match native.to_ascii_uppercase().as_str() {
            "ERROR" => "high",
            "WARNING" => "medium",
            "INFO" => "info",
            _ => native,
        }
    }

    fn representative_cvss(native: &str) -> Option<f64> {
        match native.to_ascii_uppercase().as_str() {
            "ERROR" => Some(8.5),
            "WARNING" => Some(6.0),
            "INFO" => Some(0.0),
            _ => None,
        }
    }

    fn confidence_score(native: &str) -> u8 {
        match native.to_ascii_uppercase().as_str() {
            "ERROR" => 90,
            "WARNING" => 80,
            "INFO" => 70,
            _ => 75,
        }
    }

    fn parse_result(
        &self,
        entry: &serde_json::Value,
        request: &ScanRequest,
    ) -> Option<Finding> {
        let check_id = entry.get("check_id")?.as_str()?;
        let path = entry.get("path")?.as_str()?;
        let start_line = entry
            .pointer("/start/line")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        let end_line = entry
            .pointer("/end/line")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        let start_col = entry
            .pointer("/start/col")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        let end_col = entry
            .pointer("/end/col")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        let extra = entry.get("extra").cloned().unwrap_or_default();
        let message = extra
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let native_severity = extra
            .get("severity")
            .and_then(|v| v.as_str())
            .unwrap_or("WARNING")
            .to_string();
        let snippet = extra
            .get("lines")
            .and_then(|v| v.as_str())
            .map(String::from);
        let metadata = extra.get("metadata").cloned().unwrap_or_default();

        let cwe_id = match metadata.get("cwe") {
            Some(serde_json::Value::String(text)) => extract_cwe_id(text),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .find_map(extract_cwe_id),
            _ => None,
        };
        let owasp_category = match metadata.get("owasp") {
            Some(serde_json::Value::String(text)) => Some(text.clone()),
            Some(serde_json::Value::Array(items)) => {
                items.iter().filter_map(|v| v.as_str()).next().map(String::from)
            }
            _ => None,
        };

        let normalized = normalize_severity(Self::severity_token(&native_severity));
        let confidence = match &normalized.unmapped_reason {
            Some(reason) => Confidence::new(50, reason.clone()),
            None => Confidence::new(
                Self::confidence_score(&native_severity),
                "semgrep rule match",
            ),
        };
        let cvss_score = Self::representative_cvss(&native_severity)
            .map(|score| clamp_to_band(score, normalized.level));

        let rule_tail = check_id.rsplit('.').next().unwrap_or(check_id);
        let type_name = rule_tail.replace('-', " ");

        Some(Finding {
            finding_id: derive_finding_id(
                "semgrep",
                check_id,
                path,
                start_line,
                snippet.as_deref(),
            ),
            scan_session_id: request.scan_id.clone(),
            vulnerability_type: VulnerabilityType {
                name: type_name,
                cwe_id,
                owasp_category,
            },
            location: Location {
                file_path: path.to_string(),
                function_name: None,
                class_name: None,
                line_start: start_line,
                line_end: end_line,
                column_start: start_col,
                column_end: end_col,
                code_snippet: snippet,
            },
            severity: Severity {
                level: normalized.level,
                cvss_score,
                exploitability: Exploitability::Unknown,
            },
            confidence,
            source_tools: vec![SourceTool {
                tool_id: "semgrep".to_string(),
                rule_id: check_id.to_string(),
                native_severity,
                raw_output: entry.clone(),
            }],
            description: Description {
                summary: message,
                detail: metadata
                    .get("description")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                impact: metadata
                    .get("impact")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                remediation: metadata
                    .get("remediation")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            },
            metadata: FindingMetadata {
                detected_at: Utc::now(),
                language: request.options.language.clone(),
                tags: BTreeSet::new(),
                references: metadata
                    .get("references")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            verification_status: VerificationStatus::Pending,
        })
    }
}

impl Default for SemgrepAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for SemgrepAdapter {
    fn describe(&self) -> ToolCapability {
        ToolCapability {
            tool_id: "semgrep".to_string(),
            tool_name: "Semgrep".to_string(),
            tool_version: "1.50.0".to_string(),
            category: ToolCategory::Sast,
            vendor: "Semgrep Inc.".to_string(),
            description: "Lightweight static analysis with language-aware rules".to_string(),
            capabilities: Capabilities {
                supported_languages: [
                    "python", "javascript", "typescript", "java", "go", "ruby", "c", "cpp",
                    "php", "rust", "kotlin", "scala",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                detection_types: [
                    "sql_injection",
                    "xss",
                    "command_injection",
                    "path_traversal",
                    "hardcoded_secrets",
                    "insecure_deserialization",
                    "xxe",
                    "open_redirect",
                    "csrf",
                    "weak_crypto",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                cwe_coverage: [89, 79, 78, 22, 502, 798, 611, 601, 352, 327]
                    .into_iter()
                    .collect(),
            },
            input_requirements: InputRequirements {
                requires_source_code: true,
                requires_binary: false,
                requires_running_app: false,
                requires_dependency_manifest: false,
                supported_vcs: BTreeSet::from(["git".to_string()]),
                accepted_targets: BTreeSet::from([TargetKind::LocalPath]),
            },
            output_format: OutputFormat {
                native_format: "json".to_string(),
                supports_streaming: false,
                result_fields: ["check_id", "path", "start", "end", "extra"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            execution: ExecutionConfig {
                default_timeout_secs: 1800,
                resources: ResourceRequirements {
                    min_memory_mb: 512,
                    min_cpu_cores: 1,
                },
                requires_network: false,
            },
            metadata: ToolMetadata {
                license: "LGPL-2.1".to_string(),
                documentation_url: Some("https://semgrep.dev/docs/".to_string()),
                adapter_version: "1.0.0".to_string(),
                registered_at: None,
            },
        }
    }

    fn validate(&self, request: &ScanRequest) -> Result<(), AdapterError> {
        validate_against_descriptor(&self.describe(), request)?;
        if !Path::new(&request.target.location).is_dir() {
            return Err(AdapterError::invalid_input(
                "semgrep target must be a directory",
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
        if find_binary("semgrep").is_none() {
            return Err(AdapterError::tool_missing("semgrep"));
        }

        let mut spec = CommandSpec::new("semgrep")
            .arg("scan")
            .arg("--json")
            .arg("--no-git-ignore");

        let rules = request.options.rules.as_deref().unwrap_or("auto");
        for rule in rules.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            spec = spec.args(["--config", rule]);
        }

        for exclude in request
            .options
            .exclude_paths
            .iter()
            .map(String::as_str)
            .chain(DEFAULT_EXCLUDES.iter().copied())
        {
            spec = spec.args(["--exclude", exclude]);
        }
        spec = spec.arg(&request.target.location);

        let output = run_command(&spec, ctx).await?;

        // Semgrep exits non-zero when findings exist; judge the run by
        // whether it produced JSON.
        if output.stdout.trim().is_empty() {
            return Err(AdapterError::execution_failed(
                output.exit_code,
                output.stderr_tail(),
            ));
        }
        let payload: serde_json::Value = serde_json::from_str(&output.stdout)
            .map_err(|e| AdapterError::ParseError(format!("semgrep output is not JSON: {e}")))?;
        Ok(NativeOutput::complete(payload))
    }

    fn parse(
        &self,
        output: &NativeOutput,
        request: &ScanRequest,
    ) -> Result<Vec<Finding>, AdapterError> {
        let results = output
            .payload
            .get("results")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AdapterError::ParseError("missing results array".to_string()))?;

        let mut findings = Vec::with_capacity(results.len());
        for (index, entry) in results.iter().enumerate() {
            match self.parse_result(entry, request) {
                Some(finding) => findings.push(finding),
                None => warn!(index, "skipping malformed semgrep result"),
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
        ScanRequest::new(ScanTarget::local_path("/tmp/project")).with_scan_id("scan-1")
    }

    fn sample_result() -> serde_json::Value {
        serde_json::json!({
            "check_id": "python.lang.security.audit.dangerous-sql-query",
            "path": "app/db.py",
            "start": {"line": 42, "col": 5},
            "end": {"line": 42, "col": 38},
            "extra": {
                "message": "Possible SQL injection via string formatting",
                "severity": "ERROR",
                "lines": "cursor.execute(\"SELECT * FROM t WHERE id=%s\" % uid)",
                "metadata": {
                    "cwe": ["CWE-89: SQL Injection"],
                    "owasp": ["A03:2021 - Injection"],
                    "references": ["https://owasp.org/Top10/A03_2021-Injection/"]
                }
            }
        })
    }

    #[test]
    fn parse_maps_error_to_high() {
        let adapter = SemgrepAdapter::new();
        let output = NativeOutput::complete(serde_json::json!({"results": [sample_result()]}));
        let findings = adapter.parse(&output, &request()).unwrap();

        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.severity.level, SeverityLevel::High);
        assert_eq!(f.vulnerability_type.cwe_id, Some(89));
        assert_eq!(
            f.vulnerability_type.owasp_category.as_deref(),
            Some("A03:2021 - Injection")
        );
        assert_eq!(f.location.line_start, Some(42));
        assert_eq!(f.primary_tool().rule_id, "python.lang.security.audit.dangerous-sql-query");
        assert_eq!(f.primary_tool().native_severity, "ERROR");
    }

    #[test]
    fn parse_is_deterministic() {
        let adapter = SemgrepAdapter::new();
        let output = NativeOutput::complete(serde_json::json!({"results": [sample_result()]}));
        let a = adapter.parse(&output, &request()).unwrap();
        let b = adapter.parse(&output, &request()).unwrap();
        assert_eq!(a[0].finding_id, b[0].finding_id);
    }

    #[test]
    fn raw_output_is_preserved_verbatim() {
        let adapter = SemgrepAdapter::new();
        let entry = sample_result();
        let output = NativeOutput::complete(serde_json::json!({"results": [entry.clone()]}));
        let findings = adapter.parse(&output, &request()).unwrap();
        assert_eq!(findings[0].primary_tool().raw_output, entry);
    }

    #[test]
    fn unknown_severity_falls_back_to_medium() {
        let adapter = SemgrepAdapter::new();
        let mut entry = sample_result();
        entry["extra"]["severity"] = serde_json::json!("weird");
        let output = NativeOutput::complete(serde_json::json!({"results": [entry]}));
        let findings = adapter.parse(&output, &request()).unwrap();

        assert_eq!(findings[0].severity.level, SeverityLevel::Medium);
        assert!(findings[0].confidence.reason.contains("severity unmapped"));
    }

    #[test]
    fn missing_results_is_parse_error() {
        let adapter = SemgrepAdapter::new();
        let output = NativeOutput::complete(serde_json::json!({"errors": []}));
        assert!(matches!(
            adapter.parse(&output, &request()),
            Err(AdapterError::ParseError(_))
        ));
    }

    #[test]
    fn validate_rejects_non_directory() {
        let adapter = SemgrepAdapter::new();
        let file = tempfile::NamedTempFile::new().unwrap();
        let req = ScanRequest::new(ScanTarget::local_path(
            file.path().to_string_lossy().to_string(),
        ));
        assert!(matches!(
            adapter.validate(&req),
            Err(AdapterError::InvalidInput { .. })
        ));
    }
}
