//! Cross-tool deduplication and report ordering.
//!
//! Dedup is keyed on `finding_id`: identical ids collapse into one finding
//! that keeps the highest-confidence contribution and accumulates every
//! contributing tool. Findings that differ in id but agree on
//! `(canonical path, line_start, type name)` are left separate and tagged
//! `correlated`. Aggregation is idempotent.

use crate::schema::finding::Finding;
use std::collections::HashMap;

/// Merge findings from all scan nodes so far into a deduplicated,
/// deterministically ordered list.
pub fn aggregate(findings: Vec<Finding>) -> Vec<Finding> {
    let mut by_id: HashMap<String, Finding> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for finding in findings {
        match by_id.get_mut(&finding.finding_id) {
            None => {
                order.push(finding.finding_id.clone());
                by_id.insert(finding.finding_id.clone(), finding);
            }
            Some(existing) => merge_duplicate(existing, finding),
        }
    }

    let mut merged: Vec<Finding> = order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect();

    mark_correlated(&mut merged);
    sort_for_report(&mut merged);
    merged
}

/// Collapse `incoming` into `existing`: keep the higher-confidence body,
/// keep every distinct contributing tool with its raw payload.
fn merge_duplicate(existing: &mut Finding, incoming: Finding) {
    let mut contributors = std::mem::take(&mut existing.source_tools);

    if incoming.confidence.score > existing.confidence.score {
        let incoming_tools = incoming.source_tools.clone();
        let kept_tags = std::mem::take(&mut existing.metadata.tags);
        *existing = incoming;
        existing.metadata.tags.extend(kept_tags);
        // The winner's tools lead; previous contributors follow.
        let mut rest = contributors;
        contributors = incoming_tools;
        contributors.append(&mut rest);
    } else {
        existing.metadata.tags.extend(incoming.metadata.tags);
        contributors.extend(incoming.source_tools);
    }

    contributors.dedup_by(|a, b| a.tool_id == b.tool_id && a.rule_id == b.rule_id);
    existing.source_tools = contributors;
}

/// Tag findings that point at the same location and vulnerability type but
/// came out with different ids.
fn mark_correlated(findings: &mut [Finding]) {
    let mut groups: HashMap<(String, Option<u32>, String), usize> = HashMap::new();
    for finding in findings.iter() {
        *groups.entry(finding.correlation_key()).or_insert(0) += 1;
    }
    for finding in findings.iter_mut() {
        if groups[&finding.correlation_key()] > 1 {
            finding.metadata.tags.insert("correlated".to_string());
        }
    }
}

/// Report order: severity descending, CVSS descending with nulls last,
/// file path ascending, line ascending.
pub fn sort_for_report(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        a.severity
            .level
            .rank()
            .cmp(&b.severity.level.rank())
            .then_with(|| {
                match (a.severity.cvss_score, b.severity.cvss_score) {
                    (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(std::cmp::Ordering::Equal),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                }
            })
            .then_with(|| a.location.file_path.cmp(&b.location.file_path))
            .then_with(|| a.location.line_start.cmp(&b.location.line_start))
    });
}

/// Deterministic order used when scan nodes fold completion-order results
/// into the workflow state: severity descending, then tool id, then
/// finding id.
pub fn sort_for_state(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        a.severity
            .level
            .rank()
            .cmp(&b.severity.level.rank())
            .then_with(|| a.primary_tool().tool_id.cmp(&b.primary_tool().tool_id))
            .then_with(|| a.finding_id.cmp(&b.finding_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::finding::{
        derive_finding_id, Confidence, Description, Exploitability, Finding, FindingMetadata,
        Location, Severity, SeverityLevel, SourceTool, VerificationStatus, VulnerabilityType,
    };

    fn finding(
        tool: &str,
        rule: &str,
        path: &str,
        line: u32,
        level: SeverityLevel,
        confidence: u8,
    ) -> Finding {
        Finding {
            finding_id: derive_finding_id(tool, rule, path, Some(line), None),
            scan_session_id: "scan-1".into(),
            vulnerability_type: VulnerabilityType {
                name: "SQL Injection".into(),
                cwe_id: Some(89),
                owasp_category: None,
            },
            location: Location {
                file_path: path.into(),
                line_start: Some(line),
                ..Location::default()
            },
            severity: Severity {
                level,
                cvss_score: None,
                exploitability: Exploitability::Unknown,
            },
            confidence: Confidence::new(confidence, "rule match"),
            source_tools: vec![SourceTool {
                tool_id: tool.into(),
                rule_id: rule.into(),
                native_severity: "high".into(),
                raw_output: serde_json::json!({"rule": rule}),
            }],
            description: Description::default(),
            metadata: FindingMetadata::default(),
            verification_status: VerificationStatus::Pending,
        }
    }

    #[test]
    fn identical_ids_collapse_keeping_max_confidence() {
        let a = finding("semgrep", "sqli", "app/db.py", 42, SeverityLevel::High, 80);
        let mut b = a.clone();
        b.confidence = Confidence::new(95, "validated by taint analysis");
        b.source_tools[0].tool_id = "deepscan".into();

        let merged = aggregate(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].confidence.score, 95);
        let tool_ids: Vec<_> = merged[0]
            .source_tools
            .iter()
            .map(|t| t.tool_id.as_str())
            .collect();
        assert!(tool_ids.contains(&"semgrep"));
        assert!(tool_ids.contains(&"deepscan"));
    }

    #[test]
    fn raw_payloads_survive_collapse() {
        let a = finding("toolA", "sqli", "app/db.py", 42, SeverityLevel::High, 80);
        let mut b = a.clone();
        b.source_tools[0].tool_id = "toolB".into();
        b.source_tools[0].raw_output = serde_json::json!({"native": "B"});

        let merged = aggregate(vec![a, b]);
        assert_eq!(merged[0].source_tools.len(), 2);
        assert!(merged[0]
            .source_tools
            .iter()
            .any(|t| t.raw_output == serde_json::json!({"native": "B"})));
    }

    #[test]
    fn distinct_ids_same_location_are_correlated_not_merged() {
        let a = finding("semgrep", "sqli-a", "app/db.py", 42, SeverityLevel::High, 80);
        let b = finding("bandit", "sqli-b", "app/db.py", 42, SeverityLevel::High, 70);

        let merged = aggregate(vec![a, b]);
        assert_eq!(merged.len(), 2);
        assert!(merged
            .iter()
            .all(|f| f.metadata.tags.contains("correlated")));
    }

    #[test]
    fn aggregation_is_idempotent() {
        let a = finding("semgrep", "sqli", "app/db.py", 42, SeverityLevel::High, 80);
        let mut b = a.clone();
        b.source_tools[0].tool_id = "other".into();
        let c = finding("trivy", "cve", "Cargo.lock", 1, SeverityLevel::Low, 60);

        let once = aggregate(vec![a, b, c]);
        let twice = aggregate(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn report_order_is_severity_then_cvss_then_path() {
        let mut low = finding("t", "r1", "b.py", 1, SeverityLevel::Low, 50);
        let mut crit_scored = finding("t", "r2", "c.py", 1, SeverityLevel::Critical, 50);
        crit_scored.severity.cvss_score = Some(9.8);
        let crit_unscored = finding("t", "r3", "a.py", 1, SeverityLevel::Critical, 50);
        low.severity.cvss_score = Some(2.0);

        let merged = aggregate(vec![low, crit_unscored, crit_scored]);
        assert_eq!(merged[0].severity.cvss_score, Some(9.8));
        // Unscored critical sorts after scored critical but before low.
        assert_eq!(merged[1].severity.level, SeverityLevel::Critical);
        assert_eq!(merged[1].severity.cvss_score, None);
        assert_eq!(merged[2].severity.level, SeverityLevel::Low);
    }

    #[test]
    fn state_order_is_stable() {
        let a = finding("b-tool", "r", "x.py", 1, SeverityLevel::High, 50);
        let b = finding("a-tool", "r", "x.py", 1, SeverityLevel::High, 50);
        let mut findings = vec![a, b];
        sort_for_state(&mut findings);
        assert_eq!(findings[0].primary_tool().tool_id, "a-tool");
    }
}
