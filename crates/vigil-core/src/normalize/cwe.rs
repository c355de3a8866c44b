//! CWE id extraction from rule metadata.

use regex::Regex;
use std::sync::OnceLock;

fn cwe_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)CWE[-_ ]?([0-9]+)").expect("static regex"))
}

/// Extract the first CWE id mentioned in free-form rule metadata.
///
/// Accepts forms like `CWE-89`, `cwe_89`, `CWE 89` and `CWE89`.
pub fn extract_cwe_id(text: &str) -> Option<u32> {
    cwe_pattern()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .filter(|id| *id > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_forms() {
        assert_eq!(extract_cwe_id("CWE-89: SQL Injection"), Some(89));
        assert_eq!(extract_cwe_id("cwe_79"), Some(79));
        assert_eq!(extract_cwe_id("CWE 502"), Some(502));
        assert_eq!(extract_cwe_id("CWE611"), Some(611));
    }

    #[test]
    fn first_match_wins() {
        assert_eq!(extract_cwe_id("CWE-22, CWE-78"), Some(22));
    }

    #[test]
    fn no_match() {
        assert_eq!(extract_cwe_id("no identifiers here"), None);
        assert_eq!(extract_cwe_id("CWE-0"), None);
    }
}
