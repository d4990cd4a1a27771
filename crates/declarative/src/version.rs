//! Package version comparison.
//!
//! Versions are compared as semver when both sides can be read as one
//! (leniently: a leading `v` is dropped and missing minor/patch parts are
//! zero-filled). Anything else falls back to a plain lexical comparison.

use semver::Version;
use std::cmp::Ordering;

/// How two versions were compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Semver(Ordering),
    Lexical(Ordering),
}

impl Comparison {
    pub fn ordering(self) -> Ordering {
        match self {
            Self::Semver(o) | Self::Lexical(o) => o,
        }
    }
}

/// Read `raw` as semver, tolerating `v1.2` and `3`.
pub fn parse_lenient(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if let Ok(v) = Version::parse(trimmed) {
        return Some(v);
    }

    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.is_empty()
        || parts.len() > 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }
    let mut padded = parts.clone();
    padded.resize(3, "0");
    Version::parse(&padded.join(".")).ok()
}

/// Compare two version strings.
pub fn compare(a: &str, b: &str) -> Comparison {
    match (parse_lenient(a), parse_lenient(b)) {
        (Some(va), Some(vb)) => Comparison::Semver(va.cmp(&vb)),
        _ => Comparison::Lexical(a.cmp(b)),
    }
}

/// Whether `desired` is strictly newer than `installed`.
pub fn is_newer(desired: &str, installed: &str) -> bool {
    let result = compare(desired, installed);
    if let Comparison::Lexical(_) = result {
        log::debug!("lexical version comparison: {desired} vs {installed}");
    }
    result.ordering() == Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semver_beats_lexical_ordering() {
        // Lexically "1.10.0" < "1.9.0"; semver knows better.
        assert_eq!(
            compare("1.10.0", "1.9.0"),
            Comparison::Semver(Ordering::Greater)
        );
        assert!(is_newer("1.10.0", "1.9.0"));
    }

    #[test]
    fn test_lenient_padding() {
        assert_eq!(parse_lenient("3.11"), Some(Version::new(3, 11, 0)));
        assert_eq!(parse_lenient("v2"), Some(Version::new(2, 0, 0)));
        assert_eq!(compare("3.11", "3.11.0"), Comparison::Semver(Ordering::Equal));
        assert!(!is_newer("3.11", "3.11.0"));
    }

    #[test]
    fn test_prerelease_is_older_than_release() {
        assert!(is_newer("2.0.0", "2.0.0-rc.1"));
    }

    #[test]
    fn test_distro_versions_fall_back_to_lexical() {
        let result = compare("2.35-0ubuntu3", "2.34-0ubuntu3");
        assert_eq!(result, Comparison::Lexical(Ordering::Greater));
        assert!(parse_lenient("1:2.3.4-1").is_none());
    }

    #[test]
    fn test_equal_versions_are_not_newer() {
        assert!(!is_newer("1.26.4", "1.26.4"));
        assert!(!is_newer("1.26.0", "1.26.4"));
    }
}
