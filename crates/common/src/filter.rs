//! Path exclusion rules for the scanner.
//!
//! Patterns are anchored regular expressions matched against the path of
//! each entry relative to the scan root (always beginning with `/`). An
//! excluded path is skipped entirely: not hashed, not listed.

use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("invalid exclusion pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// A compiled exclusion list. Construction fails on the first invalid
/// pattern, which callers treat as a fatal configuration error.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    patterns: Vec<String>,
    regexes: Vec<Regex>,
}

impl Filter {
    pub fn new<I, S>(patterns: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Filter::default();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let regex =
                Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
                    FilterError::InvalidPattern {
                        pattern: pattern.to_string(),
                        source,
                    }
                })?;
            compiled.patterns.push(pattern.to_string());
            compiled.regexes.push(regex);
        }
        Ok(compiled)
    }

    /// True when `path` matches any exclusion pattern.
    pub fn matches(&self, path: &str) -> bool {
        self.regexes.iter().any(|regex| regex.is_match(path))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.regexes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_are_anchored() {
        let filter = Filter::new(["/tmp/.*", "/var/log/.*"]).unwrap();
        assert!(filter.matches("/tmp/scratch"));
        assert!(filter.matches("/var/log/syslog"));
        assert!(!filter.matches("/var/lib/tmp/file"));
        assert!(!filter.matches("/tmp"));
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = Filter::new(Vec::<String>::new()).unwrap();
        assert!(!filter.matches("/anything"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = Filter::new(["/tmp/["]).unwrap_err();
        assert!(matches!(err, FilterError::InvalidPattern { .. }));
    }
}
