//! # Query Validator
//!
//! Checks a proposed query definition against the configured [`QueryLimits`]
//! before it enters the store. Every check runs independently and all
//! violations are reported together; nothing is partially accepted.

use super::QueryDraft;
use crate::config::QueryLimits;
use reqwest::Url;
use std::fmt;

/// What was wrong with a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// Required value was empty
    Empty,
    /// Value is longer than allowed (in characters)
    TooLong { max: usize, actual: usize },
    /// Request is not an absolute http(s) URL
    MalformedUrl(String),
    /// Number outside the inclusive range
    OutOfRange { min: u64, max: u64, actual: u64 },
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::Empty => write!(f, "must not be empty"),
            ViolationKind::TooLong { max, actual } => {
                write!(f, "must be at most {max} characters (got {actual})")
            }
            ViolationKind::MalformedUrl(reason) => {
                write!(f, "must be an absolute http(s) URL ({reason})")
            }
            ViolationKind::OutOfRange { min, max, actual } => {
                write!(f, "must be between {min} and {max} (got {actual})")
            }
        }
    }
}

/// A single violated constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// `name`, `request` or `refresh_interval`
    pub field: &'static str,
    pub kind: ViolationKind,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.kind)
    }
}

/// Every constraint a draft violated
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// Whether any violation concerns `field`
    pub fn has_field(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }

    pub fn fields(&self) -> Vec<&'static str> {
        self.violations.iter().map(|v| v.field).collect()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid query: ")?;
        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

/// A draft that passed every check. Only [`validate`] constructs one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedQuery {
    name: String,
    request: String,
    refresh_interval: u64,
}

impl ValidatedQuery {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn refresh_interval(&self) -> u64 {
        self.refresh_interval
    }

    pub(crate) fn into_parts(self) -> (String, String, u64) {
        (self.name, self.request, self.refresh_interval)
    }
}

fn check_length(
    field: &'static str,
    value: &str,
    max: usize,
    violations: &mut Vec<Violation>,
) -> bool {
    if value.trim().is_empty() {
        violations.push(Violation {
            field,
            kind: ViolationKind::Empty,
        });
        return false;
    }
    let actual = value.chars().count();
    if actual > max {
        violations.push(Violation {
            field,
            kind: ViolationKind::TooLong { max, actual },
        });
        return false;
    }
    true
}

fn check_url(request: &str) -> Result<(), String> {
    let url = Url::parse(request).map_err(|e| e.to_string())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("missing host".to_string());
    }
    Ok(())
}

/// Validate a draft against the limits
pub fn validate(draft: &QueryDraft, limits: &QueryLimits) -> Result<ValidatedQuery, ValidationError> {
    let mut violations = Vec::new();

    check_length("name", &draft.name, limits.max_name_length, &mut violations);

    if check_length(
        "request",
        &draft.request,
        limits.max_url_length,
        &mut violations,
    ) {
        if let Err(reason) = check_url(draft.request.trim()) {
            violations.push(Violation {
                field: "request",
                kind: ViolationKind::MalformedUrl(reason),
            });
        }
    }

    if !limits.interval_in_range(draft.refresh_interval) {
        violations.push(Violation {
            field: "refresh_interval",
            kind: ViolationKind::OutOfRange {
                min: limits.min_interval,
                max: limits.max_interval,
                actual: draft.refresh_interval,
            },
        });
    }

    if !violations.is_empty() {
        return Err(ValidationError { violations });
    }

    Ok(ValidatedQuery {
        name: draft.name.trim().to_string(),
        request: draft.request.trim().to_string(),
        refresh_interval: draft.refresh_interval,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> QueryLimits {
        QueryLimits::default()
    }

    #[test]
    fn test_valid_draft_accepted() {
        let draft = QueryDraft::new(
            "ID:7 - Total Sessions - 7daysAgo",
            "https://www.googleapis.com/analytics/v3/data/ga?ids=ga:1&metrics=ga:sessions",
            86400,
        );
        let validated = validate(&draft, &limits()).unwrap();
        assert_eq!(validated.name(), "ID:7 - Total Sessions - 7daysAgo");
        assert_eq!(validated.refresh_interval(), 86400);
    }

    #[test]
    fn test_boundaries_accepted() {
        let name = "n".repeat(115);
        let request = format!("https://example.com/?q={}", "a".repeat(2000 - 23));
        assert_eq!(request.chars().count(), 2000);
        for interval in [15, 2_505_600] {
            let draft = QueryDraft::new(name.clone(), request.clone(), interval);
            assert!(validate(&draft, &limits()).is_ok(), "interval {interval}");
        }
    }

    #[test]
    fn test_all_violations_reported() {
        let draft = QueryDraft::new("", "not a url", 5);
        let err = validate(&draft, &limits()).unwrap_err();
        assert_eq!(err.fields(), vec!["name", "request", "refresh_interval"]);
        let message = err.to_string();
        assert!(message.contains("name must not be empty"));
        assert!(message.contains("refresh_interval must be between 15 and 2505600"));
    }

    #[test]
    fn test_name_too_long() {
        let draft = QueryDraft::new("x".repeat(116), "https://example.com/", 60);
        let err = validate(&draft, &limits()).unwrap_err();
        assert_eq!(
            err.violations,
            vec![Violation {
                field: "name",
                kind: ViolationKind::TooLong {
                    max: 115,
                    actual: 116
                },
            }]
        );
    }

    #[test]
    fn test_name_length_counts_characters() {
        let draft = QueryDraft::new("é".repeat(115), "https://example.com/", 60);
        assert!(validate(&draft, &limits()).is_ok());
    }

    #[test]
    fn test_request_too_long_skips_url_check() {
        let request = format!("https://example.com/?q={}", "a".repeat(2000));
        let err = validate(&QueryDraft::new("ok", request, 60), &limits()).unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert!(matches!(
            err.violations[0].kind,
            ViolationKind::TooLong { max: 2000, .. }
        ));
    }

    #[test]
    fn test_relative_url_rejected() {
        let err = validate(&QueryDraft::new("ok", "/data/ga?ids=1", 60), &limits()).unwrap_err();
        assert!(err.has_field("request"));
    }

    #[test]
    fn test_non_http_scheme_rejected() {
        let err =
            validate(&QueryDraft::new("ok", "ftp://example.com/file", 60), &limits()).unwrap_err();
        assert!(matches!(
            &err.violations[0].kind,
            ViolationKind::MalformedUrl(reason) if reason.contains("ftp")
        ));
    }

    #[test]
    fn test_interval_bounds_follow_limits() {
        let custom = QueryLimits {
            min_interval: 60,
            max_interval: 120,
            ..QueryLimits::default()
        };
        assert!(validate(&QueryDraft::new("ok", "https://a.io/", 59), &custom).is_err());
        assert!(validate(&QueryDraft::new("ok", "https://a.io/", 60), &custom).is_ok());
        assert!(validate(&QueryDraft::new("ok", "https://a.io/", 121), &custom).is_err());
    }

    #[test]
    fn test_whitespace_is_trimmed() {
        let validated =
            validate(&QueryDraft::new("  name  ", " https://a.io/ ", 60), &limits()).unwrap();
        assert_eq!(validated.name(), "name");
        assert_eq!(validated.request(), "https://a.io/");
    }
}
