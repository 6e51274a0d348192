//! # Error Classifier
//!
//! Pure classification of execution failures into retryable and fatal
//! categories. Non-retryable patterns are checked first so that, e.g., a
//! 401 inside a network error message still fails fast. Anything
//! unclassified is fatal: the system prefers a terminal failure over
//! retrying indefinitely on unknown errors.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Failure category recorded on emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Auth,
    Validation,
    Parse,
    NotFound,
    Programming,
    Timeout,
    Network,
    RateLimit,
    ServerError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::Parse => "parse",
            Self::NotFound => "not_found",
            Self::Programming => "programming",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Verdict for one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub retryable: bool,
    pub category: ErrorCategory,
}

fn non_retryable_patterns() -> &'static [(ErrorCategory, Regex)] {
    static PATTERNS: OnceLock<Vec<(ErrorCategory, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                ErrorCategory::Auth,
                Regex::new(r"\b401\b|\b403\b|AuthenticationError|AuthorizationError|InvalidCredentials|AccessDenied")
                    .unwrap(),
            ),
            (
                ErrorCategory::Validation,
                Regex::new(r"\b400\b|ValidationError|Invalid .* format|Unknown task type|not found in task registry")
                    .unwrap(),
            ),
            (
                ErrorCategory::Parse,
                Regex::new(r"SyntaxError|JSON.*parse|Unexpected token").unwrap(),
            ),
            (
                ErrorCategory::NotFound,
                Regex::new(r"ENOENT|No such file or directory|\b404\b").unwrap(),
            ),
            (
                ErrorCategory::Programming,
                Regex::new(r"TypeError|ReferenceError|RangeError|panicked at").unwrap(),
            ),
        ]
    })
}

fn retryable_patterns() -> &'static [(ErrorCategory, Regex)] {
    static PATTERNS: OnceLock<Vec<(ErrorCategory, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                ErrorCategory::Timeout,
                Regex::new(r"(?i)timed? ?out|ETIMEDOUT|ESOCKETTIMEDOUT|AbortError").unwrap(),
            ),
            (
                ErrorCategory::Network,
                Regex::new(r"ECONNREFUSED|ENOTFOUND|ECONNRESET|EPIPE|EAI_AGAIN|socket hang up|(?i)network")
                    .unwrap(),
            ),
            (
                ErrorCategory::RateLimit,
                Regex::new(r"\b429\b|RateLimitError|Too Many Requests|(?i)rate.?limit").unwrap(),
            ),
            (
                ErrorCategory::ServerError,
                Regex::new(r"\b5\d{2}\b|InternalServerError|ServiceUnavailable|BadGateway").unwrap(),
            ),
        ]
    })
}

/// Classify one failure from its message, optional error code, and optional
/// HTTP-style status.
pub fn classify(message: &str, code: Option<&str>, status: Option<u16>) -> Classification {
    let mut haystack = message.to_string();
    if let Some(code) = code {
        haystack.push(' ');
        haystack.push_str(code);
    }
    if let Some(status) = status {
        haystack.push(' ');
        haystack.push_str(&status.to_string());
    }

    for (category, pattern) in non_retryable_patterns() {
        if pattern.is_match(&haystack) {
            return Classification {
                retryable: false,
                category: *category,
            };
        }
    }
    for (category, pattern) in retryable_patterns() {
        if pattern.is_match(&haystack) {
            return Classification {
                retryable: true,
                category: *category,
            };
        }
    }

    Classification {
        retryable: false,
        category: ErrorCategory::Unknown,
    }
}
