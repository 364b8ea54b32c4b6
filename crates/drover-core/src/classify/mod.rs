//! Failure classification: map captured worker or validation text to a
//! failure kind.
//!
//! Matching is case-insensitive substring search over the raw text. Quota
//! markers win unconditionally so that an account limit surfacing inside a
//! compiler log still triggers the global cooldown instead of escalation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The kind of failure a captured diagnostic maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Billing, rate-limit, or account-plan caps.
    Quota,
    /// Build or typecheck failure.
    Compile,
    /// Panic or fatal error at program start.
    Runtime,
    /// Validation failed at the test layer.
    Test,
    /// Timeout, signal, permission, network; also the catch-all for
    /// internal faults during launch or reap.
    Infra,
    /// Matched no marker.
    Unknown,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Quota => "quota",
            FailureKind::Compile => "compile",
            FailureKind::Runtime => "runtime",
            FailureKind::Test => "test",
            FailureKind::Infra => "infra",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quota" => Ok(FailureKind::Quota),
            "compile" => Ok(FailureKind::Compile),
            "runtime" => Ok(FailureKind::Runtime),
            "test" => Ok(FailureKind::Test),
            "infra" => Ok(FailureKind::Infra),
            "unknown" => Ok(FailureKind::Unknown),
            _ => Err(()),
        }
    }
}

/// Quota and rate-limit markers, paired with the reason tag reported in
/// events.
const QUOTA_INDICATORS: &[(&str, &str)] = &[
    ("insufficient_quota", "insufficient_quota"),
    ("quota exceeded", "quota_exceeded"),
    ("exceeded your current quota", "quota_exceeded"),
    ("billing hard limit has been reached", "billing_limit"),
    ("usage limit reached", "usage_limit"),
    ("you have reached your usage limit", "usage_limit"),
    ("you've reached your usage limit", "usage_limit"),
    ("rate limit reached", "rate_limit"),
    ("too many requests", "rate_limit"),
    ("status code 429", "rate_limit"),
    ("429 too many requests", "rate_limit"),
    ("chatgpt account", "account_plan_limit"),
    ("monthly limit reached", "account_plan_limit"),
    ("daily limit reached", "account_plan_limit"),
    ("request was rejected due to rate limiting", "rate_limit"),
];

const COMPILE_MARKERS: &[&str] = &[
    "failed to compile",
    "compilation failed",
    "could not compile",
    "cargo check",
    "cargo build",
    "swift build",
    "error[e",
    "no such module",
];

const RUNTIME_MARKERS: &[&str] = &[
    "thread 'main' panicked",
    "panic",
    "segmentation fault",
    "fatal error",
    "traceback",
    "assertion failed",
    "runtime error",
];

const TEST_MARKERS: &[&str] = &[
    "test failed",
    "failures:",
    "assertion",
    "0 passed; 1 failed",
    "failed in",
];

const INFRA_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "permission denied",
    "network is unreachable",
    "temporary failure",
    "killed",
];

/// Detect a quota or rate-limit condition, returning the matched reason
/// tag.
pub fn detect_quota_or_rate_limit(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    QUOTA_INDICATORS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, reason)| *reason)
}

/// Whether probe output indicates the requested model is unavailable to
/// the current account.
pub fn is_model_unsupported(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("is not supported when using codex with a chatgpt account")
        || lower.contains("model is not supported")
}

/// Classify captured failure text into exactly one [`FailureKind`].
pub fn classify_failure(text: &str) -> FailureKind {
    if detect_quota_or_rate_limit(text).is_some() {
        return FailureKind::Quota;
    }

    let lower = text.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if contains_any(COMPILE_MARKERS) {
        FailureKind::Compile
    } else if contains_any(RUNTIME_MARKERS) {
        FailureKind::Runtime
    } else if contains_any(TEST_MARKERS) {
        FailureKind::Test
    } else if contains_any(INFRA_MARKERS) {
        FailureKind::Infra
    } else {
        FailureKind::Unknown
    }
}
