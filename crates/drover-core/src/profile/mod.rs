//! Model profiles and the escalation ladder.
//!
//! A profile pairs a model identifier with a reasoning effort. Profiles
//! form an ordered ladder: index 0 is the starting profile, higher indices
//! are stronger. Repeated same-kind failures advance a task one rung.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasoning effort requested from the worker's model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    None,
    Minimal,
    Low,
    Medium,
    High,
    /// Aliases `extrahigh`, `extra-high`, and `extra_high` normalize here.
    #[serde(alias = "extrahigh", alias = "extra-high", alias = "extra_high")]
    Xhigh,
}

impl ReasoningEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningEffort::None => "none",
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Xhigh => "xhigh",
        }
    }
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasoningEffort {
    type Err = ProfileError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "none" => Ok(ReasoningEffort::None),
            "minimal" => Ok(ReasoningEffort::Minimal),
            "low" => Ok(ReasoningEffort::Low),
            "medium" => Ok(ReasoningEffort::Medium),
            "high" => Ok(ReasoningEffort::High),
            "xhigh" | "extrahigh" | "extra-high" | "extra_high" => Ok(ReasoningEffort::Xhigh),
            _ => Err(ProfileError::InvalidReasoning(value.to_string())),
        }
    }
}

/// One rung of the escalation ladder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelProfile {
    pub model: String,
    pub reasoning: ReasoningEffort,
}

impl fmt::Display for ModelProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.reasoning)
    }
}

/// Errors raised while parsing an `--executor-profiles` ladder.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error(
        "invalid reasoning effort '{0}'. \
         Expected one of: none, minimal, low, medium, high, xhigh."
    )]
    InvalidReasoning(String),

    #[error("invalid profile entry '{0}'. Expected '<model>:<reasoning>'.")]
    InvalidEntry(String),

    #[error("no executor profiles parsed")]
    Empty,
}

/// Parse a semicolon-separated `model:reasoning` ladder.
///
/// Blank entries are skipped; at least one profile must survive.
pub fn parse_profiles(spec: &str) -> Result<Vec<ModelProfile>, ProfileError> {
    let mut profiles = Vec::new();
    for token in spec.split(';') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let Some((model, reasoning)) = token.split_once(':') else {
            return Err(ProfileError::InvalidEntry(token.to_string()));
        };
        profiles.push(ModelProfile {
            model: model.trim().to_string(),
            reasoning: reasoning.parse()?,
        });
    }
    if profiles.is_empty() {
        return Err(ProfileError::Empty);
    }
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_ladder() {
        let profiles = parse_profiles("codex-a:low;codex-a:medium;codex-b:high").unwrap();
        assert_eq!(profiles.len(), 3);
        assert_eq!(profiles[0].model, "codex-a");
        assert_eq!(profiles[0].reasoning, ReasoningEffort::Low);
        assert_eq!(profiles[2].to_string(), "codex-b/high");
    }

    #[test]
    fn normalizes_extrahigh_aliases() {
        for alias in ["extrahigh", "extra-high", "extra_high", "XHIGH"] {
            let profiles = parse_profiles(&format!("m:{alias}")).unwrap();
            assert_eq!(profiles[0].reasoning, ReasoningEffort::Xhigh);
        }
    }

    #[test]
    fn skips_blank_entries() {
        let profiles = parse_profiles("m:low; ;m:high;").unwrap();
        assert_eq!(profiles.len(), 2);
    }

    #[test]
    fn rejects_entry_without_colon() {
        assert!(matches!(
            parse_profiles("just-a-model"),
            Err(ProfileError::InvalidEntry(_))
        ));
    }

    #[test]
    fn rejects_unknown_reasoning() {
        assert!(matches!(
            parse_profiles("m:galactic"),
            Err(ProfileError::InvalidReasoning(_))
        ));
    }

    #[test]
    fn rejects_empty_spec() {
        assert!(matches!(parse_profiles(" ; "), Err(ProfileError::Empty)));
    }

    #[test]
    fn serde_round_trip_uses_lowercase() {
        let profile = ModelProfile {
            model: "m".into(),
            reasoning: ReasoningEffort::Xhigh,
        };
        let json = serde_json::to_string(&profile).unwrap();
        assert_eq!(json, r#"{"model":"m","reasoning":"xhigh"}"#);
        let back: ModelProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, profile);
    }
}
