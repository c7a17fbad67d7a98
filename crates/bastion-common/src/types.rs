//! Core types shared across Bastion components.

use serde::{Deserialize, Serialize};

/// What the policy decided to do with a request.
///
/// - `Allow`: pass the request to the upstream origin
/// - `Deny`: refuse service with the configured status code
/// - `Challenge`: interpose a proof-of-work challenge
/// - `Weigh`: adjust the running weight counter and keep evaluating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Allow,
    Deny,
    Challenge,
    Weigh,
}

impl Action {
    /// Returns true if this action ends rule evaluation.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Weigh)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Deny => "DENY",
            Self::Challenge => "CHALLENGE",
            Self::Weigh => "WEIGH",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Challenge parameters attached to a rule or threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSpec {
    /// Registered challenge algorithm name
    pub algorithm: String,

    /// Number of leading zero nibbles the solution digest must have
    pub difficulty: u32,

    /// Difficulty reported to the client (may differ to mask the
    /// effective difficulty in logs)
    pub report_as: u32,
}

/// The outcome of evaluating the policy against one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Name of the rule or threshold that fired ("default" if none)
    pub rule: String,

    /// Selected action
    pub action: Action,

    /// Challenge parameters when `action` is `Challenge`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeSpec>,

    /// Fingerprint of the rule that fired (empty for the default)
    pub rule_hash: String,
}

impl Decision {
    /// The decision used when no rule and no threshold matched.
    pub fn default_allow() -> Self {
        Self {
            rule: "default".to_string(),
            action: Action::Allow,
            challenge: None,
            rule_hash: String::new(),
        }
    }
}

/// HTTP status codes used for each terminal action. Overridable per
/// policy document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusCodes {
    #[serde(rename = "ALLOW", default = "default_allow_status")]
    pub allow: u16,

    #[serde(rename = "CHALLENGE", default = "default_challenge_status")]
    pub challenge: u16,

    #[serde(rename = "DENY", default = "default_deny_status")]
    pub deny: u16,
}

fn default_allow_status() -> u16 {
    200
}
fn default_challenge_status() -> u16 {
    401
}
fn default_deny_status() -> u16 {
    403
}

impl Default for StatusCodes {
    fn default() -> Self {
        Self {
            allow: default_allow_status(),
            challenge: default_challenge_status(),
            deny: default_deny_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_serde_uppercase() {
        assert_eq!(serde_json::to_string(&Action::Deny).unwrap(), "\"DENY\"");
        let a: Action = serde_json::from_str("\"CHALLENGE\"").unwrap();
        assert_eq!(a, Action::Challenge);
    }

    #[test]
    fn test_terminal_actions() {
        assert!(Action::Allow.is_terminal());
        assert!(Action::Deny.is_terminal());
        assert!(Action::Challenge.is_terminal());
        assert!(!Action::Weigh.is_terminal());
    }

    #[test]
    fn test_status_code_defaults() {
        let codes = StatusCodes::default();
        assert_eq!(codes.allow, 200);
        assert_eq!(codes.challenge, 401);
        assert_eq!(codes.deny, 403);
    }
}
