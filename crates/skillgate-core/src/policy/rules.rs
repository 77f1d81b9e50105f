//! Operator access rules, evaluated first-match-wins.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAction {
    /// No grant needed. Declared writes still need a checkpoint.
    Allow,
    Deny,
    /// Treat the skill as side-effecting: every call needs a checkpoint.
    RequireCheckpoint,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Allow => "allow",
            RuleAction::Deny => "deny",
            RuleAction::RequireCheckpoint => "require-checkpoint",
        }
    }
}

/// One `[[policy.rules]]` entry. `agent` and `skill` accept `*` alone or as a
/// trailing wildcard (`notes.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessRule {
    #[serde(default = "wildcard")]
    pub agent: String,
    #[serde(default = "wildcard")]
    pub skill: String,
    pub action: RuleAction,
    #[serde(default)]
    pub reason: Option<String>,
}

fn wildcard() -> String {
    "*".to_string()
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

impl AccessRule {
    pub fn new(agent: impl Into<String>, skill: impl Into<String>, action: RuleAction) -> Self {
        Self {
            agent: agent.into(),
            skill: skill.into(),
            action,
            reason: None,
        }
    }

    pub fn matches(&self, agent_id: &str, skill_id: &str) -> bool {
        pattern_matches(&self.agent, agent_id) && pattern_matches(&self.skill, skill_id)
    }
}

/// Ordered rule list. No match means "fall through to the grant check".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRules {
    pub rules: Vec<AccessRule>,
}

impl AccessRules {
    pub fn new(rules: Vec<AccessRule>) -> Self {
        Self { rules }
    }

    pub fn first_match(&self, agent_id: &str, skill_id: &str) -> Option<&AccessRule> {
        self.rules.iter().find(|r| r.matches(agent_id, skill_id))
    }
}
