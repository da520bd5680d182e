//! Risk classification of scanned files.
//!
//! Rules are tested in configured order and the first enabled rule whose
//! condition holds wins. A file no rule matches stays unclassified: it has
//! no risk tier and callers keep it in a separate "unmatched" bucket rather
//! than folding it into [`RiskTier::Review`].

mod config;
mod engine;
mod indexed;
mod pattern;

pub use config::{RuleDocument, RuleLoadReport, RuleSource, load_rule_file, save_rule_file};
pub use engine::RuleEngine;
pub use indexed::{CacheStats, IndexedRuleEngine, MATCH_CACHE_CAPACITY};
pub use pattern::{CompiledCondition, PatternCache, glob_to_regex};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::model::FileDescriptor;

/// How risky it is to delete a file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum RiskTier {
    #[serde(rename = "L1_SAFE", alias = "safe", alias = "Safe", alias = "SAFE")]
    Safe,
    #[default]
    #[serde(rename = "L2_REVIEW", alias = "review", alias = "Review", alias = "REVIEW")]
    Review,
    #[serde(rename = "L3_SYSTEM", alias = "system", alias = "System", alias = "SYSTEM")]
    System,
}

impl RiskTier {
    pub const ALL: [RiskTier; 3] = [RiskTier::Safe, RiskTier::Review, RiskTier::System];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Safe => "safe",
            RiskTier::Review => "review",
            RiskTier::System => "system",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conjunction of optional tests. An absent component always passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Glob over the whole path: `*` any run, `?` one character.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_pattern: Option<String>,
    #[serde(default, rename = "file_extensions", skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u64>,
    /// Regex searched (not anchored) in the file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_pattern: Option<String>,
}

impl RuleCondition {
    pub fn extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &RuleCondition::default()
    }
}

/// A single classification rule as it appears in the rule document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "conditions")]
    pub condition: RuleCondition,
    #[serde(default, rename = "risk_level")]
    pub tier: RiskTier,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_enabled() -> bool {
    true
}

fn default_category() -> String {
    "general".to_string()
}

impl Rule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        condition: RuleCondition,
        tier: RiskTier,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            condition,
            tier,
            enabled: true,
            category: default_category(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Built-in rules installed when no rule file exists.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "temp_files",
            "Temporary files",
            RuleCondition::extensions([".tmp", ".temp"]),
            RiskTier::Safe,
        )
        .with_description("Scratch files left behind by applications")
        .with_category("temp"),
        Rule::new(
            "log_files",
            "Log files",
            RuleCondition::extensions([".log", ".log1", ".log2"]),
            RiskTier::Review,
        )
        .with_description("Application and system logs")
        .with_category("logs"),
        Rule::new(
            "cache_files",
            "Cache files",
            RuleCondition::extensions([".cache", ".cache2"]),
            RiskTier::Safe,
        )
        .with_description("Regenerable cache data")
        .with_category("cache"),
    ]
}

/// Outcome of classifying one file.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule: Option<Arc<Rule>>,
    pub file: FileDescriptor,
    pub matched: bool,
    pub reason: String,
}

impl RuleMatch {
    pub fn matched(rule: Arc<Rule>, file: FileDescriptor) -> Self {
        Self {
            reason: format!("Matched rule: {}", rule.name),
            rule: Some(rule),
            file,
            matched: true,
        }
    }

    pub fn unmatched(file: FileDescriptor) -> Self {
        Self {
            rule: None,
            file,
            matched: false,
            reason: "No matching rule found".to_string(),
        }
    }

    /// Tier of the winning rule; `None` when nothing matched.
    pub fn tier(&self) -> Option<RiskTier> {
        self.rule.as_ref().map(|rule| rule.tier)
    }
}

/// Anything that can assign a [`RuleMatch`] to a file.
pub trait Classifier: Send + Sync {
    fn match_file(&self, file: &FileDescriptor) -> RuleMatch;

    /// Risk tier only; `None` for unmatched files.
    fn classify(&self, file: &FileDescriptor) -> Option<RiskTier> {
        self.match_file(file).tier()
    }

    /// Rules in evaluation order, including disabled ones.
    fn rules(&self) -> Vec<Arc<Rule>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_names() -> anyhow::Result<()> {
        let tier: RiskTier = serde_json::from_str("\"L1_SAFE\"")?;
        assert_eq!(tier, RiskTier::Safe);
        let tier: RiskTier = serde_json::from_str("\"system\"")?;
        assert_eq!(tier, RiskTier::System);
        assert_eq!(serde_json::to_string(&RiskTier::Review)?, "\"L2_REVIEW\"");
        assert!(serde_json::from_str::<RiskTier>("\"L9_UNKNOWN\"").is_err());
        Ok(())
    }

    #[test]
    fn test_rule_defaults_from_document() -> anyhow::Result<()> {
        let rule: Rule = serde_json::from_str(r#"{"id": "x", "name": "X"}"#)?;
        assert_eq!(rule.tier, RiskTier::Review);
        assert!(rule.enabled);
        assert!(rule.condition.is_empty());
        assert_eq!(rule.category, "general");
        Ok(())
    }

    #[test]
    fn test_default_rules() {
        let rules = default_rules();
        let ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["temp_files", "log_files", "cache_files"]);
        assert_eq!(rules[0].tier, RiskTier::Safe);
        assert_eq!(rules[1].tier, RiskTier::Review);
        assert_eq!(rules[2].tier, RiskTier::Safe);
    }
}
