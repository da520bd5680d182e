use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::config::{RuleLoadReport, load_rule_file, save_rule_file};
use super::pattern::CompiledRule;
use super::{Classifier, RiskTier, Rule, RuleMatch, default_rules};
use crate::error::{Result, WiperError};
use crate::model::FileDescriptor;

/// Ordered, linear-scan rule engine.
///
/// Every classification walks the enabled rules in order and stops at the
/// first whose condition holds.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl RuleEngine {
    /// Engine with no rules; every file is unmatched.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_defaults() -> Self {
        let mut engine = Self::empty();
        engine.install(default_rules());
        engine
    }

    /// Build from explicit rules. Fails on the first rule that does not
    /// compile.
    pub fn from_rules(rules: Vec<Rule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Replace the rule set with the contents of `path`.
    pub fn load_rules(&mut self, path: &Path) -> RuleLoadReport {
        let (rules, mut report) = load_rule_file(path);
        let rejected = self.install(rules);
        report.loaded -= rejected;
        report.skipped += rejected;
        report
    }

    /// Compile and install `rules`, returning how many were rejected.
    fn install(&mut self, rules: Vec<Rule>) -> usize {
        let mut rejected = 0;
        self.rules = rules
            .into_iter()
            .filter_map(|rule| match CompiledRule::compile(rule) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    warn!("Skipping rule: {}", e);
                    rejected += 1;
                    None
                }
            })
            .collect();
        info!("Rule engine ready with {} rule(s)", self.rules.len());
        rejected
    }

    pub fn save_rules(&self, path: &Path) -> anyhow::Result<()> {
        let rules: Vec<Rule> = self.rules.iter().map(|r| (*r.rule).clone()).collect();
        save_rule_file(path, &rules)
    }

    /// Append a rule; it is evaluated after all existing rules.
    pub fn add_rule(&mut self, rule: Rule) -> Result<()> {
        if self.rules.iter().any(|r| r.rule.id == rule.id) {
            return Err(WiperError::Config(format!("duplicate rule id {:?}", rule.id)));
        }
        self.rules.push(CompiledRule::compile(rule)?);
        Ok(())
    }

    pub fn remove_rule(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.rule.id != id);
        before != self.rules.len()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn enabled_rules(&self) -> Vec<Arc<Rule>> {
        self.rules
            .iter()
            .filter(|r| r.rule.enabled)
            .map(|r| Arc::clone(&r.rule))
            .collect()
    }

    pub fn rules_by_tier(&self, tier: RiskTier) -> Vec<Arc<Rule>> {
        self.rules
            .iter()
            .filter(|r| r.rule.tier == tier)
            .map(|r| Arc::clone(&r.rule))
            .collect()
    }

    pub fn rules_by_category(&self, category: &str) -> Vec<Arc<Rule>> {
        self.rules
            .iter()
            .filter(|r| r.rule.category == category)
            .map(|r| Arc::clone(&r.rule))
            .collect()
    }
}

impl Classifier for RuleEngine {
    fn match_file(&self, file: &FileDescriptor) -> RuleMatch {
        let winner = self
            .rules
            .iter()
            .filter(|r| r.rule.enabled)
            .find(|r| r.condition.matches(file));

        match winner {
            Some(compiled) => {
                debug!("{:?} matched rule {}", file.path, compiled.rule.id);
                RuleMatch::matched(Arc::clone(&compiled.rule), file.clone())
            }
            None => RuleMatch::unmatched(file.clone()),
        }
    }

    fn rules(&self) -> Vec<Arc<Rule>> {
        self.rules.iter().map(|r| Arc::clone(&r.rule)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleCondition;
    use std::path::PathBuf;

    fn file(path: &str, size: u64) -> FileDescriptor {
        let path = PathBuf::from(path);
        FileDescriptor {
            extension: crate::model::real_extension(&path),
            path,
            size,
            is_dir: false,
            modified: None,
            created: None,
            is_hidden: false,
            is_readonly: false,
            risk_tier: None,
        }
    }

    #[test]
    fn test_default_rules_classify() {
        let engine = RuleEngine::with_defaults();
        assert_eq!(engine.classify(&file("/t/a.tmp", 10)), Some(RiskTier::Safe));
        assert_eq!(engine.classify(&file("/t/b.LOG", 20)), Some(RiskTier::Review));
        assert_eq!(engine.classify(&file("/t/c.cache2", 1)), Some(RiskTier::Safe));

        let unmatched = engine.match_file(&file("/t/c.txt", 5));
        assert!(!unmatched.matched);
        assert_eq!(unmatched.tier(), None);
        assert_eq!(unmatched.reason, "No matching rule found");
    }

    #[test]
    fn test_first_match_wins() -> Result<()> {
        let engine = RuleEngine::from_rules(vec![
            Rule::new(
                "a",
                "Rule A",
                RuleCondition::extensions([".log"]),
                RiskTier::System,
            ),
            Rule::new(
                "b",
                "Rule B",
                RuleCondition {
                    name_pattern: Some("debug".to_string()),
                    ..Default::default()
                },
                RiskTier::Safe,
            ),
        ])?;

        let result = engine.match_file(&file("/var/debug.log", 1));
        assert_eq!(result.rule.as_ref().map(|r| r.id.as_str()), Some("a"));
        assert_eq!(result.reason, "Matched rule: Rule A");
        Ok(())
    }

    #[test]
    fn test_disabled_rules_are_ignored() -> Result<()> {
        let engine = RuleEngine::from_rules(vec![
            Rule::new("off", "Off", RuleCondition::default(), RiskTier::System).disabled(),
            Rule::new("on", "On", RuleCondition::extensions(["tmp"]), RiskTier::Safe),
        ])?;
        assert_eq!(engine.classify(&file("/x.tmp", 1)), Some(RiskTier::Safe));
        assert_eq!(engine.classify(&file("/x.bin", 1)), None);
        assert_eq!(engine.enabled_rules().len(), 1);
        Ok(())
    }

    #[test]
    fn test_add_remove_and_queries() -> Result<()> {
        let mut engine = RuleEngine::with_defaults();
        engine.add_rule(
            Rule::new("dmp", "Dumps", RuleCondition::extensions(["dmp"]), RiskTier::Review)
                .with_category("diagnostics"),
        )?;
        let duplicate = Rule::new("dmp", "Again", RuleCondition::default(), RiskTier::Safe);
        assert!(engine.add_rule(duplicate).is_err());
        assert_eq!(engine.len(), 4);
        assert_eq!(engine.rules_by_tier(RiskTier::Safe).len(), 2);
        assert_eq!(engine.rules_by_category("diagnostics").len(), 1);

        assert!(engine.remove_rule("temp_files"));
        assert!(!engine.remove_rule("temp_files"));
        assert_eq!(engine.classify(&file("/x.tmp", 1)), None);
        Ok(())
    }

    #[test]
    fn test_load_skips_uncompilable_rules() -> anyhow::Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let path = temp_dir.path().join("rules.json");
        std::fs::write(
            &path,
            r#"{"version": "1.0", "rules": [
                {"id": "ok", "name": "Ok", "conditions": {"file_extensions": ["bak"]}, "risk_level": "L1_SAFE"},
                {"id": "broken", "name": "Broken", "conditions": {"name_pattern": "(("}}
            ]}"#,
        )?;

        let mut engine = RuleEngine::empty();
        let report = engine.load_rules(&path);
        assert_eq!(report.loaded, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(engine.classify(&file("/x.BAK", 1)), Some(RiskTier::Safe));
        Ok(())
    }
}
