use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use super::config::{RuleLoadReport, load_rule_file, save_rule_file};
use super::pattern::{CompiledRule, PatternCache};
use super::{Classifier, Rule, RuleMatch, default_rules};
use crate::error::{Result, WiperError};
use crate::model::FileDescriptor;

/// Default number of memoized classifications.
pub const MATCH_CACHE_CAPACITY: usize = 10_000;

/// Memo key. Size and modification time are part of the key, so a file
/// rewritten in place is classified again rather than served stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MatchKey {
    path: PathBuf,
    size: u64,
    modified: Option<SystemTime>,
}

impl MatchKey {
    fn of(file: &FileDescriptor) -> Self {
        Self {
            path: file.path.clone(),
            size: file.size,
            modified: file.modified,
        }
    }
}

/// Bounded first-in-first-out memo of rule indices (`None` = unmatched).
#[derive(Debug)]
struct MatchMemo {
    entries: HashMap<MatchKey, Option<usize>>,
    order: VecDeque<MatchKey>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl MatchMemo {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    fn get(&mut self, key: &MatchKey) -> Option<Option<usize>> {
        match self.entries.get(key) {
            Some(found) => {
                self.hits += 1;
                Some(*found)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn insert(&mut self, key: MatchKey, value: Option<usize>) {
        if self.capacity == 0 || self.entries.contains_key(&key) {
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.hits = 0;
        self.misses = 0;
    }
}

/// Memo and pattern-cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
    pub patterns: usize,
    pub pattern_hits: u64,
    pub pattern_misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Rule engine with an extension index, shared pattern compilation and a
/// bounded match memo.
///
/// Classification results are identical to [`RuleEngine`](super::RuleEngine)
/// for the same rule list: each extension maps to the ordered union of the
/// rules that name it and the rules that accept any extension, so the first
/// candidate that matches is also the first rule in configured order.
#[derive(Debug)]
pub struct IndexedRuleEngine {
    rules: Vec<CompiledRule>,
    by_extension: HashMap<String, Vec<usize>>,
    any_extension: Vec<usize>,
    patterns: PatternCache,
    memo: Mutex<MatchMemo>,
}

impl Default for IndexedRuleEngine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl IndexedRuleEngine {
    pub fn empty() -> Self {
        Self::with_capacity(MATCH_CACHE_CAPACITY)
    }

    /// Empty engine whose memo holds at most `capacity` results.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rules: Vec::new(),
            by_extension: HashMap::new(),
            any_extension: Vec::new(),
            patterns: PatternCache::new(),
            memo: Mutex::new(MatchMemo::new(capacity)),
        }
    }

    pub fn with_defaults() -> Self {
        let mut engine = Self::empty();
        engine.install(default_rules());
        engine
    }

    pub fn from_rules(rules: Vec<Rule>) -> Result<Self> {
        let mut engine = Self::empty();
        for rule in rules {
            engine.push_rule(rule)?;
        }
        engine.rebuild_index();
        Ok(engine)
    }

    pub fn load_rules(&mut self, path: &Path) -> RuleLoadReport {
        let (rules, mut report) = load_rule_file(path);
        let rejected = self.install(rules);
        report.loaded -= rejected;
        report.skipped += rejected;
        report
    }

    fn install(&mut self, rules: Vec<Rule>) -> usize {
        self.rules.clear();
        self.patterns = PatternCache::new();
        let mut rejected = 0;
        for rule in rules {
            if let Err(e) = self.push_rule(rule) {
                warn!("Skipping rule: {}", e);
                rejected += 1;
            }
        }
        self.rebuild_index();
        info!(
            "Indexed rule engine ready with {} rule(s), {} extension key(s), {} pattern(s)",
            self.rules.len(),
            self.by_extension.len(),
            self.patterns.len()
        );
        rejected
    }

    fn push_rule(&mut self, rule: Rule) -> Result<()> {
        let compiled = CompiledRule::compile_with(rule, &mut self.patterns)?;
        self.rules.push(compiled);
        Ok(())
    }

    /// Recompute candidate lists and drop every memoized result.
    fn rebuild_index(&mut self) {
        let mut by_extension: HashMap<String, Vec<usize>> = HashMap::new();
        let mut any_extension = Vec::new();

        for (index, compiled) in self.rules.iter().enumerate() {
            if !compiled.rule.enabled {
                continue;
            }
            let extensions = compiled.condition.extensions();
            if extensions.is_empty() {
                any_extension.push(index);
            } else {
                for ext in extensions {
                    by_extension.entry(ext.clone()).or_default().push(index);
                }
            }
        }

        for candidates in by_extension.values_mut() {
            candidates.extend_from_slice(&any_extension);
            candidates.sort_unstable();
            candidates.dedup();
        }

        self.by_extension = by_extension;
        self.any_extension = any_extension;
        self.lock_memo().clear();
    }

    fn lock_memo(&self) -> MutexGuard<'_, MatchMemo> {
        self.memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn save_rules(&self, path: &Path) -> anyhow::Result<()> {
        let rules: Vec<Rule> = self.rules.iter().map(|r| (*r.rule).clone()).collect();
        save_rule_file(path, &rules)
    }

    pub fn add_rule(&mut self, rule: Rule) -> Result<()> {
        if self.rules.iter().any(|r| r.rule.id == rule.id) {
            return Err(WiperError::Config(format!("duplicate rule id {:?}", rule.id)));
        }
        self.push_rule(rule)?;
        self.rebuild_index();
        Ok(())
    }

    pub fn remove_rule(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.rule.id != id);
        let removed = before != self.rules.len();
        if removed {
            self.rebuild_index();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rule indices worth testing for `extension`, in configured order.
    fn candidates(&self, extension: &str) -> &[usize] {
        self.by_extension
            .get(&extension.to_lowercase())
            .unwrap_or(&self.any_extension)
    }

    pub fn cache_stats(&self) -> CacheStats {
        let memo = self.lock_memo();
        CacheStats {
            hits: memo.hits,
            misses: memo.misses,
            entries: memo.entries.len(),
            capacity: memo.capacity,
            patterns: self.patterns.len(),
            pattern_hits: self.patterns.hits(),
            pattern_misses: self.patterns.misses(),
        }
    }

    pub fn clear_cache(&self) {
        debug!("Clearing rule match cache");
        self.lock_memo().clear();
    }
}

impl Classifier for IndexedRuleEngine {
    fn match_file(&self, file: &FileDescriptor) -> RuleMatch {
        let key = MatchKey::of(file);
        let memoized = self.lock_memo().get(&key);

        let winner = match memoized {
            Some(winner) => winner,
            None => {
                let winner = self
                    .candidates(&file.extension)
                    .iter()
                    .copied()
                    .find(|&index| self.rules[index].condition.matches(file));
                self.lock_memo().insert(key, winner);
                winner
            }
        };

        match winner {
            Some(index) => RuleMatch::matched(Arc::clone(&self.rules[index].rule), file.clone()),
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
    use crate::rules::{RiskTier, RuleCondition, RuleEngine};
    use std::time::{Duration, UNIX_EPOCH};

    fn file(path: &str, size: u64) -> FileDescriptor {
        let path = PathBuf::from(path);
        FileDescriptor {
            extension: crate::model::real_extension(&path),
            path,
            size,
            is_dir: false,
            modified: Some(UNIX_EPOCH + Duration::from_secs(1_000)),
            created: None,
            is_hidden: false,
            is_readonly: false,
            risk_tier: None,
        }
    }

    fn mixed_rules() -> Vec<Rule> {
        vec![
            // Extension-free rule ahead of extension rules: a file it
            // matches must never be claimed by a later extension rule.
            Rule::new(
                "huge",
                "Huge files",
                RuleCondition {
                    min_size: Some(1_000),
                    ..Default::default()
                },
                RiskTier::Review,
            ),
            Rule::new("tmp", "Temp", RuleCondition::extensions([".tmp"]), RiskTier::Safe),
            Rule::new(
                "dumps",
                "Dumps",
                RuleCondition {
                    path_pattern: Some("*/dumps/*".to_string()),
                    ..Default::default()
                },
                RiskTier::System,
            ),
            Rule::new(
                "logs",
                "Logs",
                RuleCondition::extensions([".log", ".tmp"]),
                RiskTier::Review,
            ),
            Rule::new("off", "Disabled", RuleCondition::default(), RiskTier::System).disabled(),
        ]
    }

    #[test]
    fn test_agrees_with_baseline() -> Result<()> {
        let baseline = RuleEngine::from_rules(mixed_rules())?;
        let indexed = IndexedRuleEngine::from_rules(mixed_rules())?;

        let files = [
            file("/a/small.tmp", 10),
            file("/a/big.tmp", 5_000),
            file("/a/dumps/core.tmp", 10),
            file("/a/dumps/core.bin", 10),
            file("/a/server.LOG", 10),
            file("/a/notes.txt", 10),
            file("/a/noext", 10),
        ];
        for f in &files {
            let expected = baseline.match_file(f).rule.map(|r| r.id.clone());
            let actual = indexed.match_file(f).rule.map(|r| r.id.clone());
            assert_eq!(actual, expected, "{:?}", f.path);
        }

        assert_eq!(indexed.classify(&files[1]), Some(RiskTier::Review));
        assert_eq!(indexed.classify(&files[3]), Some(RiskTier::System));
        assert_eq!(indexed.classify(&files[5]), None);
        Ok(())
    }

    #[test]
    fn test_memo_hits_and_staleness_key() -> Result<()> {
        let engine = IndexedRuleEngine::from_rules(mixed_rules())?;
        let original = file("/a/grow.bin", 10);

        assert_eq!(engine.classify(&original), None);
        assert_eq!(engine.classify(&original), None);
        let stats = engine.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);

        // Same path, rewritten larger: must be evaluated again.
        let rewritten = file("/a/grow.bin", 5_000);
        assert_eq!(engine.classify(&rewritten), Some(RiskTier::Review));
        assert_eq!(engine.cache_stats().entries, 2);
        Ok(())
    }

    #[test]
    fn test_memo_evicts_oldest_first() -> Result<()> {
        let mut engine = IndexedRuleEngine::with_capacity(2);
        engine.add_rule(Rule::new("tmp", "Temp", RuleCondition::extensions(["tmp"]), RiskTier::Safe))?;

        let a = file("/a.tmp", 1);
        let b = file("/b.tmp", 1);
        let c = file("/c.tmp", 1);
        engine.match_file(&a);
        engine.match_file(&b);
        engine.match_file(&c);
        assert_eq!(engine.cache_stats().entries, 2);

        engine.match_file(&c);
        assert_eq!(engine.cache_stats().hits, 1);
        engine.match_file(&a);
        assert_eq!(engine.cache_stats().hits, 1, "oldest entry should be gone");
        Ok(())
    }

    #[test]
    fn test_mutation_invalidates_memo() -> Result<()> {
        let mut engine = IndexedRuleEngine::with_defaults();
        let f = file("/x/a.tmp", 1);
        assert_eq!(engine.classify(&f), Some(RiskTier::Safe));

        assert!(engine.remove_rule("temp_files"));
        assert_eq!(engine.classify(&f), None);

        engine.clear_cache();
        assert_eq!(engine.cache_stats().entries, 0);
        Ok(())
    }

    #[test]
    fn test_patterns_are_shared() -> Result<()> {
        let same_glob = |id: &str| {
            Rule::new(
                id,
                id,
                RuleCondition {
                    path_pattern: Some("*/cache/*".to_string()),
                    ..Default::default()
                },
                RiskTier::Safe,
            )
        };
        let engine = IndexedRuleEngine::from_rules(vec![same_glob("one"), same_glob("two")])?;
        let stats = engine.cache_stats();
        assert_eq!(stats.patterns, 1);
        assert_eq!(stats.pattern_hits, 1);
        Ok(())
    }
}
