use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

use super::{Rule, default_rules};
use crate::error::{Result, WiperError};

/// Where the active rule set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSource {
    File,
    Defaults,
}

/// Summary of a rule load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleLoadReport {
    pub source: RuleSource,
    pub loaded: usize,
    /// Entries dropped because they were malformed, duplicated or failed to
    /// compile.
    pub skipped: usize,
}

/// On-disk rule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDocument {
    pub version: String,
    pub rules: Vec<Rule>,
}

impl RuleDocument {
    pub const VERSION: &'static str = "1.0";

    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            version: Self::VERSION.to_string(),
            rules,
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

/// Parse the whole document into a JSON tree regardless of on-disk format.
fn read_document(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)?;
    if is_toml(path) {
        let table: toml::Table = toml::from_str(&content)?;
        Ok(serde_json::to_value(table)?)
    } else {
        Ok(serde_json::from_str(&content)?)
    }
}

/// Read rules from `path`, falling back to [`default_rules`].
///
/// A missing file installs the defaults in memory without writing them. A
/// file that cannot be read or parsed as a whole also yields the defaults.
/// Individual malformed or duplicate entries are skipped with a warning.
pub fn load_rule_file(path: &Path) -> (Vec<Rule>, RuleLoadReport) {
    let defaults = |skipped| {
        let rules = default_rules();
        let report = RuleLoadReport {
            source: RuleSource::Defaults,
            loaded: rules.len(),
            skipped,
        };
        (rules, report)
    };

    if !path.exists() {
        info!("No rule file at {:?}, using built-in rules", path);
        return defaults(0);
    }

    let document = match read_document(path) {
        Ok(document) => document,
        Err(e) => {
            error!("Unreadable rule file {:?}, using built-in rules: {}", path, e);
            return defaults(0);
        }
    };

    let entries = match &document {
        Value::Object(map) => map.get("rules").and_then(Value::as_array),
        Value::Array(list) => Some(list),
        _ => None,
    };
    let Some(entries) = entries else {
        let e = WiperError::Config("document has no \"rules\" list".to_string());
        error!("{} in {:?}, using built-in rules", e, path);
        return defaults(0);
    };

    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(entries.len());
    let mut skipped = 0;
    for (index, entry) in entries.iter().enumerate() {
        match Rule::deserialize(entry) {
            Ok(rule) if !seen.insert(rule.id.clone()) => {
                warn!("Skipping duplicate rule id {:?} (entry {})", rule.id, index);
                skipped += 1;
            }
            Ok(rule) => rules.push(rule),
            Err(e) => {
                warn!("Skipping malformed rule entry {} in {:?}: {}", index, path, e);
                skipped += 1;
            }
        }
    }

    info!(
        "Loaded {} rule(s) from {:?} ({} skipped)",
        rules.len(),
        path,
        skipped
    );
    let report = RuleLoadReport {
        source: RuleSource::File,
        loaded: rules.len(),
        skipped,
    };
    (rules, report)
}

/// Write `rules` as a versioned document; TOML for `.toml` paths, JSON
/// otherwise.
pub fn save_rule_file(path: &Path, rules: &[Rule]) -> anyhow::Result<()> {
    let document = RuleDocument::new(rules.to_vec());
    let content = if is_toml(path) {
        toml::to_string_pretty(&document).context("Failed to encode rules as TOML")?
    } else {
        serde_json::to_string_pretty(&document).context("Failed to encode rules as JSON")?
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create rule directory {parent:?}"))?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write rules to {path:?}"))?;
    info!("Saved {} rule(s) to {:?}", rules.len(), path);
    Ok(())
}
