use regex::{Regex, RegexBuilder};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{Rule, RuleCondition};
use crate::error::{Result, WiperError};
use crate::model::{FileDescriptor, normalize_extension};

/// Translate a path glob into an anchored regex.
///
/// `*` matches any run of characters (separators included) and `?` exactly
/// one; everything else is literal. Backslashes are treated as separators so
/// Windows-style patterns work on normalized paths.
pub fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    let mut literal = [0u8; 4];
    for ch in glob.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' | '/' => out.push('/'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut literal))),
        }
    }
    out.push('$');
    out
}

/// Path text that globs are matched against.
fn match_text(file: &FileDescriptor) -> Cow<'_, str> {
    let text = file.path.to_string_lossy();
    if cfg!(windows) {
        Cow::Owned(text.replace('\\', "/"))
    } else {
        text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PatternKey {
    Glob(String),
    Regex(String),
}

/// Compiled patterns shared between rules that use the same text.
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: HashMap<PatternKey, Regex>,
    hits: u64,
    misses: u64,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn glob(&mut self, pattern: &str) -> Result<Regex> {
        self.get_or_compile(PatternKey::Glob(pattern.to_string()), || {
            glob_to_regex(pattern)
        })
    }

    pub fn regex(&mut self, pattern: &str) -> Result<Regex> {
        self.get_or_compile(PatternKey::Regex(pattern.to_string()), || {
            pattern.to_string()
        })
    }

    fn get_or_compile(&mut self, key: PatternKey, source: impl FnOnce() -> String) -> Result<Regex> {
        if let Some(regex) = self.compiled.get(&key) {
            self.hits += 1;
            return Ok(regex.clone());
        }
        self.misses += 1;

        let source = source();
        let regex = RegexBuilder::new(&source)
            .case_insensitive(true)
            .build()
            .map_err(|e| WiperError::Config(format!("invalid pattern {source:?}: {e}")))?;
        self.compiled.insert(key, regex.clone());
        Ok(regex)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

/// A [`RuleCondition`] with its patterns compiled and extensions normalized.
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    path: Option<Regex>,
    extensions: HashSet<String>,
    min_size: Option<u64>,
    max_size: Option<u64>,
    name: Option<Regex>,
}

impl CompiledCondition {
    pub fn compile(condition: &RuleCondition) -> Result<Self> {
        Self::compile_with(condition, &mut PatternCache::new())
    }

    pub fn compile_with(condition: &RuleCondition, cache: &mut PatternCache) -> Result<Self> {
        let path = condition
            .path_pattern
            .as_deref()
            .map(|glob| cache.glob(glob))
            .transpose()?;
        let name = condition
            .name_pattern
            .as_deref()
            .map(|regex| cache.regex(regex))
            .transpose()?;
        let extensions = condition
            .extensions
            .iter()
            .map(|ext| normalize_extension(ext))
            .filter(|ext| !ext.is_empty())
            .collect();

        Ok(Self {
            path,
            extensions,
            min_size: condition.min_size,
            max_size: condition.max_size,
            name,
        })
    }

    /// Normalized extensions this condition requires; empty means any.
    pub fn extensions(&self) -> &HashSet<String> {
        &self.extensions
    }

    /// True when every present component holds. Cheap checks run first.
    pub fn matches(&self, file: &FileDescriptor) -> bool {
        if !self.extensions.is_empty() && !self.extensions.contains(&file.extension.to_lowercase())
        {
            return false;
        }
        if self.min_size.is_some_and(|min| file.size < min) {
            return false;
        }
        if self.max_size.is_some_and(|max| file.size > max) {
            return false;
        }
        if let Some(path) = &self.path {
            if !path.is_match(&match_text(file)) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if !name.is_match(&file.file_name()) {
                return false;
            }
        }
        true
    }
}

/// A rule paired with its compiled condition.
#[derive(Debug, Clone)]
pub(super) struct CompiledRule {
    pub(super) rule: Arc<Rule>,
    pub(super) condition: CompiledCondition,
}

impl CompiledRule {
    pub(super) fn compile(rule: Rule) -> Result<Self> {
        Self::compile_with(rule, &mut PatternCache::new())
    }

    pub(super) fn compile_with(rule: Rule, cache: &mut PatternCache) -> Result<Self> {
        let condition = CompiledCondition::compile_with(&rule.condition, cache)
            .map_err(|e| WiperError::Config(format!("rule {:?}: {e}", rule.id)))?;
        Ok(Self {
            rule: Arc::new(rule),
            condition,
        })
    }
}
