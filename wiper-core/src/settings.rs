use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::analyzer::AnalyzerConfig;
use crate::cleaner::CleanPolicy;
use crate::scanner::{ScanConfig, TraversalStrategy};

/// Which rule engine classifies scan results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Linear first-match evaluation.
    #[default]
    Baseline,
    /// Extension index with memoized matches.
    Indexed,
}

/// Where deleted files go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecycleMode {
    /// The platform trash.
    #[default]
    System,
    /// Log only; nothing is removed.
    Simulate,
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub rules_path: PathBuf,
    pub cache_path: PathBuf,
    /// Extensions that are never deleted.
    pub whitelist_extensions: Vec<String>,
    /// Protected in addition to the platform defaults.
    pub protected_paths: Vec<PathBuf>,
    pub traversal: TraversalStrategy,
    pub rule_engine: EngineKind,
    pub recycle: RecycleMode,
    pub analyzer: AnalyzerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        let config_dir = dirs::config_dir().map(|d| d.join("wiper"));
        let cache_dir = dirs::cache_dir().map(|d| d.join("wiper"));
        let fallback = || PathBuf::from(".wiper");

        Self {
            rules_path: config_dir.unwrap_or_else(fallback).join("rules.json"),
            cache_path: cache_dir.unwrap_or_else(fallback).join("scan_cache.json"),
            whitelist_extensions: Vec::new(),
            protected_paths: Vec::new(),
            traversal: TraversalStrategy::default(),
            rule_engine: EngineKind::default(),
            recycle: RecycleMode::default(),
            analyzer: AnalyzerConfig::default(),
        }
    }
}

impl Settings {
    /// `<config dir>/wiper/settings.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("wiper").join("settings.toml"))
    }

    /// Read settings from `path`. A missing file yields the defaults; a
    /// malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {path:?}"))?;
        let settings = toml::from_str(&content)
            .with_context(|| format!("Invalid settings file {path:?}"))?;
        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Settings from [`default_path`](Self::default_path), or the defaults
    /// when the platform has no config directory.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings directory {parent:?}"))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to encode settings")?;
        fs::write(path, content).with_context(|| format!("Failed to write settings to {path:?}"))?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            strategy: self.traversal,
            ..Default::default()
        }
    }

    pub fn clean_policy(&self) -> CleanPolicy {
        CleanPolicy {
            whitelist_extensions: self.whitelist_extensions.clone(),
            ..Default::default()
        }
    }
}
