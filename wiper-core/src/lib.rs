use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod analyzer;
pub mod cache;
pub mod cleaner;
pub mod context;
pub mod controller;
pub mod error;
pub mod events;
pub mod model;
pub mod rules;
pub mod safety;
pub mod scanner;
pub mod settings;
pub mod state;

pub use analyzer::{AnalyzerConfig, AppCluster, AppClusterAnalyzer};
pub use cache::ScanCache;
pub use cleaner::{
    CleanPolicy, DeletionExecutor, RECYCLE_BIN_THRESHOLD, RecycleBin, SimulatedRecycleBin,
    default_recycle_bin,
};
pub use context::AppContext;
pub use controller::{
    AnalysisController, AnalysisReport, CleanController, CleanPreview, CleanReport,
    ScanController, ScanSummary,
};
pub use error::{Result, WiperError};
pub use events::{DomainEvent, EventBus, EventKind, SubscriptionId};
pub use model::{FileDescriptor, ScanResult, ScanTarget};
pub use rules::{Classifier, IndexedRuleEngine, RiskTier, Rule, RuleCondition, RuleEngine, RuleMatch};
pub use safety::{SafetyValidator, SafetyVerdict, UnsafeReason};
pub use scanner::{ScanConfig, Scanner, TraversalStrategy};
pub use settings::{EngineKind, RecycleMode, Settings};
pub use state::{StateCoordinator, SystemState};

#[cfg(any(
    windows,
    target_os = "macos",
    target_os = "linux",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
pub use cleaner::SystemRecycleBin;

/// Outcome of one clean run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanResult {
    /// False when the run was cancelled or the worker failed. Per-file
    /// errors do not clear it.
    pub success: bool,
    pub files_deleted: usize,
    /// Files rejected by the safety validator.
    pub skipped: usize,
    pub freed_space: u64,
    pub errors: Vec<String>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl Default for CleanResult {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanResult {
    pub fn new() -> Self {
        Self {
            success: true,
            files_deleted: 0,
            skipped: 0,
            freed_space: 0,
            errors: Vec::new(),
            cancelled: false,
            duration: Duration::ZERO,
        }
    }

    /// Result of a run that never got to delete anything.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![reason.into()],
            ..Self::new()
        }
    }

    pub fn add_success(&mut self, size_freed: u64) {
        self.files_deleted += 1;
        self.freed_space += size_freed;
    }

    pub fn add_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn add_failure(&mut self, message: String) {
        self.errors.push(message);
    }

    pub fn format_size(&self) -> String {
        format_bytes(self.freed_space)
    }
}

/// Render a byte count with 1024-based units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
