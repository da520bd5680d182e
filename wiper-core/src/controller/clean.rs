use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

use super::{Worker, lock, run_guarded};
use crate::cleaner::DeletionExecutor;
use crate::events::{DomainEvent, EventBus, EventKind};
use crate::model::FileDescriptor;
use crate::rules::{Classifier, RiskTier};
use crate::safety::SafetyVerdict;
use crate::state::{StateCoordinator, SystemState};
use crate::{CleanResult, format_bytes};

/// What a clean would do, computed without touching anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanPreview {
    pub file_count: usize,
    pub total_size: u64,
    pub formatted_size: String,
    /// Deletable files classified as Safe.
    pub safe_files: usize,
    /// Deletable files that are Review, System or unclassified.
    pub risky_files: usize,
    /// Files under protected locations or on the critical-file list.
    pub system_files: usize,
    /// Other files the validator rejects (missing, whitelisted).
    pub excluded_files: usize,
    pub recycle_bin_warning: bool,
    /// Share of the recycle-bin threshold this clean would use, in percent.
    pub recycle_bin_usage: f64,
}

impl CleanPreview {
    pub fn usage_label(&self) -> String {
        format!("{:.1}%", self.recycle_bin_usage)
    }
}

/// Presentation-ready summary of a finished clean.
#[derive(Debug, Clone, Serialize)]
pub struct CleanReport {
    pub success: bool,
    pub cancelled: bool,
    pub files_deleted: usize,
    pub skipped: usize,
    pub freed_space: u64,
    pub formatted_size: String,
    pub duration: Duration,
    pub error_count: usize,
    pub errors: Vec<String>,
    pub generated_at: SystemTime,
}

impl From<&CleanResult> for CleanReport {
    fn from(result: &CleanResult) -> Self {
        Self {
            success: result.success,
            cancelled: result.cancelled,
            files_deleted: result.files_deleted,
            skipped: result.skipped,
            freed_space: result.freed_space,
            formatted_size: result.format_size(),
            duration: result.duration,
            error_count: result.errors.len(),
            errors: result.errors.clone(),
            generated_at: SystemTime::now(),
        }
    }
}

#[derive(Debug, Default)]
struct CleanShared {
    confirmed: bool,
    result: Option<CleanResult>,
}

/// Gatekeeper for deletions: preview, explicit confirmation, then a
/// background clean.
pub struct CleanController {
    executor: Arc<DeletionExecutor>,
    classifier: Option<Arc<dyn Classifier>>,
    state: Arc<StateCoordinator>,
    bus: Arc<EventBus>,
    shared: Arc<Mutex<CleanShared>>,
    worker: Worker,
}

impl CleanController {
    pub fn new(
        executor: Arc<DeletionExecutor>,
        state: Arc<StateCoordinator>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            executor,
            classifier: None,
            state,
            bus,
            shared: Arc::default(),
            worker: Worker::default(),
        }
    }

    /// Classify untagged files when computing the preview breakdown.
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Statistics for cleaning `files`.
    ///
    /// Nothing on disk and nothing in the coordinator changes. Any earlier
    /// confirmation is withdrawn because it was given for a different
    /// preview.
    pub fn preview_clean(&self, files: &[FileDescriptor]) -> CleanPreview {
        lock(&self.shared).confirmed = false;

        let policy = self.executor.policy();
        let total_size: u64 = files.iter().map(|f| f.size).sum();
        let mut preview = CleanPreview {
            file_count: files.len(),
            total_size,
            formatted_size: format_bytes(total_size),
            safe_files: 0,
            risky_files: 0,
            system_files: 0,
            excluded_files: 0,
            recycle_bin_warning: total_size > policy.recycle_bin_threshold,
            recycle_bin_usage: total_size as f64 / policy.recycle_bin_threshold.max(1) as f64
                * 100.0,
        };

        for file in files {
            match self
                .executor
                .safety()
                .is_safe_to_delete(&file.path, &policy.whitelist_extensions)
            {
                SafetyVerdict::Unsafe(reason) if reason.is_system() => preview.system_files += 1,
                SafetyVerdict::Unsafe(_) => preview.excluded_files += 1,
                SafetyVerdict::Safe => {
                    let tier = file.risk_tier.or_else(|| {
                        self.classifier.as_ref().and_then(|c| c.classify(file))
                    });
                    if tier == Some(RiskTier::Safe) {
                        preview.safe_files += 1;
                    } else {
                        preview.risky_files += 1;
                    }
                }
            }
        }

        info!(
            "Clean preview: {} files, {}, {} risky, {} system",
            preview.file_count, preview.formatted_size, preview.risky_files, preview.system_files
        );
        preview
    }

    /// Record the user's go-ahead for the next clean.
    pub fn confirm_clean(&self) -> bool {
        lock(&self.shared).confirmed = true;
        info!("Clean confirmed");
        true
    }

    pub fn is_confirmed(&self) -> bool {
        lock(&self.shared).confirmed
    }

    pub fn reset_confirmation(&self) {
        lock(&self.shared).confirmed = false;
    }

    /// Delete `files` on a background thread.
    ///
    /// With `require_confirmation` the call is refused unless
    /// [`confirm_clean`](Self::confirm_clean) was called since the last
    /// preview; the confirmation is consumed by the clean it authorizes.
    /// Allowed from Idle, or straight from Scanning.
    pub fn start_clean(&self, files: Vec<FileDescriptor>, require_confirmation: bool) -> bool {
        if files.is_empty() {
            warn!("No files to clean");
            return false;
        }
        let was_confirmed = {
            let mut shared = lock(&self.shared);
            if require_confirmation && !shared.confirmed {
                warn!("Clean not confirmed");
                return false;
            }
            std::mem::take(&mut shared.confirmed)
        };
        if let Err(e) = self.state.transition(SystemState::Cleaning) {
            warn!("Cannot start clean: {}", e);
            lock(&self.shared).confirmed = was_confirmed;
            return false;
        }
        lock(&self.shared).result = None;

        let executor = Arc::clone(&self.executor);
        let state = Arc::clone(&self.state);
        let bus = Arc::clone(&self.bus);
        let shared = Arc::clone(&self.shared);
        let file_count = files.len();

        let spawned = self.worker.spawn("clean-worker", move || {
            let result = match run_guarded(|| executor.clean(&files)) {
                Ok(result) => result,
                Err(reason) => {
                    error!("Clean worker failed: {}", reason);
                    bus.publish(
                        DomainEvent::new(EventKind::CleanFailed).with("reason", reason.as_str()),
                    );
                    CleanResult::failed(reason)
                }
            };
            lock(&shared).result = Some(result);
            state.release(SystemState::Cleaning);
        });

        if let Err(e) = spawned {
            error!("Failed to start clean worker: {}", e);
            self.state.release(SystemState::Cleaning);
            return false;
        }
        info!("Clean started for {} file(s)", file_count);
        true
    }

    /// Ask the running clean to stop before its next file.
    pub fn cancel_clean(&self) -> bool {
        if !self.state.request_cancel_for(SystemState::Cleaning) {
            warn!("No clean in progress to cancel");
            return false;
        }
        true
    }

    pub fn get_result(&self) -> Option<CleanResult> {
        lock(&self.shared).result.clone()
    }

    pub fn get_report(&self) -> Option<CleanReport> {
        lock(&self.shared).result.as_ref().map(CleanReport::from)
    }

    pub fn is_cleaning(&self) -> bool {
        self.state.is_cleaning()
    }

    pub fn is_complete(&self) -> bool {
        self.worker.is_complete()
    }

    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        self.worker.wait(timeout)
    }
}
