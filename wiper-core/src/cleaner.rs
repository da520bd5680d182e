use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::CleanResult;
use crate::error::WiperError;
use crate::events::{CANCELLED_REASON, DomainEvent, EventBus, EventKind};
use crate::model::FileDescriptor;
use crate::safety::{SafetyValidator, SafetyVerdict, UnsafeReason};
use crate::state::StateCoordinator;

/// Recoverable deletion primitive.
///
/// Implementations move files somewhere the user can restore them from.
/// None of them may fall back to a permanent unlink.
pub trait RecycleBin: Send + Sync {
    fn recycle(&self, path: &Path) -> Result<()>;

    fn name(&self) -> &'static str;

    /// Whether files are actually left in place.
    fn is_simulated(&self) -> bool {
        false
    }
}

/// The platform trash (Recycle Bin, Finder Trash, freedesktop Trash).
#[cfg(any(
    windows,
    target_os = "macos",
    target_os = "linux",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRecycleBin;

#[cfg(any(
    windows,
    target_os = "macos",
    target_os = "linux",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
impl RecycleBin for SystemRecycleBin {
    fn recycle(&self, path: &Path) -> Result<()> {
        use anyhow::Context;
        trash::delete(path).with_context(|| format!("Failed to move {path:?} to trash"))
    }

    fn name(&self) -> &'static str {
        "system trash"
    }
}

/// Logs what would be deleted and leaves the file alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedRecycleBin;

impl RecycleBin for SimulatedRecycleBin {
    fn recycle(&self, path: &Path) -> Result<()> {
        info!("Simulated delete: {:?}", path);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "simulated"
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

/// The platform trash where one exists, otherwise a simulated bin.
pub fn default_recycle_bin() -> Arc<dyn RecycleBin> {
    #[cfg(any(
        windows,
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    {
        Arc::new(SystemRecycleBin)
    }
    #[cfg(not(any(
        windows,
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    )))]
    {
        warn!("No trash facility on this platform, deletions will be simulated");
        Arc::new(SimulatedRecycleBin)
    }
}

/// Size above which a clean preview warns about recycle-bin capacity.
pub const RECYCLE_BIN_THRESHOLD: u64 = 1024 * 1024 * 1024;

/// What the deletion executor refuses to touch and how it reports.
#[derive(Debug, Clone)]
pub struct CleanPolicy {
    /// Extensions that must never be deleted.
    pub whitelist_extensions: Vec<String>,
    pub recycle_bin_threshold: u64,
    /// Publish clean-progress every N files.
    pub progress_interval: usize,
}

impl Default for CleanPolicy {
    fn default() -> Self {
        Self {
            whitelist_extensions: Vec::new(),
            recycle_bin_threshold: RECYCLE_BIN_THRESHOLD,
            progress_interval: 10,
        }
    }
}

/// Moves files to the recycle bin after re-validating each one.
pub struct DeletionExecutor {
    policy: CleanPolicy,
    safety: Arc<SafetyValidator>,
    state: Arc<StateCoordinator>,
    bus: Arc<EventBus>,
    recycle_bin: Arc<dyn RecycleBin>,
}

impl DeletionExecutor {
    pub fn new(
        policy: CleanPolicy,
        safety: Arc<SafetyValidator>,
        state: Arc<StateCoordinator>,
        bus: Arc<EventBus>,
        recycle_bin: Arc<dyn RecycleBin>,
    ) -> Self {
        Self {
            policy,
            safety,
            state,
            bus,
            recycle_bin,
        }
    }

    pub fn policy(&self) -> &CleanPolicy {
        &self.policy
    }

    pub fn safety(&self) -> &SafetyValidator {
        &self.safety
    }

    pub fn recycle_bin(&self) -> &dyn RecycleBin {
        self.recycle_bin.as_ref()
    }

    pub fn clean(&self, files: &[FileDescriptor]) -> CleanResult {
        self.clean_with_progress(files, |_, _| {})
    }

    /// Delete `files` in order, calling `progress(done, total)` after each.
    ///
    /// Cancellation is checked before every file. Safety rejections are
    /// counted as skipped; a missing file or a failed move is an error and
    /// the run continues with the next file.
    pub fn clean_with_progress<F>(&self, files: &[FileDescriptor], progress: F) -> CleanResult
    where
        F: Fn(usize, usize),
    {
        let start_time = Instant::now();
        let mut result = CleanResult::new();
        let total = files.len();
        let interval = self.policy.progress_interval.max(1);

        info!(
            "Cleaning {} file(s) via {}",
            total,
            self.recycle_bin.name()
        );
        self.bus.publish(
            DomainEvent::new(EventKind::CleanStarted)
                .with("file_count", total)
                .with("total_size", files.iter().map(|f| f.size).sum::<u64>())
                .with("simulated", self.recycle_bin.is_simulated()),
        );

        for (index, file) in files.iter().enumerate() {
            if self.state.is_cancel_requested() {
                info!("Clean cancelled after {} of {} file(s)", index, total);
                result.cancelled = true;
                result.success = false;
                break;
            }

            self.clean_one(file, &mut result);

            let done = index + 1;
            progress(done, total);
            if done % interval == 0 || done == total {
                self.bus.publish(
                    DomainEvent::new(EventKind::CleanProgress)
                        .with("current", done)
                        .with("total", total)
                        .with("files_deleted", result.files_deleted)
                        .with("freed_space", result.freed_space),
                );
            }
        }

        result.duration = start_time.elapsed();
        info!(
            "Clean finished: {} deleted, {} skipped, {} error(s), {} freed in {:?}",
            result.files_deleted,
            result.skipped,
            result.errors.len(),
            result.format_size(),
            result.duration
        );

        let summary = |kind| {
            DomainEvent::new(kind)
                .with("files_deleted", result.files_deleted)
                .with("skipped", result.skipped)
                .with("freed_space", result.freed_space)
                .with("error_count", result.errors.len())
                .with("duration_ms", result.duration.as_millis() as u64)
        };
        let event = if result.cancelled {
            summary(EventKind::CleanFailed).with("reason", CANCELLED_REASON)
        } else {
            summary(EventKind::CleanCompleted)
        };
        self.bus.publish(event);

        result
    }

    fn clean_one(&self, file: &FileDescriptor, result: &mut CleanResult) {
        match self
            .safety
            .is_safe_to_delete(&file.path, &self.policy.whitelist_extensions)
        {
            SafetyVerdict::Safe => match self.recycle_bin.recycle(&file.path) {
                Ok(()) => {
                    debug!("Deleted {:?}", file.path);
                    result.add_success(file.size);
                }
                Err(e) => {
                    error!("Failed to delete {:?}: {:#}", file.path, e);
                    result.add_failure(format!("Failed to delete {}: {e:#}", file.path.display()));
                }
            },
            SafetyVerdict::Unsafe(UnsafeReason::Missing(path)) => {
                warn!("File vanished before deletion: {:?}", path);
                result.add_failure(format!("File not found: {}", path.display()));
            }
            SafetyVerdict::Unsafe(reason) => {
                let rejection = WiperError::UnsafeDeletion {
                    path: file.path.clone(),
                    reason: reason.to_string(),
                };
                debug!("{}", rejection);
                result.add_skip();
            }
        }
    }
}
