use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::ScanCache;
use crate::error::WiperError;
use crate::events::{DomainEvent, EventBus, EventKind};
use crate::model::{FileDescriptor, ScanResult, ScanTarget};
use crate::safety::SafetyValidator;
use crate::state::StateCoordinator;

/// How a target directory is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TraversalStrategy {
    /// One entry at a time through `walkdir`.
    #[default]
    Walk,
    /// Explicit work stack; attributes are fetched per directory in a batch.
    Stack,
}

/// Scanner configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub strategy: TraversalStrategy,
    /// Directories with at least this many entries have their attributes
    /// fetched in parallel (stack traversal only).
    pub parallel_threshold: usize,
    /// Record file sizes into the scan cache.
    pub record_cache: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            strategy: TraversalStrategy::Walk,
            parallel_threshold: 100,
            record_cache: true,
        }
    }
}

/// Walks scan targets and yields one [`ScanResult`] per target.
pub struct Scanner {
    config: ScanConfig,
    safety: Arc<SafetyValidator>,
    state: Arc<StateCoordinator>,
    bus: Arc<EventBus>,
    cache: Arc<ScanCache>,
}

impl Scanner {
    pub fn new(
        config: ScanConfig,
        safety: Arc<SafetyValidator>,
        state: Arc<StateCoordinator>,
        bus: Arc<EventBus>,
        cache: Arc<ScanCache>,
    ) -> Self {
        Self {
            config,
            safety,
            state,
            bus,
            cache,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn cache(&self) -> &ScanCache {
        &self.cache
    }

    /// Lazily scan `targets` in order.
    ///
    /// Nothing happens until the first call to `next`. Disabled targets are
    /// skipped; a target whose root is missing yields a failed result.
    /// Cancellation is checked between targets and between directory
    /// entries.
    pub fn scan(&self, targets: Vec<ScanTarget>) -> ScanIter<'_> {
        ScanIter {
            scanner: self,
            total: targets.len(),
            targets: targets.into_iter(),
            position: 0,
            scanned: 0,
            started: false,
            finished: false,
            cancelled: false,
        }
    }

    /// Walk a single target to completion (or cancellation).
    pub fn scan_target(&self, target: &ScanTarget) -> ScanResult {
        let start_time = Instant::now();
        let root = &target.path;
        info!("Scanning target {} at {:?}", target.id, root);

        if !root.exists() {
            warn!("Scan root missing: {:?}", root);
            return ScanResult::failed(
                target.clone(),
                WiperError::NotFound(root.clone()).to_string(),
            );
        }
        if !root.is_dir() {
            return ScanResult::failed(
                target.clone(),
                format!("Path is not a directory: {}", root.display()),
            );
        }

        let mut result = ScanResult::new(target.clone());
        for descriptor in self.scan_directory(root) {
            result.push(descriptor);
        }
        result.duration = start_time.elapsed();

        info!(
            "Target {}: {} files, {} dirs, {} in {:?}",
            target.id,
            result.file_count,
            result.dir_count,
            result.formatted_size(),
            result.duration
        );
        result
    }

    /// Depth-first walk of everything below `root`.
    ///
    /// Symlinks are never followed or reported, protected locations are
    /// pruned, and unreadable entries are logged and skipped. Entries of a
    /// directory are visited in file-name order.
    pub fn scan_directory(&self, root: &Path) -> DirectoryWalk<'_> {
        let inner = match self.config.strategy {
            TraversalStrategy::Walk => Traversal::Walk(WalkTraversal::new(self, root)),
            TraversalStrategy::Stack => Traversal::Stack(StackTraversal::new(self, root)),
        };
        DirectoryWalk {
            scanner: self,
            inner,
        }
    }

    fn cancelled(&self) -> bool {
        self.state.is_cancel_requested()
    }

    fn publish(&self, event: DomainEvent) {
        self.bus.publish(event);
    }
}

/// Sequence of per-target results produced by [`Scanner::scan`].
pub struct ScanIter<'a> {
    scanner: &'a Scanner,
    targets: std::vec::IntoIter<ScanTarget>,
    total: usize,
    position: usize,
    scanned: usize,
    started: bool,
    finished: bool,
    cancelled: bool,
}

impl ScanIter<'_> {
    /// Whether this run stopped on a cancellation request rather than by
    /// running out of targets. Settled once the iterator returns `None`.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    fn finish(&mut self, cancelled: bool) {
        self.finished = true;
        self.cancelled = cancelled;
        if let Err(e) = self.scanner.cache.flush() {
            warn!("Scan cache flush failed: {:#}", e);
        }
        if cancelled {
            info!("Scan cancelled after {} target(s)", self.scanned);
        }
        self.scanner.publish(
            DomainEvent::new(EventKind::ScanCompleted)
                .with("targets_scanned", self.scanned)
                .with("cancelled", cancelled),
        );
    }
}

impl Iterator for ScanIter<'_> {
    type Item = ScanResult;

    fn next(&mut self) -> Option<ScanResult> {
        if self.finished {
            return None;
        }
        if !self.started {
            self.started = true;
            self.scanner
                .publish(DomainEvent::new(EventKind::ScanStarted).with("target_count", self.total));
        }

        loop {
            if self.scanner.cancelled() {
                self.finish(true);
                return None;
            }

            let Some(target) = self.targets.next() else {
                self.finish(false);
                return None;
            };
            self.position += 1;

            if !target.enabled {
                debug!("Skipping disabled target {}", target.id);
                continue;
            }

            let result = self.scanner.scan_target(&target);
            self.scanned += 1;
            self.scanner.publish(
                DomainEvent::new(EventKind::ScanProgress)
                    .with("current", self.position)
                    .with("total", self.total)
                    .with("target_id", target.id.as_str())
                    .with("file_count", result.file_count)
                    .with("total_size", result.total_size),
            );
            return Some(result);
        }
    }
}

/// Descriptors below one root, produced by [`Scanner::scan_directory`].
pub struct DirectoryWalk<'a> {
    scanner: &'a Scanner,
    inner: Traversal<'a>,
}

enum Traversal<'a> {
    Walk(WalkTraversal<'a>),
    Stack(StackTraversal<'a>),
}

impl Iterator for DirectoryWalk<'_> {
    type Item = FileDescriptor;

    fn next(&mut self) -> Option<FileDescriptor> {
        let descriptor = match &mut self.inner {
            Traversal::Walk(walk) => walk.next(),
            Traversal::Stack(stack) => stack.next(),
        }?;

        if self.scanner.config.record_cache && !descriptor.is_dir {
            self.scanner
                .cache
                .set(&descriptor.path, descriptor.size, descriptor.modified);
        }
        Some(descriptor)
    }
}

fn log_skipped(path: &Path, error: &io::Error) {
    if error.kind() == io::ErrorKind::PermissionDenied {
        warn!("Permission denied, skipping {:?}", path);
    } else {
        warn!("Cannot read {:?}, skipping: {}", path, error);
    }
}

struct WalkTraversal<'a> {
    scanner: &'a Scanner,
    walker: walkdir::IntoIter,
    done: bool,
}

impl<'a> WalkTraversal<'a> {
    fn new(scanner: &'a Scanner, root: &Path) -> Self {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();
        Self {
            scanner,
            walker,
            done: false,
        }
    }
}

impl Iterator for WalkTraversal<'_> {
    type Item = FileDescriptor;

    fn next(&mut self) -> Option<FileDescriptor> {
        while !self.done {
            if self.scanner.cancelled() {
                debug!("Traversal stopped by cancellation");
                self.done = true;
                return None;
            }

            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    match e.io_error() {
                        Some(io_error) => log_skipped(&path, io_error),
                        None => warn!("Traversal error: {}", e),
                    }
                    continue;
                }
            };

            if entry.path_is_symlink() {
                debug!("Skipping symlink {:?}", entry.path());
                continue;
            }

            if self.scanner.safety.is_system_path(entry.path()) {
                debug!("Skipping protected path {:?}", entry.path());
                if entry.file_type().is_dir() {
                    self.walker.skip_current_dir();
                }
                continue;
            }

            match entry.metadata() {
                Ok(metadata) => {
                    return Some(FileDescriptor::from_metadata(entry.into_path(), &metadata));
                }
                Err(e) => {
                    match e.io_error() {
                        Some(io_error) => log_skipped(entry.path(), io_error),
                        None => warn!("Cannot stat {:?}: {}", entry.path(), e),
                    }
                    continue;
                }
            }
        }
        None
    }
}

struct StackTraversal<'a> {
    scanner: &'a Scanner,
    stack: Vec<PathBuf>,
    ready: VecDeque<FileDescriptor>,
}

impl<'a> StackTraversal<'a> {
    fn new(scanner: &'a Scanner, root: &Path) -> Self {
        Self {
            scanner,
            stack: vec![root.to_path_buf()],
            ready: VecDeque::new(),
        }
    }

    /// Read one directory and describe all of its entries at once.
    fn read_batch(&self, dir: &Path) -> Vec<FileDescriptor> {
        let mut entries: Vec<fs::DirEntry> = match fs::read_dir(dir) {
            Ok(read_dir) => read_dir
                .filter_map(|entry| entry.map_err(|e| log_skipped(dir, &e)).ok())
                .collect(),
            Err(e) => {
                log_skipped(dir, &e);
                return Vec::new();
            }
        };
        entries.sort_by_key(fs::DirEntry::file_name);

        let safety = &self.scanner.safety;
        let describe = |entry: &fs::DirEntry| -> Option<FileDescriptor> {
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(e) => {
                    log_skipped(&path, &e);
                    return None;
                }
            };
            if file_type.is_symlink() {
                debug!("Skipping symlink {:?}", path);
                return None;
            }
            if safety.is_system_path(&path) {
                debug!("Skipping protected path {:?}", path);
                return None;
            }
            match entry.metadata() {
                Ok(metadata) => Some(FileDescriptor::from_metadata(path, &metadata)),
                Err(e) => {
                    log_skipped(&path, &e);
                    None
                }
            }
        };

        if entries.len() >= self.scanner.config.parallel_threshold {
            entries.par_iter().filter_map(describe).collect()
        } else {
            entries.iter().filter_map(describe).collect()
        }
    }
}

impl Iterator for StackTraversal<'_> {
    type Item = FileDescriptor;

    fn next(&mut self) -> Option<FileDescriptor> {
        loop {
            if self.scanner.cancelled() {
                debug!("Traversal stopped by cancellation");
                self.stack.clear();
                self.ready.clear();
                return None;
            }

            if let Some(descriptor) = self.ready.pop_front() {
                return Some(descriptor);
            }

            let dir = self.stack.pop()?;
            let batch = self.read_batch(&dir);
            // Reverse push keeps the first subdirectory on top of the stack.
            self.stack.extend(
                batch
                    .iter()
                    .rev()
                    .filter(|d| d.is_dir)
                    .map(|d| d.path.clone()),
            );
            self.ready.extend(batch);
        }
    }
}
