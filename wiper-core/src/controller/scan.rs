use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::{Worker, lock, run_guarded};
use crate::events::{CANCELLED_REASON, DomainEvent, EventBus, EventKind};
use crate::model::{FileDescriptor, ScanResult, ScanTarget};
use crate::rules::{Classifier, RiskTier};
use crate::scanner::Scanner;
use crate::state::{StateCoordinator, SystemState};

/// Counts over the last scan's classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub total_files: usize,
    pub total_size: u64,
    pub safe: usize,
    pub review: usize,
    pub system: usize,
    pub unmatched: usize,
    pub scan_count: usize,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct Buckets {
    safe: Vec<FileDescriptor>,
    review: Vec<FileDescriptor>,
    system: Vec<FileDescriptor>,
    unmatched: Vec<FileDescriptor>,
}

impl Buckets {
    fn tier(&self, tier: RiskTier) -> &Vec<FileDescriptor> {
        match tier {
            RiskTier::Safe => &self.safe,
            RiskTier::Review => &self.review,
            RiskTier::System => &self.system,
        }
    }

    fn push(&mut self, file: FileDescriptor) {
        match file.risk_tier {
            Some(RiskTier::Safe) => self.safe.push(file),
            Some(RiskTier::Review) => self.review.push(file),
            Some(RiskTier::System) => self.system.push(file),
            None => self.unmatched.push(file),
        }
    }
}

#[derive(Debug, Default)]
struct ScanOutcome {
    results: Vec<ScanResult>,
    buckets: Buckets,
    duration: Duration,
}

impl ScanOutcome {
    fn push(&mut self, result: ScanResult) {
        for file in result.regular_files() {
            self.buckets.push(file.clone());
        }
        self.results.push(result);
    }

    fn summary(&self) -> ScanSummary {
        ScanSummary {
            total_files: self.results.iter().map(|r| r.file_count).sum(),
            total_size: self.results.iter().map(|r| r.total_size).sum(),
            safe: self.buckets.safe.len(),
            review: self.buckets.review.len(),
            system: self.buckets.system.len(),
            unmatched: self.buckets.unmatched.len(),
            scan_count: self.results.len(),
            duration: self.duration,
        }
    }
}

/// Runs scans in the background and classifies what they find.
pub struct ScanController {
    scanner: Arc<Scanner>,
    classifier: Arc<dyn Classifier>,
    state: Arc<StateCoordinator>,
    bus: Arc<EventBus>,
    outcome: Arc<Mutex<ScanOutcome>>,
    worker: Worker,
}

impl ScanController {
    pub fn new(
        scanner: Arc<Scanner>,
        classifier: Arc<dyn Classifier>,
        state: Arc<StateCoordinator>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            scanner,
            classifier,
            state,
            bus,
            outcome: Arc::default(),
            worker: Worker::default(),
        }
    }

    /// Start scanning `targets` on a background thread.
    ///
    /// Returns false when there is nothing to scan or another operation
    /// holds the coordinator. Results of the previous scan are discarded.
    pub fn start_scan(&self, targets: Vec<ScanTarget>) -> bool {
        if targets.is_empty() {
            warn!("No targets to scan");
            return false;
        }
        if let Err(e) = self.state.transition(SystemState::Scanning) {
            warn!("Cannot start scan: {}", e);
            return false;
        }
        *lock(&self.outcome) = ScanOutcome::default();

        let scanner = Arc::clone(&self.scanner);
        let classifier = Arc::clone(&self.classifier);
        let state = Arc::clone(&self.state);
        let bus = Arc::clone(&self.bus);
        let outcome = Arc::clone(&self.outcome);
        let target_count = targets.len();

        let spawned = self.worker.spawn("scan-worker", move || {
            let start_time = Instant::now();
            let run = run_guarded(|| {
                let mut results = scanner.scan(targets);
                for result in results.by_ref() {
                    let classified = classify(classifier.as_ref(), result);
                    lock(&outcome).push(classified);
                }
                results.was_cancelled()
            });

            let summary = {
                let mut outcome = lock(&outcome);
                outcome.duration = start_time.elapsed();
                outcome.summary()
            };
            match run {
                Ok(true) => {
                    info!("Scan cancelled after {} target(s)", summary.scan_count);
                    bus.publish(
                        DomainEvent::new(EventKind::ScanFailed)
                            .with("reason", CANCELLED_REASON)
                            .with("completed", summary.scan_count),
                    );
                }
                Ok(false) => {
                    info!(
                        "Scan completed: {} files, {} bytes, {:?}",
                        summary.total_files, summary.total_size, summary.duration
                    );
                    bus.publish(
                        DomainEvent::new(EventKind::ScanCompleted)
                            .with("duration_ms", summary.duration.as_millis() as u64)
                            .with("total_files", summary.total_files)
                            .with("total_size", summary.total_size)
                            .with("safe", summary.safe)
                            .with("review", summary.review)
                            .with("system", summary.system)
                            .with("unmatched", summary.unmatched),
                    );
                }
                Err(reason) => {
                    error!("Scan worker failed: {}", reason);
                    bus.publish(DomainEvent::new(EventKind::ScanFailed).with("reason", reason));
                }
            }
            state.release(SystemState::Scanning);
        });

        if let Err(e) = spawned {
            error!("Failed to start scan worker: {}", e);
            self.state.release(SystemState::Scanning);
            return false;
        }
        info!("Scan started for {} target(s)", target_count);
        true
    }

    /// Ask the running scan to stop at its next checkpoint.
    pub fn cancel_scan(&self) -> bool {
        if !self.state.request_cancel_for(SystemState::Scanning) {
            warn!("No scan in progress to cancel");
            return false;
        }
        true
    }

    pub fn get_results(&self) -> Vec<ScanResult> {
        lock(&self.outcome).results.clone()
    }

    pub fn get_matched_files(&self, tier: RiskTier) -> Vec<FileDescriptor> {
        lock(&self.outcome).buckets.tier(tier).clone()
    }

    pub fn get_unmatched_files(&self) -> Vec<FileDescriptor> {
        lock(&self.outcome).buckets.unmatched.clone()
    }

    /// Every classified file, Safe first, then Review, then System.
    pub fn get_all_matched_files(&self) -> Vec<FileDescriptor> {
        let outcome = lock(&self.outcome);
        RiskTier::ALL
            .iter()
            .flat_map(|tier| outcome.buckets.tier(*tier).iter().cloned())
            .collect()
    }

    pub fn get_summary(&self) -> ScanSummary {
        lock(&self.outcome).summary()
    }

    pub fn is_scanning(&self) -> bool {
        self.state.is_scanning()
    }

    pub fn is_complete(&self) -> bool {
        self.worker.is_complete()
    }

    /// Block until the current scan finishes. Without a timeout this waits
    /// indefinitely, including when no scan was ever started.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        self.worker.wait(timeout)
    }
}

/// Tag every regular file of `result` with its tier.
fn classify(classifier: &dyn Classifier, mut result: ScanResult) -> ScanResult {
    if !result.is_success() {
        warn!(
            "Scan failed for {}: {}",
            result.target.id,
            result.error.as_deref().unwrap_or("unknown error")
        );
        return result;
    }

    for file in result.files.iter_mut().filter(|f| !f.is_dir) {
        let rule_match = classifier.match_file(file);
        file.risk_tier = rule_match.tier();
        debug!("{:?}: {}", file.path, rule_match.reason);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ScanCache;
    use crate::rules::{Rule, RuleCondition, RuleEngine};
    use crate::safety::SafetyValidator;
    use crate::scanner::ScanConfig;
    use anyhow::Result;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn controller() -> Result<(ScanController, Arc<StateCoordinator>, Arc<EventBus>)> {
        let bus = Arc::new(EventBus::new());
        let state = Arc::new(StateCoordinator::with_event_bus(Arc::clone(&bus)));
        let scanner = Arc::new(Scanner::new(
            ScanConfig::default(),
            Arc::new(SafetyValidator::with_protected_paths(Vec::<PathBuf>::new())),
            Arc::clone(&state),
            Arc::clone(&bus),
            Arc::new(ScanCache::in_memory()),
        ));
        let engine = RuleEngine::from_rules(vec![
            Rule::new("tmp", "Temp", RuleCondition::extensions([".tmp"]), RiskTier::Safe),
            Rule::new("log", "Logs", RuleCondition::extensions([".log"]), RiskTier::Review),
        ])?;
        let controller =
            ScanController::new(scanner, Arc::new(engine), Arc::clone(&state), Arc::clone(&bus));
        Ok((controller, state, bus))
    }

    #[test]
    fn test_scan_buckets_files_by_tier() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a.tmp"), vec![0u8; 10])?;
        fs::write(temp_dir.path().join("b.log"), vec![0u8; 20])?;
        fs::write(temp_dir.path().join("c.txt"), vec![0u8; 5])?;

        let (controller, state, _) = controller()?;
        assert!(controller.start_scan(vec![ScanTarget::from_path(temp_dir.path())]));
        assert!(controller.wait_for_completion(Some(Duration::from_secs(10))));
        assert!(state.is_idle());
        assert!(controller.is_complete());

        let summary = controller.get_summary();
        assert_eq!(summary.total_files, 3);
        assert_eq!(summary.total_size, 35);
        assert_eq!((summary.safe, summary.review, summary.system, summary.unmatched), (1, 1, 0, 1));

        let safe = controller.get_matched_files(RiskTier::Safe);
        assert_eq!(safe[0].file_name(), "a.tmp");
        assert_eq!(safe[0].risk_tier, Some(RiskTier::Safe));
        assert_eq!(controller.get_unmatched_files()[0].file_name(), "c.txt");
        assert_eq!(controller.get_all_matched_files().len(), 2);
        Ok(())
    }

    #[test]
    fn test_start_scan_rejected_while_busy() -> Result<()> {
        let (controller, state, _) = controller()?;
        assert!(!controller.start_scan(Vec::new()));

        state.transition(SystemState::Analyzing)?;
        let temp_dir = TempDir::new()?;
        assert!(!controller.start_scan(vec![ScanTarget::from_path(temp_dir.path())]));
        assert!(!controller.cancel_scan());
        assert!(state.is_analyzing());
        Ok(())
    }

    #[test]
    fn test_missing_target_still_completes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let (controller, _, bus) = controller()?;
        let completed = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&completed);
        bus.subscribe(EventKind::ScanCompleted, move |event| {
            if event.get("total_files").is_some() {
                *counter.lock().unwrap() += 1;
            }
        });

        assert!(controller.start_scan(vec![ScanTarget::from_path(temp_dir.path().join("gone"))]));
        assert!(controller.wait_for_completion(Some(Duration::from_secs(10))));

        let results = controller.get_results();
        assert_eq!(results.len(), 1);
        assert!(!results[0].is_success());
        assert_eq!(*completed.lock().unwrap(), 1);
        Ok(())
    }

    #[test]
    fn test_cancelled_scan_publishes_failure() -> Result<()> {
        let temp_dir = TempDir::new()?;
        for i in 0..3 {
            let dir = temp_dir.path().join(format!("t{i}"));
            fs::create_dir(&dir)?;
            fs::write(dir.join("x.tmp"), "x")?;
        }

        let (controller, state, bus) = controller()?;
        // Cancel as soon as the first target has been reported.
        let canceller = Arc::clone(&state);
        bus.subscribe(EventKind::ScanProgress, move |_| canceller.request_cancel());
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        bus.subscribe(EventKind::ScanFailed, move |event| {
            sink.lock().unwrap().push(event.get_str("reason").unwrap_or_default().to_string());
        });

        let targets = (0..3)
            .map(|i| ScanTarget::from_path(temp_dir.path().join(format!("t{i}"))))
            .collect();
        assert!(controller.start_scan(targets));
        assert!(controller.wait_for_completion(Some(Duration::from_secs(10))));

        assert_eq!(controller.get_results().len(), 1);
        assert_eq!(*reasons.lock().unwrap(), vec![CANCELLED_REASON.to_string()]);
        assert!(state.is_idle());
        Ok(())
    }

    #[test]
    fn test_panicking_classifier_becomes_failure() -> Result<()> {
        struct Exploding;
        impl Classifier for Exploding {
            fn match_file(&self, _file: &FileDescriptor) -> crate::rules::RuleMatch {
                panic!("classifier exploded")
            }
            fn rules(&self) -> Vec<Arc<Rule>> {
                Vec::new()
            }
        }

        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a.tmp"), "x")?;
        let (base, state, bus) = controller()?;
        let controller = ScanController::new(
            Arc::clone(&base.scanner),
            Arc::new(Exploding),
            Arc::clone(&state),
            Arc::clone(&bus),
        );
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        bus.subscribe(EventKind::ScanFailed, move |event| {
            sink.lock().unwrap().push(event.get_str("reason").unwrap_or_default().to_string());
        });

        assert!(controller.start_scan(vec![ScanTarget::from_path(temp_dir.path())]));
        assert!(controller.wait_for_completion(Some(Duration::from_secs(10))));
        assert_eq!(*reasons.lock().unwrap(), vec!["classifier exploded".to_string()]);
        assert!(state.is_idle());
        Ok(())
    }

    #[test]
    fn test_restart_from_idle_subscriber() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a.tmp"), "x")?;
        let (controller, state, bus) = controller()?;
        let controller = Arc::new(controller);

        let restarted = Arc::new(AtomicBool::new(false));
        let restarter = Arc::clone(&controller);
        let flag = Arc::clone(&restarted);
        let root = temp_dir.path().to_path_buf();
        bus.subscribe(EventKind::StateChanged, move |event| {
            if event.get_str("to") == Some("idle") && !flag.swap(true, Ordering::SeqCst) {
                assert!(restarter.start_scan(vec![ScanTarget::from_path(&root)]));
            }
        });
        let completed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completed);
        bus.subscribe(EventKind::ScanCompleted, move |event| {
            if event.get("total_files").is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(controller.start_scan(vec![ScanTarget::from_path(temp_dir.path())]));
        assert!(controller.wait_for_completion(Some(Duration::from_secs(10))));
        assert!(restarted.load(Ordering::SeqCst));
        assert!(controller.wait_for_completion(Some(Duration::from_secs(10))));

        assert_eq!(completed.load(Ordering::SeqCst), 2);
        assert_eq!(controller.get_summary().total_files, 1);
        assert!(state.is_idle());
        bus.clear(None);
        Ok(())
    }

    #[test]
    fn test_cancel_after_handoff_keeps_scan_completed() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a.tmp"), "x")?;
        let (controller, state, bus) = controller()?;

        // Once the walk is over, hand the coordinator to a clean and cancel
        // that clean before the scan worker reports.
        let handoff = Arc::clone(&state);
        bus.subscribe(EventKind::ScanCompleted, move |event| {
            if event.get("targets_scanned").is_some() {
                handoff.transition(SystemState::Cleaning).unwrap();
                assert!(handoff.request_cancel_for(SystemState::Cleaning));
            }
        });
        let failures = Arc::new(AtomicUsize::new(0));
        let failed = Arc::clone(&failures);
        bus.subscribe(EventKind::ScanFailed, move |_| {
            failed.fetch_add(1, Ordering::SeqCst);
        });
        let completed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completed);
        bus.subscribe(EventKind::ScanCompleted, move |event| {
            if event.get("total_files").is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(controller.start_scan(vec![ScanTarget::from_path(temp_dir.path())]));
        assert!(controller.wait_for_completion(Some(Duration::from_secs(10))));

        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert!(!controller.cancel_scan());
        assert!(state.is_cleaning());
        assert!(state.is_cancel_requested());
        assert!(state.release(SystemState::Cleaning));
        Ok(())
    }
}
