use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tracing::{error, info, warn};

use super::{Worker, lock, run_guarded};
use crate::analyzer::{AppCluster, AppClusterAnalyzer};
use crate::events::{CANCELLED_REASON, DomainEvent, EventBus, EventKind};
use crate::format_bytes;
use crate::state::{StateCoordinator, SystemState};

/// Number of applications listed in an [`AnalysisReport`].
const REPORT_TOP_APPS: usize = 10;

/// One line of a top-applications listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppSummary {
    pub name: String,
    pub size: u64,
    pub formatted_size: String,
    pub path: PathBuf,
    pub install_files: usize,
    pub user_data_files: usize,
    pub orphan_files: usize,
}

impl From<&AppCluster> for AppSummary {
    fn from(cluster: &AppCluster) -> Self {
        Self {
            name: cluster.name.clone(),
            size: cluster.total_size,
            formatted_size: cluster.formatted_size(),
            path: cluster.install_path.clone(),
            install_files: cluster.install_files.len(),
            user_data_files: cluster.user_data_files.len(),
            orphan_files: cluster.orphan_files.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub app_count: usize,
    pub total_size: u64,
    pub formatted_size: String,
    pub total_files: usize,
    pub duration: Duration,
    pub top_apps: Vec<AppSummary>,
    pub generated_at: SystemTime,
}

impl AnalysisReport {
    fn new(clusters: &[AppCluster], duration: Duration) -> Self {
        let total_size = clusters.iter().map(|c| c.total_size).sum();
        Self {
            app_count: clusters.len(),
            total_size,
            formatted_size: format_bytes(total_size),
            total_files: clusters.iter().map(AppCluster::file_count).sum(),
            duration,
            top_apps: top_apps(clusters, REPORT_TOP_APPS),
            generated_at: SystemTime::now(),
        }
    }
}

fn top_apps(clusters: &[AppCluster], limit: usize) -> Vec<AppSummary> {
    let mut ranked: Vec<&AppCluster> = clusters.iter().collect();
    ranked.sort_by(|a, b| b.total_size.cmp(&a.total_size));
    ranked.into_iter().take(limit).map(AppSummary::from).collect()
}

#[derive(Debug, Default)]
struct AnalysisShared {
    clusters: Vec<AppCluster>,
    report: Option<AnalysisReport>,
}

/// Runs application-space analysis in the background.
pub struct AnalysisController {
    analyzer: Arc<AppClusterAnalyzer>,
    state: Arc<StateCoordinator>,
    bus: Arc<EventBus>,
    shared: Arc<Mutex<AnalysisShared>>,
    worker: Worker,
}

impl AnalysisController {
    pub fn new(
        analyzer: Arc<AppClusterAnalyzer>,
        state: Arc<StateCoordinator>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            analyzer,
            state,
            bus,
            shared: Arc::default(),
            worker: Worker::default(),
        }
    }

    /// Returns false when another operation holds the coordinator.
    pub fn start_analysis(&self) -> bool {
        if let Err(e) = self.state.transition(SystemState::Analyzing) {
            warn!("Cannot start analysis: {}", e);
            return false;
        }
        *lock(&self.shared) = AnalysisShared::default();

        let analyzer = Arc::clone(&self.analyzer);
        let state = Arc::clone(&self.state);
        let bus = Arc::clone(&self.bus);
        let shared = Arc::clone(&self.shared);

        let spawned = self.worker.spawn("analysis-worker", move || {
            let start_time = Instant::now();
            bus.publish(
                DomainEvent::new(EventKind::AnalysisStarted)
                    .with("install_zones", analyzer.config().install_zones.len())
                    .with("user_data_zones", analyzer.config().user_data_zones.len()),
            );

            match run_guarded(|| analyzer.analyze()) {
                Ok(clusters) => {
                    let cancelled = state.is_cancel_requested();
                    let report = AnalysisReport::new(&clusters, start_time.elapsed());
                    let event = if cancelled {
                        info!("Analysis cancelled with {} partial cluster(s)", clusters.len());
                        DomainEvent::new(EventKind::AnalysisFailed)
                            .with("reason", CANCELLED_REASON)
                    } else {
                        info!(
                            "Analysis completed: {} application(s), {}, {:?}",
                            report.app_count, report.formatted_size, report.duration
                        );
                        DomainEvent::new(EventKind::AnalysisCompleted)
                            .with("app_count", report.app_count)
                            .with("total_size", report.total_size)
                            .with("duration_ms", report.duration.as_millis() as u64)
                    };
                    {
                        let mut shared = lock(&shared);
                        shared.clusters = clusters;
                        shared.report = (!cancelled).then_some(report);
                    }
                    bus.publish(event);
                }
                Err(reason) => {
                    error!("Analysis worker failed: {}", reason);
                    bus.publish(DomainEvent::new(EventKind::AnalysisFailed).with("reason", reason));
                }
            }
            state.release(SystemState::Analyzing);
        });

        if let Err(e) = spawned {
            error!("Failed to start analysis worker: {}", e);
            self.state.release(SystemState::Analyzing);
            return false;
        }
        info!("Analysis started");
        true
    }

    pub fn cancel_analysis(&self) -> bool {
        if !self.state.request_cancel_for(SystemState::Analyzing) {
            warn!("No analysis in progress to cancel");
            return false;
        }
        true
    }

    /// Clusters of the last run, largest first. Partial after a cancel.
    pub fn get_clusters(&self) -> Vec<AppCluster> {
        lock(&self.shared).clusters.clone()
    }

    /// Report of the last completed run; `None` while running or after a
    /// cancel.
    pub fn get_report(&self) -> Option<AnalysisReport> {
        lock(&self.shared).report.clone()
    }

    pub fn get_top_apps(&self, limit: usize) -> Vec<AppSummary> {
        top_apps(&lock(&self.shared).clusters, limit)
    }

    pub fn is_analyzing(&self) -> bool {
        self.state.is_analyzing()
    }

    pub fn is_complete(&self) -> bool {
        self.worker.is_complete()
    }

    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        self.worker.wait(timeout)
    }
}
