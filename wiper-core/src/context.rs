use std::sync::Arc;
use tracing::info;

use crate::analyzer::AppClusterAnalyzer;
use crate::cache::ScanCache;
use crate::cleaner::{DeletionExecutor, RecycleBin, SimulatedRecycleBin, default_recycle_bin};
use crate::controller::{AnalysisController, CleanController, ScanController};
use crate::error::Result;
use crate::events::EventBus;
use crate::rules::{Classifier, IndexedRuleEngine, RuleEngine, RuleLoadReport};
use crate::safety::SafetyValidator;
use crate::scanner::Scanner;
use crate::settings::{EngineKind, RecycleMode, Settings};
use crate::state::StateCoordinator;

/// Every engine and controller, wired to one shared bus and coordinator.
pub struct AppContext {
    pub settings: Settings,
    pub bus: Arc<EventBus>,
    pub state: Arc<StateCoordinator>,
    pub safety: Arc<SafetyValidator>,
    pub cache: Arc<ScanCache>,
    pub classifier: Arc<dyn Classifier>,
    pub rule_report: RuleLoadReport,
    pub scan: ScanController,
    pub clean: CleanController,
    pub analysis: AnalysisController,
}

impl AppContext {
    /// Build the application from `settings`.
    ///
    /// Fails only on an invalid analyzer pattern; rule and cache problems
    /// fall back to defaults.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let state = Arc::new(StateCoordinator::with_event_bus(Arc::clone(&bus)));

        let safety = Arc::new(SafetyValidator::new());
        for path in &settings.protected_paths {
            safety.add_protected_path(path.clone());
        }

        let cache = Arc::new(ScanCache::open(&settings.cache_path));
        let (classifier, rule_report) = load_classifier(&settings);

        let recycle_bin: Arc<dyn RecycleBin> = match settings.recycle {
            RecycleMode::System => default_recycle_bin(),
            RecycleMode::Simulate => Arc::new(SimulatedRecycleBin),
        };

        let scanner = Arc::new(Scanner::new(
            settings.scan_config(),
            Arc::clone(&safety),
            Arc::clone(&state),
            Arc::clone(&bus),
            Arc::clone(&cache),
        ));
        let executor = Arc::new(DeletionExecutor::new(
            settings.clean_policy(),
            Arc::clone(&safety),
            Arc::clone(&state),
            Arc::clone(&bus),
            recycle_bin,
        ));
        let analyzer = Arc::new(AppClusterAnalyzer::new(
            settings.analyzer.clone(),
            Arc::clone(&state),
            Arc::clone(&bus),
        )?);

        let scan = ScanController::new(
            scanner,
            Arc::clone(&classifier),
            Arc::clone(&state),
            Arc::clone(&bus),
        );
        let clean = CleanController::new(executor, Arc::clone(&state), Arc::clone(&bus))
            .with_classifier(Arc::clone(&classifier));
        let analysis = AnalysisController::new(analyzer, Arc::clone(&state), Arc::clone(&bus));

        info!(
            "Context ready: {:?} engine with {} rule(s), {:?} traversal, {:?} recycling",
            settings.rule_engine,
            rule_report.loaded,
            settings.traversal,
            settings.recycle
        );
        Ok(Self {
            settings,
            bus,
            state,
            safety,
            cache,
            classifier,
            rule_report,
            scan,
            clean,
            analysis,
        })
    }
}

fn load_classifier(settings: &Settings) -> (Arc<dyn Classifier>, RuleLoadReport) {
    match settings.rule_engine {
        EngineKind::Baseline => {
            let mut engine = RuleEngine::empty();
            let report = engine.load_rules(&settings.rules_path);
            (Arc::new(engine), report)
        }
        EngineKind::Indexed => {
            let mut engine = IndexedRuleEngine::empty();
            let report = engine.load_rules(&settings.rules_path);
            (Arc::new(engine), report)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalyzerConfig;
    use crate::events::EventKind;
    use crate::model::ScanTarget;
    use crate::rules::{RiskTier, RuleSource};
    use crate::state::SystemState;
    use std::fs;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings(root: &std::path::Path, engine: EngineKind) -> Settings {
        Settings {
            rules_path: root.join("rules.json"),
            cache_path: root.join("cache.json"),
            rule_engine: engine,
            recycle: RecycleMode::Simulate,
            analyzer: AnalyzerConfig {
                install_zones: Vec::new(),
                user_data_zones: Vec::new(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_components_share_one_coordinator() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let context = AppContext::from_settings(settings(temp_dir.path(), EngineKind::Baseline))?;
        assert_eq!(context.rule_report.source, RuleSource::Defaults);

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        context.bus.subscribe(EventKind::StateChanged, move |event| {
            sink.lock().unwrap().push(event.get_str("to").unwrap_or_default().to_string());
        });

        context.state.transition(SystemState::Analyzing)?;
        assert!(!context.scan.start_scan(vec![ScanTarget::from_path(temp_dir.path())]));
        assert!(!context.analysis.start_analysis());
        assert!(context.state.release(SystemState::Analyzing));
        assert_eq!(*changes.lock().unwrap(), vec!["analyzing", "idle"]);
        Ok(())
    }

    #[test]
    fn test_indexed_engine_from_settings() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let data = temp_dir.path().join("data");
        fs::create_dir(&data)?;
        fs::write(data.join("a.tmp"), "1234")?;

        let context = AppContext::from_settings(settings(temp_dir.path(), EngineKind::Indexed))?;
        assert!(context.scan.start_scan(vec![ScanTarget::from_path(&data)]));
        assert!(context.scan.wait_for_completion(Some(Duration::from_secs(10))));
        assert_eq!(context.scan.get_matched_files(RiskTier::Safe).len(), 1);
        Ok(())
    }
}
