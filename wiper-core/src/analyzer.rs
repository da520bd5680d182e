use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Result, WiperError};
use crate::events::{DomainEvent, EventBus, EventKind};
use crate::format_bytes;
use crate::model::FileDescriptor;
use crate::state::StateCoordinator;

/// Directory-name patterns of well-known applications, matched
/// case-insensitively anywhere in the name.
pub const DEFAULT_APP_PATTERNS: &[&str] = &[
    "Chrome",
    "Chromium",
    "Firefox",
    "Edge",
    "Brave",
    "Visual Studio",
    "VSCode",
    "JetBrains",
    "Python",
    "Java",
    r"Node\.js",
    "Git",
    "Docker",
    "VMware",
    "VirtualBox",
    "Sublime Text",
    r"Notepad\+\+",
    "WinRAR",
    "7-Zip",
    "Adobe",
    "Office",
    "LibreOffice",
    "TeamViewer",
    "Discord",
    "Slack",
    "Steam",
    "Epic Games",
];

/// Which side of an application's footprint a directory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// Where programs are installed.
    Install,
    /// Per-user data, settings and caches.
    UserData,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Install => "install",
            Zone::UserData => "user_data",
        }
    }
}

/// Analyzer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub install_zones: Vec<PathBuf>,
    pub user_data_zones: Vec<PathBuf>,
    pub app_patterns: Vec<String>,
    /// Depth limit of the walk inside each application directory.
    pub max_depth: usize,
    /// Name similarity above which two clusters are merged.
    pub merge_threshold: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            install_zones: default_install_zones(),
            user_data_zones: default_user_data_zones(),
            app_patterns: DEFAULT_APP_PATTERNS.iter().map(|p| p.to_string()).collect(),
            max_depth: 8,
            merge_threshold: 0.8,
        }
    }
}

#[cfg(windows)]
fn default_install_zones() -> Vec<PathBuf> {
    let mut zones: Vec<PathBuf> = ["ProgramFiles", "ProgramFiles(x86)"]
        .iter()
        .filter_map(|var| std::env::var_os(var))
        .map(PathBuf::from)
        .collect();
    if zones.is_empty() {
        zones.push(PathBuf::from(r"C:\Program Files"));
    }
    zones.dedup();
    zones
}

#[cfg(target_os = "macos")]
fn default_install_zones() -> Vec<PathBuf> {
    let mut zones = vec![PathBuf::from("/Applications")];
    if let Some(home) = dirs::home_dir() {
        zones.push(home.join("Applications"));
    }
    zones
}

#[cfg(not(any(windows, target_os = "macos")))]
fn default_install_zones() -> Vec<PathBuf> {
    vec![PathBuf::from("/opt"), PathBuf::from("/usr/share")]
}

fn default_user_data_zones() -> Vec<PathBuf> {
    let mut zones: Vec<PathBuf> = Vec::new();
    #[cfg(not(target_os = "macos"))]
    zones.extend(dirs::config_dir());
    zones.extend(dirs::data_dir());
    zones.extend(dirs::data_local_dir());
    zones.extend(dirs::cache_dir());
    zones.sort();
    zones.dedup();
    zones
}

/// One application's files across both zones.
#[derive(Debug, Clone, Serialize)]
pub struct AppCluster {
    pub name: String,
    pub install_path: PathBuf,
    pub install_files: Vec<FileDescriptor>,
    pub user_data_files: Vec<FileDescriptor>,
    pub total_size: u64,
    /// User-data files left behind by an application that is no longer
    /// installed.
    pub orphan_files: Vec<FileDescriptor>,
}

impl AppCluster {
    fn new(name: String, path: PathBuf) -> Self {
        Self {
            name,
            install_path: path,
            install_files: Vec::new(),
            user_data_files: Vec::new(),
            total_size: 0,
            orphan_files: Vec::new(),
        }
    }

    pub fn file_count(&self) -> usize {
        self.install_files.len() + self.user_data_files.len()
    }

    pub fn is_installed(&self) -> bool {
        !self.install_files.is_empty()
    }

    pub fn formatted_size(&self) -> String {
        format_bytes(self.total_size)
    }

    fn absorb(&mut self, other: AppCluster) {
        if !self.is_installed() && other.is_installed() {
            self.install_path = other.install_path;
        }
        self.install_files.extend(other.install_files);
        self.user_data_files.extend(other.user_data_files);
        self.total_size += other.total_size;
    }

    fn find_orphans(&mut self) {
        self.orphan_files = if self.is_installed() {
            Vec::new()
        } else {
            self.user_data_files.clone()
        };
    }
}

/// Merge clusters whose names are equal or similar enough.
///
/// Clusters are folded in order; each one joins the earliest kept cluster
/// with the same lowercase name, otherwise the earliest whose normalized
/// Levenshtein similarity exceeds `threshold`.
pub fn merge_clusters(clusters: Vec<AppCluster>, threshold: f64) -> Vec<AppCluster> {
    let mut merged: Vec<AppCluster> = Vec::new();
    let mut keys: Vec<String> = Vec::new();

    for cluster in clusters {
        let key = cluster.name.to_lowercase();
        let target = keys.iter().position(|k| *k == key).or_else(|| {
            keys.iter()
                .position(|k| strsim::normalized_levenshtein(k, &key) > threshold)
        });

        match target {
            Some(index) => {
                debug!("Merging {:?} into {:?}", cluster.name, merged[index].name);
                merged[index].absorb(cluster);
            }
            None => {
                keys.push(key);
                merged.push(cluster);
            }
        }
    }
    merged
}

/// Groups install-zone and user-data-zone directories by application.
pub struct AppClusterAnalyzer {
    config: AnalyzerConfig,
    matcher: RegexSet,
    state: Arc<StateCoordinator>,
    bus: Arc<EventBus>,
}

impl AppClusterAnalyzer {
    /// Fails when an application pattern is not a valid regex.
    pub fn new(
        config: AnalyzerConfig,
        state: Arc<StateCoordinator>,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let matcher = RegexSetBuilder::new(&config.app_patterns)
            .case_insensitive(true)
            .build()
            .map_err(|e| WiperError::Config(format!("invalid application pattern: {e}")))?;
        Ok(Self {
            config,
            matcher,
            state,
            bus,
        })
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Whether a directory name looks like a known application.
    pub fn identify_app(&self, name: &str) -> bool {
        self.matcher.is_match(name)
    }

    /// Walk both zone sets and return clusters sorted by size, largest
    /// first.
    ///
    /// Cancellation is checked before every top-level directory entry; a
    /// cancelled run returns whatever was collected up to that point.
    pub fn analyze(&self) -> Vec<AppCluster> {
        let start_time = Instant::now();
        info!(
            "Analyzing {} install zone(s) and {} user data zone(s)",
            self.config.install_zones.len(),
            self.config.user_data_zones.len()
        );

        let mut clusters = Vec::new();
        for (zone, roots) in [
            (Zone::Install, &self.config.install_zones),
            (Zone::UserData, &self.config.user_data_zones),
        ] {
            for root in roots {
                if !self.scan_zone(zone, root, &mut clusters) {
                    info!("Analysis cancelled");
                    break;
                }
            }
            if self.state.is_cancel_requested() {
                break;
            }
        }

        let mut merged = merge_clusters(clusters, self.config.merge_threshold);
        for cluster in &mut merged {
            cluster.find_orphans();
        }
        merged.sort_by(|a, b| b.total_size.cmp(&a.total_size));

        info!(
            "Analysis found {} application(s) in {:?}",
            merged.len(),
            start_time.elapsed()
        );
        merged
    }

    /// Returns false once cancellation has been observed.
    fn scan_zone(&self, zone: Zone, root: &Path, clusters: &mut Vec<AppCluster>) -> bool {
        let mut entries = match fs::read_dir(root) {
            Ok(read_dir) => read_dir.filter_map(|e| e.ok()).collect::<Vec<_>>(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Zone does not exist: {:?}", root);
                return true;
            }
            Err(e) => {
                warn!("Cannot read zone {:?}: {}", root, e);
                return true;
            }
        };
        entries.sort_by_key(|e| e.file_name());
        info!("Scanning {} zone {:?}", zone.as_str(), root);

        let total = entries.len();
        for (index, entry) in entries.into_iter().enumerate() {
            if self.state.is_cancel_requested() {
                return false;
            }

            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().to_string();
            if is_dir && self.identify_app(&name) {
                debug!("Identified application directory {:?}", entry.path());
                clusters.push(self.build_cluster(zone, name, entry.path()));
            }

            self.bus.publish(
                DomainEvent::new(EventKind::AnalysisProgress)
                    .with("zone", zone.as_str())
                    .with("current", index + 1)
                    .with("total", total),
            );
        }
        true
    }

    fn build_cluster(&self, zone: Zone, name: String, path: PathBuf) -> AppCluster {
        let mut cluster = AppCluster::new(name, path.clone());

        let walker = WalkDir::new(&path)
            .follow_links(false)
            .max_depth(self.config.max_depth)
            .into_iter();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry under {:?}: {}", path, e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!("No metadata for {:?}: {}", entry.path(), e);
                    continue;
                }
            };

            let file = FileDescriptor::from_metadata(entry.into_path(), &metadata);
            cluster.total_size += file.size;
            match zone {
                Zone::Install => cluster.install_files.push(file),
                Zone::UserData => cluster.user_data_files.push(file),
            }
        }
        cluster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn write(path: &Path, size: usize) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, vec![b'x'; size])?;
        Ok(())
    }

    fn config(root: &Path) -> AnalyzerConfig {
        AnalyzerConfig {
            install_zones: vec![root.join("programs")],
            user_data_zones: vec![root.join("appdata"), root.join("missing")],
            ..Default::default()
        }
    }

    fn analyzer(config: AnalyzerConfig) -> Result<(AppClusterAnalyzer, Arc<StateCoordinator>, Arc<EventBus>)> {
        let state = Arc::new(StateCoordinator::new());
        let bus = Arc::new(EventBus::new());
        let analyzer = AppClusterAnalyzer::new(config, Arc::clone(&state), Arc::clone(&bus))?;
        Ok((analyzer, state, bus))
    }

    #[test]
    fn test_identify_app_is_case_insensitive() -> Result<()> {
        let (analyzer, _, _) = analyzer(AnalyzerConfig::default())?;
        assert!(analyzer.identify_app("Google Chrome"));
        assert!(analyzer.identify_app("mozilla firefox"));
        assert!(analyzer.identify_app("Notepad++"));
        assert!(!analyzer.identify_app("Unknown Application"));
        Ok(())
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let config = AnalyzerConfig {
            app_patterns: vec!["(".to_string()],
            ..Default::default()
        };
        let result = AppClusterAnalyzer::new(
            config,
            Arc::new(StateCoordinator::new()),
            Arc::new(EventBus::new()),
        );
        assert!(matches!(result, Err(WiperError::Config(_))));
    }

    #[test]
    fn test_analyze_builds_merged_sorted_clusters() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write(&root.join("programs/Google Chrome/chrome.exe"), 100)?;
        write(&root.join("programs/Google Chrome/locales/en.pak"), 20)?;
        write(&root.join("programs/Unknown Tool/tool.exe"), 500)?;
        write(&root.join("appdata/google chrome/Preferences"), 50)?;
        write(&root.join("appdata/Discord/cache/data_0"), 30)?;

        let (analyzer, _, _) = analyzer(config(root))?;
        let clusters = analyzer.analyze();

        assert_eq!(clusters.len(), 2);
        let chrome = &clusters[0];
        assert_eq!(chrome.name, "Google Chrome");
        assert_eq!(chrome.total_size, 170);
        assert_eq!(chrome.install_files.len(), 2);
        assert_eq!(chrome.user_data_files.len(), 1);
        assert!(chrome.orphan_files.is_empty());
        assert_eq!(chrome.install_path, root.join("programs/Google Chrome"));

        let discord = &clusters[1];
        assert_eq!(discord.name, "Discord");
        assert!(!discord.is_installed());
        assert_eq!(discord.orphan_files.len(), 1);
        Ok(())
    }

    #[test]
    fn test_similar_names_merge_into_earlier_cluster() {
        let clusters = vec![
            AppCluster::new("Sublime Text 3".into(), PathBuf::from("/a")),
            AppCluster::new("Docker".into(), PathBuf::from("/b")),
            AppCluster::new("Sublime Text 4".into(), PathBuf::from("/c")),
            AppCluster::new("DOCKER".into(), PathBuf::from("/d")),
        ];
        let merged = merge_clusters(clusters, 0.8);
        let names: Vec<_> = merged.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Sublime Text 3", "Docker"]);
    }

    #[test]
    fn test_walk_respects_max_depth() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write(&root.join("programs/Git/git.exe"), 1)?;
        write(&root.join("programs/Git/a/b/c/deep.txt"), 1)?;

        let config = AnalyzerConfig {
            max_depth: 2,
            ..config(root)
        };
        let (analyzer, _, _) = analyzer(config)?;
        let clusters = analyzer.analyze();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].install_files.len(), 1);
        Ok(())
    }

    #[test]
    fn test_cancelled_analysis_is_empty() -> Result<()> {
        let temp_dir = TempDir::new()?;
        write(&temp_dir.path().join("programs/Steam/steam.exe"), 10)?;

        let (analyzer, state, _) = analyzer(config(temp_dir.path()))?;
        state.request_cancel();
        assert!(analyzer.analyze().is_empty());
        Ok(())
    }

    #[test]
    fn test_progress_is_published_per_entry() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        write(&root.join("programs/Steam/steam.exe"), 10)?;
        write(&root.join("programs/readme.txt"), 10)?;
        write(&root.join("appdata/Slack/state"), 10)?;

        let (analyzer, _, bus) = analyzer(config(root))?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(EventKind::AnalysisProgress, move |event| {
            sink.lock().unwrap().push((
                event.get_str("zone").unwrap_or_default().to_string(),
                event.get_u64("current").unwrap_or_default(),
                event.get_u64("total").unwrap_or_default(),
            ));
        });

        analyzer.analyze();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("install".to_string(), 1, 2),
                ("install".to_string(), 2, 2),
                ("user_data".to_string(), 1, 1),
            ]
        );
        Ok(())
    }
}
