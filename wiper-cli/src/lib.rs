use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use wiper_core::{
    AppContext, CleanPreview, CleanReport, EngineKind, FileDescriptor, RecycleMode, RiskTier,
    ScanSummary, ScanTarget, Settings, TraversalStrategy,
    rules::{default_rules, save_rule_file},
};

#[derive(Parser)]
#[command(name = "wiper")]
#[command(about = "Rule-driven disk cleaner with guarded, recoverable deletion")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (defaults to <config dir>/wiper/settings.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Rule file, overriding the one named in the settings
    #[arg(short, long, global = true)]
    pub rules: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan directories and classify what they contain
    Scan {
        /// Directories to scan
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,

        /// Rule engine variant
        #[arg(short, long, value_enum)]
        engine: Option<EngineArg>,

        /// Directory traversal strategy
        #[arg(short, long, value_enum)]
        traversal: Option<TraversalArg>,

        /// List the files of one bucket
        #[arg(long, value_enum)]
        tier: Option<TierArg>,
    },
    /// Scan directories and move matching files to the recycle bin
    Clean {
        /// Directories to scan and clean
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,

        /// Bucket to clean
        #[arg(long, value_enum, default_value = "safe")]
        tier: TierArg,

        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,

        /// Log what would be deleted without touching anything
        #[arg(short = 'n', long)]
        simulate: bool,
    },
    /// Attribute disk usage to installed applications
    Analyze {
        /// Number of applications to list
        #[arg(long, default_value = "10")]
        top: usize,
    },
    /// List the active rules
    Rules {
        /// Write the built-in rule document to this path instead
        #[arg(short, long)]
        write: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineArg {
    Baseline,
    Indexed,
}

impl From<EngineArg> for EngineKind {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Baseline => EngineKind::Baseline,
            EngineArg::Indexed => EngineKind::Indexed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TraversalArg {
    Walk,
    Stack,
}

impl From<TraversalArg> for TraversalStrategy {
    fn from(arg: TraversalArg) -> Self {
        match arg {
            TraversalArg::Walk => TraversalStrategy::Walk,
            TraversalArg::Stack => TraversalStrategy::Stack,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TierArg {
    Safe,
    Review,
    System,
    Unmatched,
}

impl TierArg {
    fn tier(self) -> Option<RiskTier> {
        match self {
            TierArg::Safe => Some(RiskTier::Safe),
            TierArg::Review => Some(RiskTier::Review),
            TierArg::System => Some(RiskTier::System),
            TierArg::Unmatched => None,
        }
    }
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wiper={log_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = load_settings(cli.config.as_deref(), cli.rules.as_deref())?;

    match cli.command {
        Commands::Scan {
            paths,
            engine,
            traversal,
            tier,
        } => handle_scan_command(settings, paths, engine, traversal, tier),
        Commands::Clean {
            paths,
            tier,
            yes,
            simulate,
        } => handle_clean_command(settings, paths, tier, yes, simulate),
        Commands::Analyze { top } => handle_analyze_command(settings, top),
        Commands::Rules { write } => handle_rules_command(settings, write),
    }
}

/// Settings from `config` (or the default location) with the `rules`
/// override applied.
fn load_settings(config: Option<&Path>, rules: Option<&Path>) -> Result<Settings> {
    let mut settings = match config {
        Some(path) => Settings::load(path)?,
        None => Settings::load_default()?,
    };
    if let Some(rules) = rules {
        debug!("Rule file overridden with {:?}", rules);
        settings.rules_path = rules.to_path_buf();
    }
    Ok(settings)
}

fn targets(paths: &[PathBuf]) -> Vec<ScanTarget> {
    paths.iter().map(ScanTarget::from_path).collect()
}

/// Run a scan to completion and return the context that holds its results.
fn scan_to_completion(settings: Settings, paths: &[PathBuf]) -> Result<AppContext> {
    let context = AppContext::from_settings(settings)?;
    if !context.scan.start_scan(targets(paths)) {
        bail!("Could not start scan");
    }
    context.scan.wait_for_completion(None);

    for result in context.scan.get_results() {
        if let Some(error) = &result.error {
            eprintln!("Skipped {}: {}", result.target.path.display(), error);
        }
    }
    Ok(context)
}

fn files_in(context: &AppContext, tier: TierArg) -> Vec<FileDescriptor> {
    match tier.tier() {
        Some(tier) => context.scan.get_matched_files(tier),
        None => context.scan.get_unmatched_files(),
    }
}

fn handle_scan_command(
    mut settings: Settings,
    paths: Vec<PathBuf>,
    engine: Option<EngineArg>,
    traversal: Option<TraversalArg>,
    tier: Option<TierArg>,
) -> Result<()> {
    if let Some(engine) = engine {
        settings.rule_engine = engine.into();
    }
    if let Some(traversal) = traversal {
        settings.traversal = traversal.into();
    }

    let context = scan_to_completion(settings, &paths)?;
    display_summary(&context.scan.get_summary());

    if let Some(tier) = tier {
        display_files(&files_in(&context, tier));
    }
    Ok(())
}

fn handle_clean_command(
    mut settings: Settings,
    paths: Vec<PathBuf>,
    tier: TierArg,
    yes: bool,
    simulate: bool,
) -> Result<()> {
    if simulate {
        settings.recycle = RecycleMode::Simulate;
    }

    let context = scan_to_completion(settings, &paths)?;
    let files = files_in(&context, tier);
    if files.is_empty() {
        println!("No files found to clean.");
        return Ok(());
    }

    println!("Found {} files to clean:", files.len());
    display_files(&files);
    let preview = context.clean.preview_clean(&files);
    display_preview(&preview);

    if !yes && !prompt_confirmation(&preview)? {
        println!("Cleaning cancelled.");
        return Ok(());
    }

    context.clean.confirm_clean();
    if !context.clean.start_clean(files, true) {
        bail!("Could not start clean");
    }
    context.clean.wait_for_completion(None);

    let report = context
        .clean
        .get_report()
        .context("Clean finished without a result")?;
    display_clean_report(&report);
    Ok(())
}

fn handle_analyze_command(settings: Settings, top: usize) -> Result<()> {
    let context = AppContext::from_settings(settings)?;
    if !context.analysis.start_analysis() {
        bail!("Could not start analysis");
    }
    context.analysis.wait_for_completion(None);

    let Some(report) = context.analysis.get_report() else {
        bail!("Analysis did not complete");
    };

    println!(
        "\nFound {} applications using {} in {} files",
        report.app_count, report.formatted_size, report.total_files
    );
    println!(
        "{:<30} {:<12} {:<8} {:<8} {:<8} {}",
        "Application", "Size", "Install", "Data", "Orphans", "Path"
    );
    println!("{}", "-".repeat(90));
    for app in context.analysis.get_top_apps(top) {
        println!(
            "{:<30} {:<12} {:<8} {:<8} {:<8} {}",
            app.name,
            app.formatted_size,
            app.install_files,
            app.user_data_files,
            app.orphan_files,
            app.path.display()
        );
    }
    Ok(())
}

fn handle_rules_command(settings: Settings, write: Option<PathBuf>) -> Result<()> {
    if let Some(path) = write {
        save_rule_file(&path, &default_rules())?;
        println!("Wrote default rules to {}", path.display());
        return Ok(());
    }

    let context = AppContext::from_settings(settings)?;
    println!(
        "{} rule(s) from {:?} ({} skipped)",
        context.rule_report.loaded, context.rule_report.source, context.rule_report.skipped
    );
    println!("{:<20} {:<24} {:<8} {:<10} {}", "Id", "Name", "Tier", "Category", "Enabled");
    println!("{}", "-".repeat(75));
    for rule in context.classifier.rules() {
        println!(
            "{:<20} {:<24} {:<8} {:<10} {}",
            rule.id,
            rule.name,
            rule.tier.as_str(),
            rule.category,
            if rule.enabled { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn display_summary(summary: &ScanSummary) {
    println!(
        "\nScanned {} target(s): {} files, {} in {:?}",
        summary.scan_count,
        summary.total_files,
        wiper_core::format_bytes(summary.total_size),
        summary.duration
    );
    println!("  safe:      {}", summary.safe);
    println!("  review:    {}", summary.review);
    println!("  system:    {}", summary.system);
    println!("  unmatched: {}", summary.unmatched);
}

fn display_files(files: &[FileDescriptor]) {
    if files.is_empty() {
        println!("No files found.");
        return;
    }

    println!("{:<12} {:<8} {}", "Size", "Tier", "Path");
    println!("{}", "-".repeat(75));
    for file in files {
        println!(
            "{:<12} {:<8} {}",
            file.formatted_size(),
            file.risk_tier.map_or("-", |t| t.as_str()),
            file.path.display()
        );
    }
}

fn display_preview(preview: &CleanPreview) {
    println!(
        "\n{} files, {} ({} safe, {} risky, {} system, {} excluded)",
        preview.file_count,
        preview.formatted_size,
        preview.safe_files,
        preview.risky_files,
        preview.system_files,
        preview.excluded_files
    );
    if preview.recycle_bin_warning {
        println!(
            "Warning: this is {} of the recycle bin threshold",
            preview.usage_label()
        );
    }
}

fn prompt_confirmation(preview: &CleanPreview) -> Result<bool> {
    print!(
        "\nThis will move {} files ({}) to the recycle bin. Continue? [y/N]: ",
        preview.file_count, preview.formatted_size
    );
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(is_affirmative(&input))
}

fn is_affirmative(input: &str) -> bool {
    matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
}

fn display_clean_report(report: &CleanReport) {
    if report.cancelled {
        println!("\nCleaning cancelled.");
    } else {
        println!("\nCleaning completed!");
    }
    println!("Files deleted: {}", report.files_deleted);
    println!("Files skipped: {}", report.skipped);
    println!("Size freed: {}", report.formatted_size);

    if report.error_count > 0 {
        println!("\n{} error(s):", report.error_count);
        for error in &report.errors {
            println!("  - {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parse_scan_command() {
        let args = vec![
            "wiper",
            "scan",
            "/tmp",
            "/var/tmp",
            "--engine",
            "indexed",
            "--traversal",
            "stack",
            "--tier",
            "unmatched",
        ];
        let cli = Cli::try_parse_from(args).unwrap();

        match cli.command {
            Commands::Scan {
                paths,
                engine,
                traversal,
                tier,
            } => {
                assert_eq!(paths, vec![PathBuf::from("/tmp"), PathBuf::from("/var/tmp")]);
                assert_eq!(engine, Some(EngineArg::Indexed));
                assert_eq!(traversal, Some(TraversalArg::Stack));
                assert_eq!(tier, Some(TierArg::Unmatched));
            }
            _ => panic!("Expected Scan command"),
        }
    }

    #[test]
    fn test_cli_parse_clean_defaults() {
        let cli = Cli::try_parse_from(["wiper", "clean"]).unwrap();

        match cli.command {
            Commands::Clean {
                paths,
                tier,
                yes,
                simulate,
            } => {
                assert_eq!(paths, vec![PathBuf::from(".")]);
                assert_eq!(tier, TierArg::Safe);
                assert!(!yes);
                assert!(!simulate);
            }
            _ => panic!("Expected Clean command"),
        }
    }

    #[test]
    fn test_cli_parse_global_flags() {
        let args = vec![
            "wiper",
            "analyze",
            "--top",
            "3",
            "--config",
            "/etc/wiper.toml",
            "--rules",
            "rules.json",
            "--verbose",
        ];
        let cli = Cli::try_parse_from(args).unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/etc/wiper.toml")));
        assert_eq!(cli.rules, Some(PathBuf::from("rules.json")));
        assert!(cli.verbose);
        assert!(!cli.debug);
        assert!(matches!(cli.command, Commands::Analyze { top: 3 }));
    }

    #[test]
    fn test_cli_rejects_unknown_engine() {
        assert!(Cli::try_parse_from(["wiper", "scan", "--engine", "quantum"]).is_err());
    }

    #[test]
    fn test_arg_conversions() {
        assert_eq!(EngineKind::from(EngineArg::Indexed), EngineKind::Indexed);
        assert_eq!(TraversalStrategy::from(TraversalArg::Walk), TraversalStrategy::Walk);
        assert_eq!(TierArg::Review.tier(), Some(RiskTier::Review));
        assert_eq!(TierArg::Unmatched.tier(), None);
    }

    #[test]
    fn test_load_settings_applies_rules_override() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = temp_dir.path().join("settings.toml");
        fs::write(&config, "rule_engine = \"indexed\"\nrecycle = \"simulate\"\n")?;
        let rules = temp_dir.path().join("custom.json");

        let settings = load_settings(Some(&config), Some(&rules))?;
        assert_eq!(settings.rule_engine, EngineKind::Indexed);
        assert_eq!(settings.recycle, RecycleMode::Simulate);
        assert_eq!(settings.rules_path, rules);
        Ok(())
    }

    #[test]
    fn test_load_settings_rejects_malformed_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = temp_dir.path().join("settings.toml");
        fs::write(&config, "traversal = 42")?;
        assert!(load_settings(Some(&config), None).is_err());
        Ok(())
    }

    #[test]
    fn test_affirmative_answers() {
        assert!(is_affirmative("y\n"));
        assert!(is_affirmative(" YES "));
        assert!(!is_affirmative("\n"));
        assert!(!is_affirmative("no"));
    }

    #[test]
    fn test_scan_selects_tier_files() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let data = temp_dir.path().join("data");
        fs::create_dir_all(&data)?;
        fs::write(data.join("a.tmp"), "1234")?;
        fs::write(data.join("b.txt"), "12")?;

        let mut settings = Settings {
            rules_path: temp_dir.path().join("rules.json"),
            cache_path: temp_dir.path().join("cache.json"),
            recycle: RecycleMode::Simulate,
            ..Default::default()
        };
        settings.analyzer.install_zones.clear();
        settings.analyzer.user_data_zones.clear();

        let context = scan_to_completion(settings, &[data])?;
        let safe = files_in(&context, TierArg::Safe);
        assert_eq!(safe.len(), 1);
        assert_eq!(safe[0].file_name(), "a.tmp");
        assert_eq!(files_in(&context, TierArg::Unmatched).len(), 1);
        Ok(())
    }
}
