//! # Wiper
//!
//! A rule-driven disk cleaner. Files found under scan targets are classified
//! into risk tiers by configurable rules, checked against protected locations
//! and moved to the platform recycle bin instead of being erased.
//!
//! ## Usage
//!
//! ### Command Line
//!
//! ```bash
//! # Scan and list the files safe to remove
//! wiper scan ~/Downloads --tier safe
//!
//! # Clean them, asking for confirmation first
//! wiper clean ~/Downloads
//!
//! # Log what would be removed without touching anything
//! wiper clean ~/Downloads --simulate --yes
//!
//! # Attribute disk usage to installed applications
//! wiper analyze --top 5
//! ```
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use wiper_core::{AppContext, RiskTier, ScanTarget, Settings};
//!
//! let context = AppContext::from_settings(Settings::default())?;
//! context.scan.start_scan(vec![ScanTarget::from_path("/tmp")]);
//! context.scan.wait_for_completion(None);
//!
//! let files = context.scan.get_matched_files(RiskTier::Safe);
//! let preview = context.clean.preview_clean(&files);
//! println!("{} files, {}", preview.file_count, preview.formatted_size);
//!
//! context.clean.confirm_clean();
//! context.clean.start_clean(files, true);
//! context.clean.wait_for_completion(None);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Re-export core functionality
pub use wiper_core::*;
