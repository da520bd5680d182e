use serde::{Deserialize, Serialize};
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::format_bytes;
use crate::rules::RiskTier;

/// A root the scanner is asked to walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTarget {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub requires_admin: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScanTarget {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
            requires_admin: false,
            description: None,
            enabled: true,
        }
    }

    /// Target whose id and name are derived from the path itself.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Self::new(path.to_string_lossy().to_string(), name, path)
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn requires_admin(mut self, requires_admin: bool) -> Self {
        self.requires_admin = requires_admin;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// One discovered filesystem entry.
///
/// Only `risk_tier` changes after creation; the scan controller sets it
/// once classification has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<SystemTime>,
    pub created: Option<SystemTime>,
    /// Last suffix with its leading dot, or empty.
    pub extension: String,
    pub is_hidden: bool,
    pub is_readonly: bool,
    #[serde(default)]
    pub risk_tier: Option<RiskTier>,
}

impl FileDescriptor {
    /// Describe `path` without following a final symlink.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = fs::symlink_metadata(path)?;
        Ok(Self::from_metadata(path.to_path_buf(), &metadata))
    }

    pub fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        let is_dir = metadata.is_dir();
        let extension = real_extension(&path);
        let is_hidden = is_hidden(&path, metadata);
        Self {
            size: if is_dir { 0 } else { metadata.len() },
            is_dir,
            modified: metadata.modified().ok(),
            created: metadata.created().ok(),
            extension,
            is_hidden,
            is_readonly: metadata.permissions().readonly(),
            risk_tier: None,
            path,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn formatted_size(&self) -> String {
        format_bytes(self.size)
    }
}

/// Last suffix of the file name, lowercased, with a leading dot.
///
/// `archive.tar.gz` yields `.gz`; a dotfile such as `.bashrc` has no
/// extension.
pub fn real_extension(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

#[cfg(windows)]
fn is_hidden(_path: &Path, metadata: &Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    metadata.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0
}

#[cfg(not(windows))]
fn is_hidden(path: &Path, _metadata: &Metadata) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// Outcome of walking a single [`ScanTarget`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub target: ScanTarget,
    /// Files and directories in traversal order.
    pub files: Vec<FileDescriptor>,
    /// Sum of file sizes; directories contribute nothing.
    pub total_size: u64,
    pub file_count: usize,
    pub dir_count: usize,
    pub from_cache: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

impl ScanResult {
    pub fn new(target: ScanTarget) -> Self {
        Self {
            target,
            files: Vec::new(),
            total_size: 0,
            file_count: 0,
            dir_count: 0,
            from_cache: false,
            duration: Duration::ZERO,
            error: None,
        }
    }

    pub fn failed(target: ScanTarget, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(target)
        }
    }

    pub(crate) fn push(&mut self, descriptor: FileDescriptor) {
        if descriptor.is_dir {
            self.dir_count += 1;
        } else {
            self.file_count += 1;
            self.total_size += descriptor.size;
        }
        self.files.push(descriptor);
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Non-directory entries only.
    pub fn regular_files(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.files.iter().filter(|f| !f.is_dir)
    }

    pub fn files_with_extension(&self, extension: &str) -> Vec<&FileDescriptor> {
        let wanted = normalize_extension(extension);
        self.regular_files()
            .filter(|f| f.extension == wanted)
            .collect()
    }

    pub fn files_larger_than(&self, bytes: u64) -> Vec<&FileDescriptor> {
        self.regular_files().filter(|f| f.size > bytes).collect()
    }

    pub fn formatted_size(&self) -> String {
        format_bytes(self.total_size)
    }
}

/// `tmp`, `.TMP` and `.tmp` all become `.tmp`.
pub fn normalize_extension(extension: &str) -> String {
    let trimmed = extension.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(".{}", trimmed.to_lowercase())
    }
}
