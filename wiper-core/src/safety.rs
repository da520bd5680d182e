use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::model::{normalize_extension, real_extension};

/// Base names that are never offered for deletion, wherever they live.
pub const CRITICAL_SYSTEM_FILES: &[&str] = &[
    "pagefile.sys",
    "hiberfil.sys",
    "swapfile.sys",
    "ntldr",
    "ntdetect.com",
    "boot.ini",
    "bootsect.bak",
    "vmlinuz",
    "initrd.img",
    "swapfile",
];

/// Deletable, but worth a warning in the log.
pub const CRITICAL_EXTENSIONS: &[&str] = &[
    ".sys", ".dll", ".exe", ".com", ".bat", ".cmd", ".ps1", ".reg", ".inf", ".so", ".dylib",
    ".sh",
];

/// Why a path must not be deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsafeReason {
    Missing(PathBuf),
    Unresolvable { path: PathBuf, error: String },
    ProtectedPath(PathBuf),
    SystemFile(String),
    WhitelistedExtension(String),
}

impl UnsafeReason {
    /// Protected-location and critical-file rejections, as opposed to a
    /// file that is simply gone or excluded by user preference.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            UnsafeReason::ProtectedPath(_) | UnsafeReason::SystemFile(_)
        )
    }
}

impl fmt::Display for UnsafeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsafeReason::Missing(path) => write!(f, "File does not exist: {}", path.display()),
            UnsafeReason::Unresolvable { path, error } => {
                write!(f, "Cannot resolve path {}: {}", path.display(), error)
            }
            UnsafeReason::ProtectedPath(root) => write!(f, "Protected path: {}", root.display()),
            UnsafeReason::SystemFile(name) => write!(f, "System file: {name}"),
            UnsafeReason::WhitelistedExtension(ext) => write!(f, "Whitelisted extension: {ext}"),
        }
    }
}

/// Result of [`SafetyValidator::is_safe_to_delete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Safe,
    Unsafe(UnsafeReason),
}

impl SafetyVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, SafetyVerdict::Safe)
    }

    /// `OK` for a safe path, otherwise the rejection text.
    pub fn reason(&self) -> String {
        match self {
            SafetyVerdict::Safe => "OK".to_string(),
            SafetyVerdict::Unsafe(reason) => reason.to_string(),
        }
    }

    pub fn unsafe_reason(&self) -> Option<&UnsafeReason> {
        match self {
            SafetyVerdict::Safe => None,
            SafetyVerdict::Unsafe(reason) => Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
struct ProtectedRoot {
    display: PathBuf,
    components: Vec<String>,
}

impl ProtectedRoot {
    fn new(path: PathBuf) -> Self {
        // Resolve when possible so that e.g. /var -> /private/var still
        // matches resolved candidates; fall back to the literal path.
        let resolved = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        Self {
            components: folded_components(&resolved),
            display: path,
        }
    }

    fn contains(&self, candidate: &[String]) -> bool {
        !self.components.is_empty()
            && candidate.len() >= self.components.len()
            && candidate[..self.components.len()] == self.components[..]
    }
}

/// Case-folded path components, ignoring `.` and trailing separators.
fn folded_components(path: &Path) -> Vec<String> {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
        .collect()
}

/// Multi-layer guard deciding whether a path may be deleted.
#[derive(Debug)]
pub struct SafetyValidator {
    protected: RwLock<Vec<ProtectedRoot>>,
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyValidator {
    /// Validator guarding the platform's protected locations.
    pub fn new() -> Self {
        Self::with_protected_paths(default_protected_paths())
    }

    pub fn with_protected_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let protected = paths
            .into_iter()
            .map(|p| ProtectedRoot::new(p.into()))
            .collect();
        Self {
            protected: RwLock::new(protected),
        }
    }

    pub fn add_protected_path(&self, path: impl Into<PathBuf>) {
        let root = ProtectedRoot::new(path.into());
        debug!("Adding protected path: {:?}", root.display);
        self.protected
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(root);
    }

    pub fn protected_paths(&self) -> Vec<PathBuf> {
        self.protected
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|root| root.display.clone())
            .collect()
    }

    /// Decide whether `path` may be moved to the recycle bin.
    ///
    /// `whitelist` lists extensions the user never wants touched; membership
    /// makes a file unsafe.
    pub fn is_safe_to_delete(&self, path: &Path, whitelist: &[String]) -> SafetyVerdict {
        if fs::symlink_metadata(path).is_err() {
            return SafetyVerdict::Unsafe(UnsafeReason::Missing(path.to_path_buf()));
        }

        // Every later check runs on the resolved path so a swapped-in
        // symlink cannot redirect the delete.
        let resolved = match fs::canonicalize(path) {
            Ok(resolved) => resolved,
            // A dangling symlink has nothing behind it to delete.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return SafetyVerdict::Unsafe(UnsafeReason::Missing(path.to_path_buf()));
            }
            Err(e) => {
                return SafetyVerdict::Unsafe(UnsafeReason::Unresolvable {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                });
            }
        };

        if let Some(root) = self.protected_root_of(&resolved) {
            debug!("Rejecting {:?}: under protected root {:?}", resolved, root);
            return SafetyVerdict::Unsafe(UnsafeReason::ProtectedPath(root));
        }

        let name = resolved
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if CRITICAL_SYSTEM_FILES.contains(&name.as_str()) {
            return SafetyVerdict::Unsafe(UnsafeReason::SystemFile(name));
        }

        let extension = real_extension(&resolved);
        if !extension.is_empty()
            && whitelist
                .iter()
                .any(|w| normalize_extension(w) == extension)
        {
            return SafetyVerdict::Unsafe(UnsafeReason::WhitelistedExtension(extension));
        }

        if CRITICAL_EXTENSIONS.contains(&extension.as_str()) {
            warn!("Deleting file with critical extension: {:?}", resolved);
        }

        SafetyVerdict::Safe
    }

    /// Whether `path` sits under a protected root. Used to prune traversal.
    pub fn is_system_path(&self, path: &Path) -> bool {
        let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.protected_root_of(&resolved).is_some()
    }

    fn protected_root_of(&self, resolved: &Path) -> Option<PathBuf> {
        let candidate = folded_components(resolved);
        self.protected
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|root| root.contains(&candidate))
            .map(|root| root.display.clone())
    }
}

/// Protected locations for the running platform.
#[cfg(windows)]
pub fn default_protected_paths() -> Vec<PathBuf> {
    let system_drive = std::env::var("SystemDrive").unwrap_or_else(|_| "C:".to_string());
    let root = PathBuf::from(format!("{system_drive}\\"));
    let env_or = |key: &str, fallback: &str| {
        std::env::var_os(key)
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join(fallback))
    };

    vec![
        env_or("SystemRoot", "Windows"),
        env_or("ProgramFiles", "Program Files"),
        env_or("ProgramFiles(x86)", "Program Files (x86)"),
        env_or("ProgramData", "ProgramData"),
        root.join("System Volume Information"),
        root.join("Recovery"),
        root.join("Boot"),
        root.join("EFI"),
        root.join("$Recycle.Bin"),
    ]
}

/// Protected locations for the running platform.
#[cfg(not(windows))]
pub fn default_protected_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = [
        "/bin",
        "/boot",
        "/dev",
        "/etc",
        "/lib",
        "/lib64",
        "/opt",
        "/proc",
        "/sbin",
        "/sys",
        "/usr",
        "/System",
        "/Applications",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();

    if let Some(home) = dirs::home_dir() {
        if cfg!(target_os = "macos") {
            paths.push(home.join(".Trash"));
        } else {
            paths.push(home.join(".local/share/Trash"));
        }
    }
    paths
}
