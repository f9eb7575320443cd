//! ssh-init path and constant configuration.
//!
//! Everything home-directory relative is resolved once into [`SshPaths`]
//! and handed to the components explicitly, so the rewriter and resolver
//! never read the environment themselves.
//!
//! # Example
//!
//! ```rust
//! use ssh_init::config::SshPaths;
//! use std::path::Path;
//!
//! let paths = SshPaths::from_home(Path::new("/home/alice"));
//! assert_eq!(paths.config_file, Path::new("/home/alice/.ssh/config"));
//! assert_eq!(paths.key_dir, Path::new("/home/alice/.ssh/auto"));
//! ```

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Port used when the connection string has no `:port` part.
pub const DEFAULT_PORT: &str = "22";

/// Key type passed to `ssh-keygen -t`.
pub const KEY_TYPE: &str = "ed25519";

/// Mode for `~/.ssh` and the dedicated key directory.
pub const PRIVATE_DIR_MODE: u32 = 0o700;

/// Mode for a newly created client config file.
pub const CONFIG_FILE_MODE: u32 = 0o600;

/// Name of the key directory under `~/.ssh`.
const KEY_DIR_NAME: &str = "auto";

/// Locations of the local SSH state touched by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshPaths {
    /// `~/.ssh`
    pub ssh_dir: PathBuf,
    /// `~/.ssh/config`
    pub config_file: PathBuf,
    /// `~/.ssh/auto`, one key pair per target
    pub key_dir: PathBuf,
}

impl SshPaths {
    /// Create paths relative to a home directory.
    pub fn from_home(home: &Path) -> Self {
        let ssh_dir = home.join(".ssh");
        Self {
            config_file: ssh_dir.join("config"),
            key_dir: ssh_dir.join(KEY_DIR_NAME),
            ssh_dir,
        }
    }

    /// Resolve paths for the current user.
    pub fn discover() -> Result<Self> {
        let home = dirs::home_dir().context("Cannot determine home directory")?;
        Ok(Self::from_home(&home))
    }

    /// Apply command-line overrides on top of the discovered defaults.
    pub fn with_overrides(mut self, config_file: Option<PathBuf>, key_dir: Option<PathBuf>) -> Self {
        if let Some(config_file) = config_file {
            self.config_file = config_file;
        }
        if let Some(key_dir) = key_dir {
            self.key_dir = key_dir;
        }
        self
    }

    /// Create `~/.ssh` with mode 0700 if it does not exist yet.
    ///
    /// An existing directory is left as it is.
    pub fn ensure_ssh_dir(&self) -> Result<()> {
        if self.ssh_dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.ssh_dir)
            .with_context(|| format!("Failed to create {}", self.ssh_dir.display()))?;
        fs::set_permissions(&self.ssh_dir, fs::Permissions::from_mode(PRIVATE_DIR_MODE))
            .with_context(|| format!("Failed to set permissions on {}", self.ssh_dir.display()))?;
        Ok(())
    }
}
