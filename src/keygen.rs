//! Dedicated key pair generation.
//!
//! Each target gets its own ed25519 pair under the key directory
//! (`~/.ssh/auto/<target>` and `<target>.pub`). The actual key material is
//! produced by `ssh-keygen`; this module only picks the path, prepares the
//! directory and checks the result.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{KEY_TYPE, PRIVATE_DIR_MODE};
use crate::process::Cmd;

/// Paths of one generated key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private: PathBuf,
    pub public: PathBuf,
}

impl KeyPair {
    /// Deterministic location for `target`'s key pair.
    pub fn at(key_dir: &Path, target: &str) -> Self {
        let private = key_dir.join(target);
        let public = key_dir.join(format!("{}.pub", target));
        Self { private, public }
    }

    /// Read and validate the public key.
    pub fn read_public(&self) -> Result<String> {
        let content = fs::read_to_string(&self.public)
            .with_context(|| format!("Failed to read public key: {}", self.public.display()))?;
        verify_public_key(&content)
            .with_context(|| format!("Invalid public key: {}", self.public.display()))?;
        Ok(content)
    }
}

/// Create the key directory (if needed) and restrict it to the owner.
pub fn prepare_key_dir(key_dir: &Path) -> Result<()> {
    fs::create_dir_all(key_dir)
        .with_context(|| format!("Failed to create key directory: {}", key_dir.display()))?;
    fs::set_permissions(key_dir, fs::Permissions::from_mode(PRIVATE_DIR_MODE))
        .with_context(|| format!("Failed to set permissions on {}", key_dir.display()))?;
    Ok(())
}

/// Generate a fresh key pair for `target`.
///
/// An existing pair at the same path is replaced. An empty passphrase
/// leaves the private key unencrypted.
pub fn generate_key_pair(key_dir: &Path, target: &str, passphrase: &str) -> Result<KeyPair> {
    if target.is_empty() || target.contains('/') || target.starts_with('.') {
        bail!("Cannot use '{}' as a key file name", target);
    }

    prepare_key_dir(key_dir)?;
    let pair = KeyPair::at(key_dir, target);

    for path in [&pair.private, &pair.public] {
        if path.exists() {
            debug!(path = %path.display(), "removing previous key");
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove old key: {}", path.display()))?;
        }
    }

    Cmd::new("ssh-keygen")
        .args(["-q", "-t", KEY_TYPE, "-f"])
        .arg_path(&pair.private)
        .args(["-C", target, "-N", passphrase])
        .error_msg(format!("ssh-keygen failed to create a key for {}", target))
        .run()?;

    if !pair.private.exists() {
        bail!("Private key was not written: {}", pair.private.display());
    }
    pair.read_public()?;

    info!(name = target, path = %pair.private.display(), "key pair generated");
    Ok(pair)
}

/// Check that `content` looks like a single OpenSSH public key line.
pub fn verify_public_key(content: &str) -> Result<()> {
    let line = content.trim();
    if line.is_empty() {
        bail!("public key is empty");
    }
    if line.lines().count() != 1 {
        bail!("public key spans multiple lines");
    }

    let mut fields = line.split_whitespace();
    let algorithm = fields.next().unwrap_or_default();
    if !(algorithm.starts_with("ssh-") || algorithm.starts_with("ecdsa-") || algorithm.starts_with("sk-")) {
        bail!("unrecognized key type '{}'", algorithm);
    }
    if fields.next().is_none() {
        bail!("public key has no key data");
    }
    Ok(())
}
