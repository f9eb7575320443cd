//! Remote public key installation over `ssh`.
//!
//! The user install pipes the key into a one-line shell command that
//! appends it to `~/.ssh/authorized_keys`. The root install runs with a
//! terminal attached (`ssh -t`) so `sudo` can ask for a password, which
//! means stdin is not free for the key; it is embedded in the command
//! instead, shell-quoted.
//!
//! Both return whether the remote command succeeded. Failing to start
//! `ssh` at all is an error; a non-zero remote exit is not.

use anyhow::Result;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::args::ConnectionSettings;
use crate::process::Cmd;
use crate::stanza::proxy_command;

/// Remote command for the login user. The key arrives on stdin.
pub const USER_INSTALL_COMMAND: &str =
    "umask 077; mkdir -p .ssh && cat >> .ssh/authorized_keys";

/// Everything needed to reach the host and the key to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    /// `user@host` or `host`
    pub target: String,
    pub port: String,
    /// Identity to authenticate with, if not the ssh default.
    pub identity_file: Option<PathBuf>,
    pub proxy_command: Option<String>,
    /// Public key line, as read from the `.pub` file.
    pub public_key: String,
}

impl InstallRequest {
    pub fn from_settings(settings: &ConnectionSettings, public_key: impl Into<String>) -> Self {
        Self {
            target: settings.target(),
            port: settings.port.clone(),
            identity_file: settings.identity_file.clone(),
            proxy_command: settings
                .bastion
                .as_deref()
                .map(|bastion| proxy_command(bastion, &settings.host)),
            public_key: public_key.into(),
        }
    }

    fn key_line(&self) -> String {
        format!("{}\n", self.public_key.trim())
    }
}

/// Runs the remote install steps with a given `ssh` binary.
#[derive(Debug, Clone)]
pub struct Installer {
    program: String,
    leading_args: Vec<String>,
}

impl Default for Installer {
    fn default() -> Self {
        Self::new("ssh")
    }
}

impl Installer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Run a shell script in place of `ssh`.
    #[cfg(test)]
    fn script(path: &std::path::Path) -> Self {
        Self {
            program: "sh".to_string(),
            leading_args: vec![path.display().to_string()],
        }
    }

    /// Append the key to the login user's authorized keys.
    pub fn install_key(&self, request: &InstallRequest) -> Result<bool> {
        println!("Installing key for {}...", request.target);

        let status = self
            .user_command(request)
            .stdin_bytes(request.key_line())
            .allow_fail()
            .run_interactive()?;

        if status.success() {
            info!(target_host = %request.target, "key installed");
        } else {
            warn!(target_host = %request.target, code = ?status.code(), "key install failed");
        }
        Ok(status.success())
    }

    /// Append the key to root's authorized keys through `sudo`.
    pub fn install_root_key(&self, request: &InstallRequest) -> Result<bool> {
        println!("Installing key for root on {}...", request.target);

        let status = self.root_command(request).allow_fail().run_interactive()?;

        if status.success() {
            info!(target_host = %request.target, "root key installed");
        } else {
            warn!(target_host = %request.target, code = ?status.code(), "root key install failed");
        }
        Ok(status.success())
    }

    fn user_command(&self, request: &InstallRequest) -> Cmd {
        self.base(request)
            .arg(&request.target)
            .arg(USER_INSTALL_COMMAND)
    }

    fn root_command(&self, request: &InstallRequest) -> Cmd {
        self.base(request)
            .arg("-t")
            .arg(&request.target)
            .arg(root_install_command(&request.public_key))
    }

    fn base(&self, request: &InstallRequest) -> Cmd {
        let mut cmd = Cmd::new(self.program.as_str())
            .args(&self.leading_args)
            .args(["-p", request.port.as_str()]);
        if let Some(identity) = &request.identity_file {
            cmd = cmd.arg("-i").arg_path(identity);
        }
        if let Some(proxy) = &request.proxy_command {
            cmd = cmd.arg("-o").arg(format!("ProxyCommand={}", proxy));
        }
        cmd
    }
}

/// Run the user install and, if asked for, the root install.
///
/// A failed user install does not stop the root install. Returns `true`
/// only if every step that ran succeeded. The root step is skipped when the
/// login user is already root.
pub fn install_all(
    installer: &Installer,
    request: &InstallRequest,
    want_root: bool,
    is_root_login: bool,
) -> Result<bool> {
    let mut all_ok = true;

    if installer.install_key(request)? {
        println!("  Key installed for {}", request.target);
    } else {
        println!("  Key installation failed for {}", request.target);
        all_ok = false;
    }

    if want_root {
        if is_root_login {
            println!("  [SKIP] Already logged in as root");
        } else if installer.install_root_key(request)? {
            println!("  Key installed for root");
        } else {
            println!("  Key installation failed for root");
            all_ok = false;
        }
    }

    Ok(all_ok)
}

/// `sudo sh -c '...'` appending `public_key` to root's authorized keys.
pub fn root_install_command(public_key: &str) -> String {
    let script = format!(
        "umask 077; mkdir -p ~root/.ssh && printf '%s\\n' {} >> ~root/.ssh/authorized_keys",
        shell_quote(public_key.trim())
    );
    format!("sudo sh -c {}", shell_quote(&script))
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
