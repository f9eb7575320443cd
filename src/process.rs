//! External process execution.
//!
//! A small builder around [`std::process::Command`] used for every call out
//! to `ssh` and `ssh-keygen`. Failures carry the program name, exit code and
//! captured stderr unless the caller opts out with [`Cmd::allow_fail`].

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

/// Output of a captured command.
#[derive(Debug)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Builder for an external command.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    stdin: Option<Vec<u8>>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Bytes written to the child's stdin, which is then closed.
    pub fn stdin_bytes(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Message used in place of the generic failure text.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return non-zero exits as results instead of errors.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Run with stdout and stderr captured.
    pub fn run(self) -> Result<CommandResult> {
        debug!(command = %self, "running");

        let mut child = self
            .command()
            .stdin(self.stdin_mode())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program))?;

        self.feed_stdin(&mut child)?;

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {}", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            self.fail(result.status, result.stderr.trim())?;
        }

        Ok(result)
    }

    /// Run with stdout and stderr attached to the terminal.
    ///
    /// Used for `ssh`, which may need to ask for a password or host key
    /// confirmation on the controlling terminal.
    pub fn run_interactive(self) -> Result<ExitStatus> {
        debug!(command = %self, "running interactively");

        let mut child = self
            .command()
            .stdin(self.stdin_mode())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program))?;

        self.feed_stdin(&mut child)?;

        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for {}", self.program))?;

        if !status.success() && !self.allow_fail {
            self.fail(status, "")?;
        }

        Ok(status)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    fn stdin_mode(&self) -> Stdio {
        if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        }
    }

    fn feed_stdin(&self, child: &mut std::process::Child) -> Result<()> {
        if let Some(input) = &self.stdin {
            // Dropping the handle closes the pipe so the child sees EOF.
            let mut pipe = child
                .stdin
                .take()
                .with_context(|| format!("No stdin pipe for {}", self.program))?;
            pipe.write_all(input)
                .with_context(|| format!("Failed to write stdin of {}", self.program))?;
        }
        Ok(())
    }

    fn fail(&self, status: ExitStatus, stderr: &str) -> Result<()> {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());

        match &self.error_msg {
            Some(msg) if stderr.is_empty() => bail!("{} (exit {})", msg, code),
            Some(msg) => bail!("{} (exit {}): {}", msg, code, stderr),
            None if stderr.is_empty() => bail!("{} failed (exit {})", self.program, code),
            None => bail!("{} failed (exit {}): {}", self.program, code, stderr),
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Locate a program on `PATH`.
pub fn which(tool: &str) -> Option<String> {
    which::which(tool)
        .ok()
        .map(|path| path.display().to_string())
}

/// Whether a program is on `PATH`.
pub fn exists(tool: &str) -> bool {
    which(tool).is_some()
}
