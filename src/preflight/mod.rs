//! Preflight checks before touching keys or config.
//!
//! Validates prerequisites BEFORE a key is generated or `~/.ssh/config` is
//! rewritten, so a missing tool doesn't leave a half-finished setup behind.
//!
//! # Checks Performed
//!
//! - **Host tools**: `ssh` and `ssh-keygen` are installed (fatal)
//! - **Network**: the target's SSH port accepts TCP connections (warning only;
//!   skipped when going through a bastion)
//!
//! # Usage
//!
//! ```rust,ignore
//! use ssh_init::preflight::PreflightChecker;
//!
//! let checker = PreflightChecker::new("db01", "22", None);
//! let report = checker.run_all().await;
//!
//! report.print_summary();
//! if !report.is_ok() {
//!     std::process::exit(1);
//! }
//! ```

mod host_tools;
mod network;

pub use host_tools::check_host_tools;
pub use network::{check_reachable, CONNECT_TIMEOUT};

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Name of the check
    pub name: String,
    /// Whether the check passed
    pub passed: bool,
    /// Passed, but with something the user should know about
    pub warning: bool,
    /// Human-readable message
    pub message: String,
    /// Optional suggestion for fixing the issue
    pub suggestion: Option<String>,
}

impl CheckResult {
    /// Create a passing check result.
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            warning: false,
            message: message.into(),
            suggestion: None,
        }
    }

    /// Create a failing check result.
    pub fn fail(
        name: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            passed: false,
            warning: false,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    /// Create a warning check result (passes but with a note).
    pub fn warn(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            warning: true,
            message: message.into(),
            suggestion: None,
        }
    }

    /// Tag shown in the summary: `[OK]`, `[WARN]` or `[FAIL]`.
    pub fn status(&self) -> &'static str {
        match (self.passed, self.warning) {
            (false, _) => "[FAIL]",
            (true, true) => "[WARN]",
            (true, false) => "[OK]",
        }
    }
}

/// All preflight results for one run.
#[derive(Debug, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Check if all preflight checks passed.
    pub fn is_ok(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Get all failing checks.
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    pub fn total_count(&self) -> usize {
        self.checks.len()
    }

    /// Print a summary of the preflight checks.
    pub fn print_summary(&self) {
        for check in &self.checks {
            println!("{} {}: {}", check.status(), check.name, check.message);
            if let Some(suggestion) = &check.suggestion {
                println!("     Suggestion: {}", suggestion);
            }
        }

        if !self.is_ok() {
            println!(
                "Preflight checks failed: {} of {} passed",
                self.passed_count(),
                self.total_count()
            );
        }
    }
}

/// Preflight checker for one target.
pub struct PreflightChecker {
    host: String,
    port: String,
    bastion: Option<String>,
}

impl PreflightChecker {
    pub fn new(host: impl Into<String>, port: impl Into<String>, bastion: Option<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
            bastion,
        }
    }

    /// Run all preflight checks and return a report.
    pub async fn run_all(&self) -> PreflightReport {
        let mut report = PreflightReport::default();

        report.checks.extend(check_host_tools());

        let network = match &self.bastion {
            Some(bastion) => CheckResult::warn(
                "Network",
                format!("Skipped, {} is reached through {}", self.host, bastion),
            ),
            None => match self.port.parse::<u16>() {
                Ok(port) => check_reachable(&self.host, port, CONNECT_TIMEOUT).await,
                Err(_) => CheckResult::fail(
                    "Network",
                    format!("Invalid port '{}'", self.port),
                    "Use a port between 1 and 65535",
                ),
            },
        };
        report.checks.push(network);

        report
    }
}
