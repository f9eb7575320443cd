//! Host tool validation.
//!
//! Checks that the OpenSSH client tools are installed and on `PATH`.

use super::CheckResult;
use crate::process::which;

/// Required host tools with their install suggestions.
const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("ssh", "Install the key remotely", "Install the OpenSSH client (openssh-client / openssh-clients)"),
    ("ssh-keygen", "Generate the key pair", "Install the OpenSSH client (openssh-client / openssh-clients)"),
];

/// Check that all required host tools are installed.
pub fn check_host_tools() -> Vec<CheckResult> {
    REQUIRED_TOOLS
        .iter()
        .map(|(tool, purpose, install)| check_tool(tool, purpose, install))
        .collect()
}

fn check_tool(tool: &str, purpose: &str, install_hint: &str) -> CheckResult {
    match which(tool) {
        Some(path) => CheckResult::pass(
            format!("{} tool", tool),
            format!("Found at {} ({})", path, purpose),
        ),
        None => CheckResult::fail(
            format!("{} tool", tool),
            format!("Not found (needed to: {})", purpose),
            install_hint,
        ),
    }
}
