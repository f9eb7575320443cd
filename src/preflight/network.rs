//! Reachability check for the target's SSH port.
//!
//! A plain TCP connect with a short timeout. An unreachable host is only a
//! warning: it may still be reachable through settings in `~/.ssh/config`
//! that a raw connect knows nothing about.

use super::CheckResult;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// How long to wait for the TCP handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Try to open a TCP connection to `host:port`.
pub async fn check_reachable(host: &str, port: u16, limit: Duration) -> CheckResult {
    let addr = format!("{}:{}", host, port);

    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => CheckResult::pass("Network", format!("{} accepts connections", addr)),
        Ok(Err(e)) => CheckResult::warn(
            "Network",
            format!("{} unreachable ({}), continuing anyway", addr, e),
        ),
        Err(_) => CheckResult::warn(
            "Network",
            format!(
                "{} did not answer within {}s, continuing anyway",
                addr,
                limit.as_secs()
            ),
        ),
    }
}
