//! Clock synchronization.
//!
//! Tries the NTP client first and `rdate` second, each under its own
//! deadline. Failure never blocks the boot; the terminal keeps its local
//! clock.

use std::time::Duration;

use thinboot_core::config::ToolPaths;
use thinboot_core::error::BootFailure;

use crate::process::CommandRunner;

/// Tool that set the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Ntp,
    Rdate,
}

impl std::fmt::Display for ClockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockSource::Ntp => write!(f, "ntpd"),
            ClockSource::Rdate => write!(f, "rdate"),
        }
    }
}

/// Synchronize the clock against `server`, giving each source at most
/// `deadline`.
pub async fn sync_clock(
    runner: &dyn CommandRunner,
    tools: &ToolPaths,
    server: &str,
    deadline: Duration,
) -> std::result::Result<ClockSource, BootFailure> {
    let attempts = [
        (
            ClockSource::Ntp,
            tools.ntpd.as_path(),
            vec!["-n".to_string(), "-q".to_string(), "-p".to_string(), server.to_string()],
        ),
        (
            ClockSource::Rdate,
            tools.rdate.as_path(),
            vec!["-s".to_string(), server.to_string()],
        ),
    ];

    let mut errors = Vec::new();
    for (source, program, args) in attempts {
        match tokio::time::timeout(deadline, runner.run(program, &args)).await {
            Ok(Ok(output)) if output.success() => {
                tracing::info!(%source, server, "Clock synchronized");
                return Ok(source);
            }
            Ok(Ok(output)) => errors.push(format!("{} {}", source, output.exit)),
            Ok(Err(e)) => errors.push(format!("{} {}", source, e)),
            Err(_) => {
                tracing::warn!(%source, server, ?deadline, "Clock source timed out");
                errors.push(format!("{} timed out after {}s", source, deadline.as_secs()));
            }
        }
    }

    let failure = BootFailure::ClockSync(format!("{}: {}", server, errors.join(", ")));
    tracing::warn!(error = %failure, "Continuing with local clock");
    Err(failure)
}
