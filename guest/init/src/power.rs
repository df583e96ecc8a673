//! Reboot handling for PID 1.

use std::time::Duration;

use thinboot_core::error::{Result, ThinbootError};

/// Time given to children after SIGTERM before they are killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Stop every other process, flush filesystems and reboot. Returns only if
/// the reboot call itself fails.
#[cfg(target_os = "linux")]
pub fn reboot(grace: Duration) -> Result<()> {
    use nix::sys::reboot::{reboot as sys_reboot, RebootMode};

    tracing::info!("Rebooting");
    stop_children(grace);
    nix::unistd::sync();
    match sys_reboot(RebootMode::RB_AUTOBOOT) {
        Ok(never) => match never {},
        Err(e) => Err(ThinbootError::Other(format!("reboot failed: {}", e))),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn reboot(_grace: Duration) -> Result<()> {
    Err(ThinbootError::Other(
        "reboot is only supported on Linux".to_string(),
    ))
}

/// Forward SIGTERM to every process, reap until they are gone or `grace`
/// runs out, then SIGKILL the rest.
#[cfg(target_os = "linux")]
fn stop_children(grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;
    use std::time::Instant;

    // -1 addresses every process except PID 1.
    let _ = kill(Pid::from_raw(-1), Signal::SIGTERM);

    let start = Instant::now();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if start.elapsed() > grace {
                    tracing::warn!("Shutdown grace period over, killing remaining processes");
                    let _ = kill(Pid::from_raw(-1), Signal::SIGKILL);
                    while let Ok(status) = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                        if status == WaitStatus::StillAlive {
                            break;
                        }
                    }
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Ok(_) => {}
            Err(Errno::ECHILD) => return,
            Err(e) => {
                tracing::warn!(error = %e, "waitpid failed during shutdown");
                return;
            }
        }
    }
}
