//! Boot supervisor entry point.
//!
//! This process runs as PID 1 inside every thinboot image. It never exits:
//! the boot ends either in a reboot or in the emergency shell.

use std::path::Path;
use std::process;
use std::sync::Arc;

use thinboot_core::config::{SupervisorConfig, SUPERVISOR_CONFIG_PATH};
use thinboot_core::params::BootParameterSet;
use thinboot_guest_init::bringup::{self, CMDLINE_PATH};
use thinboot_guest_init::power::{self, SHUTDOWN_GRACE};
use thinboot_guest_init::shell::{self, EmergencyShell};
use thinboot_guest_init::{BootOutcome, BootSupervisor, LogBuffer, UplinkLayer};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool, buffer: Arc<LogBuffer>) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(UplinkLayer::new(buffer))
        .init();
}

/// Resolves when PID 1 receives SIGTERM.
async fn terminated() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Cannot watch for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

fn main() {
    // /proc must be mounted before the command line can be read, and the
    // command line decides the log level.
    let mounted = bringup::mount_pseudo_filesystems();
    let params = bringup::read_boot_parameters(Path::new(CMDLINE_PATH));
    let config = SupervisorConfig::load_or_default(Path::new(SUPERVISOR_CONFIG_PATH));

    let verbose = params.as_ref().map(|p| p.verbose).unwrap_or(false);
    let capacity = config
        .as_ref()
        .map(|c| c.log_buffer_capacity)
        .unwrap_or_else(|_| SupervisorConfig::default().log_buffer_capacity);
    let buffer = Arc::new(LogBuffer::new(capacity));
    init_tracing(verbose, buffer.clone());

    info!("thinboot-init {} starting (PID {})", thinboot_core::VERSION, process::id());
    if let Err(e) = mounted {
        error!(error = %e, "Mounting pseudo-filesystems failed");
    }
    let params = params.unwrap_or_else(|e| {
        warn!(error = %e, "Using default boot parameters");
        BootParameterSet::default()
    });
    let config = config.unwrap_or_else(|e| {
        warn!(error = %e, "Using default supervisor configuration");
        SupervisorConfig::default()
    });

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Cannot start async runtime");
            fallback_shell(&config);
            return;
        }
    };

    let supervisor = BootSupervisor::new(config.clone(), buffer);
    let outcome = runtime.block_on(async {
        tokio::select! {
            outcome = supervisor.run(params) => outcome,
            _ = terminated() => BootOutcome::Reboot { reason: "SIGTERM received".to_string() },
        }
    });

    let banner = match outcome {
        BootOutcome::Reboot { reason } => {
            info!(%reason, "Boot ended, rebooting");
            match power::reboot(SHUTDOWN_GRACE) {
                Ok(()) => return,
                Err(e) => {
                    error!(error = %e, "Reboot failed");
                    shell::banner(&format!("reboot failed after: {}", reason), false, None)
                }
            }
        }
        BootOutcome::EmergencyShell(report) => {
            error!(phase = %report.phase, reason = %report.reason, "Entering emergency shell");
            let display_log = report
                .display_log_tail
                .as_ref()
                .map(|_| config.xorg_log_path.display().to_string());
            shell::banner(&report.reason, report.remote_shell, display_log.as_deref())
        }
    };

    runtime.block_on(EmergencyShell::new(&config.tools.shell).run(&banner));
}

/// Keep a shell on the console without the async runtime.
fn fallback_shell(config: &SupervisorConfig) {
    loop {
        if let Err(e) = process::Command::new(&config.tools.shell).status() {
            error!(error = %e, "Cannot start emergency shell");
            std::thread::sleep(std::time::Duration::from_secs(5));
        }
    }
}
