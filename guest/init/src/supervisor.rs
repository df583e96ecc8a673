//! Boot sequence.
//!
//! Phases run one after another, each a precondition for the next:
//! device bring-up, network, clock, display, remote session. A failed
//! network or display halts in the emergency shell. An exhausted session
//! budget ends in a reboot.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thinboot_core::config::SupervisorConfig;
use thinboot_core::error::BootFailure;
use thinboot_core::metrics::SessionStatus;
use thinboot_core::params::BootParameterSet;
use thinboot_core::HardwareVariant;
use tokio::sync::watch;

use crate::bringup::{gpu_present, load_variant_manifest, DeviceBringUp};
use crate::clock::sync_clock;
use crate::display::{candidate_list, log_tail, DisplaySupervisor, XorgLauncher};
use crate::network::{IoctlLink, NetworkBringUp, NetworkLease};
use crate::process::{CommandRunner, SystemRunner};
use crate::services::Services;
use crate::session::{BackoffPolicy, FreeRdpLauncher, SessionAttempt, SessionSupervisor};
use crate::telemetry::{flush_once, HttpServerApi, LogBuffer, ServerApi, TelemetryTasks};

/// Lines of the display server log included in a diagnostic report.
pub const DISPLAY_LOG_LINES: usize = 50;

/// Phase a boot stopped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    BringUp,
    Network,
    Display,
    Session,
}

impl std::fmt::Display for BootPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootPhase::BringUp => write!(f, "bring-up"),
            BootPhase::Network => write!(f, "network"),
            BootPhase::Display => write!(f, "display"),
            BootPhase::Session => write!(f, "session"),
        }
    }
}

/// Report posted to the server when a boot stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticReport {
    pub phase: BootPhase,
    pub reason: String,
    pub variant: String,
    pub mac: Option<String>,
    pub attempted_drivers: Vec<String>,
    pub display_log_tail: Option<String>,
    pub session_history: Vec<SessionAttempt>,
    /// Whether the remote diagnostic shell is reachable.
    pub remote_shell: bool,
}

impl DiagnosticReport {
    pub fn new(phase: BootPhase, reason: impl Into<String>, variant: &str) -> Self {
        Self {
            phase,
            reason: reason.into(),
            variant: variant.to_string(),
            mac: None,
            attempted_drivers: Vec::new(),
            display_log_tail: None,
            session_history: Vec::new(),
            remote_shell: false,
        }
    }

    pub fn render(&self) -> String {
        let mut text = format!(
            "phase: {}\nerror: {}\nvariant: {}\nmac: {}\n",
            self.phase,
            self.reason,
            self.variant,
            self.mac.as_deref().unwrap_or("unknown")
        );
        if !self.attempted_drivers.is_empty() {
            text.push_str(&format!("drivers attempted: {}\n", self.attempted_drivers.join(", ")));
        }
        if !self.session_history.is_empty() {
            text.push_str("session attempts:\n");
            for attempt in &self.session_history {
                text.push_str(&format!(
                    "  #{} {} (backoff {}s)\n",
                    attempt.index,
                    attempt.exit.message(),
                    attempt.backoff.as_secs()
                ));
            }
        }
        if let Some(tail) = &self.display_log_tail {
            text.push_str(&format!(
                "--- display server log (last {} lines) ---\n{}\n",
                DISPLAY_LOG_LINES, tail
            ));
        }
        text
    }
}

/// How a boot ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    Reboot { reason: String },
    EmergencyShell(DiagnosticReport),
}

/// Post `report` and flush buffered logs. Failures are logged only.
pub async fn deliver_report(api: &dyn ServerApi, buffer: &LogBuffer, mac: &str, report: &DiagnosticReport) {
    match api.post_diagnostic(mac, report.render()).await {
        Ok(()) => tracing::info!(phase = %report.phase, "Diagnostic report delivered"),
        Err(e) => tracing::warn!(error = %e, "Diagnostic report not delivered"),
    }
    if let Err(e) = flush_once(api, buffer, mac).await {
        tracing::debug!(error = %e, "Final log flush failed");
    }
}

/// Drives one boot of the terminal.
pub struct BootSupervisor {
    config: SupervisorConfig,
    buffer: Arc<LogBuffer>,
    runner: Arc<dyn CommandRunner>,
}

impl BootSupervisor {
    pub fn new(config: SupervisorConfig, buffer: Arc<LogBuffer>) -> Self {
        let runner = SystemRunner::with_deadline(config.tool_timeout());
        Self {
            config,
            buffer,
            runner: Arc::new(runner),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub async fn run(&self, params: BootParameterSet) -> BootOutcome {
        let manifest = load_variant_manifest(&self.config.variant_manifest, params.video_driver.as_deref());
        let variant = manifest.variant;
        tracing::info!(
            variant = %variant.name,
            kernel = %manifest.kernel_version,
            server = ?params.server_ip,
            "Boot supervisor starting"
        );

        self.bring_up_devices(&variant).await;

        let lease = match self.bring_up_network().await {
            Ok(lease) => lease,
            Err(failure) => {
                let report = DiagnosticReport::new(BootPhase::Network, failure.to_string(), &variant.name);
                return BootOutcome::EmergencyShell(report);
            }
        };

        // Local clock is kept on failure.
        let _ = sync_clock(
            self.runner.as_ref(),
            &self.config.tools,
            &params.ntp_server,
            self.config.clock_sync_timeout(),
        )
        .await;

        let api = self.connect(&params);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Disconnected);
        if let Some(api) = &api {
            // Detached; the tasks live until the machine reboots.
            let _tasks = TelemetryTasks::spawn(api.clone(), self.buffer.clone(), &lease.mac, status_rx, &self.config);
        }

        let remote_shell = self.start_services(&params).await;

        if params.force_shell {
            tracing::warn!("Emergency shell requested on the kernel command line");
            let mut report = DiagnosticReport::new(BootPhase::BringUp, "emergency shell requested", &variant.name);
            report.mac = Some(lease.mac.clone());
            report.remote_shell = remote_shell;
            return BootOutcome::EmergencyShell(report);
        }

        let candidates = candidate_list(&variant, &params, gpu_present(Path::new("/dev")));
        let launcher = XorgLauncher {
            xorg: self.config.tools.xorg.clone(),
            config_path: self.config.xorg_config_path.clone(),
            log_path: self.config.xorg_log_path.clone(),
            display: self.config.display.clone(),
            resolution: params.resolution,
        };
        let display = DisplaySupervisor::new(launcher, self.config.display_settle())
            .start(&candidates)
            .await;
        let attempted = display.attempted.clone();
        let (driver, _server) = match display.into_result() {
            Ok(running) => running,
            Err(failure) => {
                let mut report = DiagnosticReport::new(BootPhase::Display, failure.to_string(), &variant.name);
                report.mac = Some(lease.mac.clone());
                report.attempted_drivers = attempted;
                report.display_log_tail = Some(log_tail(&self.config.xorg_log_path, DISPLAY_LOG_LINES));
                report.remote_shell = remote_shell;
                if let Some(api) = &api {
                    deliver_report(api.as_ref(), &self.buffer, &lease.mac, &report).await;
                }
                return BootOutcome::EmergencyShell(report);
            }
        };
        tracing::info!(driver = %driver, "Display ready, starting remote session");

        let (failure, history) = self.run_sessions(&params, api.clone(), status_tx).await;
        let mut report = DiagnosticReport::new(BootPhase::Session, failure.to_string(), &variant.name);
        report.mac = Some(lease.mac.clone());
        report.attempted_drivers = attempted;
        report.session_history = history;
        if let Some(api) = &api {
            deliver_report(api.as_ref(), &self.buffer, &lease.mac, &report).await;
        }
        BootOutcome::Reboot {
            reason: failure.to_string(),
        }
    }

    async fn bring_up_devices(&self, variant: &HardwareVariant) {
        match DeviceBringUp::new(self.runner.as_ref(), &self.config.tools)
            .run(variant)
            .await
        {
            Ok(report) if !report.failed.is_empty() => {
                tracing::warn!(failed = ?report.failed, "Some kernel modules did not load")
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Device bring-up incomplete"),
        }
    }

    async fn bring_up_network(&self) -> std::result::Result<NetworkLease, BootFailure> {
        let link = IoctlLink;
        let result = NetworkBringUp::new(
            self.runner.as_ref(),
            &link,
            &self.config.tools.udhcpc,
            Duration::from_secs(self.config.dhcp_timeout_secs),
        )
        .run()
        .await;
        if let Err(failure) = &result {
            tracing::error!(error = %failure, "Network bring-up failed");
        }
        result
    }

    fn connect(&self, params: &BootParameterSet) -> Option<Arc<HttpServerApi>> {
        let Some(server) = &params.server_ip else {
            tracing::warn!("No serverip on the kernel command line, telemetry disabled");
            return None;
        };
        match HttpServerApi::new(server, self.config.http_timeout()) {
            Ok(api) => Some(Arc::new(api)),
            Err(e) => {
                tracing::error!(error = %e, "Cannot create server client, telemetry disabled");
                None
            }
        }
    }

    /// Start the optional services. Returns whether the remote shell runs.
    async fn start_services(&self, params: &BootParameterSet) -> bool {
        let services = Services::new(self.runner.as_ref(), &self.config.tools);
        let mut remote_shell = false;
        if let Some(password) = &params.ssh_password {
            match services.start_remote_shell(password).await {
                Ok(()) => remote_shell = true,
                Err(e) => tracing::warn!(error = %e, "Remote diagnostic shell not started"),
            }
        }
        if params.print_server {
            if let Err(e) = services.start_print_server().await {
                tracing::warn!(error = %e, "Print server not started");
            }
        }
        remote_shell
    }

    async fn run_sessions(
        &self,
        params: &BootParameterSet,
        api: Option<Arc<HttpServerApi>>,
        status: watch::Sender<SessionStatus>,
    ) -> (BootFailure, Vec<SessionAttempt>) {
        if !params.has_session_target() {
            tracing::error!("No remote desktop server or boot token on the kernel command line");
        }
        let launcher = FreeRdpLauncher {
            xfreerdp: self.config.tools.xfreerdp.clone(),
            display: self.config.display.clone(),
        };
        let mut session = SessionSupervisor::new(
            launcher,
            BackoffPolicy::from_config(&self.config),
            self.config.session_retry_budget,
            status,
        )
        .with_settle(self.config.session_settle());
        if let Some(api) = api {
            session = session.with_credential_source(api);
        }
        let failure = session.run(params).await;
        (failure, session.history().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ExitClass;
    use crate::telemetry::tasks::tests::RecordingApi;
    use thinboot_core::log::{LogRecord, Severity};

    fn display_report() -> DiagnosticReport {
        let mut report = DiagnosticReport::new(
            BootPhase::Display,
            BootFailure::DisplayStart("tried intel, fbdev, vesa".to_string()).to_string(),
            "intel",
        );
        report.mac = Some("AA:BB:CC:DD:EE:FF".to_string());
        report.attempted_drivers = vec!["intel".into(), "fbdev".into(), "vesa".into()];
        report.display_log_tail = Some("(EE) no screens found".to_string());
        report
    }

    #[test]
    fn test_report_render() {
        let text = display_report().render();
        assert!(text.starts_with("phase: display\n"));
        assert!(text.contains("error: display server failed with every driver: tried intel, fbdev, vesa"));
        assert!(text.contains("drivers attempted: intel, fbdev, vesa"));
        assert!(text.contains("(EE) no screens found"));
        assert!(!text.contains("session attempts"));
    }

    #[test]
    fn test_report_render_session_history() {
        let mut report = DiagnosticReport::new(BootPhase::Session, "remote session gave up after 2 attempt(s)", "amd");
        report.session_history = vec![
            SessionAttempt {
                index: 1,
                exit: ExitClass::AuthenticationFailed,
                backoff: Duration::from_secs(30),
            },
            SessionAttempt {
                index: 2,
                exit: ExitClass::ConnectionFailed,
                backoff: Duration::from_secs(10),
            },
        ];
        let text = report.render();
        assert!(text.contains("mac: unknown"));
        assert!(text.contains("  #1 Authentication failed (backoff 30s)"));
        assert!(text.contains("  #2 Connection to remote desktop server failed (backoff 10s)"));
    }

    #[tokio::test]
    async fn test_deliver_report_posts_and_flushes() {
        let api = RecordingApi::default();
        let buffer = LogBuffer::new(100);
        buffer.push(LogRecord::new(Severity::Critical, "display failed"));
        let report = display_report();

        deliver_report(&api, &buffer, "AA:BB:CC:DD:EE:FF", &report).await;

        let diagnostics = api.diagnostics.lock();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].0, "AA:BB:CC:DD:EE:FF");
        assert_eq!(diagnostics[0].1, report.render());
        assert_eq!(api.messages(), vec!["display failed"]);
    }

    #[tokio::test]
    async fn test_deliver_report_offline_keeps_logs() {
        let api = RecordingApi::default();
        api.set_offline(true);
        let buffer = LogBuffer::new(100);
        buffer.push(LogRecord::new(Severity::Error, "no network"));

        deliver_report(&api, &buffer, "AA:BB:CC:DD:EE:FF", &display_report()).await;

        assert!(api.diagnostics.lock().is_empty());
        assert_eq!(buffer.failed_batches(), 1);
    }

    #[test]
    fn test_connect_requires_server() {
        let supervisor = BootSupervisor::new(SupervisorConfig::default(), Arc::new(LogBuffer::new(10)));
        assert!(supervisor.connect(&BootParameterSet::default()).is_none());
        let params = BootParameterSet::parse("serverip=192.168.1.10");
        let api = supervisor.connect(&params).unwrap();
        assert_eq!(api.base(), "http://192.168.1.10/api");
    }
}
