//! Remote session supervision.
//!
//! Runs the remote-desktop client again and again. Each exit is classified
//! into a message and a backoff class, and every attempt counts toward a
//! fixed budget, clean disconnects included. When the budget is spent the
//! boot ends in a reboot so the next boot picks up fresh configuration.
//!
//! The reported status turns connected only once the client has stayed up
//! for the settle time; a client that exits sooner never reached a desktop.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thinboot_core::config::SupervisorConfig;
use thinboot_core::error::{BootFailure, Result};
use thinboot_core::metrics::SessionStatus;
use thinboot_core::params::{BootParameterSet, Resolution};
use thinboot_core::wire::Credentials;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;

use crate::process::{process_error, ExitOutcome};

/// Classified client exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    CleanDisconnect,
    ConnectionFailed,
    AuthenticationFailed,
    ClosedByServer,
    SecurityNegotiationFailed,
    /// Any other exit code.
    Unclassified(i32),
    /// Killed by a signal, or could not be started.
    Abnormal,
}

/// Backoff bucket of an exit class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffClass {
    Short,
    Medium,
    Long,
}

impl ExitClass {
    pub fn from_exit(exit: &ExitOutcome) -> Self {
        match exit.code {
            Some(0) => ExitClass::CleanDisconnect,
            Some(11) => ExitClass::ConnectionFailed,
            Some(23) => ExitClass::AuthenticationFailed,
            Some(131) => ExitClass::ClosedByServer,
            Some(132) => ExitClass::SecurityNegotiationFailed,
            Some(code) => ExitClass::Unclassified(code),
            None => ExitClass::Abnormal,
        }
    }

    pub fn backoff_class(&self) -> BackoffClass {
        match self {
            ExitClass::CleanDisconnect => BackoffClass::Short,
            ExitClass::AuthenticationFailed => BackoffClass::Long,
            _ => BackoffClass::Medium,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ExitClass::CleanDisconnect => "Session disconnected cleanly".to_string(),
            ExitClass::ConnectionFailed => "Connection to remote desktop server failed".to_string(),
            ExitClass::AuthenticationFailed => "Authentication failed".to_string(),
            ExitClass::ClosedByServer => "Session closed by server".to_string(),
            ExitClass::SecurityNegotiationFailed => "Security negotiation failed".to_string(),
            ExitClass::Unclassified(code) => format!("Remote desktop client exited with code {}", code),
            ExitClass::Abnormal => "Remote desktop client terminated abnormally".to_string(),
        }
    }
}

/// Maps (attempt, classification) to the delay before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub short: Duration,
    pub medium: Duration,
    pub long: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            short: Duration::from_secs(config.backoff_short_secs),
            medium: Duration::from_secs(config.backoff_medium_secs),
            long: Duration::from_secs(config.backoff_long_secs),
        }
    }

    /// Delay after attempt `attempt` (1-based) ended with `class`. The delay
    /// depends only on the classification.
    pub fn backoff(&self, _attempt: u32, class: ExitClass) -> Duration {
        match class.backoff_class() {
            BackoffClass::Short => self.short,
            BackoffClass::Medium => self.medium,
            BackoffClass::Long => self.long,
        }
    }
}

/// One client run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAttempt {
    /// 1-based attempt index.
    pub index: u32,
    pub exit: ExitClass,
    pub backoff: Duration,
}

/// Client arguments for one attempt. The client always runs full-screen.
pub fn client_args(params: &BootParameterSet, credentials: &Credentials) -> Vec<String> {
    let mut args = Vec::new();
    let fields = [
        ("/v:", &credentials.server),
        ("/d:", &credentials.domain),
        ("/u:", &credentials.username),
        ("/p:", &credentials.password),
    ];
    for (flag, value) in fields {
        if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
            args.push(format!("{}{}", flag, value));
        }
    }

    args.push("/f".to_string());
    if let Resolution::Fixed { width, height } = params.resolution {
        args.push(format!("/size:{}x{}", width, height));
    }
    args.push("/cert:ignore".to_string());

    let flags = &params.peripherals;
    if flags.sound {
        args.push("/sound:sys:alsa".to_string());
        args.push("/microphone:sys:alsa".to_string());
    }
    if flags.printer {
        args.push("/printer".to_string());
    }
    if flags.usb {
        args.push("/usb:auto".to_string());
    }
    args.push(if flags.clipboard { "+clipboard" } else { "-clipboard" }.to_string());
    if flags.drives {
        args.push("/drive:media,/media".to_string());
    }
    args.push(if flags.compression { "+compression" } else { "-compression" }.to_string());
    if flags.multimon {
        args.push("/multimon".to_string());
    }
    args
}

/// Client arguments with the password masked, for logs.
pub fn redacted(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|a| if a.starts_with("/p:") { "/p:***".to_string() } else { a.clone() })
        .collect()
}

/// Exchanges a one-time boot token for credentials.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn exchange(&self, token: &str) -> Result<Credentials>;
}

/// Result of one client run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientExit {
    pub exit: ExitOutcome,
    /// Captured client output.
    pub output: String,
}

/// Runs the remote-desktop client to completion.
#[async_trait]
pub trait SessionLauncher: Send {
    async fn run(&mut self, args: &[String]) -> Result<ClientExit>;
}

/// Launches xfreerdp against the running display.
pub struct FreeRdpLauncher {
    pub xfreerdp: PathBuf,
    pub display: String,
}

#[async_trait]
impl SessionLauncher for FreeRdpLauncher {
    async fn run(&mut self, args: &[String]) -> Result<ClientExit> {
        let mut child = Command::new(&self.xfreerdp)
            .args(args)
            .env("DISPLAY", &self.display)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| process_error(&self.xfreerdp, e))?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let read_out = async {
            let mut buf = Vec::new();
            if let Some(s) = stdout.as_mut() {
                let _ = s.read_to_end(&mut buf).await;
            }
            buf
        };
        let read_err = async {
            let mut buf = Vec::new();
            if let Some(s) = stderr.as_mut() {
                let _ = s.read_to_end(&mut buf).await;
            }
            buf
        };
        let (out, err, status) = tokio::join!(read_out, read_err, child.wait());
        let status = status.map_err(|e| process_error(&self.xfreerdp, e))?;

        let mut output = String::from_utf8_lossy(&out).to_string();
        output.push_str(&String::from_utf8_lossy(&err));
        Ok(ClientExit {
            exit: status.into(),
            output,
        })
    }
}

const DEFAULT_SETTLE: Duration = Duration::from_secs(5);

/// Runs attempts until the budget is spent.
pub struct SessionSupervisor<L> {
    launcher: L,
    credentials: Option<Arc<dyn CredentialSource>>,
    policy: BackoffPolicy,
    budget: u32,
    status: watch::Sender<SessionStatus>,
    settle: Duration,
    /// Credentials delivered for the boot token, once exchanged.
    delivered: Option<Credentials>,
    history: Vec<SessionAttempt>,
}

impl<L: SessionLauncher> SessionSupervisor<L> {
    pub fn new(launcher: L, policy: BackoffPolicy, budget: u32, status: watch::Sender<SessionStatus>) -> Self {
        Self {
            launcher,
            credentials: None,
            policy,
            budget,
            status,
            settle: DEFAULT_SETTLE,
            delivered: None,
            history: Vec::new(),
        }
    }

    /// Time the client must stay up before the session is reported connected.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Source used to exchange the boot token.
    pub fn with_credential_source(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    pub fn history(&self) -> &[SessionAttempt] {
        &self.history
    }

    /// Credentials for the next attempt. A boot token is exchanged once; a
    /// failed exchange is retried on the next attempt and the command-line
    /// credentials are used meanwhile.
    async fn credentials_for_attempt(&mut self, params: &BootParameterSet) -> Credentials {
        if let Some(delivered) = &self.delivered {
            return params.credentials.overridden_by(delivered);
        }
        let (Some(token), Some(source)) = (&params.boot_token, &self.credentials) else {
            return params.credentials.clone();
        };

        match source.exchange(token).await {
            Ok(delivered) => {
                tracing::info!(server = ?delivered.server, user = ?delivered.username, "Boot token exchanged for credentials");
                let merged = params.credentials.overridden_by(&delivered);
                self.delivered = Some(delivered);
                merged
            }
            Err(e) => {
                let failure = BootFailure::CredentialFetch(e.to_string());
                tracing::warn!(error = %failure, "Using command-line credentials");
                params.credentials.clone()
            }
        }
    }

    /// Run attempts until the retry budget is exhausted. Returns the
    /// session failure that ends the boot.
    pub async fn run(&mut self, params: &BootParameterSet) -> BootFailure {
        for index in 1..=self.budget {
            let credentials = self.credentials_for_attempt(params).await;
            if credentials.server.is_none() {
                tracing::error!(attempt = index, "No remote desktop server configured");
            }
            let args = client_args(params, &credentials);
            tracing::info!(attempt = index, budget = self.budget, args = ?redacted(&args), "RDP connecting");

            let running = self.launcher.run(&args);
            tokio::pin!(running);
            let result = tokio::select! {
                result = &mut running => result,
                _ = tokio::time::sleep(self.settle) => {
                    tracing::info!(attempt = index, "RDP session established");
                    let _ = self.status.send(SessionStatus::Connected);
                    running.await
                }
            };
            let exit = match result {
                Ok(client) => {
                    if !client.output.trim().is_empty() {
                        tracing::debug!(attempt = index, output = %client.output.trim_end(), "Client output");
                    }
                    ExitClass::from_exit(&client.exit)
                }
                Err(e) => {
                    tracing::error!(attempt = index, error = %e, "Remote desktop client failed to start");
                    ExitClass::Abnormal
                }
            };
            let _ = self.status.send(SessionStatus::Disconnected);

            let backoff = self.policy.backoff(index, exit);
            match exit.backoff_class() {
                BackoffClass::Short => tracing::info!(attempt = index, backoff = ?backoff, "{}", exit.message()),
                _ => tracing::error!(attempt = index, backoff = ?backoff, "{}", exit.message()),
            }
            self.history.push(SessionAttempt { index, exit, backoff });
            tokio::time::sleep(backoff).await;
        }

        tracing::error!(attempts = self.budget, "Session retry budget exhausted");
        BootFailure::Session {
            attempts: self.budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thinboot_core::error::ThinbootError;

    /// Launcher replaying scripted exit codes; repeats the last one.
    struct ScriptedClient {
        codes: VecDeque<i32>,
        last: i32,
        uptime: Duration,
        seen_args: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl ScriptedClient {
        fn new(codes: &[i32]) -> Self {
            Self {
                codes: codes.iter().copied().collect(),
                last: codes.last().copied().unwrap_or(0),
                uptime: Duration::ZERO,
                seen_args: Arc::default(),
            }
        }

        fn staying_up(mut self, uptime: Duration) -> Self {
            self.uptime = uptime;
            self
        }
    }

    #[async_trait]
    impl SessionLauncher for ScriptedClient {
        async fn run(&mut self, args: &[String]) -> Result<ClientExit> {
            self.seen_args.lock().push(args.to_vec());
            if !self.uptime.is_zero() {
                tokio::time::sleep(self.uptime).await;
            }
            let code = self.codes.pop_front().unwrap_or(self.last);
            Ok(ClientExit {
                exit: ExitOutcome::code(code),
                output: String::new(),
            })
        }
    }

    struct FakeExchange {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl CredentialSource for FakeExchange {
        async fn exchange(&self, token: &str) -> Result<Credentials> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(ThinbootError::ApiError {
                    endpoint: format!("/boot/credentials/{}", token),
                    message: "connection refused".to_string(),
                });
            }
            Ok(Credentials {
                server: Some("rds.corp".to_string()),
                domain: None,
                username: Some("delivered".to_string()),
                password: Some("s3cret".to_string()),
            })
        }
    }

    /// Source that always delivers the same credentials.
    struct FixedExchange(Credentials);

    #[async_trait]
    impl CredentialSource for FixedExchange {
        async fn exchange(&self, _token: &str) -> Result<Credentials> {
            Ok(self.0.clone())
        }
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy::from_config(&SupervisorConfig::default())
    }

    #[test]
    fn test_exit_classification() {
        let class = |code| ExitClass::from_exit(&ExitOutcome::code(code));
        assert_eq!(class(0), ExitClass::CleanDisconnect);
        assert_eq!(class(11), ExitClass::ConnectionFailed);
        assert_eq!(class(23), ExitClass::AuthenticationFailed);
        assert_eq!(class(131), ExitClass::ClosedByServer);
        assert_eq!(class(132), ExitClass::SecurityNegotiationFailed);
        assert_eq!(class(5), ExitClass::Unclassified(5));
        let killed = ExitOutcome { code: None, signal: Some(9) };
        assert_eq!(ExitClass::from_exit(&killed), ExitClass::Abnormal);
    }

    #[test]
    fn test_backoff_policy() {
        let p = policy();
        assert_eq!(p.backoff(1, ExitClass::CleanDisconnect), Duration::from_secs(5));
        assert_eq!(p.backoff(1, ExitClass::ConnectionFailed), Duration::from_secs(10));
        assert_eq!(p.backoff(3, ExitClass::AuthenticationFailed), Duration::from_secs(30));
        assert_eq!(p.backoff(2, ExitClass::Unclassified(99)), Duration::from_secs(10));
        assert!(p.backoff(1, ExitClass::AuthenticationFailed) > p.backoff(1, ExitClass::ConnectionFailed));
    }

    #[test]
    fn test_client_args_from_parameters() {
        let params = BootParameterSet::parse(
            "rdserver=rds.local rdpuser=alice rdppass=pw usb=yes clipboard=no multimon=yes",
        );
        let args = client_args(&params, &params.credentials);
        for expected in [
            "/v:rds.local", "/u:alice", "/p:pw", "/f", "/sound:sys:alsa", "/microphone:sys:alsa",
            "/usb:auto", "-clipboard", "+compression", "/multimon",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {}", expected);
        }
        assert!(!args.iter().any(|a| a == "/printer"));
        assert!(!args.iter().any(|a| a.starts_with("/drive")));
        assert!(redacted(&args).iter().any(|a| a == "/p:***"));
    }

    #[test]
    fn test_fixed_resolution_still_fullscreen() {
        let params = BootParameterSet::parse("resolution=1280x1024");
        let args = client_args(&params, &params.credentials);
        assert!(args.iter().any(|a| a == "/f"));
        assert!(args.iter().any(|a| a == "/size:1280x1024"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_auth_failures_then_reboot() {
        let client = ScriptedClient::new(&[23]);
        let seen = client.seen_args.clone();
        let (tx, _rx) = watch::channel(SessionStatus::Disconnected);
        let mut supervisor = SessionSupervisor::new(client, policy(), 10, tx);
        let params = BootParameterSet::parse("rdserver=rds.local rdpuser=alice");

        let started = tokio::time::Instant::now();
        let failure = supervisor.run(&params).await;

        assert_eq!(failure, BootFailure::Session { attempts: 10 });
        assert!(failure.requires_reboot());
        assert_eq!(seen.lock().len(), 10);
        let history = supervisor.history();
        assert_eq!(history.len(), 10);
        for (i, attempt) in history.iter().enumerate() {
            assert_eq!(attempt.index, i as u32 + 1);
            assert_eq!(attempt.exit, ExitClass::AuthenticationFailed);
            assert_eq!(attempt.backoff, Duration::from_secs(30));
        }
        assert_eq!(started.elapsed(), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_disconnects_count_toward_budget() {
        let client = ScriptedClient::new(&[0]);
        let (tx, _rx) = watch::channel(SessionStatus::Disconnected);
        let mut supervisor = SessionSupervisor::new(client, policy(), 3, tx);
        let failure = supervisor.run(&BootParameterSet::default()).await;
        assert_eq!(failure, BootFailure::Session { attempts: 3 });
        assert!(supervisor
            .history()
            .iter()
            .all(|a| a.exit == ExitClass::CleanDisconnect && a.backoff == Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_exchanged_once_and_overrides_cmdline() {
        let client = ScriptedClient::new(&[0]);
        let seen = client.seen_args.clone();
        let exchange = Arc::new(FakeExchange {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let (tx, _rx) = watch::channel(SessionStatus::Disconnected);
        let mut supervisor = SessionSupervisor::new(client, policy(), 3, tx)
            .with_credential_source(exchange.clone());
        let params = BootParameterSet::parse("rdserver=old.local rdpuser=alice rdpdomain=CORP boottoken=abc123");

        supervisor.run(&params).await;

        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
        for args in seen.lock().iter() {
            assert!(args.contains(&"/v:rds.corp".to_string()));
            assert!(args.contains(&"/u:delivered".to_string()));
            assert!(args.contains(&"/d:CORP".to_string()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_exchange_falls_back_then_retries() {
        let client = ScriptedClient::new(&[11]);
        let seen = client.seen_args.clone();
        let exchange = Arc::new(FakeExchange {
            calls: AtomicUsize::new(0),
            fail_first: 1,
        });
        let (tx, _rx) = watch::channel(SessionStatus::Disconnected);
        let mut supervisor = SessionSupervisor::new(client, policy(), 3, tx)
            .with_credential_source(exchange.clone());
        let params = BootParameterSet::parse("rdserver=old.local boottoken=abc123");

        supervisor.run(&params).await;

        assert_eq!(exchange.calls.load(Ordering::SeqCst), 2);
        let seen = seen.lock();
        assert!(seen[0].contains(&"/v:old.local".to_string()));
        assert!(seen[1].contains(&"/v:rds.corp".to_string()));
        assert!(seen[2].contains(&"/v:rds.corp".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_published_per_attempt() {
        let client = ScriptedClient::new(&[0]);
        let (tx, mut rx) = watch::channel(SessionStatus::Disconnected);
        let mut supervisor = SessionSupervisor::new(client, policy(), 1, tx);
        supervisor.run(&BootParameterSet::default()).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), SessionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_only_after_client_settles() {
        let client = ScriptedClient::new(&[0]).staying_up(Duration::from_secs(60));
        let (tx, rx) = watch::channel(SessionStatus::Disconnected);
        let mut supervisor =
            SessionSupervisor::new(client, policy(), 1, tx).with_settle(Duration::from_secs(5));
        let params = BootParameterSet::default();
        let run = supervisor.run(&params);
        tokio::pin!(run);

        tokio::select! {
            _ = &mut run => panic!("session ended early"),
            _ = tokio::time::sleep(Duration::from_secs(4)) => {}
        }
        assert_eq!(*rx.borrow(), SessionStatus::Disconnected);
        tokio::select! {
            _ = &mut run => panic!("session ended early"),
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        }
        assert_eq!(*rx.borrow(), SessionStatus::Connected);

        run.await;
        assert_eq!(*rx.borrow(), SessionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connection_never_reports_connected() {
        let client = ScriptedClient::new(&[131]).staying_up(Duration::from_secs(1));
        let (tx, mut rx) = watch::channel(SessionStatus::Disconnected);
        let mut supervisor =
            SessionSupervisor::new(client, policy(), 3, tx).with_settle(Duration::from_secs(5));
        let mut seen = Vec::new();
        let params = BootParameterSet::default();
        let run = supervisor.run(&params);
        tokio::pin!(run);
        loop {
            tokio::select! {
                _ = &mut run => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    seen.push(*rx.borrow_and_update());
                }
            }
        }
        assert!(!seen.contains(&SessionStatus::Connected), "{:?}", seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_delivered_fields_keep_cmdline_values() {
        let client = ScriptedClient::new(&[0]);
        let seen = client.seen_args.clone();
        let delivered: Credentials =
            serde_json::from_str(r#"{"rdp_server":"rds","rdp_domain":"","rdp_username":"bob","rdp_password":""}"#)
                .unwrap();
        let (tx, _rx) = watch::channel(SessionStatus::Disconnected);
        let mut supervisor = SessionSupervisor::new(client, policy(), 1, tx)
            .with_credential_source(Arc::new(FixedExchange(delivered)));
        let params = BootParameterSet::parse("rdpdomain=CORP boottoken=abc123");

        supervisor.run(&params).await;

        let seen = seen.lock();
        let args = &seen[0];
        assert!(args.contains(&"/v:rds".to_string()));
        assert!(args.contains(&"/d:CORP".to_string()));
        assert!(args.contains(&"/u:bob".to_string()));
        assert!(!args.iter().any(|a| a == "/d:" || a.starts_with("/p:")), "{:?}", args);
    }

    #[test]
    fn test_client_args_skip_blank_fields() {
        let params = BootParameterSet::default();
        let credentials = Credentials {
            server: Some("rds".into()),
            domain: Some(String::new()),
            username: Some(" ".into()),
            password: Some(String::new()),
        };
        let args = client_args(&params, &credentials);
        assert_eq!(args[0], "/v:rds");
        assert!(!args.iter().any(|a| a.starts_with("/d:") || a.starts_with("/u:") || a.starts_with("/p:")));
    }

    #[tokio::test]
    async fn test_freerdp_launcher_captures_exit() {
        let mut launcher = FreeRdpLauncher {
            xfreerdp: PathBuf::from("/bin/sh"),
            display: ":0".to_string(),
        };
        let exit = launcher
            .run(&["-c".to_string(), "echo connecting; exit 131".to_string()])
            .await
            .unwrap();
        assert_eq!(exit.exit.code, Some(131));
        assert!(exit.output.contains("connecting"));
        assert_eq!(ExitClass::from_exit(&exit.exit), ExitClass::ClosedByServer);
    }
}
