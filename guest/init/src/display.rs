//! Display server supervision.
//!
//! Candidate drivers are tried in order. Each attempt writes a display
//! configuration naming the driver, launches the server, and waits a settle
//! interval: a server still running when the interval closes counts as
//! started. The state machine itself is a pure function of events.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thinboot_core::error::{BootFailure, Result};
use thinboot_core::params::{BootParameterSet, Resolution};
use thinboot_core::variant::{HardwareVariant, SOFTWARE_DISPLAY_DRIVERS};

use crate::process::{ExitOutcome, Supervised, SupervisedChild};

/// Display supervisor state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayState {
    NotStarted,
    /// Trying the candidate at `index`.
    TryingDriver { index: usize, driver: String },
    Running { driver: String },
    Failed,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEvent {
    Start,
    /// The server survived the settle interval.
    Alive,
    /// The server exited or could not be launched.
    Died,
}

impl DisplayState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DisplayState::Running { .. } | DisplayState::Failed)
    }
}

fn trying(candidates: &[String], index: usize) -> DisplayState {
    match candidates.get(index) {
        Some(driver) => DisplayState::TryingDriver {
            index,
            driver: driver.clone(),
        },
        None => DisplayState::Failed,
    }
}

/// Next state for `event`. Events that do not apply leave the state alone.
pub fn transition(state: &DisplayState, event: DisplayEvent, candidates: &[String]) -> DisplayState {
    match (state, event) {
        (DisplayState::NotStarted, DisplayEvent::Start) => trying(candidates, 0),
        (DisplayState::TryingDriver { driver, .. }, DisplayEvent::Alive) => DisplayState::Running {
            driver: driver.clone(),
        },
        (DisplayState::TryingDriver { index, .. }, DisplayEvent::Died) => trying(candidates, index + 1),
        (state, _) => state.clone(),
    }
}

/// Ordered driver candidates for this boot.
///
/// A forced driver is the only candidate. Without a GPU device node the list
/// is the software-only one. Otherwise the configured driver comes first,
/// then the variant's drivers, then the software fallbacks.
pub fn candidate_list(variant: &HardwareVariant, params: &BootParameterSet, gpu_present: bool) -> Vec<String> {
    if let Some(forced) = &params.forced_display_driver {
        return vec![forced.clone()];
    }

    let software = SOFTWARE_DISPLAY_DRIVERS.iter().map(|d| d.to_string());
    let ordered: Vec<String> = if gpu_present {
        params
            .video_driver
            .iter()
            .cloned()
            .chain(variant.display_drivers.iter().cloned())
            .chain(software)
            .collect()
    } else {
        software.collect()
    };

    let mut candidates: Vec<String> = Vec::with_capacity(ordered.len());
    for driver in ordered {
        if !candidates.contains(&driver) {
            candidates.push(driver);
        }
    }
    candidates
}

/// Display server configuration naming one driver.
pub fn render_config(driver: &str, resolution: &Resolution) -> String {
    let modes = match resolution {
        Resolution::Fullscreen => String::new(),
        Resolution::Fixed { width, height } => format!(
            "    SubSection \"Display\"\n        Modes \"{}x{}\"\n    EndSubSection\n",
            width, height
        ),
    };
    format!(
        "Section \"ServerFlags\"\n\
         \x20   Option \"AutoAddGPU\" \"false\"\n\
         \x20   Option \"BlankTime\" \"0\"\n\
         \x20   Option \"StandbyTime\" \"0\"\n\
         \x20   Option \"SuspendTime\" \"0\"\n\
         \x20   Option \"OffTime\" \"0\"\n\
         EndSection\n\n\
         Section \"Device\"\n\
         \x20   Identifier \"Card0\"\n\
         \x20   Driver \"{driver}\"\n\
         EndSection\n\n\
         Section \"Screen\"\n\
         \x20   Identifier \"Screen0\"\n\
         \x20   Device \"Card0\"\n\
         {modes}\
         EndSection\n"
    )
}

/// Starts the display server with a given driver.
#[async_trait]
pub trait DisplayLauncher: Send {
    async fn launch(&mut self, driver: &str) -> Result<Box<dyn Supervised>>;
}

/// Launches Xorg after rewriting its configuration file.
pub struct XorgLauncher {
    pub xorg: PathBuf,
    pub config_path: PathBuf,
    pub log_path: PathBuf,
    pub display: String,
    pub resolution: Resolution,
}

#[async_trait]
impl DisplayLauncher for XorgLauncher {
    async fn launch(&mut self, driver: &str) -> Result<Box<dyn Supervised>> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.config_path, render_config(driver, &self.resolution))?;

        let args = vec![
            self.display.clone(),
            "-config".to_string(),
            self.config_path.display().to_string(),
            "-logfile".to_string(),
            self.log_path.display().to_string(),
            "-nolisten".to_string(),
            "tcp".to_string(),
            "-noreset".to_string(),
            "vt1".to_string(),
        ];
        let child = SupervisedChild::spawn(&self.xorg, &args, |command| {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        })?;
        Ok(Box::new(child))
    }
}

/// Outcome of the display phase.
pub struct DisplayRun {
    pub state: DisplayState,
    /// Drivers attempted, in order.
    pub attempted: Vec<String>,
    /// The running server, kept alive for the rest of the boot.
    pub server: Option<Box<dyn Supervised>>,
}

impl std::fmt::Debug for DisplayRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayRun")
            .field("state", &self.state)
            .field("attempted", &self.attempted)
            .field("server", &self.server.is_some())
            .finish()
    }
}

impl DisplayRun {
    /// The running driver, or the fatal display failure.
    pub fn into_result(self) -> std::result::Result<(String, Box<dyn Supervised>), BootFailure> {
        match (self.state, self.server) {
            (DisplayState::Running { driver }, Some(server)) => Ok((driver, server)),
            _ => Err(BootFailure::DisplayStart(format!(
                "tried {}",
                if self.attempted.is_empty() {
                    "no drivers".to_string()
                } else {
                    self.attempted.join(", ")
                }
            ))),
        }
    }
}

/// Drives the candidate list through the state machine.
pub struct DisplaySupervisor<L> {
    launcher: L,
    settle: Duration,
}

impl<L: DisplayLauncher> DisplaySupervisor<L> {
    pub fn new(launcher: L, settle: Duration) -> Self {
        Self { launcher, settle }
    }

    pub async fn start(&mut self, candidates: &[String]) -> DisplayRun {
        let mut state = transition(&DisplayState::NotStarted, DisplayEvent::Start, candidates);
        let mut attempted = Vec::new();

        while let DisplayState::TryingDriver { index, driver } = &state {
            tracing::info!(driver = %driver, candidate = index + 1, total = candidates.len(), "Starting display server");
            attempted.push(driver.clone());

            let event = match self.launcher.launch(driver).await {
                Ok(mut server) => match server.exited_within(self.settle).await {
                    Ok(None) => {
                        tracing::info!(driver = %driver, "Display server running");
                        let next = transition(&state, DisplayEvent::Alive, candidates);
                        return DisplayRun {
                            state: next,
                            attempted,
                            server: Some(server),
                        };
                    }
                    Ok(Some(exit)) => {
                        log_death(driver, exit);
                        DisplayEvent::Died
                    }
                    Err(e) => {
                        tracing::warn!(driver = %driver, error = %e, "Lost track of display server");
                        let _ = server.terminate().await;
                        DisplayEvent::Died
                    }
                },
                Err(e) => {
                    tracing::warn!(driver = %driver, error = %e, "Display server failed to launch");
                    DisplayEvent::Died
                }
            };
            state = transition(&state, event, candidates);
        }

        tracing::error!(attempted = ?attempted, "Display server failed with every driver");
        DisplayRun {
            state,
            attempted,
            server: None,
        }
    }
}

fn log_death(driver: &str, exit: ExitOutcome) {
    tracing::warn!(driver, %exit, "Display server exited during settle interval");
}

/// Last `lines` lines of the display server log.
pub fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(content) = fs::read_to_string(path) else {
        return format!("(no display log at {})", path.display());
    };
    let mut tail: VecDeque<&str> = VecDeque::with_capacity(lines);
    for line in content.lines() {
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;
    use thinboot_core::variant::builtin_catalog;

    /// Server that either dies after `lifetime` or outlives every window.
    struct FakeServer {
        dies_after: Option<Duration>,
    }

    #[async_trait]
    impl Supervised for FakeServer {
        async fn exited_within(&mut self, window: Duration) -> Result<Option<ExitOutcome>> {
            match self.dies_after {
                Some(lifetime) if lifetime <= window => {
                    tokio::time::sleep(lifetime).await;
                    Ok(Some(ExitOutcome::code(1)))
                }
                _ => {
                    tokio::time::sleep(window).await;
                    Ok(None)
                }
            }
        }

        async fn wait(&mut self) -> Result<ExitOutcome> {
            std::future::pending::<Result<ExitOutcome>>().await
        }

        async fn terminate(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Launcher whose servers survive only for the listed drivers.
    #[derive(Clone, Default)]
    struct ScriptedLauncher {
        healthy: Vec<String>,
        launched: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl DisplayLauncher for ScriptedLauncher {
        async fn launch(&mut self, driver: &str) -> Result<Box<dyn Supervised>> {
            self.launched.lock().push(driver.to_string());
            let dies_after = (!self.healthy.iter().any(|d| d == driver)).then(|| Duration::from_millis(500));
            Ok(Box::new(FakeServer { dies_after }))
        }
    }

    fn variant(name: &str) -> HardwareVariant {
        builtin_catalog().into_iter().find(|v| v.name == name).unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_transition_function() {
        let candidates = names(&["intel", "modesetting"]);
        let s = transition(&DisplayState::NotStarted, DisplayEvent::Start, &candidates);
        assert_eq!(s, DisplayState::TryingDriver { index: 0, driver: "intel".into() });
        let s = transition(&s, DisplayEvent::Died, &candidates);
        assert_eq!(s, DisplayState::TryingDriver { index: 1, driver: "modesetting".into() });
        let running = transition(&s, DisplayEvent::Alive, &candidates);
        assert_eq!(running, DisplayState::Running { driver: "modesetting".into() });
        assert_eq!(transition(&s, DisplayEvent::Died, &candidates), DisplayState::Failed);
        assert_eq!(transition(&running, DisplayEvent::Died, &candidates), running);
        assert_eq!(
            transition(&DisplayState::NotStarted, DisplayEvent::Start, &[]),
            DisplayState::Failed
        );
    }

    #[test]
    fn test_candidate_list_from_variant() {
        let params = BootParameterSet::default();
        assert_eq!(
            candidate_list(&variant("intel"), &params, true),
            names(&["intel", "modesetting", "fbdev", "vesa"])
        );
    }

    #[test]
    fn test_candidate_list_configured_driver_first() {
        let params = BootParameterSet::parse("videodriver=modesetting");
        assert_eq!(
            candidate_list(&variant("intel"), &params, true),
            names(&["modesetting", "intel", "fbdev", "vesa"])
        );
    }

    #[test]
    fn test_candidate_list_without_gpu() {
        let params = BootParameterSet::default();
        assert_eq!(candidate_list(&variant("amd"), &params, false), names(&["fbdev", "vesa"]));
    }

    #[test]
    fn test_forced_driver_is_only_candidate() {
        let params = BootParameterSet::parse("xorg_driver=vesa");
        assert_eq!(candidate_list(&variant("nvidia"), &params, true), names(&["vesa"]));
        assert_eq!(candidate_list(&variant("nvidia"), &params, false), names(&["vesa"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_candidate_runs_after_two_failures() {
        let launcher = ScriptedLauncher {
            healthy: names(&["fbdev"]),
            ..Default::default()
        };
        let launched = launcher.launched.clone();
        let candidates = names(&["intel", "modesetting", "fbdev", "vesa"]);

        let run = DisplaySupervisor::new(launcher, Duration::from_secs(3))
            .start(&candidates)
            .await;

        assert_eq!(run.state, DisplayState::Running { driver: "fbdev".into() });
        assert_eq!(run.attempted, names(&["intel", "modesetting", "fbdev"]));
        assert_eq!(*launched.lock(), names(&["intel", "modesetting", "fbdev"]));
        let (driver, _server) = run.into_result().unwrap();
        assert_eq!(driver, "fbdev");
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_driver_single_attempt() {
        let launcher = ScriptedLauncher::default();
        let launched = launcher.launched.clone();
        let params = BootParameterSet::parse("xorg_driver=nouveau");
        let candidates = candidate_list(&variant("nvidia"), &params, true);

        let run = DisplaySupervisor::new(launcher, Duration::from_secs(3))
            .start(&candidates)
            .await;

        assert_eq!(run.state, DisplayState::Failed);
        assert_eq!(*launched.lock(), names(&["nouveau"]));
        let err = run.into_result().err().expect("expected display failure");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("nouveau"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_candidates_fail() {
        let launcher = ScriptedLauncher::default();
        let candidates = names(&["fbdev", "vesa"]);
        let run = DisplaySupervisor::new(launcher, Duration::from_secs(3))
            .start(&candidates)
            .await;
        assert_eq!(run.state, DisplayState::Failed);
        assert_eq!(run.attempted, candidates);
        assert!(run.server.is_none());
    }

    #[test]
    fn test_render_config() {
        let config = render_config("intel", &Resolution::Fullscreen);
        assert!(config.contains("    Driver \"intel\"\n"));
        assert!(!config.contains("Modes"));

        let fixed = render_config("fbdev", &Resolution::Fixed { width: 1920, height: 1080 });
        assert!(fixed.contains("Modes \"1920x1080\""));
    }

    #[tokio::test]
    async fn test_xorg_launcher_writes_config() {
        let tmp = TempDir::new().unwrap();
        let mut launcher = XorgLauncher {
            xorg: PathBuf::from("/bin/true"),
            config_path: tmp.path().join("X11/xorg.conf"),
            log_path: tmp.path().join("Xorg.0.log"),
            display: ":0".to_string(),
            resolution: Resolution::Fullscreen,
        };
        let mut server = launcher.launch("vesa").await.unwrap();
        let config = fs::read_to_string(tmp.path().join("X11/xorg.conf")).unwrap();
        assert!(config.contains("Driver \"vesa\""));
        // /bin/true exits at once: not a surviving server
        let exit = server.exited_within(Duration::from_secs(5)).await.unwrap();
        assert!(exit.is_some());
    }

    #[test]
    fn test_log_tail() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Xorg.0.log");
        let content: String = (1..=50).map(|i| format!("line {}\n", i)).collect();
        fs::write(&path, content).unwrap();
        let tail = log_tail(&path, 3);
        assert_eq!(tail, "line 48\nline 49\nline 50");
        assert!(log_tail(&tmp.path().join("missing"), 3).contains("no display log"));
    }
}
