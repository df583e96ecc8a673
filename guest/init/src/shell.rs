//! Emergency diagnostic shell.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use crate::process::{Supervised, SupervisedChild};

const RULE: &str = "==============================================================";

/// Console banner shown before the shell starts.
pub fn banner(reason: &str, remote_shell: bool, display_log: Option<&str>) -> String {
    let mut text = format!("\n{}\n THINBOOT EMERGENCY SHELL\n{}\n Reason: {}\n", RULE, RULE, reason);
    if let Some(log) = display_log {
        text.push_str(&format!(" Display server log: {}\n", log));
    }
    if remote_shell {
        text.push_str(" Remote access: ssh root@<this terminal> (port 22)\n");
    }
    text.push_str(" Type 'reboot -f' to restart the terminal.\n");
    text.push_str(RULE);
    text.push('\n');
    text
}

/// Interactive shell on the console, respawned whenever it exits.
pub struct EmergencyShell {
    shell: PathBuf,
    respawn_delay: Duration,
}

impl EmergencyShell {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            respawn_delay: Duration::from_secs(1),
        }
    }

    /// Print the banner and keep a shell on the console. Never returns.
    pub async fn run(&self, banner: &str) {
        loop {
            {
                let mut console = std::io::stderr().lock();
                let _ = console.write_all(banner.as_bytes());
                let _ = console.flush();
            }
            match SupervisedChild::spawn(&self.shell, &[], |command| {
                command
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }) {
                Ok(mut child) => match child.wait().await {
                    Ok(exit) => tracing::info!(%exit, "Emergency shell exited, respawning"),
                    Err(e) => tracing::warn!(error = %e, "Lost emergency shell"),
                },
                Err(e) => tracing::error!(error = %e, shell = %self.shell.display(), "Cannot start emergency shell"),
            }
            tokio::time::sleep(self.respawn_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_contents() {
        let text = banner("display server failed with every driver: tried intel, fbdev", true, Some("/var/log/Xorg.0.log"));
        assert!(text.contains("EMERGENCY SHELL"));
        assert!(text.contains("tried intel, fbdev"));
        assert!(text.contains("/var/log/Xorg.0.log"));
        assert!(text.contains("ssh root@"));

        let plain = banner("no network interface came up", false, None);
        assert!(!plain.contains("ssh"));
        assert!(!plain.contains("Display server log"));
    }

    #[tokio::test]
    async fn test_shell_respawns() {
        let shell = EmergencyShell {
            shell: PathBuf::from("/bin/true"),
            respawn_delay: Duration::from_millis(10),
        };
        // The loop never ends; it must still be running after several respawns.
        let result = tokio::time::timeout(Duration::from_millis(200), shell.run("")).await;
        assert!(result.is_err());
    }
}
