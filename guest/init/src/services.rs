//! Optional network services: the remote diagnostic shell and the print
//! server. Both are started after the network phase and are best-effort.

use std::path::PathBuf;

use thinboot_core::config::ToolPaths;
use thinboot_core::error::{Result, ThinbootError};

use crate::process::CommandRunner;

pub const HOST_KEY_PATH: &str = "/etc/dropbear/dropbear_rsa_host_key";

/// Printer device exposed by the print server.
pub const PRINTER_DEVICE: &str = "/dev/usb/lp0";

pub struct Services<'a> {
    runner: &'a dyn CommandRunner,
    tools: &'a ToolPaths,
    host_key: PathBuf,
}

impl<'a> Services<'a> {
    pub fn new(runner: &'a dyn CommandRunner, tools: &'a ToolPaths) -> Self {
        Self {
            runner,
            tools,
            host_key: PathBuf::from(HOST_KEY_PATH),
        }
    }

    pub fn with_host_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_key = path.into();
        self
    }

    /// Generate a host key if needed, set the root password and start the
    /// SSH daemon in the background.
    pub async fn start_remote_shell(&self, password: &str) -> Result<()> {
        if !self.host_key.exists() {
            if let Some(parent) = self.host_key.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let key = self.host_key.display().to_string();
            self.check(
                "dropbearkey",
                self.runner
                    .run(&self.tools.dropbearkey, &args(&["-t", "rsa", "-f", &key]))
                    .await?,
            )?;
        }

        self.check(
            "chpasswd",
            self.runner
                .run_with_input(&self.tools.chpasswd, &[], &format!("root:{}\n", password))
                .await?,
        )?;

        let key = self.host_key.display().to_string();
        self.check(
            "dropbear",
            self.runner
                .run(&self.tools.dropbear, &args(&["-r", &key, "-p", "22", "-E"]))
                .await?,
        )?;
        tracing::info!(port = 22, "Remote diagnostic shell started");
        Ok(())
    }

    /// Start the raw TCP print server on port 9100.
    pub async fn start_print_server(&self) -> Result<()> {
        self.check(
            "p910nd",
            self.runner
                .run(&self.tools.p910nd, &args(&["-b", "-f", PRINTER_DEVICE, "0"]))
                .await?,
        )?;
        tracing::info!(port = 9100, device = PRINTER_DEVICE, "Print server started");
        Ok(())
    }

    fn check(&self, what: &str, output: crate::process::CommandOutput) -> Result<()> {
        if output.success() {
            return Ok(());
        }
        Err(ThinbootError::ProcessError {
            program: what.to_string(),
            message: format!("{}: {}", output.exit, output.combined()),
        })
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
