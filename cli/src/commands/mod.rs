//! CLI command definitions and dispatch.

mod build;
mod closure;
mod fetch_boot;
mod variants;
mod verify;
mod version;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use thinboot_core::config::AssemblyConfig;

/// thinboot - build and inspect diskless thin-client images.
#[derive(Parser)]
#[command(name = "thinboot", version, about)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build variant images in parallel
    Build(build::BuildArgs),
    /// List the hardware variant catalog
    Variants(variants::VariantsArgs),
    /// Check an artifact against its hash and size sidecars
    Verify(verify::VerifyArgs),
    /// Print the shared-library closure of a binary
    Closure(closure::ClosureArgs),
    /// Fetch the boot instructions the server hands to a terminal
    FetchBoot(fetch_boot::FetchBootArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Load the assembly configuration, or the defaults when no file is given.
pub(crate) fn load_config(path: Option<&Path>) -> Result<AssemblyConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(AssemblyConfig::load(path)?),
        None => Ok(AssemblyConfig::default()),
    }
}

/// Environment variable naming the assembler configuration file.
pub const CONFIG_ENV: &str = "THINBOOT_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/thinboot/assembler.yaml";

/// Configuration file used when `--config` is absent: `THINBOOT_CONFIG`,
/// then the system-wide file when present.
pub(crate) fn default_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(path));
    }
    let path = PathBuf::from(SYSTEM_CONFIG_PATH);
    path.exists().then_some(path)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args).await,
        Command::Variants(args) => variants::execute(args).await,
        Command::Verify(args) => verify::execute(args).await,
        Command::Closure(args) => closure::execute(args).await,
        Command::FetchBoot(args) => fetch_boot::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
