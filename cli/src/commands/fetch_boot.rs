//! `thinboot fetch-boot` command.

use std::time::Duration;

use clap::Args;
use thinboot_core::normalize_mac;
use thinboot_guest_init::telemetry::HttpServerApi;

#[derive(Args)]
pub struct FetchBootArgs {
    /// Server address or URL
    #[arg(long)]
    pub server: String,

    /// Hardware address of the terminal
    #[arg(long)]
    pub mac: String,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,
}

pub async fn execute(args: FetchBootArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mac = normalize_mac(&args.mac).ok_or_else(|| format!("invalid hardware address: {}", args.mac))?;
    let api = HttpServerApi::new(&args.server, Duration::from_secs(args.timeout))?;
    tracing::info!(base = api.base(), %mac, "Fetching boot instructions");
    let script = api.boot_script(&mac).await?;
    print!("{script}");
    if !script.ends_with('\n') {
        println!();
    }
    Ok(())
}
