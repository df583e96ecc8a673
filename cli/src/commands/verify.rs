//! `thinboot verify` command.

use std::path::PathBuf;

use clap::Args;
use thinboot_assembler::{verify_artifact, Verification};

use crate::output;

#[derive(Args)]
pub struct VerifyArgs {
    /// Path of the packaged artifact (e.g. initrd-intel.img)
    pub artifact: PathBuf,
}

pub async fn execute(args: VerifyArgs) -> Result<(), Box<dyn std::error::Error>> {
    let path = args.artifact.clone();
    let verification = tokio::task::spawn_blocking(move || verify_artifact(&path)).await??;

    for line in describe(&verification) {
        println!("{line}");
    }
    if !verification.is_valid() {
        return Err(format!("{} does not match its sidecar files", args.artifact.display()).into());
    }
    Ok(())
}

fn describe(v: &Verification) -> Vec<String> {
    let declared_hash = v.declared_sha256.as_deref().unwrap_or("missing");
    let declared_size = v
        .declared_size
        .map(|s| s.to_string())
        .unwrap_or_else(|| "missing".to_string());
    vec![
        format!("artifact: {}", v.path.display()),
        format!("codec:    {}", v.codec),
        format!("entries:  {}", v.entries),
        format!(
            "sha256:   {} (declared {}) {}",
            v.sha256,
            declared_hash,
            mark(v.declared_sha256.as_deref() == Some(v.sha256.as_str()))
        ),
        format!(
            "size:     {} [{}] (declared {}) {}",
            v.size,
            output::format_bytes(v.size),
            declared_size,
            mark(v.declared_size == Some(v.size))
        ),
    ]
}

fn mark(ok: bool) -> &'static str {
    if ok {
        "OK"
    } else {
        "MISMATCH"
    }
}
