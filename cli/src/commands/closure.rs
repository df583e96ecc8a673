//! `thinboot closure` command.

use std::path::PathBuf;

use clap::Args;
use thinboot_assembler::{DependencyClosure, DependencyResolver};

#[derive(Args)]
pub struct ClosureArgs {
    /// Binary or shared object to resolve
    pub binary: PathBuf,

    /// Library search directory, can be repeated (default: the configured search paths)
    #[arg(long = "search-path")]
    pub search_path: Vec<PathBuf>,

    /// Assembler configuration file (YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

pub async fn execute(args: ClosureArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(args.config.or_else(super::default_config_path).as_deref())?;
    let search_paths = if args.search_path.is_empty() {
        config.search_paths()
    } else {
        args.search_path
    };
    let resolver = DependencyResolver::new(config.host_root.clone(), search_paths);

    let binary = args.binary;
    let closure = tokio::task::spawn_blocking(move || resolver.resolve(&binary)).await??;

    for line in render(&closure) {
        println!("{line}");
    }
    if !closure.is_complete() {
        return Err(format!("unresolved shared libraries: {}", closure.unresolved.len()).into());
    }
    Ok(())
}

fn render(closure: &DependencyClosure) -> Vec<String> {
    let mut lines = vec![format!("{}:", closure.root.display())];
    lines.extend(closure.libraries.iter().map(|lib| format!("  {}", lib.display())));
    lines.extend(
        closure
            .unresolved
            .iter()
            .map(|name| format!("  {} => not found", name)),
    );
    lines
}
