//! `thinboot variants` command.

use std::path::PathBuf;

use clap::Args;
use thinboot_core::variant::artifact_file_name;
use thinboot_core::HardwareVariant;

use crate::output;

#[derive(Args)]
pub struct VariantsArgs {
    /// Assembler configuration file (YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Output the catalog as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: VariantsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(args.config.or_else(super::default_config_path).as_deref())?;
    let catalog = config.catalog();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
        return Ok(());
    }

    let mut table = output::new_table(&["VARIANT", "ARTIFACT", "DISPLAY DRIVERS", "GPU MODULES", "FIRMWARE"]);
    for variant in &catalog {
        table.add_row(variant_row(variant));
    }
    println!("{table}");
    Ok(())
}

fn variant_row(variant: &HardwareVariant) -> Vec<String> {
    let firmware: Vec<String> = variant
        .firmware
        .iter()
        .map(|f| format!("{} (>= {} files)", f.dir.display(), f.min_files))
        .collect();
    vec![
        variant.name.clone(),
        artifact_file_name(&variant.name),
        output::join_or_dash(&variant.display_drivers),
        output::join_or_dash(&variant.gpu_modules),
        output::join_or_dash(&firmware),
    ]
}
