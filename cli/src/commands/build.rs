//! `thinboot build` command - assemble variant images in parallel.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use thinboot_assembler::{VariantAssembler, VariantResult};
use thinboot_core::error::ThinbootError;
use thinboot_core::variant::find_variant;
use thinboot_core::HardwareVariant;

use crate::output;

#[derive(Args)]
pub struct BuildArgs {
    /// Assembler configuration file (YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Variant to build, can be repeated (default: every variant)
    #[arg(long)]
    pub variant: Vec<String>,

    /// Output directory for artifacts
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Compression codec: gzip, xz, bzip2 or none
    #[arg(long)]
    pub codec: Option<String>,
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = super::load_config(args.config.or_else(super::default_config_path).as_deref())?;
    if let Some(out) = args.out {
        config.output_dir = out;
    }
    if let Some(codec) = &args.codec {
        config.codec = codec.parse()?;
    }

    let selected = select_variants(&config.catalog(), &args.variant)?;
    let assembler = Arc::new(VariantAssembler::new(config)?);
    tracing::info!(
        variants = selected.len(),
        kernel = assembler.kernel_version(),
        "Building variant images"
    );

    let results = assembler.assemble_all(selected).await;

    let mut table = output::new_table(&["VARIANT", "STATUS", "ARTIFACT", "SIZE", "SHA256", "ISSUES", "UNRESOLVED"]);
    for result in &results {
        table.add_row(result_row(result));
    }
    println!("{table}");

    let failed: Vec<&str> = results
        .iter()
        .filter(|r| r.outcome.is_err())
        .map(|r| r.variant.as_str())
        .collect();
    for result in &results {
        if let Err(e) = &result.outcome {
            eprintln!("{}: {}", result.variant, e);
        }
    }
    if !failed.is_empty() {
        return Err(format!("{} of {} variant(s) failed: {}", failed.len(), results.len(), failed.join(", ")).into());
    }
    Ok(())
}

/// Variants named on the command line, or the whole catalog.
fn select_variants(catalog: &[HardwareVariant], names: &[String]) -> Result<Vec<HardwareVariant>, ThinbootError> {
    if names.is_empty() {
        return Ok(catalog.to_vec());
    }
    names
        .iter()
        .map(|name| {
            find_variant(catalog, name)
                .cloned()
                .ok_or_else(|| ThinbootError::UnknownVariant(name.clone()))
        })
        .collect()
}

fn result_row(result: &VariantResult) -> Vec<String> {
    match &result.outcome {
        Ok(outcome) => vec![
            result.variant.clone(),
            "published".to_string(),
            outcome
                .artifact
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            output::format_bytes(outcome.artifact.size),
            output::short_hash(&outcome.artifact.sha256).to_string(),
            format!(
                "{} critical, {} advisory",
                outcome.report.critical_count(),
                outcome.report.advisory_count()
            ),
            outcome.unresolved.len().to_string(),
        ],
        Err(e) => vec![
            result.variant.clone(),
            "failed".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            match e {
                ThinbootError::ValidationFailed { critical, .. } => format!("{} critical", critical),
                _ => "-".to_string(),
            },
            "-".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thinboot_core::variant::builtin_catalog;

    #[test]
    fn test_select_all_by_default() {
        let catalog = builtin_catalog();
        assert_eq!(select_variants(&catalog, &[]).unwrap().len(), catalog.len());
    }

    #[test]
    fn test_select_named_variants() {
        let catalog = builtin_catalog();
        let selected = select_variants(&catalog, &["amd".to_string(), "minimal".to_string()]).unwrap();
        let names: Vec<&str> = selected.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["amd", "minimal"]);
    }

    #[test]
    fn test_unknown_variant_rejected() {
        let err = select_variants(&builtin_catalog(), &["matrox".to_string()]).unwrap_err();
        assert!(matches!(err, ThinbootError::UnknownVariant(name) if name == "matrox"));
    }

    #[test]
    fn test_failed_row() {
        let result = VariantResult {
            variant: "intel".to_string(),
            outcome: Err(ThinbootError::ValidationFailed {
                variant: "intel".to_string(),
                critical: 2,
            }),
        };
        let row = result_row(&result);
        assert_eq!(row[1], "failed");
        assert_eq!(row[5], "2 critical");
    }
}
