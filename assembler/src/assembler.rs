//! Variant image assembler.
//!
//! Builds one image artifact per hardware variant:
//!
//! 1. base tree with hardware-agnostic components
//! 2. variant overlay (kernel modules, firmware, drivers, DRI modules)
//! 3. shared-library closure of every binary and driver in the image
//! 4. component validation; critical issues abort the variant
//! 5. removal of wireless components
//! 6. packaging with hash and size sidecars
//!
//! Every step is idempotent on the staging tree and retried on transient
//! errors. Variants never share a staging tree, so they build in parallel.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thinboot_core::artifact::ImageArtifact;
use thinboot_core::component::{Component, ComponentKind};
use thinboot_core::config::{AssemblyConfig, VARIANT_MANIFEST_PATH};
use thinboot_core::error::{Result, ThinbootError};
use thinboot_core::variant::{HardwareVariant, VariantManifest};
use tokio::task::JoinSet;

use crate::kmod::{ModuleIndex, MODULE_INDEX_FILES};
use crate::packager::Packager;
use crate::resolver::{merge_closures, DependencyResolver, DynamicInspector};
use crate::strip::strip_paths;
use crate::tree::{ImageTree, InstallOutcome};
use crate::validator::{ComponentValidator, ValidationReport};

/// Multi-call binary the applet links point at, relative to the image root.
const BUSYBOX_PATH: &str = "bin/busybox";

/// A successfully published variant.
#[derive(Debug, Clone)]
pub struct AssemblyOutcome {
    pub artifact: ImageArtifact,
    pub report: ValidationReport,
    /// Shared libraries that could not be found on the build host.
    pub unresolved: BTreeSet<String>,
    /// Paths removed by the strip step.
    pub stripped: Vec<PathBuf>,
}

/// Per-variant result of a parallel build.
#[derive(Debug)]
pub struct VariantResult {
    pub variant: String,
    pub outcome: Result<AssemblyOutcome>,
}

/// Assembles variant images from a build host root.
#[derive(Debug, Clone)]
pub struct VariantAssembler {
    config: AssemblyConfig,
    kernel_version: String,
    resolver: DependencyResolver,
    packager: Packager,
}

impl VariantAssembler {
    pub fn new(config: AssemblyConfig) -> Result<Self> {
        let kernel_version = match &config.kernel_version {
            Some(version) => version.clone(),
            None => detect_kernel_version()?,
        };
        let resolver = DependencyResolver::new(config.host_root.clone(), config.search_paths());
        let packager = Packager::new(config.codec, config.min_artifact_bytes()?);
        Ok(Self {
            config,
            kernel_version,
            resolver,
            packager,
        })
    }

    /// Replace the dynamic-linking inspector used for closures.
    pub fn with_inspector(mut self, inspector: Arc<dyn DynamicInspector>) -> Self {
        self.resolver = self.resolver.with_inspector(inspector);
        self
    }

    pub fn kernel_version(&self) -> &str {
        &self.kernel_version
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    fn modules_dir(&self) -> PathBuf {
        Path::new("lib/modules").join(&self.kernel_version)
    }

    /// Build and publish the artifact for one variant.
    pub fn assemble(&self, variant: &HardwareVariant) -> Result<AssemblyOutcome> {
        tracing::info!(variant = %variant.name, kernel = %self.kernel_version, "Assembling variant image");

        let (_scratch, staging) = self.staging_dir(&variant.name)?;
        let tree = ImageTree::new(&staging, &self.config.host_root);

        self.step("base", variant, || self.install_base(&tree))?;
        self.step("overlay", variant, || self.install_variant(&tree, variant))?;
        let unresolved = self.step("closure", variant, || self.install_closure(&tree))?;
        let report = self.step("validate", variant, || {
            ComponentValidator::new(tree.root(), &self.kernel_version)
                .with_runtime(&self.config.tools)
                .validate(variant)
                .into_result()
        })?;
        let stripped = self.step("strip", variant, || {
            strip_paths(tree.root(), &self.config.strip_patterns)
        })?;
        self.step("manifest", variant, || self.write_manifest(&tree, variant))?;
        let artifact = self.step("package", variant, || {
            self.packager
                .package(&tree, &self.config.output_dir, &variant.name)
        })?;

        Ok(AssemblyOutcome {
            artifact,
            report,
            unresolved,
            stripped,
        })
    }

    /// Build many variants concurrently. A failure in one variant does not
    /// affect the others. Results follow the input order.
    pub async fn assemble_all(self: Arc<Self>, variants: Vec<HardwareVariant>) -> Vec<VariantResult> {
        let mut tasks = JoinSet::new();
        for (index, variant) in variants.iter().cloned().enumerate() {
            let assembler = Arc::clone(&self);
            tasks.spawn_blocking(move || {
                let outcome = assembler.assemble(&variant);
                if let Err(e) = &outcome {
                    tracing::error!(variant = %variant.name, error = %e, "Variant build failed");
                }
                (index, VariantResult {
                    variant: variant.name,
                    outcome,
                })
            });
        }

        let mut results: Vec<Option<VariantResult>> = (0..variants.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::error!(error = %e, "Variant build task panicked"),
            }
        }

        results
            .into_iter()
            .zip(variants)
            .map(|(result, variant)| {
                result.unwrap_or_else(|| VariantResult {
                    variant: variant.name,
                    outcome: Err(ThinbootError::Other("build task aborted".to_string())),
                })
            })
            .collect()
    }

    /// Run a step, retrying transient failures.
    fn step<T>(
        &self,
        name: &str,
        variant: &HardwareVariant,
        mut run: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let attempts = self.config.step_retries + 1;
        let mut attempt = 1;
        loop {
            match run() {
                Ok(value) => {
                    tracing::debug!(variant = %variant.name, step = name, attempt, "Step complete");
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        variant = %variant.name,
                        step = name,
                        attempt,
                        error = %e,
                        "Step failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fresh staging directory for a variant. The guard keeps a temporary
    /// directory alive for the duration of the build.
    fn staging_dir(&self, variant: &str) -> Result<(Option<tempfile::TempDir>, PathBuf)> {
        match &self.config.work_dir {
            Some(work_dir) => {
                let staging = work_dir.join(variant);
                if staging.exists() {
                    std::fs::remove_dir_all(&staging)?;
                }
                std::fs::create_dir_all(&staging)?;
                Ok((None, staging))
            }
            None => {
                let scratch = tempfile::Builder::new()
                    .prefix(&format!("thinboot-{}-", variant))
                    .tempdir()?;
                let staging = scratch.path().join("image");
                Ok((Some(scratch), staging))
            }
        }
    }

    fn install_base(&self, tree: &ImageTree) -> Result<()> {
        tree.prepare(&self.kernel_version)?;

        if let Some(base) = &self.config.base_tree {
            let copied = if base.is_dir() {
                tree.overlay_dir(base)?
            } else {
                tree.overlay_archive(base)?
            };
            tracing::debug!(base = %base.display(), copied, "Copied base tree");
        }

        for binary in &self.config.base_binaries {
            let component = Component::new(
                self.config.host_path(binary),
                binary.clone(),
                kind_of(binary),
            );
            tree.install_component(&component)?;
        }

        let linked = tree.install_applets(Path::new(BUSYBOX_PATH), &self.config.busybox_applets)?;
        tracing::debug!(linked, "Linked busybox applets");

        for dir in &self.config.base_dirs {
            match tree.install_dir(dir) {
                Ok(count) => tracing::debug!(dir = %dir.display(), count, "Installed base directory"),
                Err(ThinbootError::ComponentNotFound(_)) => {
                    tracing::warn!(dir = %dir.display(), "Base directory absent on build host")
                }
                Err(e) => return Err(e),
            }
        }

        let modules = self.modules_dir();
        for name in MODULE_INDEX_FILES {
            let file = modules.join(name);
            if self.config.host_path(&file).exists() {
                tree.install(&file)?;
            }
        }
        for dir in &self.config.base_module_dirs {
            match tree.install_dir(&modules.join(dir)) {
                Ok(count) => tracing::debug!(dir = %dir.display(), count, "Installed base modules"),
                Err(ThinbootError::ComponentNotFound(_)) => {
                    tracing::warn!(dir = %dir.display(), "Base module directory absent on build host")
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(init) = &self.config.supervisor_binary {
            tree.install_init(init)?;
        }
        Ok(())
    }

    /// Copy the variant's own components. Missing sources are left for the
    /// validator to judge.
    fn install_variant(&self, tree: &ImageTree, variant: &HardwareVariant) -> Result<()> {
        let modules = self.modules_dir();
        let index = ModuleIndex::load(&self.config.host_path(&modules))?;
        for module in index.closure(&variant.kernel_modules) {
            install_optional(tree, &modules.join(&module), ComponentKind::KernelModule)?;
        }

        for firmware in &variant.firmware {
            match tree.install_dir(&firmware.dir) {
                Ok(count) => tracing::debug!(dir = %firmware.dir.display(), count, "Installed firmware"),
                Err(ThinbootError::ComponentNotFound(_)) => {
                    tracing::warn!(dir = %firmware.dir.display(), "Firmware absent on build host")
                }
                Err(e) => return Err(e),
            }
        }

        for driver in &variant.drivers {
            install_optional(tree, &driver.path, ComponentKind::UserDriver)?;
            if let Some(dri) = &driver.dri {
                install_optional(tree, dri, ComponentKind::UserDriver)?;
            }
        }
        for dri in &variant.dri_modules {
            install_optional(tree, dri, ComponentKind::UserDriver)?;
        }
        Ok(())
    }

    /// Install the library closure of every linkable object in the image.
    fn install_closure(&self, tree: &ImageTree) -> Result<BTreeSet<String>> {
        let roots: Vec<PathBuf> = tree
            .entries()?
            .into_iter()
            .filter(|relative| is_closure_root(relative))
            .map(|relative| tree.root().join(relative))
            .filter(|path| path.is_file())
            .collect();

        let closures = self.resolver.resolve_all(&roots, tree.root())?;
        // Roots are staged copies; libraries resolve against the host.
        let (libraries, unresolved) = merge_closures(&closures, &self.config.host_root);

        let mut added = 0;
        for library in &libraries {
            if tree.install(library)? == InstallOutcome::Installed {
                added += 1;
            }
        }
        tracing::info!(
            roots = roots.len(),
            libraries = libraries.len(),
            added,
            unresolved = unresolved.len(),
            "Installed shared library closure"
        );
        Ok(unresolved)
    }

    fn write_manifest(&self, tree: &ImageTree, variant: &HardwareVariant) -> Result<()> {
        let manifest = VariantManifest {
            variant: variant.clone(),
            kernel_version: self.kernel_version.clone(),
        };
        tree.write_file(VARIANT_MANIFEST_PATH, &serde_json::to_string_pretty(&manifest)?)
    }
}

fn install_optional(tree: &ImageTree, relative: &Path, kind: ComponentKind) -> Result<()> {
    match tree.install(relative) {
        Ok(_) => Ok(()),
        Err(ThinbootError::ComponentNotFound(_)) => {
            tracing::warn!(path = %relative.display(), %kind, "Component absent on build host");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn kind_of(path: &Path) -> ComponentKind {
    let text = path.to_string_lossy();
    if text.contains("/xorg/modules/") || text.contains("/dri/") {
        ComponentKind::UserDriver
    } else if text.contains(".so") {
        ComponentKind::SharedLibrary
    } else {
        ComponentKind::Executable
    }
}

/// Objects whose shared-library requirements must be satisfied.
fn is_closure_root(relative: &Path) -> bool {
    const EXEC_DIRS: [&str; 7] = [
        "bin",
        "sbin",
        "usr/bin",
        "usr/sbin",
        "usr/libexec",
        "usr/lib/xorg",
        "lib/systemd",
    ];
    let text = relative.to_string_lossy();
    text == "init"
        || EXEC_DIRS.iter().any(|d| relative.starts_with(d))
        || (text.contains("/dri/") && text.ends_with(".so"))
}

/// Release of the running kernel.
fn detect_kernel_version() -> Result<String> {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            ThinbootError::ConfigError(format!(
                "kernel_version not set and running kernel unknown: {}",
                e
            ))
        })
}
