//! Component validation of an assembled image tree.
//!
//! Firmware packages that were only partially installed on the build host
//! still create their directories, so presence alone proves nothing: each
//! firmware tree is checked against a minimum file count and byte size, and
//! zero-byte files are treated as corruption.
//!
//! The runtime check covers what every image needs to boot: `/init`, the
//! DHCP lease hook, and the programs the supervisor runs. Symlinks are
//! followed inside the image root, since busybox applets are links.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thinboot_core::config::ToolPaths;
use thinboot_core::error::{Result, ThinbootError};
use thinboot_core::variant::{FirmwareRequirement, HardwareVariant};

use crate::layout::{IMAGE_INIT_PATH, UDHCPC_SCRIPT_PATH};
use crate::tree::{normalize, strip_root};

/// Symlink hops followed when resolving a path inside the image.
const MAX_LINK_HOPS: usize = 16;

/// How a validation issue affects publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IssueSeverity {
    /// The variant must not be published.
    Critical,
    /// Degraded but bootable.
    Advisory,
}

impl std::fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::Advisory => write!(f, "advisory"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    /// Offending path, relative to the image root.
    pub path: PathBuf,
    pub message: String,
}

/// Outcome of validating one variant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub variant: String,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn critical_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Critical)
            .count()
    }

    pub fn advisory_count(&self) -> usize {
        self.issues.len() - self.critical_count()
    }

    pub fn is_publishable(&self) -> bool {
        self.critical_count() == 0
    }

    /// Log every issue and fail when any is critical.
    pub fn into_result(self) -> Result<Self> {
        for issue in &self.issues {
            match issue.severity {
                IssueSeverity::Critical => tracing::error!(
                    variant = %self.variant,
                    path = %issue.path.display(),
                    "{}",
                    issue.message
                ),
                IssueSeverity::Advisory => tracing::warn!(
                    variant = %self.variant,
                    path = %issue.path.display(),
                    "{}",
                    issue.message
                ),
            }
        }
        if self.is_publishable() {
            Ok(self)
        } else {
            Err(ThinbootError::ValidationFailed {
                variant: self.variant.clone(),
                critical: self.critical_count(),
            })
        }
    }

    fn push(&mut self, severity: IssueSeverity, path: &Path, message: String) {
        self.issues.push(ValidationIssue {
            severity,
            path: path.to_path_buf(),
            message,
        });
    }
}

/// Validates a variant's required components inside an image tree.
pub struct ComponentValidator<'a> {
    tree: &'a Path,
    kernel_version: &'a str,
    runtime: Option<&'a ToolPaths>,
}

impl<'a> ComponentValidator<'a> {
    pub fn new(tree: &'a Path, kernel_version: &'a str) -> Self {
        Self {
            tree,
            kernel_version,
            runtime: None,
        }
    }

    /// Also check the boot entry point and the supervisor's tools.
    pub fn with_runtime(mut self, tools: &'a ToolPaths) -> Self {
        self.runtime = Some(tools);
        self
    }

    pub fn validate(&self, variant: &HardwareVariant) -> ValidationReport {
        let mut report = ValidationReport {
            variant: variant.name.clone(),
            issues: Vec::new(),
        };

        if let Some(tools) = self.runtime {
            self.check_runtime(tools, &mut report);
        }

        for firmware in &variant.firmware {
            self.check_firmware(firmware, &mut report);
        }

        for driver in &variant.drivers {
            let severity = if driver.legacy {
                IssueSeverity::Advisory
            } else {
                IssueSeverity::Critical
            };
            if !self.tree.join(&driver.path).exists() {
                report.push(
                    severity,
                    &driver.path,
                    format!("display driver '{}' missing", driver.name),
                );
            }
            if let Some(dri) = &driver.dri {
                if !self.tree.join(dri).exists() {
                    report.push(
                        severity,
                        dri,
                        format!("acceleration module for driver '{}' missing", driver.name),
                    );
                }
            }
        }

        let modules_root = Path::new("lib/modules").join(self.kernel_version);
        for module in &variant.kernel_modules {
            if !module_present(&self.tree.join(&modules_root), module) {
                report.push(
                    IssueSeverity::Critical,
                    &modules_root.join(module),
                    "kernel module missing".to_string(),
                );
            }
        }

        for dri in &variant.dri_modules {
            if !self.tree.join(dri).exists() {
                report.push(
                    IssueSeverity::Advisory,
                    dri,
                    "acceleration module missing".to_string(),
                );
            }
        }

        tracing::debug!(
            variant = %variant.name,
            critical = report.critical_count(),
            advisory = report.advisory_count(),
            "Validation finished"
        );
        report
    }

    fn check_runtime(&self, tools: &ToolPaths, report: &mut ValidationReport) {
        let mut required = vec![
            ("boot supervisor", Path::new(IMAGE_INIT_PATH), IssueSeverity::Critical),
            ("DHCP lease hook", Path::new(UDHCPC_SCRIPT_PATH), IssueSeverity::Critical),
        ];
        for (name, path, essential) in tools.entries() {
            let severity = if essential {
                IssueSeverity::Critical
            } else {
                IssueSeverity::Advisory
            };
            required.push((name, path, severity));
        }

        for (name, path, severity) in required {
            let relative = strip_root(path);
            match resolve_in_tree(self.tree, &relative) {
                Some(resolved) if is_executable(&resolved) => {}
                Some(_) => report.push(severity, &relative, format!("{} is not executable", name)),
                None => report.push(severity, &relative, format!("{} missing", name)),
            }
        }
    }

    fn check_firmware(&self, firmware: &FirmwareRequirement, report: &mut ValidationReport) {
        let dir = self.tree.join(&firmware.dir);
        if !dir.is_dir() {
            report.push(
                IssueSeverity::Critical,
                &firmware.dir,
                "firmware directory missing".to_string(),
            );
            return;
        }

        let mut stats = FirmwareStats::default();
        if let Err(e) = stats.scan(&dir) {
            report.push(
                IssueSeverity::Critical,
                &firmware.dir,
                format!("firmware directory unreadable: {}", e),
            );
            return;
        }

        for empty in &stats.empty_files {
            let relative = empty.strip_prefix(self.tree).unwrap_or(empty);
            report.push(
                IssueSeverity::Critical,
                relative,
                "zero-byte firmware file (corrupt package)".to_string(),
            );
        }
        if stats.files < firmware.min_files {
            report.push(
                IssueSeverity::Critical,
                &firmware.dir,
                format!(
                    "firmware incomplete: {} file(s), expected at least {}",
                    stats.files, firmware.min_files
                ),
            );
        }
        if stats.bytes < firmware.min_bytes {
            report.push(
                IssueSeverity::Critical,
                &firmware.dir,
                format!(
                    "firmware incomplete: {} byte(s), expected at least {}",
                    stats.bytes, firmware.min_bytes
                ),
            );
        }
    }
}

#[derive(Default)]
struct FirmwareStats {
    files: usize,
    bytes: u64,
    empty_files: Vec<PathBuf>,
}

impl FirmwareStats {
    /// Count regular files; symlinks are aliases and not counted.
    fn scan(&mut self, dir: &Path) -> std::io::Result<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let meta = std::fs::symlink_metadata(entry.path())?;
            if meta.is_dir() {
                self.scan(&entry.path())?;
            } else if meta.is_file() {
                self.files += 1;
                self.bytes += meta.len();
                if meta.len() == 0 {
                    self.empty_files.push(entry.path());
                }
            }
        }
        Ok(())
    }
}

/// Follow symlinks within `root` (absolute targets are re-rooted) to a
/// regular file.
fn resolve_in_tree(root: &Path, relative: &Path) -> Option<PathBuf> {
    let mut current = normalize(relative);
    for _ in 0..MAX_LINK_HOPS {
        let path = root.join(&current);
        let meta = std::fs::symlink_metadata(&path).ok()?;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&path).ok()?;
            current = if target.is_absolute() {
                normalize(&target)
            } else {
                normalize(&current.parent().unwrap_or(Path::new("")).join(target))
            };
        } else if meta.is_file() {
            return Some(path);
        } else {
            return None;
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Whether a module exists, allowing for a different compression suffix.
fn module_present(modules_root: &Path, module: &Path) -> bool {
    if modules_root.join(module).exists() {
        return true;
    }
    let name = module.to_string_lossy();
    let base = [".ko.xz", ".ko.zst", ".ko.gz", ".ko"]
        .iter()
        .find_map(|s| name.strip_suffix(s))
        .unwrap_or(&name)
        .to_string();
    [".ko", ".ko.xz", ".ko.zst", ".ko.gz"]
        .iter()
        .any(|s| modules_root.join(format!("{}{}", base, s)).exists())
}
