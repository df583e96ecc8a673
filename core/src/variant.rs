//! Hardware variant definitions.
//!
//! A variant is a named class of graphics hardware. It declares which
//! display drivers to try, which GPU kernel modules to load, and which
//! driver/firmware files must be present in its image. Paths are relative
//! to the build host root and land at the same relative path inside the
//! image.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the software-only variant that carries no GPU modules.
pub const SOFTWARE_VARIANT: &str = "minimal";

/// Display drivers used when no GPU device node exists at boot.
pub const SOFTWARE_DISPLAY_DRIVERS: [&str; 2] = ["fbdev", "vesa"];

/// A user-space display driver shipped by a variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverRequirement {
    /// Display driver name as used in the display server configuration.
    pub name: String,
    /// Driver module path, relative to the host root.
    pub path: PathBuf,
    /// GPU-acceleration (DRI) counterpart, relative to the host root.
    #[serde(default)]
    pub dri: Option<PathBuf>,
    /// Legacy fallback drivers only produce advisory issues when missing.
    #[serde(default)]
    pub legacy: bool,
}

/// A firmware directory with minimum completeness expectations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareRequirement {
    /// Firmware directory, relative to the host root (e.g. `lib/firmware/i915`).
    pub dir: PathBuf,
    /// Minimum number of regular files expected in the directory tree.
    pub min_files: usize,
    /// Minimum aggregate byte size of those files.
    pub min_bytes: u64,
}

/// A named class of graphics hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareVariant {
    /// Variant identifier (e.g. `intel`).
    pub name: String,
    /// Display drivers in fallback order: primary, legacy, minimal.
    pub display_drivers: Vec<String>,
    /// GPU kernel module names in load order. Empty for software-only.
    #[serde(default)]
    pub gpu_modules: Vec<String>,
    /// Kernel module files, relative to `lib/modules/<kernel version>`.
    #[serde(default)]
    pub kernel_modules: Vec<PathBuf>,
    /// User-space display drivers.
    #[serde(default)]
    pub drivers: Vec<DriverRequirement>,
    /// Firmware trees the variant claims.
    #[serde(default)]
    pub firmware: Vec<FirmwareRequirement>,
    /// Additional DRI acceleration modules, relative to the host root.
    #[serde(default)]
    pub dri_modules: Vec<PathBuf>,
}

impl HardwareVariant {
    /// Whether this variant runs without any GPU kernel module.
    pub fn is_software_only(&self) -> bool {
        self.gpu_modules.is_empty()
    }

    /// Every file path this variant owns inside the image, relative to the
    /// image root. Kernel modules are placed under `lib/modules/<kver>`.
    pub fn owned_paths(&self, kernel_version: &str) -> Vec<PathBuf> {
        let modules_root = Path::new("lib/modules").join(kernel_version);
        let mut paths: Vec<PathBuf> = self
            .kernel_modules
            .iter()
            .map(|m| modules_root.join(m))
            .collect();
        for driver in &self.drivers {
            paths.push(driver.path.clone());
            if let Some(dri) = &driver.dri {
                paths.push(dri.clone());
            }
        }
        paths.extend(self.firmware.iter().map(|f| f.dir.clone()));
        paths.extend(self.dri_modules.iter().cloned());
        paths
    }
}

/// Identity of an image, written by the assembler and read by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantManifest {
    pub variant: HardwareVariant,
    /// Kernel version whose modules the image carries.
    pub kernel_version: String,
}

impl VariantManifest {
    /// Fallback identity when an image carries no manifest.
    pub fn software_only(kernel_version: impl Into<String>) -> Self {
        let variant = builtin_catalog()
            .into_iter()
            .find(|v| v.name == SOFTWARE_VARIANT)
            .unwrap_or_else(|| HardwareVariant {
                name: SOFTWARE_VARIANT.to_string(),
                display_drivers: SOFTWARE_DISPLAY_DRIVERS.iter().map(|d| d.to_string()).collect(),
                gpu_modules: vec![],
                kernel_modules: vec![],
                drivers: vec![],
                firmware: vec![],
                dri_modules: vec![],
            });
        Self {
            variant,
            kernel_version: kernel_version.into(),
        }
    }
}

/// File name of the packaged image for a variant.
pub fn artifact_file_name(variant: &str) -> String {
    format!("initrd-{}.img", variant)
}

/// Map a configured video driver to the variant whose image carries it.
///
/// Unknown drivers map to the software-only variant.
pub fn variant_for_driver(driver: &str) -> &'static str {
    match driver.trim().to_lowercase().as_str() {
        "intel" | "i915" => "intel",
        "amd" | "amdgpu" | "radeon" | "ati" => "amd",
        "nvidia" | "nouveau" => "nvidia",
        "vmware" | "vmwgfx" => "vmware",
        "modesetting" | "generic" => "generic",
        _ => SOFTWARE_VARIANT,
    }
}

fn driver(name: &str, path: String, dri: Option<String>, legacy: bool) -> DriverRequirement {
    DriverRequirement {
        name: name.to_string(),
        path: PathBuf::from(path),
        dri: dri.map(PathBuf::from),
        legacy,
    }
}

fn firmware(dir: &str, min_files: usize, min_bytes: u64) -> FirmwareRequirement {
    FirmwareRequirement {
        dir: PathBuf::from(dir),
        min_files,
        min_bytes,
    }
}

const XORG_DRIVERS: &str = "usr/lib/xorg/modules/drivers";
const DRI_DIR: &str = "usr/lib/x86_64-linux-gnu/dri";
const MIB: u64 = 1024 * 1024;

/// The built-in variant catalog, one entry per supported hardware class.
pub fn builtin_catalog() -> Vec<HardwareVariant> {
    let drv = |name: &str| format!("{}/{}_drv.so", XORG_DRIVERS, name);
    let dri = |name: &str| format!("{}/{}_dri.so", DRI_DIR, name);

    vec![
        HardwareVariant {
            name: "intel".to_string(),
            display_drivers: vec!["intel".into(), "modesetting".into(), "fbdev".into()],
            gpu_modules: vec!["i915".into()],
            kernel_modules: vec![PathBuf::from("kernel/drivers/gpu/drm/i915/i915.ko")],
            drivers: vec![
                driver("intel", drv("intel"), Some(dri("iris")), false),
                driver("modesetting", drv("modesetting"), None, true),
            ],
            firmware: vec![firmware("lib/firmware/i915", 20, 2 * MIB)],
            dri_modules: vec![PathBuf::from(dri("i965"))],
        },
        HardwareVariant {
            name: "amd".to_string(),
            display_drivers: vec!["amdgpu".into(), "radeon".into(), "fbdev".into()],
            gpu_modules: vec!["amdgpu".into(), "radeon".into()],
            kernel_modules: vec![
                PathBuf::from("kernel/drivers/gpu/drm/amd/amdgpu/amdgpu.ko"),
                PathBuf::from("kernel/drivers/gpu/drm/radeon/radeon.ko"),
            ],
            drivers: vec![
                driver("amdgpu", drv("amdgpu"), Some(dri("radeonsi")), false),
                driver("radeon", drv("radeon"), Some(dri("r600")), true),
            ],
            firmware: vec![
                firmware("lib/firmware/amdgpu", 100, 20 * MIB),
                firmware("lib/firmware/radeon", 50, 2 * MIB),
            ],
            dri_modules: vec![],
        },
        HardwareVariant {
            name: "nvidia".to_string(),
            display_drivers: vec!["nouveau".into(), "modesetting".into(), "fbdev".into()],
            gpu_modules: vec!["nouveau".into()],
            kernel_modules: vec![PathBuf::from("kernel/drivers/gpu/drm/nouveau/nouveau.ko")],
            drivers: vec![
                driver("nouveau", drv("nouveau"), Some(dri("nouveau")), false),
                driver("modesetting", drv("modesetting"), None, true),
            ],
            firmware: vec![firmware("lib/firmware/nvidia", 10, MIB)],
            dri_modules: vec![],
        },
        HardwareVariant {
            name: "vmware".to_string(),
            display_drivers: vec!["vmware".into(), "modesetting".into(), "fbdev".into()],
            gpu_modules: vec!["vmwgfx".into()],
            kernel_modules: vec![PathBuf::from("kernel/drivers/gpu/drm/vmwgfx/vmwgfx.ko")],
            drivers: vec![
                driver("vmware", drv("vmware"), Some(dri("vmwgfx")), false),
                driver("modesetting", drv("modesetting"), None, true),
            ],
            firmware: vec![],
            dri_modules: vec![],
        },
        HardwareVariant {
            name: "generic".to_string(),
            display_drivers: vec!["modesetting".into(), "vesa".into(), "fbdev".into()],
            gpu_modules: vec!["virtio_gpu".into(), "bochs".into()],
            kernel_modules: vec![
                PathBuf::from("kernel/drivers/gpu/drm/virtio/virtio-gpu.ko"),
                PathBuf::from("kernel/drivers/gpu/drm/tiny/bochs.ko"),
            ],
            drivers: vec![driver("modesetting", drv("modesetting"), None, false)],
            firmware: vec![],
            dri_modules: vec![PathBuf::from(dri("swrast"))],
        },
        HardwareVariant {
            name: SOFTWARE_VARIANT.to_string(),
            display_drivers: SOFTWARE_DISPLAY_DRIVERS.iter().map(|d| d.to_string()).collect(),
            gpu_modules: vec![],
            kernel_modules: vec![],
            drivers: vec![],
            firmware: vec![],
            dri_modules: vec![],
        },
    ]
}

/// Find a variant by name in a catalog.
pub fn find_variant<'a>(catalog: &'a [HardwareVariant], name: &str) -> Option<&'a HardwareVariant> {
    catalog.iter().find(|v| v.name == name)
}
