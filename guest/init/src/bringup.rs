//! Device bring-up: pseudo-filesystems, device nodes, kernel modules and the
//! device manager.
//!
//! Runs once, synchronously, before anything else touches hardware.

use std::fs;
use std::path::{Path, PathBuf};

use thinboot_core::config::ToolPaths;
use thinboot_core::error::{Result, ThinbootError};
use thinboot_core::params::BootParameterSet;
use thinboot_core::variant::{
    builtin_catalog, find_variant, variant_for_driver, HardwareVariant, VariantManifest,
};

use crate::process::CommandRunner;

/// Kernel command line.
pub const CMDLINE_PATH: &str = "/proc/cmdline";

/// Wired network drivers, loaded first.
pub const NETWORK_MODULES: &[&str] = &[
    "e1000e", "e1000", "igb", "igc", "r8169", "tg3", "bnx2", "atl1c", "alx", "8139too",
    "virtio_net",
];

/// USB host controllers, loaded before the device-class drivers.
pub const USB_HOST_MODULES: &[&str] = &["xhci_pci", "ehci_pci", "ohci_pci", "uhci_hcd"];

pub const USB_DEVICE_MODULES: &[&str] = &["usbhid", "usb_storage", "usblp"];

pub const INPUT_MODULES: &[&str] = &["evdev", "hid_generic", "psmouse", "atkbd"];

pub const SOUND_MODULES: &[&str] = &["snd_hda_intel", "snd_usb_audio", "snd_pcm_oss"];

/// A named group of kernel modules loaded together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleGroup {
    pub name: &'static str,
    pub modules: Vec<String>,
}

fn group(name: &'static str, modules: &[&str]) -> ModuleGroup {
    ModuleGroup {
        name,
        modules: modules.iter().map(|m| m.to_string()).collect(),
    }
}

/// Kernel modules in load order: wired network, GPU (from the variant),
/// USB host then device, input, sound.
pub fn module_load_order(variant: &HardwareVariant) -> Vec<ModuleGroup> {
    vec![
        group("network", NETWORK_MODULES),
        ModuleGroup {
            name: "gpu",
            modules: variant.gpu_modules.clone(),
        },
        group("usb-host", USB_HOST_MODULES),
        group("usb-device", USB_DEVICE_MODULES),
        group("input", INPUT_MODULES),
        group("sound", SOUND_MODULES),
    ]
}

/// A character device node to create under `/dev`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    /// Path relative to the device root, e.g. `input/event0`.
    pub path: PathBuf,
    pub major: u64,
    pub minor: u64,
}

/// sysfs classes whose devices get proactive nodes, with their `/dev`
/// subdirectory.
const DEVICE_CLASSES: &[(&str, &str)] = &[("input", "input"), ("drm", "dri"), ("sound", "snd")];

/// Device nodes announced by sysfs for input, GPU, and sound devices.
///
/// Each `<sys>/class/<class>/<name>/dev` file holds `major:minor`.
pub fn plan_device_nodes(sys_root: &Path) -> Result<Vec<DeviceNode>> {
    let mut nodes = Vec::new();
    for (class, dev_dir) in DEVICE_CLASSES {
        let class_dir = sys_root.join("class").join(class);
        let entries = match fs::read_dir(&class_dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(content) = fs::read_to_string(entry.path().join("dev")) else {
                continue;
            };
            match parse_dev_numbers(&content) {
                Some((major, minor)) => nodes.push(DeviceNode {
                    path: Path::new(dev_dir).join(&name),
                    major,
                    minor,
                }),
                None => tracing::warn!(class, device = %name, "Malformed dev numbers in sysfs"),
            }
        }
    }
    nodes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(nodes)
}

fn parse_dev_numbers(content: &str) -> Option<(u64, u64)> {
    let (major, minor) = content.trim().split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Create the planned nodes that the device manager has not created yet.
/// Returns how many were created.
#[cfg(target_os = "linux")]
pub fn create_device_nodes(dev_root: &Path, nodes: &[DeviceNode]) -> Result<usize> {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    let mut created = 0;
    for node in nodes {
        let path = dev_root.join(&node.path);
        if path.exists() {
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        mknod(
            &path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o660),
            makedev(node.major, node.minor),
        )
        .map_err(|e| {
            ThinbootError::BringUpError(format!("mknod {} failed: {}", path.display(), e))
        })?;
        created += 1;
    }
    Ok(created)
}

#[cfg(not(target_os = "linux"))]
pub fn create_device_nodes(_dev_root: &Path, _nodes: &[DeviceNode]) -> Result<usize> {
    tracing::info!("Skipping device node creation on non-Linux platform (development mode)");
    Ok(0)
}

/// Whether the kernel exposes a GPU device node.
pub fn gpu_present(dev_root: &Path) -> bool {
    fs::read_dir(dev_root.join("dri"))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.file_name().to_string_lossy().starts_with("card"))
        })
        .unwrap_or(false)
}

/// Mount the pseudo-filesystems the image needs. Already-mounted targets
/// are left alone.
#[cfg(target_os = "linux")]
pub fn mount_pseudo_filesystems() -> Result<()> {
    use nix::errno::Errno;
    use nix::mount::{mount, MsFlags};

    let nosuid = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    let mounts: [(&str, &str, &str, MsFlags, Option<&str>); 6] = [
        ("proc", "/proc", "proc", nosuid, None),
        ("sysfs", "/sys", "sysfs", nosuid, None),
        ("devtmpfs", "/dev", "devtmpfs", MsFlags::MS_NOSUID, Some("mode=0755")),
        ("devpts", "/dev/pts", "devpts", MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC, Some("gid=5,mode=620")),
        ("tmpfs", "/run", "tmpfs", MsFlags::MS_NOSUID | MsFlags::MS_NODEV, Some("mode=0755")),
        ("tmpfs", "/tmp", "tmpfs", MsFlags::MS_NOSUID | MsFlags::MS_NODEV, Some("mode=1777")),
    ];

    for (source, target, fstype, flags, data) in mounts {
        fs::create_dir_all(target)?;
        match mount(Some(source), target, Some(fstype), flags, data) {
            Ok(()) => tracing::debug!(target, fstype, "Mounted"),
            Err(Errno::EBUSY) => tracing::debug!(target, "Already mounted"),
            Err(e) => {
                return Err(ThinbootError::BringUpError(format!(
                    "mount {} on {} failed: {}",
                    fstype, target, e
                )))
            }
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn mount_pseudo_filesystems() -> Result<()> {
    tracing::info!("Skipping mounts on non-Linux platform (development mode)");
    Ok(())
}

/// Read and parse the kernel command line.
pub fn read_boot_parameters(path: &Path) -> Result<BootParameterSet> {
    let cmdline = fs::read_to_string(path).map_err(|e| {
        ThinbootError::BringUpError(format!("cannot read {}: {}", path.display(), e))
    })?;
    Ok(BootParameterSet::parse(&cmdline))
}

/// Read the image's variant manifest. Images without one run as the
/// software-only variant.
pub fn load_variant_manifest(path: &Path, video_driver: Option<&str>) -> VariantManifest {
    let kernel_version = fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    let manifest = fs::read_to_string(path)
        .map_err(ThinbootError::from)
        .and_then(|content| {
            serde_json::from_str::<VariantManifest>(&content).map_err(ThinbootError::from)
        });
    let err = match manifest {
        Ok(manifest) => return manifest,
        Err(e) => e,
    };

    // The server's videodriver setting still names the hardware class.
    let catalog = builtin_catalog();
    if let Some(variant) = video_driver.and_then(|d| find_variant(&catalog, variant_for_driver(d))) {
        tracing::warn!(
            path = %path.display(),
            error = %err,
            variant = %variant.name,
            "No usable variant manifest, using the configured video driver"
        );
        return VariantManifest {
            variant: variant.clone(),
            kernel_version,
        };
    }

    tracing::warn!(
        path = %path.display(),
        error = %err,
        "No usable variant manifest, running software-only"
    );
    VariantManifest::software_only(kernel_version)
}

/// Summary of the bring-up phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BringUpReport {
    pub loaded: Vec<String>,
    pub failed: Vec<String>,
    pub nodes_created: usize,
}

/// Loads modules and starts the device manager.
pub struct DeviceBringUp<'a> {
    runner: &'a dyn CommandRunner,
    tools: &'a ToolPaths,
    sys_root: PathBuf,
    dev_root: PathBuf,
}

impl<'a> DeviceBringUp<'a> {
    pub fn new(runner: &'a dyn CommandRunner, tools: &'a ToolPaths) -> Self {
        Self {
            runner,
            tools,
            sys_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
        }
    }

    /// Use different sysfs and device roots.
    pub fn with_roots(mut self, sys_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        self.sys_root = sys_root.into();
        self.dev_root = dev_root.into();
        self
    }

    /// Load modules in order, then start the device manager and create any
    /// nodes it missed. Individual module failures are not fatal.
    pub async fn run(&self, variant: &HardwareVariant) -> Result<BringUpReport> {
        let mut report = BringUpReport::default();

        for group in module_load_order(variant) {
            if group.modules.is_empty() {
                tracing::info!(group = group.name, "No modules to load");
                continue;
            }
            for module in &group.modules {
                if self.load_module(module).await {
                    report.loaded.push(module.clone());
                } else {
                    report.failed.push(module.clone());
                }
            }
        }
        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Kernel modules loaded"
        );

        self.start_device_manager().await;

        let nodes = plan_device_nodes(&self.sys_root)?;
        report.nodes_created = create_device_nodes(&self.dev_root, &nodes)?;
        if report.nodes_created > 0 {
            tracing::info!(created = report.nodes_created, "Created missing device nodes");
        }
        Ok(report)
    }

    async fn load_module(&self, module: &str) -> bool {
        match self.runner.run(&self.tools.modprobe, &[module.to_string()]).await {
            Ok(output) if output.success() => {
                tracing::debug!(module, "Loaded kernel module");
                true
            }
            Ok(output) => {
                tracing::debug!(module, output = %output.combined(), "Kernel module not loaded");
                false
            }
            Err(e) => {
                tracing::warn!(module, error = %e, "modprobe failed");
                false
            }
        }
    }

    /// Start udevd, trigger coldplug events, and wait for the queue to settle.
    async fn start_device_manager(&self) {
        let steps: [(&Path, Vec<String>); 3] = [
            (self.tools.udevd.as_path(), vec!["--daemon".to_string()]),
            (
                self.tools.udevadm.as_path(),
                vec!["trigger".to_string(), "--action=add".to_string()],
            ),
            (
                self.tools.udevadm.as_path(),
                vec!["settle".to_string(), "--timeout=10".to_string()],
            ),
        ];
        for (program, args) in steps {
            match self.runner.run(program, &args).await {
                Ok(output) if output.success() => {}
                Ok(output) => tracing::warn!(
                    program = %program.display(),
                    ?args,
                    exit = %output.exit,
                    "Device manager step failed"
                ),
                Err(e) => tracing::warn!(program = %program.display(), error = %e, "Device manager unavailable"),
            }
        }
    }
}
