//! Configuration files for the assembler and the boot supervisor.

use crate::artifact::Codec;
use crate::error::{Result, ThinbootError};
use crate::variant::{builtin_catalog, HardwareVariant};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the supervisor configuration inside the image.
pub const SUPERVISOR_CONFIG_PATH: &str = "/etc/thinboot/supervisor.yaml";

/// Location of the variant manifest inside the image, relative to its root.
pub const VARIANT_MANIFEST_PATH: &str = "etc/thinboot/variant.json";

fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ThinbootError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
    })?;
    serde_yaml::from_str(&content).map_err(|e| {
        ThinbootError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// Build-host configuration for the variant image assembler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// Root of the build host filesystem that components are copied from.
    pub host_root: PathBuf,

    /// Kernel version whose modules go into the images. Detected from the
    /// running kernel when unset.
    pub kernel_version: Option<String>,

    /// Shared library search directories, relative to `host_root`.
    pub library_paths: Vec<PathBuf>,

    /// Prepared hardware-agnostic tree copied into every image first.
    pub base_tree: Option<PathBuf>,

    /// Executables and software display drivers every image carries,
    /// relative to `host_root`.
    pub base_binaries: Vec<PathBuf>,

    /// Data directories every image carries, relative to `host_root`.
    pub base_dirs: Vec<PathBuf>,

    /// Kernel module directories every image carries (network, USB, input,
    /// sound), relative to `lib/modules/<kernel version>`.
    pub base_module_dirs: Vec<PathBuf>,

    /// Boot supervisor binary installed as `/init`, a path on the build
    /// server (not under `host_root`). An image without `/init` fails
    /// validation.
    pub supervisor_binary: Option<PathBuf>,

    /// Busybox applet links created next to `bin/busybox`, relative to the
    /// image root. Paths already present in the image are left alone.
    pub busybox_applets: Vec<PathBuf>,

    /// Programs the supervisor drives on the terminal. Validation checks
    /// that each one is present and executable in the image.
    pub tools: ToolPaths,

    /// Directory the artifacts are published to.
    pub output_dir: PathBuf,

    /// Staging directory for image trees. A temporary directory when unset.
    pub work_dir: Option<PathBuf>,

    pub codec: Codec,

    /// Smallest acceptable compressed artifact (e.g. "32m").
    pub min_artifact_size: String,

    /// Glob patterns, relative to the image root, removed before packaging.
    pub strip_patterns: Vec<String>,

    /// Extra attempts for each assembly step.
    pub step_retries: u32,

    /// Hardware variants to build. The built-in catalog when unset.
    pub variants: Option<Vec<HardwareVariant>>,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            host_root: PathBuf::from("/"),
            kernel_version: None,
            library_paths: [
                "lib/x86_64-linux-gnu",
                "usr/lib/x86_64-linux-gnu",
                "lib64",
                "usr/lib64",
                "lib",
                "usr/lib",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            base_tree: None,
            base_binaries: [
                "bin/busybox",
                "usr/lib/xorg/Xorg",
                "usr/bin/xfreerdp",
                "usr/sbin/dropbear",
                "usr/bin/dropbearkey",
                "usr/sbin/p910nd",
                "lib/systemd/systemd-udevd",
                "bin/udevadm",
                "sbin/modprobe",
                "usr/lib/xorg/modules/drivers/fbdev_drv.so",
                "usr/lib/xorg/modules/drivers/vesa_drv.so",
                "usr/lib/xorg/modules/libfbdevhw.so",
                "usr/lib/xorg/modules/libshadow.so",
                "usr/lib/xorg/modules/input/libinput_drv.so",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            base_dirs: [
                "usr/share/X11/xkb",
                "usr/share/fonts/X11/misc",
                "etc/ssl/certs",
                "usr/share/alsa",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            base_module_dirs: [
                "kernel/drivers/net/ethernet",
                "kernel/drivers/usb",
                "kernel/drivers/hid",
                "kernel/drivers/input",
                "kernel/sound",
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            supervisor_binary: Some(PathBuf::from("/usr/lib/thinboot/thinboot-init")),
            busybox_applets: default_busybox_applets(),
            tools: ToolPaths::default(),
            output_dir: PathBuf::from("/srv/tftp/thinboot"),
            work_dir: None,
            codec: Codec::Gzip,
            min_artifact_size: "32m".to_string(),
            strip_patterns: default_strip_patterns(),
            step_retries: 2,
            variants: None,
        }
    }
}

/// Wireless stacks, drivers, firmware, and tools. Terminals are wired only.
pub fn default_strip_patterns() -> Vec<String> {
    [
        "lib/modules/*/kernel/net/wireless",
        "lib/modules/*/kernel/net/mac80211",
        "lib/modules/*/kernel/net/bluetooth",
        "lib/modules/*/kernel/drivers/net/wireless",
        "lib/modules/*/kernel/drivers/bluetooth",
        "lib/firmware/iwlwifi-*",
        "lib/firmware/ath*k",
        "lib/firmware/brcm",
        "lib/firmware/rtlwifi",
        "lib/firmware/rtw88",
        "lib/firmware/mediatek",
        "usr/sbin/wpa_supplicant",
        "sbin/iw",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Applets the boot scripts and the supervisor call through busybox.
pub fn default_busybox_applets() -> Vec<PathBuf> {
    let bin = [
        "sh", "ash", "cat", "cp", "dmesg", "echo", "false", "grep", "hostname", "kill", "ln", "ls",
        "mkdir", "mknod", "mount", "mv", "ps", "rm", "sed", "sleep", "true", "umount", "vi",
    ];
    let sbin = ["ip", "ifconfig", "route", "udhcpc", "reboot", "poweroff", "halt"];
    let usr_bin = ["free", "tail", "top", "wget"];
    let usr_sbin = ["ntpd", "rdate", "chpasswd"];

    [("bin", &bin[..]), ("sbin", &sbin[..]), ("usr/bin", &usr_bin[..]), ("usr/sbin", &usr_sbin[..])]
        .iter()
        .flat_map(|(dir, names)| names.iter().map(move |name| Path::new(dir).join(name)))
        .collect()
}

impl AssemblyConfig {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_yaml(path)?;
        config.min_artifact_bytes()?;
        Ok(config)
    }

    /// Minimum artifact size in bytes.
    pub fn min_artifact_bytes(&self) -> Result<u64> {
        parse_size(&self.min_artifact_size).map_err(|e| {
            ThinbootError::ConfigError(format!("min_artifact_size: {}", e))
        })
    }

    /// The configured variants, or the built-in catalog.
    pub fn catalog(&self) -> Vec<HardwareVariant> {
        self.variants.clone().unwrap_or_else(builtin_catalog)
    }

    /// Absolute host path for a path relative to `host_root`.
    pub fn host_path(&self, relative: &Path) -> PathBuf {
        self.host_root
            .join(relative.strip_prefix("/").unwrap_or(relative))
    }

    /// Absolute library search directories.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.library_paths
            .iter()
            .map(|p| self.host_path(p))
            .collect()
    }
}

/// Paths of the external programs the supervisor drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub xorg: PathBuf,
    pub xfreerdp: PathBuf,
    pub udhcpc: PathBuf,
    pub ntpd: PathBuf,
    pub rdate: PathBuf,
    pub dropbear: PathBuf,
    pub dropbearkey: PathBuf,
    pub chpasswd: PathBuf,
    pub udevd: PathBuf,
    pub udevadm: PathBuf,
    pub modprobe: PathBuf,
    pub p910nd: PathBuf,
    pub shell: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            xorg: PathBuf::from("/usr/lib/xorg/Xorg"),
            xfreerdp: PathBuf::from("/usr/bin/xfreerdp"),
            udhcpc: PathBuf::from("/sbin/udhcpc"),
            ntpd: PathBuf::from("/usr/sbin/ntpd"),
            rdate: PathBuf::from("/usr/sbin/rdate"),
            dropbear: PathBuf::from("/usr/sbin/dropbear"),
            dropbearkey: PathBuf::from("/usr/bin/dropbearkey"),
            chpasswd: PathBuf::from("/usr/sbin/chpasswd"),
            udevd: PathBuf::from("/lib/systemd/systemd-udevd"),
            udevadm: PathBuf::from("/bin/udevadm"),
            modprobe: PathBuf::from("/sbin/modprobe"),
            p910nd: PathBuf::from("/usr/sbin/p910nd"),
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl ToolPaths {
    /// Every tool as `(name, path, essential)`. A terminal cannot boot to a
    /// session without the essential ones; the rest back optional services.
    pub fn entries(&self) -> Vec<(&'static str, &Path, bool)> {
        vec![
            ("xorg", self.xorg.as_path(), true),
            ("xfreerdp", self.xfreerdp.as_path(), true),
            ("udhcpc", self.udhcpc.as_path(), true),
            ("ntpd", self.ntpd.as_path(), true),
            ("rdate", self.rdate.as_path(), true),
            ("chpasswd", self.chpasswd.as_path(), true),
            ("modprobe", self.modprobe.as_path(), true),
            ("shell", self.shell.as_path(), true),
            ("dropbear", self.dropbear.as_path(), false),
            ("dropbearkey", self.dropbearkey.as_path(), false),
            ("udevd", self.udevd.as_path(), false),
            ("udevadm", self.udevadm.as_path(), false),
            ("p910nd", self.p910nd.as_path(), false),
        ]
    }
}

/// Runtime configuration of the boot supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub heartbeat_interval_secs: u64,
    pub metrics_interval_secs: u64,
    pub log_flush_interval_secs: u64,
    pub failed_log_retry_secs: u64,
    /// Timeout applied to every server API call.
    pub http_timeout_secs: u64,
    /// Time a display server must stay alive to count as started.
    pub display_settle_secs: u64,
    /// Time the client must stay up before the session counts as connected.
    pub session_settle_secs: u64,
    /// Session attempts before the terminal reboots.
    pub session_retry_budget: u32,
    pub backoff_short_secs: u64,
    pub backoff_medium_secs: u64,
    pub backoff_long_secs: u64,
    /// Records kept locally while the server is unreachable.
    pub log_buffer_capacity: usize,
    /// Seconds to wait for a DHCP lease on one interface.
    pub dhcp_timeout_secs: u64,
    /// Deadline for one-shot helper commands (modprobe, ip, chpasswd, ...).
    pub tool_timeout_secs: u64,
    /// Deadline for each clock source before falling back to the next.
    pub clock_sync_timeout_secs: u64,
    pub xorg_config_path: PathBuf,
    pub xorg_log_path: PathBuf,
    pub display: String,
    pub variant_manifest: PathBuf,
    pub tools: ToolPaths,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 60,
            metrics_interval_secs: 60,
            log_flush_interval_secs: 5,
            failed_log_retry_secs: 60,
            http_timeout_secs: 5,
            display_settle_secs: 3,
            session_settle_secs: 5,
            session_retry_budget: 10,
            backoff_short_secs: 5,
            backoff_medium_secs: 10,
            backoff_long_secs: 30,
            log_buffer_capacity: 5000,
            dhcp_timeout_secs: 10,
            tool_timeout_secs: 30,
            clock_sync_timeout_secs: 15,
            xorg_config_path: PathBuf::from("/etc/X11/xorg.conf"),
            xorg_log_path: PathBuf::from("/var/log/Xorg.0.log"),
            display: ":0".to_string(),
            variant_manifest: Path::new("/").join(VARIANT_MANIFEST_PATH),
            tools: ToolPaths::default(),
        }
    }
}

impl SupervisorConfig {
    /// Load the configuration at `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        load_yaml(path)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_secs(self.log_flush_interval_secs)
    }

    pub fn failed_log_retry_interval(&self) -> Duration {
        Duration::from_secs(self.failed_log_retry_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn display_settle(&self) -> Duration {
        Duration::from_secs(self.display_settle_secs)
    }

    pub fn session_settle(&self) -> Duration {
        Duration::from_secs(self.session_settle_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn clock_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.clock_sync_timeout_secs)
    }
}

/// Byte count from `4096`, `512k`, `32m`, `1g` (optional trailing `b`, any case).
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let lower = s.trim().to_ascii_lowercase();
    let digits = lower.trim_end_matches('b');
    let split = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    let (number, suffix) = digits.split_at(split);

    let shift = match suffix {
        "" => 0,
        "k" => 10,
        "m" => 20,
        "g" => 30,
        _ => return Err(format!("unrecognized size: {}", s.trim())),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid size: {}", s.trim()))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size out of range: {}", s.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("32m").unwrap(), 32 * 1024 * 1024);
        assert_eq!(parse_size("32MB").unwrap(), 32 * 1024 * 1024);
        assert_eq!(parse_size(" 512k ").unwrap(), 512 * 1024);
        assert_eq!(parse_size("1g").unwrap(), 1 << 30);
        assert_eq!(parse_size("100b").unwrap(), 100);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("m").is_err());
        assert!(parse_size("10t").is_err());
    }

    #[test]
    fn test_assembly_config_defaults() {
        let config = AssemblyConfig::default();
        assert_eq!(config.host_root, PathBuf::from("/"));
        assert_eq!(config.codec, Codec::Gzip);
        assert_eq!(config.min_artifact_bytes().unwrap(), 32 * 1024 * 1024);
        assert_eq!(config.catalog().len(), 6);
        assert!(config
            .strip_patterns
            .iter()
            .any(|p| p.contains("net/wireless")));
        assert!(config.supervisor_binary.is_some());
    }

    #[test]
    fn test_default_applets_cover_essential_tools() {
        let config = AssemblyConfig::default();
        for (name, path, essential) in config.tools.entries() {
            if !essential || name == "xorg" || name == "xfreerdp" || name == "modprobe" {
                continue;
            }
            let relative = path.strip_prefix("/").unwrap();
            assert!(
                config.busybox_applets.iter().any(|a| a == relative),
                "{} has no applet link",
                name
            );
        }
    }

    #[test]
    fn test_assembly_config_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "host_root: /srv/buildroot\nkernel_version: 6.1.0-18-amd64\ncodec: xz\nmin_artifact_size: 1k\nvariants:\n  - name: custom\n    display_drivers: [fbdev]\n"
        )
        .unwrap();

        let config = AssemblyConfig::load(file.path()).unwrap();
        assert_eq!(config.host_root, PathBuf::from("/srv/buildroot"));
        assert_eq!(config.kernel_version.as_deref(), Some("6.1.0-18-amd64"));
        assert_eq!(config.codec, Codec::Xz);
        assert_eq!(config.min_artifact_bytes().unwrap(), 1024);
        assert_eq!(config.catalog().len(), 1);
        assert_eq!(config.step_retries, 2);
    }

    #[test]
    fn test_assembly_config_rejects_bad_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "min_artifact_size: lots").unwrap();
        let err = AssemblyConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ThinbootError::ConfigError(_)));
    }

    #[test]
    fn test_host_path_strips_leading_slash() {
        let config = AssemblyConfig {
            host_root: PathBuf::from("/srv/root"),
            ..Default::default()
        };
        assert_eq!(
            config.host_path(Path::new("/usr/bin/xfreerdp")),
            PathBuf::from("/srv/root/usr/bin/xfreerdp")
        );
        assert_eq!(
            config.host_path(Path::new("lib64")),
            PathBuf::from("/srv/root/lib64")
        );
    }

    #[test]
    fn test_supervisor_config_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.metrics_interval(), Duration::from_secs(60));
        assert_eq!(config.log_flush_interval(), Duration::from_secs(5));
        assert_eq!(config.failed_log_retry_interval(), Duration::from_secs(60));
        assert_eq!(config.http_timeout(), Duration::from_secs(5));
        assert_eq!(config.session_retry_budget, 10);
        assert_eq!(config.tool_timeout(), Duration::from_secs(30));
        assert_eq!(config.clock_sync_timeout(), Duration::from_secs(15));
        assert_eq!(
            config.variant_manifest,
            PathBuf::from("/etc/thinboot/variant.json")
        );
    }

    #[test]
    fn test_supervisor_config_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig::load_or_default(&dir.path().join("none.yaml")).unwrap();
        assert_eq!(config.display_settle_secs, 3);
    }

    #[test]
    fn test_supervisor_config_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "session_retry_budget: 3\ntools:\n  xfreerdp: /opt/freerdp/bin/xfreerdp\n"
        )
        .unwrap();
        let config = SupervisorConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.session_retry_budget, 3);
        assert_eq!(
            config.tools.xfreerdp,
            PathBuf::from("/opt/freerdp/bin/xfreerdp")
        );
        assert_eq!(config.tools.xorg, PathBuf::from("/usr/lib/xorg/Xorg"));
        assert_eq!(config.backoff_long_secs, 30);
    }
}
