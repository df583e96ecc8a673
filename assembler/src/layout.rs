//! Image filesystem layout constants.
//!
//! Defines the directory structure inside a terminal image.

/// Path of the boot supervisor inside the image. The kernel runs it as PID 1.
pub const IMAGE_INIT_PATH: &str = "/init";

/// Lease hook busybox udhcpc runs when no `-s` script is given.
pub const UDHCPC_SCRIPT_PATH: &str = "/usr/share/udhcpc/default.script";

/// Directory holding thinboot's own configuration inside the image.
pub const IMAGE_CONFIG_DIR: &str = "/etc/thinboot";

/// Image filesystem layout.
#[derive(Debug, Clone)]
pub struct ImageLayout {
    /// Supervisor configuration directory.
    pub config_dir: &'static str,

    /// Display server configuration directory.
    pub xorg_dir: &'static str,

    /// Diagnostic shell host keys.
    pub dropbear_dir: &'static str,

    /// Temporary directory.
    pub tmp_dir: &'static str,

    /// Run directory for runtime files.
    pub run_dir: &'static str,

    /// Log directory (display server log, session output).
    pub log_dir: &'static str,
}

impl Default for ImageLayout {
    fn default() -> Self {
        Self {
            config_dir: IMAGE_CONFIG_DIR,
            xorg_dir: "/etc/X11",
            dropbear_dir: "/etc/dropbear",
            tmp_dir: "/tmp",
            run_dir: "/run",
            log_dir: "/var/log",
        }
    }
}

impl ImageLayout {
    /// Get the standard image layout.
    pub fn standard() -> Self {
        Self::default()
    }

    /// Get all directories that need to be created in the image.
    pub fn required_dirs(&self, kernel_version: &str) -> Vec<String> {
        let mut dirs: Vec<String> = [
            self.config_dir,
            self.xorg_dir,
            self.dropbear_dir,
            self.tmp_dir,
            self.run_dir,
            self.log_dir,
            "/dev",
            "/dev/pts",
            "/dev/input",
            "/dev/dri",
            "/dev/snd",
            "/proc",
            "/sys",
            "/root",
            "/var/run",
            "/var/spool",
            "/lib/firmware",
        ]
        .iter()
        .map(|d| d.to_string())
        .collect();
        dirs.push(format!("/lib/modules/{}", kernel_version));
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_layout_defaults() {
        let layout = ImageLayout::default();
        assert_eq!(layout.config_dir, "/etc/thinboot");
        assert_eq!(layout.xorg_dir, "/etc/X11");
        assert_eq!(layout.dropbear_dir, "/etc/dropbear");
        assert_eq!(layout.log_dir, "/var/log");
    }

    #[test]
    fn test_required_dirs_contains_layout_and_system_dirs() {
        let layout = ImageLayout::standard();
        let dirs = layout.required_dirs("6.1.0-18-amd64");

        for dir in [layout.config_dir, layout.xorg_dir, layout.tmp_dir, "/dev", "/proc", "/sys"] {
            assert!(dirs.iter().any(|d| d == dir), "{}", dir);
        }
        assert!(dirs.iter().any(|d| d == "/lib/modules/6.1.0-18-amd64"));
    }

    #[test]
    fn test_manifest_lives_in_config_dir() {
        let manifest = format!("/{}", thinboot_core::config::VARIANT_MANIFEST_PATH);
        assert!(manifest.starts_with(IMAGE_CONFIG_DIR));
    }
}
