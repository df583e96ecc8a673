//! Removal of components terminals never use (wireless stacks and tools).

use std::path::{Path, PathBuf};

use thinboot_core::error::{Result, ThinbootError};

/// Delete every path in `root` matching one of `patterns` (relative glob
/// patterns). Returns the removed paths, relative to `root`, sorted.
pub fn strip_paths(root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let escaped_root = glob::Pattern::escape(&root.to_string_lossy());
    let mut removed = Vec::new();

    for pattern in patterns {
        let full = format!("{}/{}", escaped_root, pattern.trim_start_matches('/'));
        let matches = glob::glob(&full).map_err(|e| {
            ThinbootError::ConfigError(format!("Invalid strip pattern '{}': {}", pattern, e))
        })?;

        for entry in matches {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "Unreadable path while stripping");
                    continue;
                }
            };
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                // Already removed through an earlier, broader match
                Err(_) => continue,
            };
            if meta.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            tracing::debug!(path = %relative.display(), "Stripped");
            removed.push(relative);
        }
    }

    removed.sort();
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use thinboot_core::config::default_strip_patterns;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_strip_wireless_components() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(root, "lib/modules/6.1.0/kernel/net/wireless/cfg80211.ko");
        touch(root, "lib/modules/6.1.0/kernel/drivers/net/wireless/intel/iwlwifi/iwlwifi.ko");
        touch(root, "lib/modules/6.1.0/kernel/drivers/net/ethernet/intel/e1000e/e1000e.ko");
        touch(root, "lib/firmware/iwlwifi-8265-36.ucode");
        touch(root, "lib/firmware/i915/kbl_dmc_ver1_04.bin");
        touch(root, "usr/sbin/wpa_supplicant");

        let removed = strip_paths(root, &default_strip_patterns()).unwrap();
        assert_eq!(removed.len(), 4);
        assert!(!root.join("lib/modules/6.1.0/kernel/net/wireless").exists());
        assert!(!root.join("lib/firmware/iwlwifi-8265-36.ucode").exists());
        assert!(!root.join("usr/sbin/wpa_supplicant").exists());
        assert!(root
            .join("lib/modules/6.1.0/kernel/drivers/net/ethernet/intel/e1000e/e1000e.ko")
            .exists());
        assert!(root.join("lib/firmware/i915/kbl_dmc_ver1_04.bin").exists());
    }

    #[test]
    fn test_strip_nothing_matches() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "bin/busybox");
        let removed = strip_paths(tmp.path(), &default_strip_patterns()).unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn test_invalid_pattern() {
        let tmp = TempDir::new().unwrap();
        let err = strip_paths(tmp.path(), &["lib/[".to_string()]).unwrap_err();
        assert!(matches!(err, ThinbootError::ConfigError(_)));
    }
}
