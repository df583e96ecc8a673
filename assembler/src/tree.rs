//! Staged image tree.
//!
//! Copies components from the build host root into a staging directory at
//! the same relative path. Symlinks are preserved as symlinks and their
//! targets are installed as well, so a library reached through a soname
//! link (`libfoo.so.1 -> libfoo.so.1.2.3`) lands complete.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component as PathComponent, Path, PathBuf};

use thinboot_core::component::{Component, ComponentKind};
use thinboot_core::error::{Result, ThinbootError};

use crate::layout::{ImageLayout, IMAGE_INIT_PATH, UDHCPC_SCRIPT_PATH};
use crate::packager::{detect_codec, open_decoder};

/// Symlink chains longer than this are treated as broken.
const MAX_LINK_DEPTH: usize = 16;

/// Applies a DHCP lease: address, default route, and resolver.
const UDHCPC_SCRIPT: &str = r#"#!/bin/sh
[ -n "$1" ] || exit 1
RESOLV_CONF=/etc/resolv.conf

case "$1" in
    deconfig)
        ip -4 addr flush dev "$interface"
        ip link set "$interface" up
        ;;
    bound|renew)
        ip -4 addr flush dev "$interface"
        ip addr add "$ip/${mask:-24}" ${broadcast:+broadcast "$broadcast"} dev "$interface"
        if [ -n "$router" ]; then
            while ip route del default dev "$interface" 2>/dev/null; do :; done
            for gw in $router; do
                ip route add default via "$gw" dev "$interface"
            done
        fi
        : > "$RESOLV_CONF"
        [ -n "$domain" ] && echo "search $domain" >> "$RESOLV_CONF"
        for ns in $dns; do
            echo "nameserver $ns" >> "$RESOLV_CONF"
        done
        ;;
esac
exit 0
"#;

/// Result of installing one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    AlreadyPresent,
}

/// A staging directory being filled with image components.
pub struct ImageTree {
    /// Staging directory.
    root: PathBuf,

    /// Build host root components are copied from.
    host_root: PathBuf,

    layout: ImageLayout,
}

impl ImageTree {
    pub fn new(root: impl Into<PathBuf>, host_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            host_root: host_root.into(),
            layout: ImageLayout::default(),
        }
    }

    /// Set a custom image layout.
    pub fn with_layout(mut self, layout: ImageLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    /// Create the directory skeleton and essential files.
    pub fn prepare(&self, kernel_version: &str) -> Result<()> {
        tracing::debug!(root = %self.root.display(), "Preparing image tree");

        fs::create_dir_all(&self.root).map_err(|e| {
            ThinbootError::PackageError(format!(
                "Failed to create image directory {}: {}",
                self.root.display(),
                e
            ))
        })?;

        for dir in self.layout.required_dirs(kernel_version) {
            let full_path = self.root.join(dir.trim_start_matches('/'));
            fs::create_dir_all(&full_path).map_err(|e| {
                ThinbootError::PackageError(format!(
                    "Failed to create directory {}: {}",
                    full_path.display(),
                    e
                ))
            })?;
        }

        set_mode(&self.root.join(self.layout.tmp_dir.trim_start_matches('/')), 0o1777)?;
        self.create_essential_files()
    }

    fn create_essential_files(&self) -> Result<()> {
        self.write_file(
            "etc/passwd",
            "root:x:0:0:root:/root:/bin/sh\nnobody:x:65534:65534:nobody:/:/bin/false\n",
        )?;
        self.write_file("etc/group", "root:x:0:\nlp:x:7:\nnogroup:x:65534:\n")?;
        self.write_file("etc/hosts", "127.0.0.1\tlocalhost\n::1\t\tlocalhost\n")?;
        self.write_file("etc/nsswitch.conf", "passwd: files\ngroup: files\nhosts: files dns\n")?;
        self.write_file("etc/shells", "/bin/sh\n")?;
        self.write_script(UDHCPC_SCRIPT_PATH, UDHCPC_SCRIPT)
    }

    /// Write an executable file into the image.
    pub fn write_script(&self, relative_path: &str, content: &str) -> Result<()> {
        self.write_file(relative_path, content)?;
        set_mode(&self.root.join(relative_path.trim_start_matches('/')), 0o755)
    }

    /// Create `relative` as a relative symlink to `target`, both image
    /// paths. An existing entry is kept.
    pub fn link(&self, relative: &Path, target: &Path) -> Result<InstallOutcome> {
        let relative = strip_root(relative);
        let dest = self.root.join(&relative);
        if fs::symlink_metadata(&dest).is_ok() {
            return Ok(InstallOutcome::AlreadyPresent);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let depth = relative.components().count().saturating_sub(1);
        let mut link_target: PathBuf = std::iter::repeat("..").take(depth).collect();
        link_target.push(strip_root(target));
        std::os::unix::fs::symlink(&link_target, &dest)?;
        Ok(InstallOutcome::Installed)
    }

    /// Link busybox applets to `busybox`. Nothing is linked when busybox
    /// itself is not in the image. Returns the number of links created.
    pub fn install_applets(&self, busybox: &Path, applets: &[PathBuf]) -> Result<usize> {
        if !self.contains(busybox) {
            tracing::warn!(busybox = %busybox.display(), "Busybox not in image, applets not linked");
            return Ok(0);
        }
        let mut linked = 0;
        for applet in applets {
            if self.link(applet, busybox)? == InstallOutcome::Installed {
                linked += 1;
            }
        }
        Ok(linked)
    }

    /// Install the boot supervisor as `/init`.
    pub fn install_init(&self, source: &Path) -> Result<()> {
        if !source.exists() {
            return Err(ThinbootError::ComponentNotFound(format!(
                "boot supervisor binary {}",
                source.display()
            )));
        }

        let dest = self.root.join(IMAGE_INIT_PATH.trim_start_matches('/'));

        // Skip when the staged copy is current (same size, not older)
        if let (Ok(src_meta), Ok(dst_meta)) = (fs::metadata(source), fs::metadata(&dest)) {
            if src_meta.len() == dst_meta.len() {
                if let (Ok(src_mtime), Ok(dst_mtime)) = (src_meta.modified(), dst_meta.modified()) {
                    if src_mtime <= dst_mtime {
                        tracing::debug!("Boot supervisor is up to date");
                        return Ok(());
                    }
                }
            }
        }

        fs::copy(source, &dest).map_err(|e| {
            ThinbootError::PackageError(format!("Failed to copy boot supervisor: {}", e))
        })?;
        set_mode(&dest, 0o755)
    }

    /// Install a component at its destination.
    pub fn install_component(&self, component: &Component) -> Result<InstallOutcome> {
        let outcome = self.install_from(&component.source, &component.dest, 0)?;
        if component.kind == ComponentKind::Executable {
            let dest = self.root.join(strip_root(&component.dest));
            if fs::symlink_metadata(&dest).map(|m| m.is_file()).unwrap_or(false) {
                set_mode(&dest, 0o755)?;
            }
        }
        Ok(outcome)
    }

    /// Install a host file at the same relative path inside the image.
    pub fn install(&self, relative: &Path) -> Result<InstallOutcome> {
        let relative = strip_root(relative);
        self.install_from(&self.host_root.join(&relative), &relative, 0)
    }

    fn install_from(&self, source: &Path, dest_rel: &Path, depth: usize) -> Result<InstallOutcome> {
        if depth > MAX_LINK_DEPTH {
            return Err(ThinbootError::PackageError(format!(
                "Symlink chain too deep at {}",
                source.display()
            )));
        }

        let dest_rel = strip_root(dest_rel);
        let dest = self.root.join(&dest_rel);
        if fs::symlink_metadata(&dest).is_ok() {
            return Ok(InstallOutcome::AlreadyPresent);
        }

        let meta = fs::symlink_metadata(source).map_err(|_| {
            ThinbootError::ComponentNotFound(source.display().to_string())
        })?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if meta.file_type().is_symlink() {
            let target = fs::read_link(source)?;
            std::os::unix::fs::symlink(&target, &dest)?;

            let target_rel = if target.is_absolute() {
                strip_root(&target)
            } else {
                normalize(&dest_rel.parent().unwrap_or(Path::new("")).join(&target))
            };
            let source_rel = source
                .strip_prefix(&self.host_root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| dest_rel.clone());
            let target_source = if target.is_absolute() {
                self.host_root.join(&target_rel)
            } else {
                self.host_root.join(normalize(
                    &source_rel.parent().unwrap_or(Path::new("")).join(&target),
                ))
            };
            self.install_from(&target_source, &target_rel, depth + 1)?;
        } else if meta.is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            fs::copy(source, &dest).map_err(|e| {
                ThinbootError::PackageError(format!(
                    "Failed to copy {} to {}: {}",
                    source.display(),
                    dest.display(),
                    e
                ))
            })?;
        }

        tracing::trace!(dest = %dest_rel.display(), "Installed");
        Ok(InstallOutcome::Installed)
    }

    /// Recursively install a host directory. Returns the number of entries
    /// newly installed.
    pub fn install_dir(&self, relative: &Path) -> Result<usize> {
        let relative = strip_root(relative);
        let source = self.host_root.join(&relative);
        if !source.is_dir() {
            return Err(ThinbootError::ComponentNotFound(source.display().to_string()));
        }
        fs::create_dir_all(self.root.join(&relative))?;

        let mut installed = 0;
        let mut entries: Vec<_> = fs::read_dir(&source)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let child = relative.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                installed += self.install_dir(&child)?;
            } else if self.install(&child)? == InstallOutcome::Installed {
                installed += 1;
            }
        }
        Ok(installed)
    }

    /// Copy a prepared directory (not relative to the host root) over the
    /// image root.
    pub fn overlay_dir(&self, source: &Path) -> Result<usize> {
        copy_dir_recursive(source, &self.root)
    }

    /// Unpack a tar archive (optionally compressed) over the image root.
    pub fn overlay_archive(&self, archive_path: &Path) -> Result<usize> {
        let codec = detect_codec(archive_path)?;
        let mut archive = tar::Archive::new(open_decoder(archive_path, codec)?);
        archive.set_preserve_permissions(true);
        archive.set_overwrite(true);
        fs::create_dir_all(&self.root)?;

        let mut unpacked = 0;
        let entries = archive.entries().map_err(|e| {
            ThinbootError::PackageError(format!("Failed to read {}: {}", archive_path.display(), e))
        })?;
        for entry in entries {
            let mut entry = entry.map_err(|e| {
                ThinbootError::PackageError(format!("Corrupt entry in {}: {}", archive_path.display(), e))
            })?;
            let unpacked_inside = entry.unpack_in(&self.root).map_err(|e| {
                ThinbootError::PackageError(format!("Failed to unpack {}: {}", archive_path.display(), e))
            })?;
            if unpacked_inside {
                unpacked += 1;
            }
        }
        Ok(unpacked)
    }

    /// Whether a path exists in the image (symlinks count even if dangling).
    pub fn contains(&self, relative: &Path) -> bool {
        fs::symlink_metadata(self.root.join(strip_root(relative))).is_ok()
    }

    /// Write a file into the image.
    pub fn write_file(&self, relative_path: &str, content: &str) -> Result<()> {
        let full_path = self.root.join(relative_path.trim_start_matches('/'));

        // Ensure parent directory exists
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ThinbootError::PackageError(format!("Failed to create parent directory: {}", e))
            })?;
        }

        fs::write(&full_path, content).map_err(|e| {
            ThinbootError::PackageError(format!("Failed to write {}: {}", full_path.display(), e))
        })?;

        tracing::debug!(path = %full_path.display(), "Created file");
        Ok(())
    }

    /// Every entry in the image, relative to its root, sorted.
    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        let mut entries = BTreeSet::new();
        walk(&self.root, &self.root, &mut entries)?;
        Ok(entries.into_iter().collect())
    }
}

fn walk(root: &Path, current: &Path, entries: &mut BTreeSet<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        if let Ok(relative) = path.strip_prefix(root) {
            entries.insert(relative.to_path_buf());
        }
        if entry.file_type()?.is_dir() {
            walk(root, &path, entries)?;
        }
    }
    Ok(())
}

/// Recursively copy a directory and its contents, preserving symlinks.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst).map_err(|e| {
        ThinbootError::PackageError(format!(
            "Failed to create directory {}: {}",
            dst.display(),
            e
        ))
    })?;

    let mut copied = 0;
    for entry in fs::read_dir(src).map_err(|e| {
        ThinbootError::PackageError(format!("Failed to read directory {}: {}", src.display(), e))
    })? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copied += copy_dir_recursive(&src_path, &dst_path)?;
        } else if file_type.is_symlink() {
            if fs::symlink_metadata(&dst_path).is_ok() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(fs::read_link(&src_path)?, &dst_path)?;
            copied += 1;
        } else {
            fs::copy(&src_path, &dst_path).map_err(|e| {
                ThinbootError::PackageError(format!(
                    "Failed to copy {} to {}: {}",
                    src_path.display(),
                    dst_path.display(),
                    e
                ))
            })?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Calculate the total size of a directory recursively.
pub fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let meta = fs::symlink_metadata(entry.path())?;
            if meta.is_dir() {
                total += dir_size(&entry.path())?;
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)
        .map_err(|e| ThinbootError::PackageError(format!("Failed to read permissions: {}", e)))?
        .permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)
        .map_err(|e| ThinbootError::PackageError(format!("Failed to set permissions: {}", e)))
}

pub(crate) fn strip_root(path: &Path) -> PathBuf {
    path.strip_prefix("/").unwrap_or(path).to_path_buf()
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            PathComponent::ParentDir => {
                out.pop();
            }
            PathComponent::CurDir | PathComponent::RootDir | PathComponent::Prefix(_) => {}
            PathComponent::Normal(part) => out.push(part),
        }
    }
    out
}
