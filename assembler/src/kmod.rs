//! Kernel module dependency index (`modules.dep`).

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use thinboot_core::error::Result;

/// Module index files copied next to the modules so `modprobe` works in the
/// image.
pub const MODULE_INDEX_FILES: [&str; 8] = [
    "modules.dep",
    "modules.dep.bin",
    "modules.alias",
    "modules.alias.bin",
    "modules.symbols",
    "modules.symbols.bin",
    "modules.builtin",
    "modules.order",
];

const MODULE_SUFFIXES: [&str; 4] = [".ko.xz", ".ko.zst", ".ko.gz", ".ko"];

/// Module name from its file path: `drm-kms-helper.ko.xz` → `drm_kms_helper`.
pub fn module_name(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = MODULE_SUFFIXES
        .iter()
        .find_map(|suffix| file.strip_suffix(suffix))
        .unwrap_or(&file);
    stem.replace('-', "_")
}

/// Parsed `modules.dep`: module path → hard dependency paths, relative to
/// `lib/modules/<kernel version>`.
#[derive(Debug, Clone, Default)]
pub struct ModuleIndex {
    deps: HashMap<PathBuf, Vec<PathBuf>>,
    by_name: HashMap<String, PathBuf>,
}

impl ModuleIndex {
    /// Parse the text form of `modules.dep`.
    pub fn parse(content: &str) -> Self {
        let mut index = Self::default();
        for line in content.lines() {
            let Some((module, deps)) = line.split_once(':') else {
                continue;
            };
            let module = PathBuf::from(module.trim());
            if module.as_os_str().is_empty() {
                continue;
            }
            let deps: Vec<PathBuf> = deps.split_whitespace().map(PathBuf::from).collect();
            index.by_name.insert(module_name(&module), module.clone());
            index.deps.insert(module, deps);
        }
        index
    }

    /// Load `modules.dep` from a module tree. A missing index yields an
    /// empty one.
    pub fn load(modules_root: &Path) -> Result<Self> {
        let path = modules_root.join("modules.dep");
        if !path.exists() {
            tracing::warn!(path = %path.display(), "modules.dep not found, module dependencies unknown");
            return Ok(Self::default());
        }
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Find a module by path (compression suffix may differ) or by name.
    pub fn find(&self, module: &Path) -> Option<&Path> {
        if let Some((path, _)) = self.deps.get_key_value(module) {
            return Some(path.as_path());
        }
        self.by_name
            .get(&module_name(module))
            .map(PathBuf::as_path)
    }

    /// Every module needed to load `roots`, including the roots themselves.
    /// Roots unknown to the index are returned as is so their absence is
    /// reported by validation.
    pub fn closure(&self, roots: &[PathBuf]) -> BTreeSet<PathBuf> {
        let mut result = BTreeSet::new();
        for root in roots {
            let Some(found) = self.find(root) else {
                result.insert(root.clone());
                continue;
            };
            let found = found.to_path_buf();
            if !result.insert(found.clone()) {
                continue;
            }
            // modules.dep lists the complete hard dependency chain.
            if let Some(deps) = self.deps.get(&found) {
                result.extend(deps.iter().cloned());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEP: &str = "\
kernel/drivers/gpu/drm/i915/i915.ko.xz: kernel/drivers/gpu/drm/display/drm_display_helper.ko.xz kernel/drivers/gpu/drm/drm_kms_helper.ko.xz kernel/drivers/gpu/drm/drm.ko.xz
kernel/drivers/gpu/drm/drm_kms_helper.ko.xz: kernel/drivers/gpu/drm/drm.ko.xz
kernel/drivers/gpu/drm/drm.ko.xz:
kernel/drivers/net/ethernet/intel/e1000e/e1000e.ko.xz:
";

    #[test]
    fn test_module_name() {
        assert_eq!(module_name(Path::new("a/drm-kms-helper.ko.xz")), "drm_kms_helper");
        assert_eq!(module_name(Path::new("i915.ko")), "i915");
        assert_eq!(module_name(Path::new("virtio-gpu.ko.zst")), "virtio_gpu");
    }

    #[test]
    fn test_closure_includes_hard_deps() {
        let index = ModuleIndex::parse(DEP);
        let closure = index.closure(&[PathBuf::from("kernel/drivers/gpu/drm/i915/i915.ko")]);
        assert_eq!(closure.len(), 4);
        assert!(closure.contains(Path::new("kernel/drivers/gpu/drm/drm.ko.xz")));
        assert!(closure.contains(Path::new("kernel/drivers/gpu/drm/i915/i915.ko.xz")));
        assert!(!closure.iter().any(|p| p.to_string_lossy().contains("e1000e")));
    }

    #[test]
    fn test_unknown_module_passes_through() {
        let index = ModuleIndex::parse(DEP);
        let closure = index.closure(&[PathBuf::from("kernel/drivers/gpu/drm/ast/ast.ko")]);
        assert_eq!(
            closure.into_iter().collect::<Vec<_>>(),
            vec![PathBuf::from("kernel/drivers/gpu/drm/ast/ast.ko")]
        );
    }

    #[test]
    fn test_load_missing_index_is_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let index = ModuleIndex::load(tmp.path()).unwrap();
        assert!(index.is_empty());
    }
}
