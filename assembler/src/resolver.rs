//! Dependency closure resolution.
//!
//! Computes the transitive set of shared objects a binary needs by reading
//! `DT_NEEDED` entries and the `PT_INTERP` program header, resolving each
//! name against the requiring object's `DT_RUNPATH` (or `DT_RPATH`) and then
//! the library search path, and repeating for every newly found library
//! until the work queue drains.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use elf::abi;
use elf::endian::AnyEndian;
use elf::ElfStream;
use thinboot_core::error::{Result, ThinbootError};

/// Dynamic-linking requirements of one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicInfo {
    /// `DT_NEEDED` sonames in declaration order.
    pub needed: Vec<String>,
    /// Program interpreter (dynamic linker), absolute in the target root.
    pub interpreter: Option<PathBuf>,
    /// `DT_RUNPATH` entries, or `DT_RPATH` when there is no runpath, as
    /// written (`$ORIGIN` unexpanded).
    pub runpath: Vec<String>,
}

/// Reports the direct dynamic requirements of a file.
pub trait DynamicInspector: Send + Sync {
    /// Returns `Ok(None)` for files that are not dynamically linked objects
    /// (scripts, data, static binaries without a dynamic section).
    fn inspect(&self, path: &Path) -> Result<Option<DynamicInfo>>;
}

/// Inspector reading ELF headers with the `elf` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElfInspector;

fn elf_error(path: &Path, e: impl std::fmt::Display) -> ThinbootError {
    ThinbootError::ResolveError {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

impl DynamicInspector for ElfInspector {
    fn inspect(&self, path: &Path) -> Result<Option<DynamicInfo>> {
        let file = File::open(path).map_err(|e| elf_error(path, e))?;

        // BadMagic / BadOffset for empty or non-ELF files.
        let mut elf = match ElfStream::<AnyEndian, _>::open_stream(file) {
            Ok(elf) => elf,
            Err(_) => return Ok(None),
        };

        let interp_header = elf
            .segments()
            .iter()
            .find(|phdr| phdr.p_type == abi::PT_INTERP)
            .cloned();
        let interpreter = match interp_header {
            Some(phdr) => {
                let data = elf.segment_data(&phdr).map_err(|e| elf_error(path, e))?;
                let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
                let interp = String::from_utf8_lossy(&data[..end]).to_string();
                (!interp.is_empty()).then(|| PathBuf::from(interp))
            }
            None => None,
        };

        let mut offsets = Vec::new();
        let mut runpath_offsets = Vec::new();
        let mut rpath_offsets = Vec::new();
        match elf.dynamic().map_err(|e| elf_error(path, e))? {
            Some(table) => {
                for entry in table.iter() {
                    let Ok(offset) = usize::try_from(entry.d_val()) else {
                        continue;
                    };
                    match entry.d_tag {
                        abi::DT_NEEDED => offsets.push(offset),
                        abi::DT_RUNPATH => runpath_offsets.push(offset),
                        abi::DT_RPATH => rpath_offsets.push(offset),
                        _ => {}
                    }
                }
            }
            None if interpreter.is_none() => return Ok(None),
            None => {}
        }
        // DT_RPATH is ignored when DT_RUNPATH is present.
        let search_offsets = if runpath_offsets.is_empty() {
            rpath_offsets
        } else {
            runpath_offsets
        };

        let mut needed = Vec::with_capacity(offsets.len());
        let mut runpath = Vec::new();
        if !offsets.is_empty() || !search_offsets.is_empty() {
            if let Some((_, strtab)) = elf
                .dynamic_symbol_table()
                .map_err(|e| elf_error(path, e))?
            {
                for off in offsets {
                    let name = strtab.get(off).map_err(|e| elf_error(path, e))?;
                    needed.push(name.to_string());
                }
                for off in search_offsets {
                    let dirs = strtab.get(off).map_err(|e| elf_error(path, e))?;
                    runpath.extend(dirs.split(':').filter(|d| !d.is_empty()).map(String::from));
                }
            }
        }

        Ok(Some(DynamicInfo {
            needed,
            interpreter,
            runpath,
        }))
    }
}

/// Transitive shared-object requirements of one root object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyClosure {
    /// The object the closure was computed for (host path).
    pub root: PathBuf,
    /// Every required shared object, resolved to a host path.
    pub libraries: BTreeSet<PathBuf>,
    /// Requirements that matched nothing on the search path.
    pub unresolved: BTreeSet<String>,
}

impl DependencyClosure {
    /// Library paths relative to `host_root`, i.e. their image destinations.
    pub fn image_paths(&self, host_root: &Path) -> Vec<PathBuf> {
        self.libraries
            .iter()
            .filter_map(|p| p.strip_prefix(host_root).ok().map(Path::to_path_buf))
            .collect()
    }

    /// Whether every requirement was found.
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

enum Requirement {
    /// A soname plus the requiring object's expanded runpath.
    Soname(String, Vec<PathBuf>),
    Path(PathBuf),
}

/// Resolves dependency closures against a build host root.
#[derive(Clone)]
pub struct DependencyResolver {
    host_root: PathBuf,
    search_paths: Vec<PathBuf>,
    inspector: Arc<dyn DynamicInspector>,
}

impl std::fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyResolver")
            .field("host_root", &self.host_root)
            .field("search_paths", &self.search_paths)
            .finish()
    }
}

impl DependencyResolver {
    /// Create a resolver reading ELF objects.
    ///
    /// `search_paths` are absolute host directories tried in order.
    pub fn new(host_root: impl Into<PathBuf>, search_paths: Vec<PathBuf>) -> Self {
        Self {
            host_root: host_root.into(),
            search_paths,
            inspector: Arc::new(ElfInspector),
        }
    }

    /// Replace the inspector.
    pub fn with_inspector(mut self, inspector: Arc<dyn DynamicInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    /// Compute the closure of a single root object.
    pub fn resolve(&self, root: &Path) -> Result<DependencyClosure> {
        self.resolve_from(root, root)
    }

    /// Compute the closure of `root`, a copy of the host object at
    /// `host_path`. `$ORIGIN` in its runpath expands against `host_path`.
    pub fn resolve_from(&self, root: &Path, host_path: &Path) -> Result<DependencyClosure> {
        if !root.exists() {
            return Err(ThinbootError::ResolveError {
                path: root.display().to_string(),
                message: "file does not exist".to_string(),
            });
        }

        let mut closure = DependencyClosure {
            root: root.to_path_buf(),
            ..Default::default()
        };
        let mut seen_names: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<Requirement> = VecDeque::new();

        if let Some(info) = self.inspector.inspect(root)? {
            self.enqueue(&mut queue, &mut seen_names, host_path, info);
        }

        while let Some(requirement) = queue.pop_front() {
            let resolved = match &requirement {
                Requirement::Soname(name, runpath) => self.find_library(name, runpath),
                Requirement::Path(path) => self.find_absolute(path),
            };

            let Some(library) = resolved else {
                let name = match requirement {
                    Requirement::Soname(name, _) => name,
                    Requirement::Path(path) => path.display().to_string(),
                };
                tracing::warn!(
                    root = %root.display(),
                    library = %name,
                    "Unresolved shared library"
                );
                closure.unresolved.insert(name);
                continue;
            };

            if !closure.libraries.insert(library.clone()) {
                continue;
            }
            tracing::debug!(library = %library.display(), "Resolved shared library");

            match self.inspector.inspect(&library) {
                Ok(Some(info)) => self.enqueue(&mut queue, &mut seen_names, &library, info),
                Ok(None) => {}
                Err(e) => {
                    // Keep the library; only its own requirements are unknown.
                    tracing::warn!(library = %library.display(), error = %e, "Failed to inspect library");
                }
            }
        }

        tracing::debug!(
            root = %root.display(),
            libraries = closure.libraries.len(),
            unresolved = closure.unresolved.len(),
            "Dependency closure computed"
        );
        Ok(closure)
    }

    /// Compute closures for many roots staged under `staging_root`, each a
    /// copy of the host object at the same relative path. Roots that do not
    /// exist are skipped.
    pub fn resolve_all(&self, roots: &[PathBuf], staging_root: &Path) -> Result<Vec<DependencyClosure>> {
        let mut closures = Vec::with_capacity(roots.len());
        for root in roots {
            if !root.exists() {
                tracing::debug!(root = %root.display(), "Skipping absent closure root");
                continue;
            }
            let host_path = match root.strip_prefix(staging_root) {
                Ok(relative) => self.host_root.join(relative),
                Err(_) => root.clone(),
            };
            closures.push(self.resolve_from(root, &host_path)?);
        }
        Ok(closures)
    }

    fn find_library(&self, name: &str, runpath: &[PathBuf]) -> Option<PathBuf> {
        if name.contains('/') {
            return self.find_absolute(Path::new(name));
        }
        runpath
            .iter()
            .chain(self.search_paths.iter())
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.exists())
    }

    /// Host directories for the runpath of the object at `object`.
    fn expand_runpath(&self, object: &Path, runpath: &[String]) -> Vec<PathBuf> {
        let origin = object.parent().unwrap_or(&self.host_root);
        runpath
            .iter()
            .filter_map(|entry| {
                let expanded = entry.replace("${ORIGIN}", "$ORIGIN");
                if let Some(rest) = expanded.strip_prefix("$ORIGIN") {
                    let joined = origin.join(rest.trim_start_matches('/'));
                    let relative = joined.strip_prefix(&self.host_root).ok()?;
                    Some(self.host_root.join(crate::tree::normalize(relative)))
                } else if expanded.contains('$') {
                    // $LIB and $PLATFORM depend on the running loader.
                    tracing::debug!(object = %object.display(), entry, "Skipping runpath entry");
                    None
                } else if Path::new(&expanded).is_absolute() {
                    Some(self.host_root.join(expanded.trim_start_matches('/')))
                } else {
                    None
                }
            })
            .collect()
    }

    fn enqueue(&self, queue: &mut VecDeque<Requirement>, seen: &mut HashSet<String>, object: &Path, info: DynamicInfo) {
        if let Some(interp) = info.interpreter {
            if seen.insert(interp.display().to_string()) {
                queue.push_back(Requirement::Path(interp));
            }
        }
        let runpath = self.expand_runpath(object, &info.runpath);
        for name in info.needed {
            if seen.insert(name.clone()) {
                queue.push_back(Requirement::Soname(name, runpath.clone()));
            }
        }
    }

    fn find_absolute(&self, path: &Path) -> Option<PathBuf> {
        let relative = path.strip_prefix("/").unwrap_or(path);
        let candidate = self.host_root.join(relative);
        candidate.exists().then_some(candidate)
    }
}

/// Merge many closures into one set of image destinations plus the union of
/// unresolved names.
pub fn merge_closures(
    closures: &[DependencyClosure],
    host_root: &Path,
) -> (BTreeSet<PathBuf>, BTreeSet<String>) {
    let mut libraries = BTreeSet::new();
    let mut unresolved = BTreeSet::new();
    for closure in closures {
        libraries.extend(closure.image_paths(host_root));
        unresolved.extend(closure.unresolved.iter().cloned());
    }
    (libraries, unresolved)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Inspector answering from a fixed table keyed by host path.
    #[derive(Default)]
    pub(crate) struct FakeInspector {
        pub(crate) objects: HashMap<PathBuf, DynamicInfo>,
        pub(crate) calls: AtomicUsize,
    }

    impl FakeInspector {
        pub(crate) fn with(mut self, path: &Path, needed: &[&str]) -> Self {
            self.objects.insert(
                path.to_path_buf(),
                DynamicInfo {
                    needed: needed.iter().map(|s| s.to_string()).collect(),
                    ..Default::default()
                },
            );
            self
        }

        pub(crate) fn with_runpath(mut self, path: &Path, needed: &[&str], runpath: &[&str]) -> Self {
            self.objects.insert(
                path.to_path_buf(),
                DynamicInfo {
                    needed: needed.iter().map(|s| s.to_string()).collect(),
                    interpreter: None,
                    runpath: runpath.iter().map(|s| s.to_string()).collect(),
                },
            );
            self
        }
    }

    impl DynamicInspector for FakeInspector {
        fn inspect(&self, path: &Path) -> Result<Option<DynamicInfo>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.objects.get(path).cloned())
        }
    }

    fn touch(root: &Path, rel: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"object").unwrap();
        path
    }

    fn resolver(root: &Path, inspector: FakeInspector) -> DependencyResolver {
        DependencyResolver::new(root, vec![root.join("lib"), root.join("usr/lib")])
            .with_inspector(Arc::new(inspector))
    }

    #[test]
    fn test_resolve_transitive_closure() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let bin = touch(root, "usr/bin/xfreerdp");
        let libfreerdp = touch(root, "usr/lib/libfreerdp.so.2");
        let libssl = touch(root, "lib/libssl.so.3");
        let libc = touch(root, "lib/libc.so.6");

        let inspector = FakeInspector::default()
            .with(&bin, &["libfreerdp.so.2", "libc.so.6"])
            .with(&libfreerdp, &["libssl.so.3", "libc.so.6"])
            .with(&libssl, &["libc.so.6"])
            .with(&libc, &[]);

        let closure = resolver(root, inspector).resolve(&bin).unwrap();
        assert_eq!(
            closure.libraries,
            [libfreerdp, libssl, libc].into_iter().collect()
        );
        assert!(closure.is_complete());
    }

    #[test]
    fn test_resolve_is_loop_safe() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let bin = touch(root, "bin/app");
        let liba = touch(root, "lib/liba.so");
        let libb = touch(root, "lib/libb.so");

        let inspector = FakeInspector::default()
            .with(&bin, &["liba.so"])
            .with(&liba, &["libb.so"])
            .with(&libb, &["liba.so"]);

        let closure = resolver(root, inspector).resolve(&bin).unwrap();
        assert_eq!(closure.libraries.len(), 2);
    }

    #[test]
    fn test_each_library_inspected_once() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let bin = touch(root, "bin/app");
        let liba = touch(root, "lib/liba.so");
        let libb = touch(root, "lib/libb.so");
        let libc = touch(root, "lib/libc.so.6");

        let inspector = Arc::new(
            FakeInspector::default()
                .with(&bin, &["liba.so", "libb.so"])
                .with(&liba, &["libc.so.6"])
                .with(&libb, &["libc.so.6"])
                .with(&libc, &[]),
        );
        let resolver = DependencyResolver::new(root, vec![root.join("lib")])
            .with_inspector(inspector.clone());
        let closure = resolver.resolve(&bin).unwrap();

        assert_eq!(closure.libraries.len(), 3);
        // bin + liba + libb + libc
        assert_eq!(inspector.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_unresolved_recorded_as_warning() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let bin = touch(root, "bin/app");
        let libc = touch(root, "lib/libc.so.6");

        let inspector = FakeInspector::default()
            .with(&bin, &["libx264.so.164", "libc.so.6"])
            .with(&libc, &[]);

        let closure = resolver(root, inspector).resolve(&bin).unwrap();
        assert_eq!(closure.libraries.len(), 1);
        assert!(closure.unresolved.contains("libx264.so.164"));
        assert!(!closure.is_complete());
    }

    #[test]
    fn test_search_path_order() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let bin = touch(root, "bin/app");
        let first = touch(root, "lib/libdup.so");
        touch(root, "usr/lib/libdup.so");

        let inspector = FakeInspector::default().with(&bin, &["libdup.so"]);
        let closure = resolver(root, inspector).resolve(&bin).unwrap();
        assert_eq!(closure.libraries, [first].into_iter().collect());
    }

    #[test]
    fn test_interpreter_resolved_under_host_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let bin = touch(root, "bin/app");
        let ld = touch(root, "lib64/ld-linux-x86-64.so.2");

        let mut inspector = FakeInspector::default();
        inspector.objects.insert(
            bin.clone(),
            DynamicInfo {
                interpreter: Some(PathBuf::from("/lib64/ld-linux-x86-64.so.2")),
                ..Default::default()
            },
        );

        let closure = resolver(root, inspector).resolve(&bin).unwrap();
        assert_eq!(closure.libraries, [ld].into_iter().collect());
        assert_eq!(
            closure.image_paths(root),
            vec![PathBuf::from("lib64/ld-linux-x86-64.so.2")]
        );
    }

    #[test]
    fn test_runpath_searched_before_search_paths() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let bin = touch(root, "opt/freerdp/bin/xfreerdp");
        let private = touch(root, "opt/freerdp/lib/libwinpr.so.2");
        touch(root, "lib/libwinpr.so.2");
        let vendored = touch(root, "opt/vendor/lib/libcodec.so.1");

        let inspector = FakeInspector::default()
            .with_runpath(&bin, &["libwinpr.so.2"], &["$ORIGIN/../lib"])
            .with_runpath(&private, &["libcodec.so.1"], &["/opt/vendor/lib"]);

        let closure = resolver(root, inspector).resolve(&bin).unwrap();
        assert_eq!(closure.libraries, [private, vendored].into_iter().collect());
        assert!(closure.is_complete());
    }

    #[test]
    fn test_staged_root_origin_maps_to_host() {
        let tmp = TempDir::new().unwrap();
        let host = tmp.path().join("host");
        let staging = tmp.path().join("image");
        touch(&host, "usr/libexec/helper/run");
        let private = touch(&host, "usr/libexec/lib/libhelper.so");
        let staged = touch(&staging, "usr/libexec/helper/run");

        let inspector = FakeInspector::default().with_runpath(&staged, &["libhelper.so"], &["${ORIGIN}/../lib"]);
        let closures = DependencyResolver::new(&host, vec![host.join("lib")])
            .with_inspector(Arc::new(inspector))
            .resolve_all(&[staged], &staging)
            .unwrap();
        assert_eq!(closures[0].libraries, [private].into_iter().collect());
        assert_eq!(closures[0].image_paths(&host), vec![PathBuf::from("usr/libexec/lib/libhelper.so")]);
    }

    #[test]
    fn test_non_elf_root_has_empty_closure() {
        let tmp = TempDir::new().unwrap();
        let script = touch(tmp.path(), "bin/script.sh");
        let closure = DependencyResolver::new(tmp.path(), vec![])
            .resolve(&script)
            .unwrap();
        assert!(closure.libraries.is_empty());
        assert!(closure.is_complete());
    }

    #[test]
    fn test_missing_root_is_error() {
        let tmp = TempDir::new().unwrap();
        let result = DependencyResolver::new(tmp.path(), vec![]).resolve(&tmp.path().join("nope"));
        assert!(matches!(result, Err(ThinbootError::ResolveError { .. })));
    }

    #[test]
    fn test_elf_inspector_reads_own_executable() {
        let exe = std::env::current_exe().unwrap();
        let info = ElfInspector.inspect(&exe).unwrap();
        assert!(info.is_some());
    }

    #[test]
    fn test_merge_closures() {
        let root = Path::new("/host");
        let a = DependencyClosure {
            root: root.join("bin/a"),
            libraries: [root.join("lib/libc.so.6"), root.join("lib/liba.so")]
                .into_iter()
                .collect(),
            unresolved: ["libopt.so".to_string()].into_iter().collect(),
        };
        let b = DependencyClosure {
            root: root.join("bin/b"),
            libraries: [root.join("lib/libc.so.6")].into_iter().collect(),
            unresolved: BTreeSet::new(),
        };
        let (libs, unresolved) = merge_closures(&[a, b], root);
        assert_eq!(libs.len(), 2);
        assert!(libs.contains(Path::new("lib/liba.so")));
        assert_eq!(unresolved.len(), 1);
    }
}
