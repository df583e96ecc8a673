//! Thinboot Assembler - Variant image builds on the boot server.
//!
//! Turns a build host filesystem into one compressed boot image per
//! hardware variant: dependency closures, component validation, wireless
//! stripping, and packaging with integrity sidecars.

#![allow(clippy::result_large_err)]

pub mod assembler;
pub mod cpio;
pub mod kmod;
pub mod layout;
pub mod packager;
pub mod resolver;
pub mod strip;
pub mod tree;
pub mod validator;

// Re-export common types
pub use assembler::{AssemblyOutcome, VariantAssembler, VariantResult};
pub use kmod::ModuleIndex;
pub use layout::{ImageLayout, IMAGE_CONFIG_DIR, IMAGE_INIT_PATH, UDHCPC_SCRIPT_PATH};
pub use packager::{archive_entries, archive_listing, detect_codec, sha256_file, verify_artifact, Packager, Verification};
pub use resolver::{
    merge_closures, DependencyClosure, DependencyResolver, DynamicInfo, DynamicInspector, ElfInspector,
};
pub use strip::strip_paths;
pub use tree::{ImageTree, InstallOutcome};
pub use validator::{ComponentValidator, IssueSeverity, ValidationIssue, ValidationReport};
