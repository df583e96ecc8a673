//! Filesystem objects placed into an image.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Category of an image component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    KernelModule,
    UserDriver,
    Firmware,
    SharedLibrary,
    Executable,
}

impl ComponentKind {
    /// Whether components of this kind are dynamically linked objects whose
    /// library requirements must be resolved.
    pub fn is_linkable(&self) -> bool {
        matches!(
            self,
            ComponentKind::UserDriver | ComponentKind::SharedLibrary | ComponentKind::Executable
        )
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KernelModule => write!(f, "kernel-module"),
            Self::UserDriver => write!(f, "user-driver"),
            Self::Firmware => write!(f, "firmware"),
            Self::SharedLibrary => write!(f, "shared-library"),
            Self::Executable => write!(f, "executable"),
        }
    }
}

/// A single filesystem object to include in an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    /// Absolute source location on the build host.
    pub source: PathBuf,
    /// Destination path relative to the image root.
    pub dest: PathBuf,
    /// Component category.
    pub kind: ComponentKind,
}

impl Component {
    pub fn new(source: impl Into<PathBuf>, dest: impl Into<PathBuf>, kind: ComponentKind) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            kind,
        }
    }
}
