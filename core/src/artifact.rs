//! Packaged image artifacts and their compression codecs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Compression codec applied to the serialized image archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Gzip,
    Xz,
    Bzip2,
    None,
}

impl Default for Codec {
    fn default() -> Self {
        Self::Gzip
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gzip => write!(f, "gzip"),
            Self::Xz => write!(f, "xz"),
            Self::Bzip2 => write!(f, "bzip2"),
            Self::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gzip" | "gz" => Ok(Self::Gzip),
            "xz" => Ok(Self::Xz),
            "bzip2" | "bz2" => Ok(Self::Bzip2),
            "none" => Ok(Self::None),
            _ => Err(format!(
                "unknown codec: '{}' (supported: gzip, xz, bzip2, none)",
                s
            )),
        }
    }
}

/// A published image: compressed archive plus its content hash and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArtifact {
    /// Variant the artifact was built for.
    pub variant: String,
    /// Path of the compressed archive.
    pub path: PathBuf,
    /// Lower-case hex SHA-256 of the compressed archive.
    pub sha256: String,
    /// Declared size of the compressed archive in bytes.
    pub size: u64,
    /// Codec used to compress the archive.
    pub codec: Codec,
    /// Number of filesystem entries in the archive.
    pub entries: usize,
}

impl ImageArtifact {
    /// Path of the hash sidecar file.
    pub fn hash_path(&self) -> PathBuf {
        sidecar_path(&self.path, "sha256")
    }

    /// Path of the size sidecar file.
    pub fn size_path(&self) -> PathBuf {
        sidecar_path(&self.path, "size")
    }
}

/// Sidecar file next to an artifact, e.g. `initrd-intel.img.sha256`.
pub fn sidecar_path(artifact: &Path, extension: &str) -> PathBuf {
    let mut name = artifact
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(extension);
    artifact.with_file_name(name)
}
