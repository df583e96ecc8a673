//! Image packaging.
//!
//! Serializes an image tree into a cpio "newc" stream (sorted entries,
//! zero mtime, root ownership, real permission bits), compresses it, and
//! publishes it atomically next to a SHA-256 sidecar and a size sidecar.
//! Everything is staged as temporary files in the output directory. The
//! sidecars are renamed into place first and the artifact last, so a
//! reader that sees a new artifact also sees its sidecars, and a failed
//! build never replaces or shadows a published artifact.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thinboot_core::artifact::{sidecar_path, Codec, ImageArtifact};
use thinboot_core::error::{Result, ThinbootError};
use thinboot_core::variant::artifact_file_name;

use crate::cpio::{EntryHeader, NewcReader, NewcWriter, S_IFDIR, S_IFLNK, S_IFREG};
use crate::tree::ImageTree;

/// Character devices the kernel needs before udev runs: (path, mode, major, minor).
const DEVICE_NODES: &[(&str, u32, u32, u32)] = &[("dev/console", 0o600, 5, 1), ("dev/null", 0o666, 1, 3)];

enum Encoder {
    Gzip(flate2::write::GzEncoder<BufWriter<File>>),
    Xz(xz2::write::XzEncoder<BufWriter<File>>),
    Bzip2(bzip2::write::BzEncoder<BufWriter<File>>),
    None(BufWriter<File>),
}

impl Encoder {
    fn new(codec: Codec, file: File) -> Self {
        let out = BufWriter::new(file);
        match codec {
            Codec::Gzip => Encoder::Gzip(flate2::write::GzEncoder::new(
                out,
                flate2::Compression::best(),
            )),
            Codec::Xz => Encoder::Xz(xz2::write::XzEncoder::new(out, 6)),
            Codec::Bzip2 => {
                Encoder::Bzip2(bzip2::write::BzEncoder::new(out, bzip2::Compression::best()))
            }
            Codec::None => Encoder::None(out),
        }
    }

    fn finish(self) -> std::io::Result<()> {
        let mut out = match self {
            Encoder::Gzip(e) => e.finish()?,
            Encoder::Xz(e) => e.finish()?,
            Encoder::Bzip2(e) => e.finish()?,
            Encoder::None(w) => w,
        };
        out.flush()?;
        out.get_ref().sync_all()
    }
}

impl Write for Encoder {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Xz(e) => e.write(buf),
            Encoder::Bzip2(e) => e.write(buf),
            Encoder::None(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Encoder::Gzip(e) => e.flush(),
            Encoder::Xz(e) => e.flush(),
            Encoder::Bzip2(e) => e.flush(),
            Encoder::None(w) => w.flush(),
        }
    }
}

/// Open a decompressing reader over an artifact.
pub fn open_decoder(path: &Path, codec: Codec) -> Result<Box<dyn Read>> {
    let file = File::open(path).map_err(|e| {
        ThinbootError::PackageError(format!("Failed to open {}: {}", path.display(), e))
    })?;
    Ok(match codec {
        Codec::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Codec::Xz => Box::new(xz2::read::XzDecoder::new(file)),
        Codec::Bzip2 => Box::new(bzip2::read::BzDecoder::new(file)),
        Codec::None => Box::new(file),
    })
}

/// Guess the codec of an artifact from its magic bytes.
pub fn detect_codec(path: &Path) -> Result<Codec> {
    let mut magic = [0u8; 6];
    let mut file = File::open(path)?;
    let n = file.read(&mut magic)?;
    let magic = &magic[..n];
    Ok(if magic.starts_with(&[0x1f, 0x8b]) {
        Codec::Gzip
    } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Codec::Xz
    } else if magic.starts_with(b"BZh") {
        Codec::Bzip2
    } else {
        Codec::None
    })
}

/// Decode the member headers of a packaged artifact, in archive order.
pub fn archive_listing(path: &Path, codec: Codec) -> Result<Vec<EntryHeader>> {
    NewcReader::new(open_decoder(path, codec)?)
        .map(|entry| entry.map(|e| e.header))
        .collect()
}

/// List the entry paths of a packaged artifact, in archive order.
pub fn archive_entries(path: &Path, codec: Codec) -> Result<Vec<PathBuf>> {
    Ok(archive_listing(path, codec)?
        .into_iter()
        .map(|header| PathBuf::from(header.name))
        .collect())
}

fn append_tree_entry<W: Write>(archive: &mut NewcWriter<W>, root: &Path, relative: &Path) -> std::io::Result<bool> {
    let path = root.join(relative);
    let name = relative.to_string_lossy();
    let meta = std::fs::symlink_metadata(&path)?;
    let perm = meta.mode() & 0o7777;
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        let target = std::fs::read_link(&path)?;
        archive.append(&name, S_IFLNK | perm, target.as_os_str().as_bytes())?;
    } else if file_type.is_dir() {
        archive.append(&name, S_IFDIR | perm, &[])?;
    } else if file_type.is_file() {
        archive.append_reader(&name, S_IFREG | perm, meta.len(), File::open(&path)?)?;
    } else {
        tracing::warn!(path = %relative.display(), "Skipping special file in image tree");
        return Ok(false);
    }
    Ok(true)
}

fn stage_file(output_dir: &Path, prefix: &str) -> Result<tempfile::NamedTempFile> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempfile_in(output_dir)
        .map_err(|e| ThinbootError::PackageError(format!("Failed to create temp file: {}", e)))
}

fn stage_sidecar(output_dir: &Path, name: &str, content: &str) -> Result<tempfile::NamedTempFile> {
    let mut staged = stage_file(output_dir, &format!(".{}.", name))?;
    staged.write_all(content.as_bytes())?;
    staged.as_file().sync_all()?;
    Ok(staged)
}

/// Rename a staged file into place, world-readable for the boot server.
fn publish(staged: tempfile::NamedTempFile, path: &Path) -> Result<()> {
    staged
        .as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    staged.persist(path).map_err(|e| {
        ThinbootError::PackageError(format!("Failed to publish {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

/// Compute SHA256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        ThinbootError::PackageError(format!(
            "Failed to read file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Writes image trees into compressed, checksummed artifacts.
#[derive(Debug, Clone)]
pub struct Packager {
    codec: Codec,
    min_size: u64,
}

impl Packager {
    pub fn new(codec: Codec, min_size: u64) -> Self {
        Self { codec, min_size }
    }

    /// Package `tree` as the artifact for `variant` in `output_dir`.
    pub fn package(&self, tree: &ImageTree, output_dir: &Path, variant: &str) -> Result<ImageArtifact> {
        std::fs::create_dir_all(output_dir).map_err(|e| {
            ThinbootError::PackageError(format!(
                "Failed to create output directory {}: {}",
                output_dir.display(),
                e
            ))
        })?;

        let name = artifact_file_name(variant);
        let final_path = output_dir.join(&name);
        let entries = tree.entries()?;

        let staging = stage_file(output_dir, &format!(".{}.", name))?;
        let file = staging.reopen().map_err(|e| {
            ThinbootError::PackageError(format!("Failed to open temp file: {}", e))
        })?;

        let mut archive = NewcWriter::new(Encoder::new(self.codec, file));
        let mut count = 0;
        for relative in &entries {
            if append_tree_entry(&mut archive, tree.root(), relative).map_err(|e| {
                ThinbootError::PackageError(format!(
                    "Failed to add {} to archive: {}",
                    relative.display(),
                    e
                ))
            })? {
                count += 1;
            }
        }
        if tree.contains(Path::new("dev")) {
            for (node, perm, major, minor) in DEVICE_NODES {
                if tree.contains(Path::new(node)) {
                    continue;
                }
                archive
                    .append_char_device(node, *perm, *major, *minor)
                    .map_err(|e| ThinbootError::PackageError(format!("Failed to add {}: {}", node, e)))?;
                count += 1;
            }
        }
        let encoder = archive
            .finish()
            .map_err(|e| ThinbootError::PackageError(format!("Failed to finalize archive: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| ThinbootError::PackageError(format!("Failed to compress archive: {}", e)))?;

        let size = std::fs::metadata(staging.path())?.len();
        if size < self.min_size {
            // staging is removed on drop
            return Err(ThinbootError::ArtifactTooSmall {
                name,
                size,
                minimum: self.min_size,
            });
        }

        let sha256 = sha256_file(staging.path())?;
        let artifact = ImageArtifact {
            variant: variant.to_string(),
            path: final_path,
            sha256,
            size,
            codec: self.codec,
            entries: count,
        };
        let hash_sidecar = stage_sidecar(output_dir, &name, &format!("{}  {}\n", artifact.sha256, name))?;
        let size_sidecar = stage_sidecar(output_dir, &name, &format!("{}\n", size))?;
        publish(hash_sidecar, &artifact.hash_path())?;
        publish(size_sidecar, &artifact.size_path())?;
        publish(staging, &artifact.path)?;

        tracing::info!(
            variant,
            artifact = %artifact.path.display(),
            size,
            entries = artifact.entries,
            codec = %self.codec,
            "Published image artifact"
        );
        Ok(artifact)
    }
}

/// Result of checking a published artifact against its sidecars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub path: PathBuf,
    pub codec: Codec,
    pub sha256: String,
    pub size: u64,
    pub declared_sha256: Option<String>,
    pub declared_size: Option<u64>,
    pub entries: usize,
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        self.declared_sha256.as_deref() == Some(self.sha256.as_str())
            && self.declared_size == Some(self.size)
    }
}

/// Recompute hash, size, and entry count of an artifact and compare them
/// with its sidecar files.
pub fn verify_artifact(path: &Path) -> Result<Verification> {
    if !path.exists() {
        return Err(ThinbootError::IntegrityError(format!(
            "artifact {} does not exist",
            path.display()
        )));
    }
    let codec = detect_codec(path)?;
    let sha256 = sha256_file(path)?;
    let size = std::fs::metadata(path)?.len();
    let entries = archive_entries(path, codec)?.len();

    let declared_sha256 = std::fs::read_to_string(sidecar_path(path, "sha256"))
        .ok()
        .and_then(|s| s.split_whitespace().next().map(|h| h.to_lowercase()));
    let declared_size = std::fs::read_to_string(sidecar_path(path, "size"))
        .ok()
        .and_then(|s| s.trim().parse().ok());

    Ok(Verification {
        path: path.to_path_buf(),
        codec,
        sha256,
        size,
        declared_sha256,
        declared_size,
        entries,
    })
}
