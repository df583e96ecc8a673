//! cpio "newc" archives, the format the kernel unpacks into the initial
//! root filesystem.
//!
//! Each entry is a 110-byte ASCII header (the `070701` magic followed by
//! thirteen 8-digit hex fields), a NUL-terminated name padded to four
//! bytes, and the file data padded to four bytes. An entry named
//! `TRAILER!!!` ends the archive.

use std::io::{self, Read, Write};

use thinboot_core::error::{Result, ThinbootError};

const MAGIC: &[u8; 6] = b"070701";
const HEADER_LEN: usize = 110;
const TRAILER_NAME: &str = "TRAILER!!!";

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFCHR: u32 = 0o020000;

/// Metadata of one archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: String,
    pub ino: u32,
    /// File type and permission bits, as in `st_mode`.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub size: u32,
    pub rdev_major: u32,
    pub rdev_minor: u32,
}

impl EntryHeader {
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_char_device(&self) -> bool {
        self.mode & S_IFMT == S_IFCHR
    }
}

/// A decoded member: header plus file data (the link target for symlinks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub header: EntryHeader,
    pub data: Vec<u8>,
}

fn pad_len(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Streams entries into a newc archive with root ownership and a zero
/// mtime, numbering inodes in write order.
pub struct NewcWriter<W: Write> {
    inner: W,
    next_ino: u32,
}

impl<W: Write> NewcWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, next_ino: 1 }
    }

    fn write_header(&mut self, name: &str, mode: u32, size: u32, rdev: (u32, u32)) -> io::Result<()> {
        let ino = if name == TRAILER_NAME {
            0
        } else {
            let ino = self.next_ino;
            self.next_ino += 1;
            ino
        };
        let nlink = if mode & S_IFMT == S_IFDIR { 2 } else { 1 };
        let namesize = name.len() as u32 + 1;
        let fields = [ino, mode, 0, 0, nlink, 0, size, 0, 0, rdev.0, rdev.1, namesize, 0];

        let mut header = Vec::with_capacity(HEADER_LEN + name.len() + 4);
        header.extend_from_slice(MAGIC);
        for field in fields {
            header.extend_from_slice(format!("{:08X}", field).as_bytes());
        }
        header.extend_from_slice(name.as_bytes());
        header.push(0);
        header.resize(header.len() + pad_len(header.len()), 0);
        self.inner.write_all(&header)
    }

    fn write_padding(&mut self, len: usize) -> io::Result<()> {
        self.inner.write_all(&[0u8; 3][..pad_len(len)])
    }

    /// Append an entry whose data is held in memory.
    pub fn append(&mut self, name: &str, mode: u32, data: &[u8]) -> io::Result<()> {
        let size = u32::try_from(data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("{} exceeds 4 GiB", name)))?;
        self.write_header(name, mode, size, (0, 0))?;
        self.inner.write_all(data)?;
        self.write_padding(data.len())
    }

    /// Append an entry streaming exactly `size` bytes from `reader`.
    pub fn append_reader<R: Read>(&mut self, name: &str, mode: u32, size: u64, reader: R) -> io::Result<()> {
        let size32 = u32::try_from(size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("{} exceeds 4 GiB", name)))?;
        self.write_header(name, mode, size32, (0, 0))?;
        let copied = io::copy(&mut reader.take(size), &mut self.inner)?;
        if copied != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank while archiving ({} of {} bytes)", name, copied, size),
            ));
        }
        self.write_padding(size as usize)
    }

    /// Append a character device node.
    pub fn append_char_device(&mut self, name: &str, perm: u32, major: u32, minor: u32) -> io::Result<()> {
        self.write_header(name, S_IFCHR | (perm & 0o7777), 0, (major, minor))
    }

    /// Write the trailer and hand back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_header(TRAILER_NAME, 0, 0, (0, 0))?;
        Ok(self.inner)
    }
}

/// Iterates the entries of a newc archive up to its trailer.
pub struct NewcReader<R: Read> {
    inner: R,
    done: bool,
}

impl<R: Read> NewcReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, done: false }
    }

    fn skip_padding(&mut self, len: usize) -> io::Result<()> {
        let mut pad = [0u8; 3];
        self.inner.read_exact(&mut pad[..pad_len(len)])
    }

    fn read_entry(&mut self) -> Result<Option<Entry>> {
        let mut raw = [0u8; HEADER_LEN];
        self.inner.read_exact(&mut raw).map_err(|e| corrupt(format!("truncated header: {}", e)))?;
        if &raw[..6] != MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        let mut fields = [0u32; 13];
        for (i, field) in fields.iter_mut().enumerate() {
            let start = 6 + i * 8;
            let digits = std::str::from_utf8(&raw[start..start + 8]).map_err(|_| corrupt("non-ASCII header".to_string()))?;
            *field = u32::from_str_radix(digits, 16).map_err(|_| corrupt(format!("bad header field {:?}", digits)))?;
        }

        let namesize = fields[11] as usize;
        if namesize == 0 {
            return Err(corrupt("empty name".to_string()));
        }
        let mut name = vec![0u8; namesize];
        self.inner.read_exact(&mut name).map_err(|e| corrupt(format!("truncated name: {}", e)))?;
        self.skip_padding(HEADER_LEN + namesize)?;
        name.pop();
        let name = String::from_utf8(name).map_err(|_| corrupt("name is not UTF-8".to_string()))?;
        if name == TRAILER_NAME {
            return Ok(None);
        }

        let size = fields[6] as usize;
        let mut data = vec![0u8; size];
        self.inner
            .read_exact(&mut data)
            .map_err(|e| corrupt(format!("truncated data for {}: {}", name, e)))?;
        self.skip_padding(size)?;

        Ok(Some(Entry {
            header: EntryHeader {
                name,
                ino: fields[0],
                mode: fields[1],
                uid: fields[2],
                gid: fields[3],
                nlink: fields[4],
                mtime: fields[5],
                size: fields[6],
                rdev_major: fields[9],
                rdev_minor: fields[10],
            },
            data,
        }))
    }
}

fn corrupt(reason: String) -> ThinbootError {
    ThinbootError::PackageError(format!("Corrupt cpio archive: {}", reason))
}

impl<R: Read> Iterator for NewcReader<R> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
