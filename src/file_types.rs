use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Bytes read from the start of a file when sniffing
pub const PROBE_LEN: usize = 4096;

const EXT2_MAGIC_OFFSET: usize = 1080;
const TAR_MAGIC_OFFSET: usize = 257;

/// Kind of data detected in a firmware layer
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Kind {
    Unknown,
    Encrypted, // opaque binary, candidate ciphertext
    Gzip,
    Ext2,
    Ubi,
    Directory,
    Tar,
    Cpio,
    LzmaStream,
    Bzip2Stream,
    XzStream,
    Zip,
}

impl Kind {
    /// Compression wrappers that hide another container
    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            Kind::Gzip | Kind::Bzip2Stream | Kind::LzmaStream | Kind::XzStream
        )
    }
}

/// Detect the kind of a buffer based on magic bytes
pub fn detect_kind(data: &[u8]) -> Kind {
    if data.len() < 4 {
        return Kind::Unknown;
    }

    if &data[0..4] == b"PK\x03\x04" {
        return Kind::Zip;
    }

    if data[0..2] == [0x1f, 0x8b] {
        return Kind::Gzip;
    }

    if &data[0..3] == b"BZh" && (b'1'..=b'9').contains(&data[3]) {
        return Kind::Bzip2Stream;
    }

    if data.len() >= 6 && data[0..6] == [0xfd, b'7', b'z', b'X', b'Z', 0x00] {
        return Kind::XzStream;
    }

    // lzma_alone: properties byte, then a little-endian dictionary size
    if data[0..3] == [0x5d, 0x00, 0x00] {
        return Kind::LzmaStream;
    }

    if &data[0..4] == b"UBI#" {
        return Kind::Ubi;
    }

    if data.len() >= 6 && matches!(&data[0..6], b"070701" | b"070702" | b"070707") {
        return Kind::Cpio;
    }

    if data.len() >= TAR_MAGIC_OFFSET + 5
        && &data[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar"
    {
        return Kind::Tar;
    }

    if data.len() >= EXT2_MAGIC_OFFSET + 2
        && data[EXT2_MAGIC_OFFSET..EXT2_MAGIC_OFFSET + 2] == [0x53, 0xef]
    {
        return Kind::Ext2;
    }

    if looks_like_text(data) {
        return Kind::Unknown;
    }

    Kind::Encrypted
}

/// Text without NULs; a multibyte sequence cut off by the probe still counts
fn looks_like_text(data: &[u8]) -> bool {
    if data.contains(&0) {
        return false;
    }
    match std::str::from_utf8(data) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}

/// Classify a path on disk. Never fails: unreadable input is `Unknown`.
pub fn classify(path: &Path) -> Kind {
    classify_window(path, 0)
}

fn classify_window(path: &Path, offset: u64) -> Kind {
    if path.is_dir() {
        return Kind::Directory;
    }
    match read_prefix(path, offset, PROBE_LEN) {
        Ok(prefix) => detect_kind(&prefix),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "probe failed");
            Kind::Unknown
        }
    }
}

/// Read up to `len` bytes starting at `offset`
pub fn read_prefix(path: &Path, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// An immutable view of firmware bytes on disk together with its detected kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareBlob {
    pub path: PathBuf,
    pub offset: u64,
    pub length: Option<u64>,
    pub kind: Kind,
}

impl FirmwareBlob {
    pub fn open(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            offset: 0,
            length: None,
            kind: classify(path),
        }
    }

    /// A sub-range of this blob, classified on its own
    pub fn window(&self, offset: u64, length: Option<u64>) -> Self {
        let start = self.offset + offset;
        Self {
            path: self.path.clone(),
            offset: start,
            length,
            kind: classify_window(&self.path, start),
        }
    }

    /// Read the bytes covered by this blob
    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        match self.length {
            Some(len) => file.take(len).read_to_end(&mut buf)?,
            None => file.read_to_end(&mut buf)?,
        };
        Ok(buf)
    }

    /// Whether the blob starts with `magic`
    pub fn starts_with(&self, magic: &[u8]) -> bool {
        read_prefix(&self.path, self.offset, magic.len())
            .map(|prefix| prefix == magic)
            .unwrap_or(false)
    }
}

/// Get a human-readable name for a kind
pub fn kind_name(kind: &Kind) -> &'static str {
    match kind {
        Kind::Unknown => "Unknown",
        Kind::Encrypted => "Encrypted Data",
        Kind::Gzip => "Gzip Compressed",
        Kind::Ext2 => "Ext2 Filesystem Image",
        Kind::Ubi => "UBI Image",
        Kind::Directory => "Directory",
        Kind::Tar => "Tar Archive",
        Kind::Cpio => "Cpio Archive",
        Kind::LzmaStream => "LZMA Compressed",
        Kind::Bzip2Stream => "Bzip2 Compressed",
        Kind::XzStream => "XZ Compressed",
        Kind::Zip => "ZIP Archive",
    }
}
