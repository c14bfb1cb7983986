//! Unpacking containers into a destination directory.
//!
//! Decoding itself is left to the codec crates and the mounter; this module
//! owns staging, cleanup and turning partial failures into warnings.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tar::Archive;
use tempfile::TempDir;

use crate::cpio;
use crate::error::{Error, IoContext, Result};
use crate::file_types::{classify, kind_name, Kind};
use crate::mount::{BlockDeviceMounter, FlashGuard, FsType, MountGuard};

/// Compression layers peeled off before giving up on `Container::Auto`
const MAX_LAYERS: usize = 3;

/// Result of a single decode or unpack primitive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    /// Extra bytes or a cut-off stream after usable output
    TrailingDataOk,
    Failed(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Outcome::Failed(_))
    }

    fn severity(&self) -> u8 {
        match self {
            Outcome::Ok => 0,
            Outcome::TrailingDataOk => 1,
            Outcome::Failed(_) => 2,
        }
    }
}

/// What an unpack produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackReport {
    pub files: usize,
    pub warnings: Vec<String>,
    pub outcome: Outcome,
}

impl Default for UnpackReport {
    fn default() -> Self {
        Self {
            files: 0,
            warnings: Vec::new(),
            outcome: Outcome::Ok,
        }
    }
}

impl UnpackReport {
    pub fn failed(reason: impl Into<String>) -> Self {
        let mut report = Self::default();
        report.note(Outcome::Failed(reason.into()));
        report
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Keep the worst outcome seen so far
    pub fn note(&mut self, outcome: Outcome) {
        if let Outcome::Failed(reason) = &outcome {
            self.warnings.push(reason.clone());
        }
        if outcome.severity() > self.outcome.severity() {
            self.outcome = outcome;
        }
    }

    pub fn absorb(&mut self, other: UnpackReport) {
        self.files += other.files;
        self.warnings.extend(other.warnings);
        if other.outcome.severity() > self.outcome.severity() {
            self.outcome = other.outcome;
        }
    }
}

/// How a file should be unpacked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Tar,
    /// Tar under gzip, bzip2, LZMA or xz; the compression is sniffed
    CompressedTar,
    Cpio,
    Ext2,
    Ubi,
    /// Peel compression layers, then dispatch on what is underneath
    Auto,
}

/// Join an archive member name onto `root`, rejecting escapes
pub fn safe_join(root: &Path, name: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Wrap a reader in the decoder matching `kind`
pub fn open_decoder<'r, R: BufRead + 'r>(kind: Kind, reader: R) -> Result<Box<dyn Read + 'r>> {
    Ok(match kind {
        Kind::Gzip => Box::new(flate2::bufread::MultiGzDecoder::new(reader)),
        Kind::Bzip2Stream => Box::new(bzip2::bufread::BzDecoder::new(reader)),
        Kind::XzStream => Box::new(xz2::bufread::XzDecoder::new(reader)),
        Kind::LzmaStream => {
            let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX)
                .map_err(|e| Error::Extraction(format!("lzma decoder: {}", e)))?;
            Box::new(xz2::bufread::XzDecoder::new_stream(reader, stream))
        }
        other => {
            return Err(Error::Extraction(format!(
                "{} is not a compressed stream",
                kind_name(&other)
            )))
        }
    })
}

/// Decode a compressed file into `dst`.
///
/// A stream that ends early after producing output is tolerated.
pub fn decode_to_file(kind: Kind, src: &Path, dst: &Path) -> Result<Outcome> {
    let input = BufReader::new(File::open(src).context_path("opening", src)?);
    let mut decoder = open_decoder(kind, input)?;
    let mut out = File::create(dst).context_path("creating", dst)?;

    match io::copy(&mut decoder, &mut out) {
        Ok(_) => Ok(Outcome::Ok),
        Err(e) => {
            let written = out.metadata().map(|m| m.len()).unwrap_or(0);
            if written > 0 && e.kind() == io::ErrorKind::UnexpectedEof {
                Ok(Outcome::TrailingDataOk)
            } else {
                Ok(Outcome::Failed(format!(
                    "decoding {}: {} after {} bytes",
                    src.display(),
                    e,
                    written
                )))
            }
        }
    }
}

/// Extract a tar stream entry by entry.
///
/// Entries that fail are reported and skipped; a corrupt header ends the
/// walk but keeps everything extracted before it.
pub fn unpack_tar<R: Read>(reader: R, dest: &Path) -> UnpackReport {
    let mut report = UnpackReport::default();
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(e) => return UnpackReport::failed(format!("reading tar: {}", e)),
    };

    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                report.warn(format!("tar stream ends early: {}", e));
                report.note(Outcome::TrailingDataOk);
                break;
            }
        };
        let name = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
        let is_dir = entry.header().entry_type().is_dir();
        match entry.unpack_in(dest) {
            Ok(true) if !is_dir => report.files += 1,
            Ok(true) => {}
            Ok(false) => report.warn(format!("skipped {}: outside destination", name)),
            Err(e) => report.warn(format!("{}: {}", name, e)),
        }
    }

    report
}

/// Extract only the regular files of a gzip tar whose file name matches,
/// flattened into `dest`
pub fn extract_matching(
    tgz: &Path,
    dest: &Path,
    matches: impl Fn(&str) -> bool,
) -> Result<UnpackReport> {
    fs::create_dir_all(dest).context_path("creating", dest)?;
    let input = BufReader::new(File::open(tgz).context_path("opening", tgz)?);
    let mut archive = Archive::new(flate2::bufread::MultiGzDecoder::new(input));
    let mut report = UnpackReport::default();

    let entries = archive.entries().context_path("reading", tgz)?;
    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                report.warn(format!("{}: {}", tgz.display(), e));
                report.note(Outcome::TrailingDataOk);
                break;
            }
        };
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let file_name = match entry.path() {
            Ok(path) => match path.file_name() {
                Some(name) => name.to_string_lossy().to_string(),
                None => continue,
            },
            Err(_) => continue,
        };
        if !matches(&file_name) {
            continue;
        }
        match entry.unpack(dest.join(&file_name)) {
            Ok(_) => report.files += 1,
            Err(e) => report.warn(format!("{}: {}", file_name, e)),
        }
    }

    Ok(report)
}

/// Copy a mounted tree into `dst`, keeping symlinks.
///
/// Unreadable entries and special files become warnings.
pub fn copy_tree(src: &Path, dst: &Path) -> UnpackReport {
    let mut report = UnpackReport::default();
    if let Err(e) = fs::create_dir_all(dst) {
        return UnpackReport::failed(format!("creating {}: {}", dst.display(), e));
    }
    copy_dir(src, dst, &mut report);
    report
}

fn copy_dir(src: &Path, dst: &Path, report: &mut UnpackReport) {
    let entries = match fs::read_dir(src) {
        Ok(entries) => entries,
        Err(e) => {
            report.warn(format!("{}: {}", src.display(), e));
            return;
        }
    };

    for entry in entries.flatten() {
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if let Err(e) = copy_entry(&from, &to, report) {
            report.warn(format!("{}: {}", from.display(), e));
        }
    }
}

fn copy_entry(from: &Path, to: &Path, report: &mut UnpackReport) -> io::Result<()> {
    let meta = fs::symlink_metadata(from)?;
    let file_type = meta.file_type();

    if file_type.is_dir() {
        fs::create_dir_all(to)?;
        copy_dir(from, to, report);
    } else if file_type.is_symlink() {
        let target = fs::read_link(from)?;
        if fs::symlink_metadata(to).is_ok() {
            fs::remove_file(to)?;
        }
        std::os::unix::fs::symlink(target, to)?;
        report.files += 1;
    } else if file_type.is_file() {
        if fs::symlink_metadata(to).is_ok() {
            fs::remove_file(to)?;
        }
        fs::copy(from, to)?;
        report.files += 1;
    } else {
        report.warn(format!("skipped special file {}", from.display()));
    }
    Ok(())
}

/// Unpacks containers, staging intermediate files under a scratch root
pub struct Unpacker<'a> {
    mounter: &'a dyn BlockDeviceMounter,
    scratch_root: PathBuf,
}

impl<'a> Unpacker<'a> {
    pub fn new(mounter: &'a dyn BlockDeviceMounter, scratch_root: &Path) -> Self {
        Self {
            mounter,
            scratch_root: scratch_root.to_path_buf(),
        }
    }

    /// A fresh directory removed when the returned value is dropped
    pub fn scratch(&self) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix("stage")
            .tempdir_in(&self.scratch_root)
            .context_path("creating scratch directory in", &self.scratch_root)
    }

    pub fn unpack(&self, path: &Path, container: Container, dest: &Path) -> Result<UnpackReport> {
        fs::create_dir_all(dest).context_path("creating", dest)?;

        let report = match container {
            Container::Tar => {
                let file = File::open(path).context_path("opening", path)?;
                unpack_tar(BufReader::new(file), dest)
            }
            Container::CompressedTar => self.unpack_compressed_tar(path, dest)?,
            Container::Cpio => {
                let data = fs::read(path).context_path("reading", path)?;
                cpio::extract(&data, dest)?
            }
            Container::Ext2 => self.unpack_filesystem(path, FsType::Ext2, dest)?,
            Container::Ubi => self.unpack_ubi(path, dest)?,
            Container::Auto => self.unpack_auto(path, dest)?,
        };

        tracing::debug!(
            path = %path.display(),
            dest = %dest.display(),
            ?container,
            files = report.files,
            warnings = report.warnings.len(),
            "unpacked"
        );
        Ok(report)
    }

    fn unpack_compressed_tar(&self, path: &Path, dest: &Path) -> Result<UnpackReport> {
        let kind = classify(path);
        let file = BufReader::new(File::open(path).context_path("opening", path)?);
        match kind {
            Kind::Tar => Ok(unpack_tar(file, dest)),
            k if k.is_compressed() => Ok(unpack_tar(open_decoder(k, file)?, dest)),
            other => Ok(UnpackReport::failed(format!(
                "{} holds {}, not a tar stream",
                path.display(),
                kind_name(&other)
            ))),
        }
    }

    fn unpack_auto(&self, path: &Path, dest: &Path) -> Result<UnpackReport> {
        let staging = self.scratch()?;
        let mut report = UnpackReport::default();
        let mut current = path.to_path_buf();
        let mut kind = classify(&current);

        let mut depth = 0;
        while kind.is_compressed() {
            if depth == MAX_LAYERS {
                report.note(Outcome::Failed(format!(
                    "{} still compressed after {} layers",
                    path.display(),
                    MAX_LAYERS
                )));
                return Ok(report);
            }
            let next = staging.path().join(format!("layer{}", depth));
            report.note(decode_to_file(kind, &current, &next)?);
            current = next;
            kind = classify(&current);
            depth += 1;
        }

        let inner = match kind {
            Kind::Tar => Container::Tar,
            Kind::Cpio => Container::Cpio,
            Kind::Ext2 => Container::Ext2,
            Kind::Ubi => Container::Ubi,
            other => {
                report.note(Outcome::Failed(format!(
                    "{} decodes to {}, nothing to unpack",
                    path.display(),
                    kind_name(&other)
                )));
                return Ok(report);
            }
        };
        report.absorb(self.unpack(&current, inner, dest)?);
        Ok(report)
    }

    fn unpack_filesystem(&self, image: &Path, fs: FsType, dest: &Path) -> Result<UnpackReport> {
        let mount_point = self.scratch()?;
        let guard = MountGuard::mount(self.mounter, image, fs, mount_point.path())?;
        let report = copy_tree(guard.path(), dest);
        drop(guard);
        Ok(report)
    }

    fn unpack_ubi(&self, image: &Path, dest: &Path) -> Result<UnpackReport> {
        let flash = FlashGuard::provision(self.mounter, image)?;
        let report = self.unpack_filesystem(flash.volume(), FsType::Ubifs, dest);
        drop(flash);
        report
    }
}
