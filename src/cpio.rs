//! cpio "newc" extraction for initial ramdisks.
//!
//! Several archives may follow each other (the kernel accepts that), so after
//! a trailer the zero padding is skipped and extraction continues if another
//! header follows. Anything unparsable once the first entry has been
//! extracted is treated as trailing padding.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, IoContext, Result};
use crate::unpack::{safe_join, Outcome, UnpackReport};

const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

struct Header {
    ino: usize,
    mode: u32,
    nlink: usize,
    file_size: usize,
    dev_major: usize,
    dev_minor: usize,
    name_size: usize,
}

impl Header {
    fn link_key(&self) -> Option<LinkKey> {
        (self.nlink > 1).then_some((self.dev_major, self.dev_minor, self.ino))
    }
}

type LinkKey = (usize, usize, usize);

/// Hardlinked files within one archive.
///
/// `cpio -H newc` writes every name of a multiply linked file, but only the
/// last one carries the data; the earlier ones have a size of zero.
#[derive(Default)]
struct Links {
    /// Path holding the data for an inode
    written: HashMap<LinkKey, PathBuf>,
    /// Names seen before the data arrived
    pending: HashMap<LinkKey, Vec<PathBuf>>,
}

fn parse_hex(field: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(field).ok()?;
    usize::from_str_radix(text, 16).ok()
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn parse_header(data: &[u8]) -> Option<Header> {
    if data.len() < HEADER_LEN || !matches!(&data[0..6], b"070701" | b"070702") {
        return None;
    }
    Some(Header {
        ino: parse_hex(&data[6..14])?,
        mode: parse_hex(&data[14..22])? as u32,
        nlink: parse_hex(&data[38..46])?,
        file_size: parse_hex(&data[54..62])?,
        dev_major: parse_hex(&data[62..70])?,
        dev_minor: parse_hex(&data[70..78])?,
        name_size: parse_hex(&data[94..102])?,
    })
}

/// Extract a newc archive held in memory into `dest`
pub fn extract(data: &[u8], dest: &Path) -> Result<UnpackReport> {
    if data.len() >= 6 && &data[0..6] == b"070707" {
        return Ok(UnpackReport::failed("old portable cpio format is not supported"));
    }

    let mut report = UnpackReport::default();
    let mut offset = 0;
    let mut entries = 0usize;
    let mut links = Links::default();

    while offset < data.len() {
        let header = match parse_header(&data[offset..]) {
            Some(header) => header,
            None if entries > 0 => {
                report.warn(format!("ignoring {} bytes after offset {}", data.len() - offset, offset));
                report.note(Outcome::TrailingDataOk);
                break;
            }
            None => return Err(Error::Extraction("not a newc cpio archive".to_string())),
        };

        let name_start = offset + HEADER_LEN;
        let name_end = name_start + header.name_size;
        let data_start = align4(name_end);
        let data_end = data_start + header.file_size;
        if header.name_size == 0 || data_end > data.len() {
            report.warn(format!("entry at offset {} runs past the end", offset));
            report.note(Outcome::TrailingDataOk);
            break;
        }

        // name_size counts the terminating NUL
        let raw_name = &data[name_start..name_end - 1];
        let name = String::from_utf8_lossy(raw_name).to_string();
        offset = align4(data_end);
        entries += 1;

        if name == TRAILER {
            // inode numbers start over in the next archive
            links = Links::default();
            offset = skip_padding(data, offset);
            continue;
        }

        let content = &data[data_start..data_end];
        if let Err(e) = write_entry(dest, &name, &header, content, &mut links, &mut report) {
            report.warn(format!("{}: {}", name, e));
        }
    }

    Ok(report)
}

fn skip_padding(data: &[u8], mut offset: usize) -> usize {
    while offset < data.len() && data[offset] == 0 {
        offset += 1;
    }
    offset
}

fn write_entry(
    dest: &Path,
    name: &str,
    header: &Header,
    content: &[u8],
    links: &mut Links,
    report: &mut UnpackReport,
) -> Result<()> {
    let mode = header.mode;
    let path = match safe_join(dest, name) {
        Some(path) if path != dest => path,
        Some(_) => return Ok(()),
        None => {
            report.warn(format!("skipped {}: outside destination", name));
            return Ok(());
        }
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context_path("creating", parent)?;
    }

    match mode & S_IFMT {
        S_IFDIR => {
            fs::create_dir_all(&path).context_path("creating", &path)?;
        }
        S_IFREG => {
            remove_existing(&path)?;
            let key = header.link_key();
            if let Some(target) = key.and_then(|k| links.written.get(&k)) {
                link_or_copy(target, &path)?;
                report.files += 1;
                return Ok(());
            }

            fs::write(&path, content).context_path("writing", &path)?;
            set_mode(&path, mode)?;
            report.files += 1;

            if let Some(key) = key {
                if content.is_empty() {
                    links.pending.entry(key).or_default().push(path);
                } else {
                    for earlier in links.pending.remove(&key).unwrap_or_default() {
                        remove_existing(&earlier)?;
                        link_or_copy(&path, &earlier)?;
                    }
                    links.written.insert(key, path);
                }
            }
        }
        S_IFLNK => {
            remove_existing(&path)?;
            let target = String::from_utf8_lossy(content).to_string();
            std::os::unix::fs::symlink(&target, &path).context_path("linking", &path)?;
            report.files += 1;
        }
        _ => report.warn(format!("skipped special file {}", name)),
    }
    Ok(())
}

fn link_or_copy(target: &Path, path: &Path) -> Result<()> {
    if fs::hard_link(target, path).is_err() {
        fs::copy(target, path).context_path("copying", target)?;
    }
    Ok(())
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).context_path("removing", path),
        Ok(_) => fs::remove_file(path).context_path("removing", path),
        Err(_) => Ok(()),
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    // keep the owner able to read and replace what it extracted
    let perms = fs::Permissions::from_mode((mode & 0o7777) | 0o600);
    fs::set_permissions(path, perms).context_path("chmod", path)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    fn push_entry(out: &mut Vec<u8>, ino: usize, name: &str, mode: u32, content: &[u8]) {
        push_linked_entry(out, ino, 1, name, mode, content);
    }

    fn push_linked_entry(
        out: &mut Vec<u8>,
        ino: usize,
        nlink: usize,
        name: &str,
        mode: u32,
        content: &[u8],
    ) {
        let header = format!(
            "070701{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}",
            ino,
            mode,
            0,
            0,
            nlink,
            0,
            content.len(),
            0,
            0,
            0,
            0,
            name.len() + 1,
            0
        );
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(content);
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }

    /// Build a newc archive from `(name, mode, contents)` entries
    pub(crate) fn newc_archive(entries: &[(&str, u32, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, (name, mode, content)) in entries.iter().enumerate() {
            push_entry(&mut out, i + 1, name, *mode, content);
        }
        push_entry(&mut out, 0, TRAILER, 0, b"");
        // block padding as written by cpio(1)
        while out.len() % 512 != 0 {
            out.push(0);
        }
        out
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let archive = newc_archive(&[
            (".", 0o040755, b""),
            ("bin", 0o040755, b""),
            ("bin/busybox", 0o100755, b"\x7fELF busybox"),
            ("bin/sh", 0o120777, b"busybox"),
            ("etc/hostname", 0o100644, b"NAS\n"),
        ]);

        let report = extract(&archive, dir.path()).unwrap();
        assert_eq!(report.outcome, Outcome::Ok);
        assert_eq!(report.files, 3);
        assert_eq!(
            fs::read(dir.path().join("bin/busybox")).unwrap(),
            b"\x7fELF busybox"
        );
        assert_eq!(
            fs::read_link(dir.path().join("bin/sh")).unwrap(),
            Path::new("busybox")
        );
        assert_eq!(fs::read(dir.path().join("etc/hostname")).unwrap(), b"NAS\n");
    }

    #[test]
    fn test_hardlinks_share_data() {
        let dir = TempDir::new().unwrap();
        let mut data = Vec::new();
        push_linked_entry(&mut data, 7, 2, "bin/ls", 0o100755, b"");
        push_linked_entry(&mut data, 7, 2, "bin/dir", 0o100755, b"ELF-coreutils");
        push_linked_entry(&mut data, 9, 2, "sbin/fsck", 0o100755, b"fsck");
        push_linked_entry(&mut data, 9, 2, "sbin/e2fsck", 0o100755, b"");
        push_entry(&mut data, 0, TRAILER, 0, b"");

        let report = extract(&data, dir.path()).unwrap();
        assert_eq!(report.files, 4);
        assert_eq!(fs::read(dir.path().join("bin/ls")).unwrap(), b"ELF-coreutils");
        assert_eq!(fs::read(dir.path().join("bin/dir")).unwrap(), b"ELF-coreutils");
        assert_eq!(fs::read(dir.path().join("sbin/e2fsck")).unwrap(), b"fsck");
    }

    #[test]
    fn test_link_numbers_reset_per_archive() {
        let dir = TempDir::new().unwrap();
        let mut data = Vec::new();
        push_linked_entry(&mut data, 3, 2, "a", 0o100644, b"first");
        push_entry(&mut data, 0, TRAILER, 0, b"");
        push_linked_entry(&mut data, 3, 2, "b", 0o100644, b"second");
        push_entry(&mut data, 0, TRAILER, 0, b"");

        extract(&data, dir.path()).unwrap();
        assert_eq!(fs::read(dir.path().join("a")).unwrap(), b"first");
        assert_eq!(fs::read(dir.path().join("b")).unwrap(), b"second");
    }

    #[test]
    fn test_concatenated_archives() {
        let dir = TempDir::new().unwrap();
        let mut data = newc_archive(&[("early/ucode.bin", 0o100644, b"ucode")]);
        data.extend(newc_archive(&[("init", 0o100755, b"init")]));

        let report = extract(&data, dir.path()).unwrap();
        assert_eq!(report.files, 2);
        assert!(dir.path().join("early/ucode.bin").is_file());
        assert!(dir.path().join("init").is_file());
    }

    #[test]
    fn test_trailing_garbage_tolerated() {
        let dir = TempDir::new().unwrap();
        let mut data = newc_archive(&[("sbin/init", 0o100755, b"init")]);
        data.extend_from_slice(b"\xde\xad\xbe\xef garbage from the flash image");

        let report = extract(&data, dir.path()).unwrap();
        assert_eq!(report.outcome, Outcome::TrailingDataOk);
        assert!(report.outcome.is_success());
        assert!(dir.path().join("sbin/init").is_file());
    }

    #[test]
    fn test_truncated_entry_tolerated() {
        let dir = TempDir::new().unwrap();
        let mut data = Vec::new();
        push_entry(&mut data, 1, "a", 0o100644, b"aaaa");
        push_entry(&mut data, 2, "b", 0o100644, &[b'b'; 64]);
        data.truncate(data.len() - 32);

        let report = extract(&data, dir.path()).unwrap();
        assert_eq!(report.outcome, Outcome::TrailingDataOk);
        assert_eq!(report.files, 1);
        assert!(!dir.path().join("b").exists());
    }

    #[test]
    fn test_not_cpio() {
        let dir = TempDir::new().unwrap();
        assert!(extract(b"definitely not cpio data", dir.path()).is_err());
    }

    #[test]
    fn test_path_escape_skipped() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let archive = newc_archive(&[("../evil", 0o100644, b"x"), ("ok", 0o100644, b"y")]);

        let report = extract(&archive, &root).unwrap();
        assert_eq!(report.files, 1);
        assert!(!dir.path().join("evil").exists());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_special_files_skipped() {
        let dir = TempDir::new().unwrap();
        let archive = newc_archive(&[("dev/console", 0o020600, b"")]);
        let report = extract(&archive, dir.path()).unwrap();
        assert_eq!(report.files, 0);
        assert!(report.warnings[0].contains("dev/console"));
    }
}
