use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tar::{Archive, EntryType};

use crate::error::{IoContext, Result};
use crate::unpack::{Outcome, UnpackReport};

/// Print a hexdump preview of data with indentation
pub fn print_hexdump_preview_indented(data: &[u8], max_lines: usize, indent: &str) {
    for (line, chunk) in data.chunks(16).take(max_lines).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        println!("{}  {:08x}  {:<48} |{}|", indent, line * 16, hex.join(" "), ascii);
    }

    if data.len() > max_lines * 16 {
        println!("{}  ... ({} more bytes)", indent, data.len() - max_lines * 16);
    }
}

/// One node of a directory tree, relative to the walked root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: PathBuf,
    pub is_file: bool,
    pub is_dir: bool,
    pub size: u64,
    pub mode: u32,
    pub link_target: Option<PathBuf>,
}

/// Walk `root` without following symlinks, sorted by path.
/// A missing root yields an empty list.
pub fn collect_tree(root: &Path) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    if root.is_dir() {
        walk(root, Path::new(""), &mut entries);
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// Unreadable directories are logged and skipped
fn walk(root: &Path, rel: &Path, out: &mut Vec<TreeEntry>) {
    let dir = root.join(rel);
    let listing = match fs::read_dir(&dir) {
        Ok(listing) => listing,
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "cannot list");
            return;
        }
    };
    for entry in listing {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "cannot list");
                continue;
            }
        };
        let rel_path = rel.join(entry.file_name());
        let meta = match fs::symlink_metadata(entry.path()) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "cannot stat");
                continue;
            }
        };
        let file_type = meta.file_type();
        out.push(TreeEntry {
            path: rel_path.clone(),
            is_file: file_type.is_file(),
            is_dir: file_type.is_dir(),
            size: meta.len(),
            mode: meta.permissions().mode(),
            link_target: if file_type.is_symlink() {
                fs::read_link(entry.path()).ok()
            } else {
                None
            },
        });
        if file_type.is_dir() {
            walk(root, &rel_path, out);
        }
    }
}

/// `ls -l` style mode column from a full `st_mode`
pub fn mode_string(mode: u32) -> String {
    let kind = match mode & 0o170000 {
        0o040000 => 'd',
        0o120000 => 'l',
        0o020000 => 'c',
        0o060000 => 'b',
        0o010000 => 'p',
        0o140000 => 's',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

fn tar_type_bits(entry_type: EntryType) -> u32 {
    match entry_type {
        EntryType::Directory => 0o040000,
        EntryType::Symlink => 0o120000,
        EntryType::Char => 0o020000,
        EntryType::Block => 0o060000,
        EntryType::Fifo => 0o010000,
        _ => 0o100000,
    }
}

/// Write the recursive listing of `root` to `out`, returning the entry count
pub fn write_tree_manifest(root: &Path, out: &Path) -> Result<usize> {
    let entries = collect_tree(root)?;
    let file = File::create(out).context_path("creating", out)?;
    let mut writer = BufWriter::new(file);

    for entry in &entries {
        let mut line = format!(
            "{} {:>10} {}",
            mode_string(entry.mode),
            entry.size,
            entry.path.display()
        );
        if entry.is_dir {
            line.push('/');
        }
        if let Some(target) = &entry.link_target {
            line.push_str(&format!(" -> {}", target.display()));
        }
        writeln!(writer, "{}", line).context_path("writing", out)?;
    }
    writer.flush().context_path("writing", out)?;
    Ok(entries.len())
}

/// List the members of a gzip tar into `out` (`tar tzv` style)
pub fn write_tar_listing(tgz: &Path, out: &Path) -> Result<UnpackReport> {
    let input = BufReader::new(File::open(tgz).context_path("opening", tgz)?);
    let mut archive = Archive::new(flate2::bufread::MultiGzDecoder::new(input));
    let mut writer = BufWriter::new(File::create(out).context_path("creating", out)?);
    let mut report = UnpackReport::default();

    for entry in archive.entries().context_path("reading", tgz)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                report.warn(format!("{}: {}", tgz.display(), e));
                report.note(Outcome::TrailingDataOk);
                break;
            }
        };
        let header = entry.header();
        let mode = header.mode().unwrap_or(0) | tar_type_bits(header.entry_type());
        let path = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "<invalid path>".to_string());
        let mut line = format!("{} {:>10} {}", mode_string(mode), entry.size(), path);
        if let Ok(Some(target)) = entry.link_name() {
            line.push_str(&format!(" -> {}", target.display()));
        }
        writeln!(writer, "{}", line).context_path("writing", out)?;
        report.files += 1;
    }

    writer.flush().context_path("writing", out)?;
    Ok(report)
}
