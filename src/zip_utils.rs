use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use zip::read::ZipArchive;

use crate::error::{Error, IoContext, Result};

const EOCD_MAGIC: &[u8; 4] = b"PK\x05\x06";
const EOCD_LEN: usize = 22;

/// Slice the data to include only up to the end of the ZIP's EOCD record.
/// Returns None if no valid EOCD marker is found
pub fn slice_to_eocd(data: &[u8]) -> Option<&[u8]> {
    let last = data.len().checked_sub(EOCD_LEN)?;
    let pos = (0..=last).rev().find(|&i| &data[i..i + 4] == EOCD_MAGIC)?;
    let comment_len = u16::from_le_bytes([data[pos + 20], data[pos + 21]]) as usize;
    let end = (pos + EOCD_LEN + comment_len).min(data.len());
    Some(&data[..end])
}

/// Name of the member holding the firmware image: the first `.img`, else the
/// first regular file
fn pick_image(names: &[String]) -> Option<&str> {
    names
        .iter()
        .find(|n| n.to_ascii_lowercase().ends_with(".img"))
        .or_else(|| names.iter().find(|n| !n.ends_with('/')))
        .map(String::as_str)
}

/// Extract the firmware image from a vendor download bundle into `dest_dir`
pub fn extract_firmware_image(bundle: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let data = fs::read(bundle).context_path("reading", bundle)?;
    let zip_slice = slice_to_eocd(&data).ok_or_else(|| {
        Error::Extraction(format!("{}: no ZIP end of central directory", bundle.display()))
    })?;
    let mut archive = ZipArchive::new(Cursor::new(zip_slice))?;

    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    let name = pick_image(&names)
        .ok_or_else(|| Error::Extraction(format!("{}: empty ZIP bundle", bundle.display())))?
        .to_string();

    let file_name = Path::new(&name)
        .file_name()
        .ok_or_else(|| Error::Extraction(format!("bad member name {}", name)))?;
    let out_path = dest_dir.join(file_name);

    let mut member = archive.by_name(&name)?;
    let mut out = File::create(&out_path).context_path("creating", &out_path)?;
    io::copy(&mut member, &mut out).context_path("extracting", &out_path)?;

    tracing::info!(bundle = %bundle.display(), member = %name, "extracted firmware image");
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn eocd(comment: &[u8]) -> Vec<u8> {
        let mut record = EOCD_MAGIC.to_vec();
        record.extend_from_slice(&[0u8; 16]);
        record.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        record.extend_from_slice(comment);
        record
    }

    fn bundle(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in members {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_slice_drops_trailing_bytes() {
        let mut data = b"PK\x03\x04".to_vec();
        data.extend_from_slice(&[0u8; 40]);
        data.extend(eocd(b"fw"));
        let expected = data.len();
        data.extend_from_slice(b"appended signature block");

        assert_eq!(slice_to_eocd(&data).unwrap().len(), expected);
    }

    #[test]
    fn test_slice_uses_last_marker() {
        let mut data = eocd(b"");
        data.extend_from_slice(&[0xffu8; 30]);
        data.extend(eocd(b""));
        assert_eq!(slice_to_eocd(&data).unwrap().len(), data.len());
    }

    #[test]
    fn test_slice_not_found() {
        assert!(slice_to_eocd(b"This is not a ZIP file at all").is_none());
        assert!(slice_to_eocd(b"PK\x05\x06short").is_none());
    }

    #[test]
    fn test_pick_image() {
        let names = vec!["README.txt".to_string(), "TS-X51_20200101.IMG".to_string()];
        assert_eq!(pick_image(&names), Some("TS-X51_20200101.IMG"));

        let names = vec!["docs/".to_string(), "firmware.bin".to_string()];
        assert_eq!(pick_image(&names), Some("firmware.bin"));
        assert_eq!(pick_image(&[]), None);
    }

    #[test]
    fn test_extract_firmware_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("TS-X51_20200101-4.4.1.zip");
        let mut data = bundle(&[
            ("release_notes.txt", b"notes"),
            ("TS-X51_20200101-4.4.1.img", &[0x5au8; 256]),
        ]);
        data.extend_from_slice(b"trailing vendor bytes");
        fs::write(&path, data).unwrap();

        let image = extract_firmware_image(&path, dir.path()).unwrap();
        assert_eq!(image, dir.path().join("TS-X51_20200101-4.4.1.img"));
        assert_eq!(fs::read(&image).unwrap(), vec![0x5au8; 256]);
    }

    #[test]
    fn test_extract_rejects_non_zip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.zip");
        fs::write(&path, b"PK\x03\x04 but nothing else").unwrap();
        assert!(extract_firmware_image(&path, dir.path()).is_err());
    }
}
