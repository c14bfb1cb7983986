//! Locating gzip members packed back-to-back inside kernel images.
//!
//! Vendor kernel images carry the kernel and one or more ramdisks as
//! concatenated gzip streams without any length table. Members start on
//! 4-byte boundaries, so the image is scanned in aligned windows for the gzip
//! header and each member is decoded from its offset to the end of the blob.

use std::io::Read;

use flate2::bufread::GzDecoder;

use crate::file_types::{detect_kind, Kind, PROBE_LEN};
use crate::unpack::Outcome;

/// Magic, deflate method and empty flags, as written by the vendor tooling
pub const GZIP_HEADER: [u8; 4] = [0x1f, 0x8b, 0x08, 0x00];

const ALIGNMENT: usize = 4;

/// One gzip member inside a larger blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSegment {
    pub offset: usize,
    /// Compressed length, known once the member has been decoded
    pub length: Option<usize>,
}

/// A decoded member
#[derive(Debug)]
pub struct Part {
    pub segment: StreamSegment,
    pub data: Vec<u8>,
    pub outcome: Outcome,
}

/// Return every 4-byte aligned offset holding a gzip header, ascending
pub fn find_gzip_offsets(blob: &[u8]) -> Vec<usize> {
    blob.chunks_exact(ALIGNMENT)
        .enumerate()
        .filter(|(_, window)| *window == GZIP_HEADER)
        .map(|(i, _)| i * ALIGNMENT)
        .collect()
}

/// Decode one member starting at `offset`, reading through to the end of the blob.
///
/// Bytes following the member are expected (the next member, padding or
/// kernel data) and reported as `TrailingDataOk`. A stream cut short after
/// producing output is tolerated the same way.
pub fn decode_member(blob: &[u8], offset: usize) -> Part {
    let input = blob.get(offset..).unwrap_or(&[]);
    let mut decoder = GzDecoder::new(input);
    let mut data = Vec::new();
    let result = decoder.read_to_end(&mut data);
    let remaining = decoder.into_inner().len();

    let (length, outcome) = match result {
        Ok(_) if remaining == 0 => (Some(input.len()), Outcome::Ok),
        Ok(_) => (Some(input.len() - remaining), Outcome::TrailingDataOk),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && !data.is_empty() => {
            (None, Outcome::TrailingDataOk)
        }
        Err(e) => (None, Outcome::Failed(e.to_string())),
    };

    Part {
        segment: StreamSegment { offset, length },
        data,
        outcome,
    }
}

/// Decode every member found in the blob, in order
pub fn split(blob: &[u8]) -> Vec<Part> {
    let parts: Vec<Part> = find_gzip_offsets(blob)
        .into_iter()
        .map(|offset| decode_member(blob, offset))
        .collect();

    for part in &parts {
        tracing::debug!(
            offset = part.segment.offset,
            compressed = ?part.segment.length,
            decoded = part.data.len(),
            outcome = ?part.outcome,
            "gzip member"
        );
    }
    parts
}

fn last_payload(blob: &[u8]) -> Option<Vec<u8>> {
    split(blob)
        .into_iter()
        .rev()
        .find(|part| !part.data.is_empty())
        .map(|part| part.data)
}

/// Whether a decoded member already is a ramdisk rather than another
/// layer of packed members
fn is_unpackable(data: &[u8]) -> bool {
    let kind = detect_kind(&data[..data.len().min(PROBE_LEN)]);
    matches!(kind, Kind::Cpio | Kind::Ext2 | Kind::Tar | Kind::Ubi)
        || (kind.is_compressed() && kind != Kind::Gzip)
}

/// Recover the initial ramdisk from a kernel image.
///
/// The last decoded member is the ramdisk unless it holds another layer of
/// concatenated members, in which case the last of those is. A member that
/// already sniffs as an archive or filesystem is not searched again, since
/// gzip files stored inside it sit on 4-byte boundaries too. Returns `None`
/// when the image contains no gzip member at all.
pub fn extract_ramdisk(kernel_image: &[u8]) -> Option<Vec<u8>> {
    let outer = last_payload(kernel_image)?;
    if is_unpackable(&outer) {
        return Some(outer);
    }
    match last_payload(&outer) {
        Some(inner) => Some(inner),
        None => Some(outer),
    }
}
