//! Segment files: naming, classification, and crash-safe reading.
//!
//! An *open* segment (`open-<counter>`) is preallocated and zero-filled, and is the only kind of
//! segment ever written to. A *closed* segment (`<first>-<last>`) is an open segment which was
//! sealed: truncated to its content, renamed after the inclusive raft-index range it covers, and
//! never touched again.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use rafter::StorageError;

use crate::codec;
use crate::codec::DecodedBatch;
use crate::codec::DiskEntry;

/// A classified segment file name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SegmentFile {
    Open { counter: u64 },
    Closed { first: u64, last: u64 },
}

pub fn open_filename(counter: u64) -> String {
    format!("open-{}", counter)
}

pub fn closed_filename(first: u64, last: u64) -> String {
    format!("{:016}-{:016}", first, last)
}

/// Parse a file name into a segment classification; `None` for non-segment files.
pub fn parse_filename(name: &str) -> Option<SegmentFile> {
    if let Some(rest) = name.strip_prefix("open-") {
        let counter = rest.parse::<u64>().ok()?;
        return Some(SegmentFile::Open { counter });
    }
    let mut parts = name.splitn(2, '-');
    let first = parts.next()?.parse::<u64>().ok()?;
    let last = parts.next()?.parse::<u64>().ok()?;
    if first == 0 || last < first {
        return None;
    }
    Some(SegmentFile::Closed { first, last })
}

/// List all segment files in the directory.
pub fn list_segments(dir: &Path) -> Result<Vec<(SegmentFile, PathBuf)>, StorageError> {
    let mut out = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        if let Some(segment) = parse_filename(name) {
            out.push((segment, dirent.path()));
        }
    }
    Ok(out)
}

/// Read and validate a closed segment.
///
/// Every batch must decode cleanly and the entry count must match the range encoded in the file
/// name; closed segments are immutable, so anything else is corruption, not a torn write.
pub fn read_closed_segment(path: &Path, first: u64, last: u64) -> Result<Vec<DiskEntry>, StorageError> {
    let buf = fs::read(path)?;
    let header_first = codec::decode_segment_header(&buf)?
        .ok_or_else(|| StorageError::Corrupt(format!("closed segment {:?} has an empty header", path)))?;
    if header_first != first {
        return Err(StorageError::Corrupt(format!(
            "closed segment {:?} header claims first index {}, file name says {}",
            path, header_first, first
        )));
    }

    let expected = (last - first + 1) as usize;
    let mut entries = Vec::with_capacity(expected);
    let mut at = codec::SEGMENT_HEADER_LEN as usize;
    while at < buf.len() {
        match codec::decode_batch(&buf[at..]) {
            DecodedBatch::Batch(batch, consumed) => {
                entries.extend(batch);
                at += consumed;
            }
            DecodedBatch::End => break,
            DecodedBatch::Invalid => {
                return Err(StorageError::Corrupt(format!("closed segment {:?} has an invalid batch", path)));
            }
        }
    }

    if entries.len() != expected {
        return Err(StorageError::Corrupt(format!(
            "closed segment {:?} holds {} entries, file name promises {}",
            path,
            entries.len(),
            expected
        )));
    }
    Ok(entries)
}

/// The usable content recovered from an open segment.
pub struct OpenSegmentContent {
    /// The raft index of the first recovered entry.
    pub first_index: u64,
    pub entries: Vec<DiskEntry>,
    /// The byte length of the intact content; anything beyond is a torn tail to cut off.
    pub used_len: u64,
}

/// Scan an open segment, stopping at the zeroed region or at a torn trailing write.
///
/// `Ok(None)` means the segment holds no usable content at all and should be removed.
pub fn scan_open_segment(path: &Path) -> Result<Option<OpenSegmentContent>, StorageError> {
    let buf = fs::read(path)?;
    let first_index = match codec::decode_segment_header(&buf)? {
        Some(first_index) => first_index,
        None => return Ok(None),
    };

    let mut entries = Vec::new();
    let mut at = codec::SEGMENT_HEADER_LEN as usize;
    loop {
        if at >= buf.len() {
            break;
        }
        match codec::decode_batch(&buf[at..]) {
            DecodedBatch::Batch(batch, consumed) => {
                entries.extend(batch);
                at += consumed;
            }
            DecodedBatch::End => break,
            DecodedBatch::Invalid => {
                // The torn tail of the write interrupted by the crash; recover to the last
                // intact batch.
                tracing::warn!(segment=?path, offset=at, "repairing torn write at tail of open segment");
                break;
            }
        }
    }

    if entries.is_empty() {
        return Ok(None);
    }
    Ok(Some(OpenSegmentContent {
        first_index,
        entries,
        used_len: at as u64,
    }))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::codec::EntryKind;

    use super::*;

    fn command(term: u64, body: &[u8]) -> DiskEntry {
        DiskEntry {
            term,
            kind: EntryKind::Command,
            payload: body.to_vec(),
        }
    }

    #[test]
    fn test_parse_filenames() {
        assert_eq!(parse_filename("open-7"), Some(SegmentFile::Open { counter: 7 }));
        assert_eq!(
            parse_filename("0000000000000001-0000000000000042"),
            Some(SegmentFile::Closed { first: 1, last: 42 })
        );
        assert_eq!(parse_filename("meta"), None);
        assert_eq!(parse_filename("snapshot-1-5-100.meta"), None);
        assert_eq!(parse_filename("0000000000000009-0000000000000003"), None);
    }

    #[test]
    fn test_closed_filename_parses_back() {
        let name = closed_filename(91, 130);
        assert_eq!(parse_filename(&name), Some(SegmentFile::Closed { first: 91, last: 130 }));
    }

    #[test]
    fn test_read_closed_segment_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![command(1, b"a"), command(1, b"bb"), command(2, b"ccc")];
        let path = dir.path().join(closed_filename(5, 7));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&codec::encode_segment_header(5)).unwrap();
        file.write_all(&codec::encode_batch(&entries)).unwrap();
        drop(file);

        let loaded = read_closed_segment(&path, 5, 7).unwrap();
        assert_eq!(loaded, entries);
    }

    #[test]
    fn test_read_closed_segment_rejects_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![command(1, b"a"), command(1, b"bb")];
        let path = dir.path().join(closed_filename(5, 7));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&codec::encode_segment_header(5)).unwrap();
        file.write_all(&codec::encode_batch(&entries)).unwrap();
        drop(file);

        assert!(matches!(read_closed_segment(&path, 5, 7), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn test_scan_open_segment_recovers_up_to_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(open_filename(1));
        let good = codec::encode_batch(&[command(1, b"one"), command(1, b"two")]);
        let torn = codec::encode_batch(&[command(1, b"three")]);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&codec::encode_segment_header(1)).unwrap();
        file.write_all(&good).unwrap();
        file.write_all(&torn[..torn.len() - 4]).unwrap();
        drop(file);

        let content = scan_open_segment(&path).unwrap().unwrap();
        assert_eq!(content.first_index, 1);
        assert_eq!(content.entries.len(), 2);
        assert_eq!(content.used_len, codec::SEGMENT_HEADER_LEN + good.len() as u64);
    }

    #[test]
    fn test_scan_open_segment_with_zeroed_content_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(open_filename(3));
        fs::write(&path, vec![0u8; 4096]).unwrap();
        assert!(scan_open_segment(&path).unwrap().is_none());
    }
}
