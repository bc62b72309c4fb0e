//! The byte codec for segment files: little-endian integers and CRC32-framed entry batches.

use rafter::StorageError;

/// Format version written at the head of every segment file.
pub const SEGMENT_FORMAT_VERSION: u64 = 1;

/// Every segment file starts with the format version and the raft index of its first entry.
pub const SEGMENT_HEADER_LEN: u64 = 16;

/// Fixed prefix of a batch: header crc, data crc, entry count.
const BATCH_PREFIX_LEN: usize = 16;

/// Per-entry header: term, type byte, padding, payload length.
const ENTRY_HEADER_LEN: usize = 16;

/// The on-disk kind tag of a log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// An application command.
    Command,
    /// A content-less pipeline barrier.
    Barrier,
    /// A membership configuration.
    Configuration,
}

impl EntryKind {
    fn to_byte(self) -> u8 {
        match self {
            EntryKind::Command => 1,
            EntryKind::Barrier => 2,
            EntryKind::Configuration => 3,
        }
    }

    fn from_byte(b: u8) -> Option<EntryKind> {
        match b {
            1 => Some(EntryKind::Command),
            2 => Some(EntryKind::Barrier),
            3 => Some(EntryKind::Configuration),
            _ => None,
        }
    }
}

/// A log entry in its on-disk shape: term, kind and opaque payload bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct DiskEntry {
    pub term: u64,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

/// Round a length up to the next 8-byte boundary.
pub fn pad8(len: usize) -> usize {
    (len + 7) & !7
}

/// Encode a batch of entries as written by a single append call.
///
/// Layout, little-endian:
///
/// ```text
/// [crc_header: u32][crc_data: u32][n_entries: u64]
/// n × [term: u64][kind: u8][pad: 3][len: u32]
/// payloads, each zero-padded to an 8-byte boundary
/// ```
///
/// `crc_header` covers the count and the entry headers; `crc_data` covers the padded payload
/// section exactly as written.
pub fn encode_batch(entries: &[DiskEntry]) -> Vec<u8> {
    let header_len = 8 + entries.len() * ENTRY_HEADER_LEN;
    let data_len: usize = entries.iter().map(|e| pad8(e.payload.len())).sum();
    let mut buf = Vec::with_capacity(8 + header_len + data_len);

    // Checksums are backfilled once the sections exist.
    buf.extend_from_slice(&[0u8; 8]);

    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for entry in entries {
        buf.extend_from_slice(&entry.term.to_le_bytes());
        buf.push(entry.kind.to_byte());
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&(entry.payload.len() as u32).to_le_bytes());
    }

    let data_start = buf.len();
    for entry in entries {
        buf.extend_from_slice(&entry.payload);
        let padding = pad8(entry.payload.len()) - entry.payload.len();
        buf.extend_from_slice(&[0u8; 8][..padding]);
    }

    let crc_header = crc32fast::hash(&buf[8..data_start]);
    let crc_data = crc32fast::hash(&buf[data_start..]);
    buf[0..4].copy_from_slice(&crc_header.to_le_bytes());
    buf[4..8].copy_from_slice(&crc_data.to_le_bytes());
    buf
}

/// The result of attempting to decode one batch from a buffer.
pub enum DecodedBatch {
    /// A valid batch and the number of bytes it consumed.
    Batch(Vec<DiskEntry>, usize),
    /// The buffer holds no further batch: either it is exhausted or it starts with the zeroed
    /// region of a preallocated segment.
    End,
    /// The bytes are neither a valid batch nor untouched zeroes.
    ///
    /// In a sealed segment this is corruption; in the active segment it is the torn tail of a
    /// write interrupted by a crash, repaired by truncating to the previous batch.
    Invalid,
}

fn read_u32_le(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64_le(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Decode a single batch from the front of `buf`.
pub fn decode_batch(buf: &[u8]) -> DecodedBatch {
    if buf.len() < BATCH_PREFIX_LEN {
        // Too short for a batch: end of data if all zero, torn bytes otherwise.
        if buf.iter().all(|b| *b == 0) {
            return DecodedBatch::End;
        }
        return DecodedBatch::Invalid;
    }

    if buf[..BATCH_PREFIX_LEN].iter().all(|b| *b == 0) {
        return DecodedBatch::End;
    }

    let crc_header = read_u32_le(buf, 0);
    let crc_data = read_u32_le(buf, 4);
    let n_entries = read_u64_le(buf, 8);

    // Each entry needs a header; an implausible count is torn or corrupt data.
    let max_entries = (buf.len().saturating_sub(BATCH_PREFIX_LEN)) / ENTRY_HEADER_LEN;
    if n_entries == 0 || n_entries > max_entries as u64 {
        return DecodedBatch::Invalid;
    }
    let n_entries = n_entries as usize;

    let header_end = BATCH_PREFIX_LEN + n_entries * ENTRY_HEADER_LEN;
    if crc32fast::hash(&buf[8..header_end]) != crc_header {
        return DecodedBatch::Invalid;
    }

    // Headers are trustworthy now; walk them to size the payload section.
    let mut entries = Vec::with_capacity(n_entries);
    let mut data_len = 0usize;
    for i in 0..n_entries {
        let at = BATCH_PREFIX_LEN + i * ENTRY_HEADER_LEN;
        let term = read_u64_le(buf, at);
        let kind = match EntryKind::from_byte(buf[at + 8]) {
            Some(kind) => kind,
            None => return DecodedBatch::Invalid,
        };
        let len = read_u32_le(buf, at + 12) as usize;
        entries.push((term, kind, len));
        data_len += pad8(len);
    }

    let batch_len = header_end + data_len;
    if buf.len() < batch_len {
        return DecodedBatch::Invalid;
    }
    if crc32fast::hash(&buf[header_end..batch_len]) != crc_data {
        return DecodedBatch::Invalid;
    }

    let mut out = Vec::with_capacity(n_entries);
    let mut at = header_end;
    for (term, kind, len) in entries {
        out.push(DiskEntry {
            term,
            kind,
            payload: buf[at..at + len].to_vec(),
        });
        at += pad8(len);
    }
    DecodedBatch::Batch(out, batch_len)
}

/// Encode the 16-byte segment header: format version and first raft index.
pub fn encode_segment_header(first_index: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&first_index.to_le_bytes());
    buf
}

/// Decode a segment header, returning the first raft index stored in it.
///
/// `Ok(None)` means the header region is still zeroed: a prepared segment which was never
/// written to.
pub fn decode_segment_header(buf: &[u8]) -> Result<Option<u64>, StorageError> {
    if buf.len() < SEGMENT_HEADER_LEN as usize {
        if buf.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        return Err(StorageError::Corrupt("segment header is truncated".into()));
    }
    let version = read_u64_le(buf, 0);
    if version == 0 {
        return Ok(None);
    }
    if version != SEGMENT_FORMAT_VERSION {
        return Err(StorageError::Malformed(format!("unknown segment format version {}", version)));
    }
    Ok(Some(read_u64_le(buf, 8)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<DiskEntry> {
        vec![
            DiskEntry { term: 1, kind: EntryKind::Barrier, payload: vec![] },
            DiskEntry { term: 1, kind: EntryKind::Command, payload: b"set x = 1".to_vec() },
            DiskEntry { term: 2, kind: EntryKind::Configuration, payload: vec![7; 33] },
        ]
    }

    #[test]
    fn test_batch_round_trip() {
        let entries = sample_entries();
        let buf = encode_batch(&entries);
        assert_eq!(buf.len() % 8, 0);
        match decode_batch(&buf) {
            DecodedBatch::Batch(decoded, consumed) => {
                assert_eq!(decoded, entries);
                assert_eq!(consumed, buf.len());
            }
            _ => panic!("expected a valid batch"),
        }
    }

    #[test]
    fn test_decode_batch_stops_at_zeroed_tail() {
        let entries = sample_entries();
        let mut buf = encode_batch(&entries);
        let batch_len = buf.len();
        buf.extend_from_slice(&[0u8; 256]);

        match decode_batch(&buf) {
            DecodedBatch::Batch(_, consumed) => {
                assert_eq!(consumed, batch_len);
                assert!(matches!(decode_batch(&buf[consumed..]), DecodedBatch::End));
            }
            _ => panic!("expected a valid batch"),
        }
    }

    #[test]
    fn test_decode_batch_detects_flipped_payload_byte() {
        let entries = sample_entries();
        let mut buf = encode_batch(&entries);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(decode_batch(&buf), DecodedBatch::Invalid));
    }

    #[test]
    fn test_decode_batch_detects_flipped_header_byte() {
        let entries = sample_entries();
        let mut buf = encode_batch(&entries);
        buf[9] ^= 0xff;
        assert!(matches!(decode_batch(&buf), DecodedBatch::Invalid));
    }

    #[test]
    fn test_decode_batch_detects_torn_write() {
        let entries = sample_entries();
        let buf = encode_batch(&entries);
        assert!(matches!(decode_batch(&buf[..buf.len() - 8]), DecodedBatch::Invalid));
    }

    #[test]
    fn test_segment_header_round_trip() {
        let buf = encode_segment_header(42);
        assert_eq!(decode_segment_header(&buf).unwrap(), Some(42));
    }

    #[test]
    fn test_segment_header_zeroes_mean_unwritten() {
        assert_eq!(decode_segment_header(&[0u8; 16]).unwrap(), None);
    }

    #[test]
    fn test_segment_header_rejects_unknown_version() {
        let mut buf = encode_segment_header(42);
        buf[0] = 9;
        assert!(matches!(decode_segment_header(&buf), Err(StorageError::Malformed(_))));
    }
}
