//! The snapshot store: metadata+data file pairs, newest-wins selection, prune-to-two.
//!
//! A snapshot is two files sharing a stem encoding its identity:
//! `snapshot-<term>-<index>-<timestamp>.meta` and the data file without the extension. The
//! metadata is written first, then the data, then the directory is fsynced; a metadata file
//! without its data companion is the residue of a crash and is removed on load.

use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rafter::membership::Configuration;
use rafter::storage::SnapshotMeta;
use rafter::LogId;
use rafter::StorageError;

use crate::meta::fsync_dir;

const META_FORMAT_VERSION: u64 = 1;

/// Upper bound accepted for an encoded configuration in a snapshot header.
const MAX_CONFIGURATION_LEN: u64 = 1 << 20;

/// How many snapshots `prune` keeps. Two rather than one, as a safety margin against a reader
/// still holding the previous snapshot open while a new one is put.
const SNAPSHOTS_KEPT: usize = 2;

/// The identity of a snapshot pair, encoded in its file names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotId {
    pub term: u64,
    pub index: u64,
    pub timestamp: u64,
}

impl SnapshotId {
    fn meta_filename(&self) -> String {
        format!("snapshot-{}-{}-{}.meta", self.term, self.index, self.timestamp)
    }

    fn data_filename(&self) -> String {
        format!("snapshot-{}-{}-{}", self.term, self.index, self.timestamp)
    }
}

/// Parse a `.meta` file name into the snapshot identity it encodes.
fn parse_meta_filename(name: &str) -> Option<SnapshotId> {
    let stem = name.strip_prefix("snapshot-")?.strip_suffix(".meta")?;
    let mut parts = stem.splitn(3, '-');
    let term = parts.next()?.parse().ok()?;
    let index = parts.next()?.parse().ok()?;
    let timestamp = parts.next()?.parse().ok()?;
    Some(SnapshotId { term, index, timestamp })
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    /// Write a new snapshot pair and prune old ones.
    pub fn put(&self, meta: &SnapshotMeta, data: &[u8]) -> Result<SnapshotId, StorageError> {
        let id = SnapshotId {
            term: meta.last_log_id.term,
            index: meta.last_log_id.index,
            timestamp: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0),
        };

        let header = encode_meta(meta)?;
        let meta_path = self.dir.join(id.meta_filename());
        let mut meta_file = File::create(&meta_path)?;
        meta_file.write_all(&header)?;
        meta_file.sync_all()?;
        drop(meta_file);

        let data_path = self.dir.join(id.data_filename());
        let mut data_file = File::create(&data_path)?;
        data_file.write_all(data)?;
        data_file.sync_all()?;
        drop(data_file);

        fsync_dir(&self.dir)?;

        self.prune()?;
        Ok(id)
    }

    /// List the complete snapshot pairs, oldest first, removing crash residue on the way.
    pub fn list(&self) -> Result<Vec<SnapshotId>, StorageError> {
        let mut out = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let id = match parse_meta_filename(name) {
                Some(id) => id,
                None => continue,
            };
            if !self.dir.join(id.data_filename()).exists() {
                // Metadata without data: a put which never completed.
                tracing::warn!(snapshot=?name, "removing orphaned snapshot metadata");
                fs::remove_file(dirent.path())?;
                continue;
            }
            out.push(id);
        }
        out.sort();
        Ok(out)
    }

    /// Load the most recent snapshot: highest term, then index, then timestamp.
    pub fn load_latest(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>, StorageError> {
        let id = match self.list()?.pop() {
            Some(id) => id,
            None => return Ok(None),
        };

        let header = fs::read(self.dir.join(id.meta_filename()))?;
        let (membership_index, membership) = decode_meta(&header)?;
        let data = fs::read(self.dir.join(id.data_filename()))?;

        Ok(Some((
            SnapshotMeta {
                last_log_id: LogId::new(id.term, id.index),
                membership_index,
                membership,
            },
            data,
        )))
    }

    /// Delete everything but the most recent two snapshots.
    pub fn prune(&self) -> Result<(), StorageError> {
        let ids = self.list()?;
        if ids.len() <= SNAPSHOTS_KEPT {
            return Ok(());
        }
        for id in &ids[..ids.len() - SNAPSHOTS_KEPT] {
            tracing::debug!(term=id.term, index=id.index, "pruning old snapshot");
            fs::remove_file(self.dir.join(id.meta_filename()))?;
            fs::remove_file(self.dir.join(id.data_filename()))?;
        }
        fsync_dir(&self.dir)?;
        Ok(())
    }
}

/// Encode the snapshot metadata header.
///
/// Big-endian 64-bit words: format version, crc32 of the words after it concatenated with the
/// configuration bytes, the configuration index, the configuration length, then the
/// configuration bytes themselves.
fn encode_meta(meta: &SnapshotMeta) -> Result<Vec<u8>, StorageError> {
    let config = meta.membership.encode();
    if config.len() as u64 > MAX_CONFIGURATION_LEN {
        return Err(StorageError::Corrupt("snapshot configuration exceeds 1 MiB".into()));
    }

    let mut crc_input = Vec::with_capacity(16 + config.len());
    crc_input.extend_from_slice(&meta.membership_index.to_be_bytes());
    crc_input.extend_from_slice(&(config.len() as u64).to_be_bytes());
    crc_input.extend_from_slice(&config);
    let crc = crc32fast::hash(&crc_input) as u64;

    let mut buf = Vec::with_capacity(32 + config.len());
    buf.extend_from_slice(&META_FORMAT_VERSION.to_be_bytes());
    buf.extend_from_slice(&crc.to_be_bytes());
    buf.extend_from_slice(&crc_input);
    Ok(buf)
}

/// Decode a snapshot metadata header into its configuration index and configuration.
fn decode_meta(buf: &[u8]) -> Result<(u64, Configuration), StorageError> {
    if buf.len() < 32 {
        return Err(StorageError::Corrupt("snapshot metadata is truncated".into()));
    }

    let word = |at: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[at..at + 8]);
        u64::from_be_bytes(raw)
    };

    let version = word(0);
    if version != META_FORMAT_VERSION {
        return Err(StorageError::Malformed(format!("unknown snapshot format version {}", version)));
    }
    let crc = word(8);
    let membership_index = word(16);
    let config_len = word(24);
    if config_len > MAX_CONFIGURATION_LEN {
        return Err(StorageError::Corrupt(format!("implausible snapshot configuration length {}", config_len)));
    }
    if buf.len() as u64 != 32 + config_len {
        return Err(StorageError::Corrupt("snapshot metadata length mismatch".into()));
    }

    if crc32fast::hash(&buf[16..]) as u64 != crc {
        return Err(StorageError::Corrupt("snapshot metadata checksum mismatch".into()));
    }

    let membership = Configuration::decode(&buf[32..])?;
    Ok((membership_index, membership))
}

#[cfg(test)]
mod tests {
    use rafter::membership::Role;
    use rafter::membership::Server;

    use super::*;

    fn sample_meta(term: u64, index: u64) -> SnapshotMeta {
        SnapshotMeta {
            last_log_id: LogId::new(term, index),
            membership_index: 2,
            membership: Configuration {
                servers: vec![Server { id: 1, address: "10.0.0.1:7000".into(), role: Role::Voter }],
            },
        }
    }

    #[test]
    fn test_put_then_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        store.put(&sample_meta(1, 10), b"state at 10").unwrap();
        store.put(&sample_meta(1, 20), b"state at 20").unwrap();

        let (meta, data) = store.load_latest().unwrap().unwrap();
        assert_eq!(meta.last_log_id, LogId::new(1, 20));
        assert_eq!(meta.membership_index, 2);
        assert_eq!(data, b"state at 20");
    }

    #[test]
    fn test_latest_prefers_higher_term_over_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        store.put(&sample_meta(2, 15), b"term 2").unwrap();
        store.put(&sample_meta(1, 99), b"term 1").unwrap();

        let (meta, _) = store.load_latest().unwrap().unwrap();
        assert_eq!(meta.last_log_id, LogId::new(2, 15));
    }

    #[test]
    fn test_prune_keeps_two_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        for index in [10u64, 20, 30, 40, 50] {
            store.put(&sample_meta(1, index), b"data").unwrap();
        }

        let ids = store.list().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].index, 40);
        assert_eq!(ids[1].index, 50);
    }

    #[test]
    fn test_orphaned_meta_is_removed_on_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        store.put(&sample_meta(1, 10), b"data").unwrap();
        fs::write(dir.path().join("snapshot-1-20-12345.meta"), b"whatever").unwrap();

        let ids = store.list().unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].index, 10);
        assert!(!dir.path().join("snapshot-1-20-12345.meta").exists());
    }

    #[test]
    fn test_corrupt_meta_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        store.put(&sample_meta(1, 10), b"data").unwrap();
        // Flip a byte inside the configuration region of the newest meta file.
        let id = store.list().unwrap().pop().unwrap();
        let path = dir.path().join(id.meta_filename());
        let mut buf = fs::read(&path).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        fs::write(&path, &buf).unwrap();

        assert!(matches!(store.load_latest(), Err(StorageError::Corrupt(_))));
    }
}
