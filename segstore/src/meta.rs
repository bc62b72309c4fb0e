//! The metadata file: durable term & vote, plus the bootstrap configuration.
//!
//! The file is tiny and rewritten whole on every change: write a temp file, fsync it, rename it
//! over the live one, fsync the directory. A crash leaves either the old or the new content,
//! never a mix.

use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use rafter::membership::Configuration;
use rafter::storage::HardState;
use rafter::StorageError;

const META_FILENAME: &str = "meta";
const META_TMP_FILENAME: &str = "meta.tmp";

const META_FORMAT_VERSION: u64 = 1;

/// The durable non-log state of a replica.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetaState {
    pub hard_state: HardState,
    /// The bootstrap configuration and the configuration index it was recorded at (always 0).
    pub bootstrap: Option<(u64, Configuration)>,
}

/// Fsync a directory so renames and unlinks within it are durable.
pub fn fsync_dir(dir: &Path) -> Result<(), StorageError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Persist the metadata atomically.
pub fn store(dir: &Path, state: &MetaState) -> Result<(), StorageError> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&META_FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&state.hard_state.current_term.to_le_bytes());
    buf.extend_from_slice(&state.hard_state.voted_for.unwrap_or(0).to_le_bytes());
    match &state.bootstrap {
        Some((conf_index, config)) => {
            let config = config.encode();
            buf.extend_from_slice(&conf_index.to_le_bytes());
            buf.extend_from_slice(&(config.len() as u64).to_le_bytes());
            buf.extend_from_slice(&config);
        }
        None => {
            buf.extend_from_slice(&0u64.to_le_bytes());
            buf.extend_from_slice(&0u64.to_le_bytes());
        }
    }

    let tmp_path = dir.join(META_TMP_FILENAME);
    let mut tmp = File::create(&tmp_path)?;
    tmp.write_all(&buf)?;
    tmp.sync_all()?;
    drop(tmp);

    fs::rename(&tmp_path, dir.join(META_FILENAME))?;
    fsync_dir(dir)?;
    Ok(())
}

/// Load the metadata, `None` for a pristine directory.
pub fn load(dir: &Path) -> Result<Option<MetaState>, StorageError> {
    let path = dir.join(META_FILENAME);
    let buf = match fs::read(&path) {
        Ok(buf) => buf,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    if buf.len() < 40 {
        return Err(StorageError::Corrupt("metadata file is truncated".into()));
    }

    let word = |at: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[at..at + 8]);
        u64::from_le_bytes(raw)
    };

    let version = word(0);
    if version != META_FORMAT_VERSION {
        return Err(StorageError::Malformed(format!("unknown metadata format version {}", version)));
    }
    let current_term = word(8);
    let vote = word(16);
    let conf_index = word(24);
    let conf_len = word(32) as usize;

    let bootstrap = if conf_len == 0 {
        None
    } else {
        if buf.len() < 40 + conf_len {
            return Err(StorageError::Corrupt("metadata configuration is truncated".into()));
        }
        let config = Configuration::decode(&buf[40..40 + conf_len])?;
        Some((conf_index, config))
    };

    Ok(Some(MetaState {
        hard_state: HardState {
            current_term,
            voted_for: if vote == 0 { None } else { Some(vote) },
        },
        bootstrap,
    }))
}

#[cfg(test)]
mod tests {
    use rafter::membership::Role;
    use rafter::membership::Server;

    use super::*;

    #[test]
    fn test_meta_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = MetaState {
            hard_state: HardState {
                current_term: 7,
                voted_for: Some(3),
            },
            bootstrap: Some((0, Configuration {
                servers: vec![Server { id: 1, address: "10.0.0.1:7000".into(), role: Role::Voter }],
            })),
        };

        store(dir.path(), &state).unwrap();
        let loaded = load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_meta_missing_file_is_pristine() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_meta_rewrite_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = MetaState::default();
        store(dir.path(), &state).unwrap();

        state.hard_state.current_term = 2;
        state.hard_state.voted_for = Some(9);
        store(dir.path(), &state).unwrap();

        assert_eq!(load(dir.path()).unwrap().unwrap(), state);
    }
}
