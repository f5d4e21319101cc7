//! Persistence sinks for the session store.
//!
//! The store serializes its whole state into one versioned JSON blob and hands it to a
//! [`StateStorage`] under [`STORAGE_KEY`].  Storage only moves strings around; it never
//! interprets them.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::to_writer_pretty;

use crate::chat::config::ChatConfig;
use crate::error::{Error, Result};
use crate::types::ChatSession;

/// Key the snapshot is stored under.
pub const STORAGE_KEY: &str = "chat-next-web-store";

/// Current snapshot format.
pub const SNAPSHOT_VERSION: u32 = 1;

/// A key/value sink for serialized state.
pub trait StateStorage: Send + Sync {
    /// Returns the blob stored under `key`, if any.
    fn load(&self, key: &str) -> Result<Option<String>>;

    /// Replaces the blob stored under `key`.
    fn save(&self, key: &str, blob: &str) -> Result<()>;

    /// Removes the blob stored under `key`.  Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Keeps blobs in memory.  Useful for tests and for running without a state directory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStorage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.get(key).cloned())
    }

    fn save(&self, key: &str, blob: &str) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        blobs.insert(key.to_string(), blob.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        blobs.remove(key);
        Ok(())
    }
}

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Creates a storage rooted at `dir`.  The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory blobs are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl StateStorage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::io("failed to read saved state", err)),
        }
    }

    fn save(&self, key: &str, blob: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|err| Error::io("failed to create state directory", err))?;
        // Write beside the target and rename so a crash never leaves half a snapshot.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let file =
            File::create(&tmp).map_err(|err| Error::io("failed to create state file", err))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(blob.as_bytes())
            .and_then(|()| writer.flush())
            .map_err(|err| Error::io("failed to write state file", err))?;
        fs::rename(&tmp, &path).map_err(|err| Error::io("failed to replace state file", err))
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io("failed to remove state file", err)),
        }
    }
}

/// Everything the store persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Sessions, most recent first.
    pub sessions: Vec<ChatSession>,
    /// Index of the selected session.
    pub current_index: usize,
    /// User preferences.
    #[serde(default)]
    pub config: ChatConfig,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    state: &'a PersistedState,
}

#[derive(Deserialize)]
struct SnapshotFile {
    state: PersistedState,
}

#[derive(Deserialize)]
struct SnapshotHeader {
    #[serde(default)]
    version: u32,
}

/// Serializes state into a versioned blob.
pub fn encode_snapshot(state: &PersistedState) -> Result<String> {
    let mut out = Vec::new();
    let file = SnapshotRef {
        version: SNAPSHOT_VERSION,
        state,
    };
    to_writer_pretty(&mut out, &file).map_err(|err| {
        Error::serialization("failed to serialize state", Some(Box::new(err)))
    })?;
    String::from_utf8(out).map_err(|err| {
        Error::encoding("serialized state is not UTF-8", Some(Box::new(err)))
    })
}

/// Parses a blob written by [`encode_snapshot`].
///
/// Blobs from an older format are treated as absent and yield `Ok(None)`.
pub fn decode_snapshot(blob: &str) -> Result<Option<PersistedState>> {
    let header: SnapshotHeader = serde_json::from_str(blob).map_err(|err| {
        Error::serialization("failed to parse saved state", Some(Box::new(err)))
    })?;
    if header.version < SNAPSHOT_VERSION {
        tracing::info!(version = header.version, "ignoring outdated saved state");
        return Ok(None);
    }
    let file: SnapshotFile = serde_json::from_str(blob).map_err(|err| {
        Error::serialization("failed to parse saved state", Some(Box::new(err)))
    })?;
    Ok(Some(file.state))
}
