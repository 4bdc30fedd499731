//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: used by raft-core to persist term/vote/log and snapshots
//! what: Persister trait, FilePersister implementation, MemoryPersister for testing

use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;

/// trait for durable storage of raft state
///
/// the bytes are opaque here: raft-core decides what goes into the
/// raft-state blob and when. both blobs are written by one `save` so a
/// crash never observes a snapshot that disagrees with the log.
pub trait Persister: Send + Sync {
    /// persist the raft state and the snapshot together
    fn save(&self, raft_state: &[u8], snapshot: &[u8]) -> io::Result<()>;

    /// persist the raft state, keeping the stored snapshot
    fn save_raft_state(&self, raft_state: &[u8]) -> io::Result<()>;

    /// load the raft state (empty for a fresh node)
    fn read_raft_state(&self) -> io::Result<Vec<u8>>;

    /// load the snapshot (empty if none was ever taken)
    fn read_snapshot(&self) -> io::Result<Vec<u8>>;

    /// size in bytes of the stored raft state
    fn raft_state_size(&self) -> usize;
}

// -- file persister implementation --

/// file-based persister using std::fs
///
/// stores everything in one file, `raft.json`, replaced atomically via a
/// temp file and rename, so state and snapshot always move together.
pub struct FilePersister {
    /// directory path for storing state files
    dir: PathBuf,
    /// cached copy of what is on disk
    cache: Mutex<Durable>,
}

/// on-disk layout
#[derive(serde::Serialize, serde::Deserialize, Default, Clone)]
struct Durable {
    raft_state: Vec<u8>,
    snapshot: Vec<u8>,
}

impl FilePersister {
    /// open (or create) a persister rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let cache = Self::load(&dir.join("raft.json"))?;
        Ok(Self {
            dir,
            cache: Mutex::new(cache),
        })
    }

    /// get the path to the state file
    fn state_path(&self) -> PathBuf {
        self.dir.join("raft.json")
    }

    fn load(path: &PathBuf) -> io::Result<Durable> {
        if !path.exists() {
            return Ok(Durable::default());
        }

        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        serde_json::from_str(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn write(&self, durable: &Durable) -> io::Result<()> {
        let json = serde_json::to_string(durable)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join("raft.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;

        tracing::trace!(dir = %self.dir.display(), bytes = json.len(), "raft state written");
        Ok(())
    }
}

impl Persister for FilePersister {
    fn save(&self, raft_state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        let mut cache = self.cache.lock();
        let next = Durable {
            raft_state: raft_state.to_vec(),
            snapshot: snapshot.to_vec(),
        };
        self.write(&next)?;
        *cache = next;
        Ok(())
    }

    fn save_raft_state(&self, raft_state: &[u8]) -> io::Result<()> {
        let mut cache = self.cache.lock();
        let next = Durable {
            raft_state: raft_state.to_vec(),
            snapshot: cache.snapshot.clone(),
        };
        self.write(&next)?;
        *cache = next;
        Ok(())
    }

    fn read_raft_state(&self) -> io::Result<Vec<u8>> {
        Ok(self.cache.lock().raft_state.clone())
    }

    fn read_snapshot(&self) -> io::Result<Vec<u8>> {
        Ok(self.cache.lock().snapshot.clone())
    }

    fn raft_state_size(&self) -> usize {
        self.cache.lock().raft_state.len()
    }
}

// -- in-memory persister implementation --

/// in-memory persister for testing
///
/// survives a simulated crash as long as the test keeps the value (or a
/// `copy` of it) around and hands it to the restarted node.
#[derive(Default)]
pub struct MemoryPersister {
    inner: Mutex<Durable>,
}

impl MemoryPersister {
    /// create an empty in-memory persister
    pub fn new() -> Self {
        Self::default()
    }

    /// deep copy, detached from this instance
    ///
    /// a restarted node gets a copy so writes from the old, killed
    /// instance can no longer reach the new one.
    pub fn copy(&self) -> Self {
        Self {
            inner: Mutex::new(self.inner.lock().clone()),
        }
    }

    /// size in bytes of the stored snapshot
    pub fn snapshot_size(&self) -> usize {
        self.inner.lock().snapshot.len()
    }
}

impl Persister for MemoryPersister {
    fn save(&self, raft_state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.raft_state = raft_state.to_vec();
        inner.snapshot = snapshot.to_vec();
        Ok(())
    }

    fn save_raft_state(&self, raft_state: &[u8]) -> io::Result<()> {
        self.inner.lock().raft_state = raft_state.to_vec();
        Ok(())
    }

    fn read_raft_state(&self) -> io::Result<Vec<u8>> {
        Ok(self.inner.lock().raft_state.clone())
    }

    fn read_snapshot(&self) -> io::Result<Vec<u8>> {
        Ok(self.inner.lock().snapshot.clone())
    }

    fn raft_state_size(&self) -> usize {
        self.inner.lock().raft_state.len()
    }
}
