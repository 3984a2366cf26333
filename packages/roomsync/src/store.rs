//! Persistence of the session handle across client restarts.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::lock;
use crate::session::SessionHandle;

/// What survives a reload: the handle plus the identity it was issued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    #[serde(flatten)]
    pub handle: SessionHandle,
    pub client_id: String,
}

pub trait HandleStore: Send + Sync + 'static {
    fn load(&self) -> io::Result<Option<StoredSession>>;
    fn save(&self, session: &StoredSession) -> io::Result<()>;
    fn clear(&self) -> io::Result<()>;
}

/// Keeps the handle in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: Mutex<Option<StoredSession>>,
}

impl MemoryStore {
    pub fn with(session: StoredSession) -> Self {
        Self {
            slot: Mutex::new(Some(session)),
        }
    }
}

impl HandleStore for MemoryStore {
    fn load(&self) -> io::Result<Option<StoredSession>> {
        Ok(lock(&self.slot).clone())
    }

    fn save(&self, session: &StoredSession) -> io::Result<()> {
        *lock(&self.slot) = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        *lock(&self.slot) = None;
        Ok(())
    }
}

/// Stores the handle as a JSON file. Writes go to a temp file first.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HandleStore for JsonFileStore {
    fn load(&self) -> io::Result<Option<StoredSession>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&bytes) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                // A corrupt file is treated as "no session".
                debug!(path = %self.path.display(), error = %e, "ignoring unreadable session file");
                Ok(None)
            }
        }
    }

    fn save(&self, session: &StoredSession) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(session).map_err(io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)
    }

    fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
