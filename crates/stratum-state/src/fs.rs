use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StateError;
use crate::schema::StateRecord;
use crate::storage_traits::{StateResult, StateStore};

/// Version written into every state document.
pub const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    next_sequence: u64,
    records: BTreeMap<String, StateRecord>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            next_sequence: 0,
            records: BTreeMap::new(),
        }
    }
}

/// Filesystem-backed state store: one pretty-printed JSON document.
///
/// Every mutation rewrites the whole document to a temp file in the same
/// directory and renames it over the original, so a crash leaves either the
/// previous or the new document on disk, never a torn one.
pub struct FsStateStore {
    path: PathBuf,
    doc: Mutex<StateDocument>,
}

impl FsStateStore {
    /// Open the store at `path`, creating parent directories as needed.
    /// A missing file is treated as empty state.
    pub fn open(path: impl AsRef<Path>) -> StateResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
        }

        let doc = match fs::read(&path) {
            Ok(bytes) => {
                let doc: StateDocument = serde_json::from_slice(&bytes)?;
                if doc.version != STATE_FORMAT_VERSION {
                    return Err(StateError::UnsupportedVersion {
                        found: doc.version,
                        expected: STATE_FORMAT_VERSION,
                    });
                }
                doc
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateDocument::default(),
            Err(e) => return Err(StateError::io(&path, e)),
        };

        debug!(path = %path.display(), records = doc.records.len(), "opened state store");
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, StateDocument> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, doc: &StateDocument) -> StateResult<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let bytes = serde_json::to_vec_pretty(doc)?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StateError::io(dir, e))?;
        tmp.write_all(&bytes)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StateError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| StateError::io(&self.path, e.error))?;
        Ok(())
    }

    /// Apply `mutate` to a copy of the document and persist it; the in-memory
    /// view only changes if the write succeeded.
    fn update<T>(&self, mutate: impl FnOnce(&mut StateDocument) -> T) -> StateResult<T> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = mutate(&mut next);
        self.persist(&next)?;
        *guard = next;
        Ok(out)
    }
}

#[async_trait]
impl StateStore for FsStateStore {
    async fn get(&self, id: &str) -> StateResult<Option<StateRecord>> {
        let doc = self.lock();
        Ok(doc.records.get(id).cloned())
    }

    async fn put(&self, record: StateRecord) -> StateResult<()> {
        self.update(|doc| {
            doc.records.insert(record.id.clone(), record);
        })
    }

    async fn remove(&self, id: &str) -> StateResult<()> {
        {
            let doc = self.lock();
            if !doc.records.contains_key(id) {
                return Ok(());
            }
        }
        self.update(|doc| {
            doc.records.remove(id);
        })
    }

    async fn list(&self) -> StateResult<Vec<StateRecord>> {
        let doc = self.lock();
        let mut records: Vec<StateRecord> = doc.records.values().cloned().collect();
        records.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn next_sequence(&self) -> StateResult<u64> {
        self.update(|doc| {
            doc.next_sequence += 1;
            doc.next_sequence
        })
    }
}
