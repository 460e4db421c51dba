//! In-memory fake for `StateStore` (testing only)
//!
//! `MemoryStateStore` satisfies the trait contract without touching disk.
//! It also keeps the full history of statuses written per resource and can
//! be told to reject writes, so engine tests can assert on flush discipline
//! and on state-failure handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StateError;
use crate::schema::{ResourceStatus, StateRecord};
use crate::storage_traits::{StateResult, StateStore};

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, StateRecord>,
    history: HashMap<String, Vec<ResourceStatus>>,
    next_sequence: u64,
}

/// In-memory state store backed by a `HashMap<id, StateRecord>`.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
    reject_writes: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with records, e.g. to simulate a previous run.
    pub fn with_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock().unwrap();
            for record in records {
                inner.next_sequence = inner.next_sequence.max(record.sequence);
                inner.records.insert(record.id.clone(), record);
            }
        }
        store
    }

    /// Every status ever written for `id`, in write order.
    pub fn history(&self, id: &str) -> Vec<ResourceStatus> {
        let inner = self.inner.lock().unwrap();
        inner.history.get(id).cloned().unwrap_or_default()
    }

    /// Make subsequent `put`/`remove` calls fail with an IO error.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StateResult<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StateError::io(
                "memory://state",
                std::io::Error::new(std::io::ErrorKind::Other, "writes rejected"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, id: &str) -> StateResult<Option<StateRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.get(id).cloned())
    }

    async fn put(&self, record: StateRecord) -> StateResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        inner
            .history
            .entry(record.id.clone())
            .or_default()
            .push(record.status);
        inner.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn remove(&self, id: &str) -> StateResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        inner.records.remove(id);
        Ok(())
    }

    async fn list(&self) -> StateResult<Vec<StateRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<StateRecord> = inner.records.values().cloned().collect();
        records.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn next_sequence(&self) -> StateResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_sequence += 1;
        Ok(inner.next_sequence)
    }
}
