//! Storage trait definition for resource state
//!
//! `StateStore` is keyed by resource id. The engine reads it once at the
//! start of a run to decide what can be skipped or resumed, and writes it
//! after every status transition.
//!
//! Implementations are async and backend-agnostic. An in-memory fake is
//! provided in the `fakes` module.

use async_trait::async_trait;

use crate::error::StateError;
use crate::schema::StateRecord;

/// Result type for state operations
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Durable per-resource state.
///
/// Guarantees:
/// - `put` is durable once it returns; a crash after `put` never loses it.
/// - `list` returns records ordered by ascending `sequence`.
/// - `next_sequence` never returns the same value twice for one store,
///   including across reopen.
/// - `remove` of an absent id is a no-op.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the record for `id`, if any.
    async fn get(&self, id: &str) -> StateResult<Option<StateRecord>>;

    /// Insert or replace the record for `record.id`.
    async fn put(&self, record: StateRecord) -> StateResult<()>;

    /// Drop the record for `id`.
    async fn remove(&self, id: &str) -> StateResult<()>;

    /// All records, ascending by sequence number.
    async fn list(&self) -> StateResult<Vec<StateRecord>>;

    /// Reserve the next enqueue sequence number.
    async fn next_sequence(&self) -> StateResult<u64>;
}
