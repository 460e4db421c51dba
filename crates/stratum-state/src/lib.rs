//! Stratum-State: durable resource state for the Stratum provisioner
//!
//! This crate records which resources exist, what they last reported, and in
//! which order they were enqueued, so that an interrupted or partially failed
//! run can be resumed without re-creating finished work.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: one record per resource, durable after every write.
//!
//! ## Key Components
//!
//! - `StateStore`: async, backend-agnostic store trait
//! - `StateRecord`: the persisted per-resource schema
//! - `FsStateStore`: single JSON document, replaced atomically on each write
//! - `MemoryStateStore`: in-memory fake for tests

mod error;
pub mod fakes;
mod fs;
mod schema;
pub mod storage_traits;

pub use error::StateError;
pub use fakes::MemoryStateStore;
pub use fs::{FsStateStore, STATE_FORMAT_VERSION};
pub use schema::{Attributes, ProviderHandle, ResourceStatus, StateRecord};
pub use storage_traits::{StateResult, StateStore};
