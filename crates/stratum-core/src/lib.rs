//! Stratum Core: dependency-graph provisioning engine
//!
//! Turns a flat set of declarative resource specs into a validated graph,
//! plans create and destroy batches over it, and drives provider adapters
//! through each batch with readiness gating, bounded retries, and value
//! propagation between resources. Progress is recorded in a
//! [`stratum_state::StateStore`] after every transition so interrupted or
//! partially failed runs can be resumed.
//!
//! ## Key Components
//!
//! - [`ResourceGraph`]: validated graph with separate create and destroy views
//! - [`scheduler::plan`]: deterministic Kahn level-batching
//! - [`ReadinessGate`]: cancellable polling with exponential backoff
//! - [`propagate`]: `${producer.attr}` substitution and secret resolution
//! - [`Engine`]: apply and destroy runs producing a [`RunResult`]

pub mod builtin;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod fakes;
pub mod graph;
pub mod manifest;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod propagate;
pub mod provider;
pub mod readiness;
pub mod retry;
pub mod scheduler;
pub mod telemetry;

pub use builtin::{NullProvider, WaitProvider};
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, OutcomeStatus, ResourceOutcome, RunResult, SkipReason};
pub use error::{
    ProviderError, ProviderResult, ProvisionError, ResourceError, Result, StructuralError,
    TransientKind,
};
pub use graph::ResourceGraph;
pub use manifest::Manifest;
pub use model::{Direction, EdgeKind, Parameters, ResourceKind, ResourceNode, ResourceSpec};
pub use propagate::{EnvSecretStore, MemorySecretStore, SecretError, SecretStore};
pub use provider::{ProviderAdapter, ProviderRegistry};
pub use readiness::{BackoffPolicy, GateOutcome, Poll, ReadinessGate};
pub use retry::RetryPolicy;
pub use scheduler::Batch;
pub use telemetry::init_tracing;

pub use stratum_state::{Attributes, ProviderHandle, ResourceStatus, StateRecord, StateStore};
