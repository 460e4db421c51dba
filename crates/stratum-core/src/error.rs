//! Error taxonomy for the provisioning engine.
//!
//! - [`StructuralError`]: the spec set itself is unusable. Raised before any
//!   provider call and fails the whole run.
//! - [`ProviderError`]: what an adapter reports for a single call. Only the
//!   `Transient` variant is retried.
//! - [`ResourceError`]: why one resource ended failed. Recorded on the node,
//!   persisted, and surfaced in the run result.
//! - [`ProvisionError`]: the top-level error of `apply`/`destroy`, for
//!   failures that prevent producing a run result at all.

use std::fmt;

use serde::{Deserialize, Serialize};
use stratum_state::StateError;

use crate::model::{Direction, EdgeKind};

/// The spec set cannot form a valid graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    #[error("duplicate resource id: {id}")]
    DuplicateId { id: String },

    #[error("invalid resource id {id:?}: ids are 1-63 chars of [a-z0-9_-], starting with a letter or digit")]
    InvalidId { id: String },

    #[error("resource {id} lists unknown resource {missing} in {edge}")]
    DanglingDependency {
        id: String,
        missing: String,
        edge: EdgeKind,
    },

    #[error("resource {id} references unknown resource {producer} in parameter value {reference:?}")]
    DanglingReference {
        id: String,
        producer: String,
        reference: String,
    },

    #[error("resource {id} references {producer} but does not list it in create_depends_on")]
    UndeclaredReference { id: String, producer: String },

    #[error("resource {id} has malformed reference {reference:?}; expected ${{<resource-id>.<attribute>}}")]
    MalformedReference { id: String, reference: String },

    #[error("{direction} dependency cycle: {}", .path.join(" -> "))]
    Cycle {
        direction: Direction,
        path: Vec<String>,
    },

    #[error("resource {id} has kind {kind} but no provider is registered for it")]
    NoProvider { id: String, kind: String },
}

/// Category of a retryable provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    RateLimited,
    Timeout,
    /// The provider is still converging (eventual consistency).
    Conflict,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransientKind::RateLimited => "rate-limited",
            TransientKind::Timeout => "timeout",
            TransientKind::Conflict => "conflict",
        })
    }
}

/// Error returned by a provider adapter call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The provider rejected the parameters. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Worth retrying after a backoff.
    #[error("transient {kind} error: {message}")]
    Transient { kind: TransientKind, message: String },

    /// Any other failure. Never retried.
    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn validation(message: impl Into<String>) -> Self {
        ProviderError::Validation(message.into())
    }

    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        ProviderError::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::transient(TransientKind::RateLimited, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ProviderError::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }
}

/// Result alias for provider adapter calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Why a single resource failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceError {
    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("gave up after {attempts} attempts: {last_error}")]
    TransientExhausted { attempts: u32, last_error: String },

    #[error("not ready after {waited_secs}s (last observed: {})", .last_observed.as_deref().unwrap_or("nothing"))]
    ReadinessTimeout {
        waited_secs: u64,
        last_observed: Option<String>,
    },

    #[error("probe reported failure: {reason}")]
    ProbeFailed { reason: String },

    #[error("{producer} is ready but did not emit output {attribute:?}")]
    MissingOutput { producer: String, attribute: String },

    #[error("secret {key:?} unavailable: {reason}")]
    SecretUnavailable { key: String, reason: String },

    #[error("{message}")]
    Provider { message: String },

    #[error("interrupted: {message}")]
    Interrupted { message: String },

    #[error("state store write failed: {message}")]
    State { message: String },
}

impl ResourceError {
    /// Classify a provider error that ends a resource's attempt.
    pub fn from_provider(err: ProviderError, attempts: u32) -> Self {
        match err {
            ProviderError::Validation(message) => ResourceError::Validation { message },
            ProviderError::Transient { .. } => ResourceError::TransientExhausted {
                attempts,
                last_error: err.to_string(),
            },
            ProviderError::Fatal(message) => ResourceError::Provider { message },
        }
    }
}

/// Top-level failure of a run.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid manifest: {0}")]
    Manifest(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;
