//! Persisted schema: per-resource status, handle, and attributes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Output attributes reported by a provider once a resource is ready.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Opaque identifier a provider adapter returns when it accepts a create.
///
/// The engine never interprets the handle; it is stored so that later probes
/// and destroys, possibly in a later process, address the same resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderHandle(pub String);

impl ProviderHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        ProviderHandle(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a single resource.
///
/// Create path: `Pending → Creating → WaitingReady → Ready`, with
/// `Creating`/`WaitingReady → CreatingFailed`.
/// Destroy path: `Ready → Destroying → Destroyed | DestroyFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Pending,
    Creating,
    WaitingReady,
    Ready,
    CreatingFailed,
    Destroying,
    Destroyed,
    DestroyFailed,
}

impl ResourceStatus {
    /// Whether `self → next` is an edge of the lifecycle state machine.
    ///
    /// Failed states re-enter their path on the next run (`CreatingFailed →
    /// Creating`, `DestroyFailed → Destroying`). A failed create that already
    /// holds a handle goes back to the readiness gate instead
    /// (`CreatingFailed → WaitingReady`). A resource that was accepted but
    /// never became ready may be torn down (`WaitingReady` or
    /// `CreatingFailed → Destroying`). `Pending → Destroyed` covers tearing
    /// down something that never existed.
    pub fn can_transition_to(self, next: ResourceStatus) -> bool {
        use ResourceStatus::*;
        matches!(
            (self, next),
            (Pending, Creating)
                | (Pending, Destroyed)
                | (Creating, WaitingReady)
                | (Creating, CreatingFailed)
                | (WaitingReady, Ready)
                | (WaitingReady, CreatingFailed)
                | (WaitingReady, Destroying)
                | (CreatingFailed, Creating)
                | (CreatingFailed, WaitingReady)
                | (CreatingFailed, Destroying)
                | (Ready, Destroying)
                | (Destroying, Destroyed)
                | (Destroying, DestroyFailed)
                | (DestroyFailed, Destroying)
        )
    }

    /// Terminal for an apply pass.
    pub fn is_create_terminal(self) -> bool {
        matches!(self, ResourceStatus::Ready | ResourceStatus::CreatingFailed)
    }

    /// Terminal for a destroy pass.
    pub fn is_destroy_terminal(self) -> bool {
        matches!(
            self,
            ResourceStatus::Destroyed | ResourceStatus::DestroyFailed
        )
    }

    /// A provider call was accepted but its outcome was never observed.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ResourceStatus::Creating | ResourceStatus::WaitingReady | ResourceStatus::Destroying
        )
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Creating => "creating",
            ResourceStatus::WaitingReady => "waiting_ready",
            ResourceStatus::Ready => "ready",
            ResourceStatus::CreatingFailed => "creating_failed",
            ResourceStatus::Destroying => "destroying",
            ResourceStatus::Destroyed => "destroyed",
            ResourceStatus::DestroyFailed => "destroy_failed",
        };
        f.write_str(s)
    }
}

/// Persisted record for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: String,
    pub kind: String,
    pub status: ResourceStatus,
    /// Present once a provider accepted the create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<ProviderHandle>,
    #[serde(default)]
    pub attributes: Attributes,
    /// Enqueue order of the most recent dispatch; strictly increasing per store.
    pub sequence: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// SHA-256 of the raw spec parameters at creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_digest: Option<String>,
    /// SHA-256 of the parameters after reference substitution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_digest: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    /// A fresh record in `Pending`.
    pub fn new(id: impl Into<String>, kind: impl Into<String>, sequence: u64) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            status: ResourceStatus::Pending,
            handle: None,
            attributes: Attributes::new(),
            sequence,
            attempts: 0,
            last_error: None,
            spec_digest: None,
            input_digest: None,
            updated_at: Utc::now(),
        }
    }
}
