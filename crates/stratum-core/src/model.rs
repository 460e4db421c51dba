//! Resource model: immutable specs and the mutable runtime node.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stratum_state::{Attributes, ProviderHandle, ResourceStatus, StateRecord};

use crate::error::ResourceError;

/// Opaque provider parameters. Values may embed `${id.attr}` references and
/// `{"secret_ref": "..."}` markers.
pub type Parameters = BTreeMap<String, serde_json::Value>;

/// Which pass of the engine is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Create,
    Destroy,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Create => "create",
            Direction::Destroy => "destroy",
        })
    }
}

/// Which declared edge list a dependency came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    CreateDependsOn,
    DestroyDependsOn,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EdgeKind::CreateDependsOn => "create_depends_on",
            EdgeKind::DestroyDependsOn => "destroy_depends_on",
        })
    }
}

/// Resource category; selects the provider adapter.
///
/// Unknown kinds round-trip through `Other` so adapters can be registered for
/// kinds this crate has never heard of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    Network,
    Cluster,
    NodePool,
    ManagedDatabase,
    ObjectStore,
    Secret,
    Workload,
    DnsRecord,
    LoadBalancer,
    /// Destroy-time delay node, see [`crate::builtin::WaitProvider`].
    Wait,
    /// Echoes its parameters as outputs, see [`crate::builtin::NullProvider`].
    Null,
    Other(String),
}

impl ResourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Cluster => "cluster",
            ResourceKind::NodePool => "node-pool",
            ResourceKind::ManagedDatabase => "managed-database",
            ResourceKind::ObjectStore => "object-store",
            ResourceKind::Secret => "secret",
            ResourceKind::Workload => "workload",
            ResourceKind::DnsRecord => "dns-record",
            ResourceKind::LoadBalancer => "load-balancer",
            ResourceKind::Wait => "wait",
            ResourceKind::Null => "null",
            ResourceKind::Other(s) => s,
        }
    }
}

impl From<&str> for ResourceKind {
    fn from(s: &str) -> Self {
        match s {
            "network" => ResourceKind::Network,
            "cluster" => ResourceKind::Cluster,
            "node-pool" => ResourceKind::NodePool,
            "managed-database" => ResourceKind::ManagedDatabase,
            "object-store" => ResourceKind::ObjectStore,
            "secret" => ResourceKind::Secret,
            "workload" => ResourceKind::Workload,
            "dns-record" => ResourceKind::DnsRecord,
            "load-balancer" => ResourceKind::LoadBalancer,
            "wait" => ResourceKind::Wait,
            "null" => ResourceKind::Null,
            other => ResourceKind::Other(other.to_string()),
        }
    }
}

impl From<String> for ResourceKind {
    fn from(s: String) -> Self {
        ResourceKind::from(s.as_str())
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one provisionable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub id: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub parameters: Parameters,
    /// Must be Ready before this resource is created.
    #[serde(default)]
    pub create_depends_on: BTreeSet<String>,
    /// Must wait for this resource's destroy before they are destroyed
    /// themselves (destroy-only edges, on top of the inverted create edges).
    #[serde(default)]
    pub destroy_depends_on: BTreeSet<String>,
}

impl ResourceSpec {
    pub fn new(id: impl Into<String>, kind: impl Into<ResourceKind>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            parameters: Parameters::new(),
            create_depends_on: BTreeSet::new(),
            destroy_depends_on: BTreeSet::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.create_depends_on.insert(id.into());
        self
    }

    pub fn destroy_depends_on(mut self, id: impl Into<String>) -> Self {
        self.destroy_depends_on.insert(id.into());
        self
    }

    /// SHA-256 of the raw parameters, used to notice edits to a spec whose
    /// resource already exists.
    pub fn digest(&self) -> String {
        parameters_digest(&self.parameters)
    }
}

/// SHA-256 hex digest of a parameter map. Keys are ordered, so equal maps
/// hash equally.
pub fn parameters_digest(parameters: &Parameters) -> String {
    let bytes = serde_json::to_vec(parameters).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Attempted a transition the lifecycle does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("resource {id}: illegal transition {from} -> {to}")]
pub struct InvalidTransition {
    pub id: String,
    pub from: ResourceStatus,
    pub to: ResourceStatus,
}

/// Runtime record of one resource, owned by the task driving it.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    pub spec: Arc<ResourceSpec>,
    status: ResourceStatus,
    pub attributes: Attributes,
    pub attempts: u32,
    pub last_error: Option<ResourceError>,
    pub handle: Option<ProviderHandle>,
    pub sequence: u64,
    pub input_digest: Option<String>,
    spec_digest: Option<String>,
}

impl ResourceNode {
    pub fn new(spec: Arc<ResourceSpec>) -> Self {
        Self {
            spec,
            status: ResourceStatus::Pending,
            attributes: Attributes::new(),
            attempts: 0,
            last_error: None,
            handle: None,
            sequence: 0,
            input_digest: None,
            spec_digest: None,
        }
    }

    /// Rebuild a node from what a previous run persisted.
    pub fn from_record(spec: Arc<ResourceSpec>, record: &StateRecord) -> Self {
        Self {
            spec,
            status: record.status,
            attributes: record.attributes.clone(),
            attempts: record.attempts,
            last_error: None,
            handle: record.handle.clone(),
            sequence: record.sequence,
            input_digest: record.input_digest.clone(),
            spec_digest: record.spec_digest.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn status(&self) -> ResourceStatus {
        self.status
    }

    /// The digest of the spec parameters this resource was created from.
    pub fn recorded_spec_digest(&self) -> Option<&str> {
        self.spec_digest.as_deref()
    }

    /// Move along the lifecycle, rejecting edges the state machine lacks.
    pub fn advance(&mut self, to: ResourceStatus) -> Result<ResourceStatus, InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                id: self.spec.id.clone(),
                from: self.status,
                to,
            });
        }
        let from = self.status;
        self.status = to;
        if to == ResourceStatus::Creating {
            self.spec_digest = Some(self.spec.digest());
        }
        Ok(from)
    }

    pub fn to_record(&self) -> StateRecord {
        let mut record =
            StateRecord::new(self.spec.id.clone(), self.spec.kind.as_str(), self.sequence);
        record.status = self.status;
        record.handle = self.handle.clone();
        record.attributes = self.attributes.clone();
        record.attempts = self.attempts;
        record.last_error = self.last_error.as_ref().map(ToString::to_string);
        record.spec_digest = self.spec_digest.clone();
        record.input_digest = self.input_digest.clone();
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_strings() {
        for kind in [
            ResourceKind::ManagedDatabase,
            ResourceKind::DnsRecord,
            ResourceKind::Other("gpu-pool".into()),
        ] {
            let s: String = kind.clone().into();
            assert_eq!(ResourceKind::from(s), kind);
        }
    }

    #[test]
    fn test_kind_serde_is_plain_string() {
        let json = serde_json::to_string(&ResourceKind::ObjectStore).unwrap();
        assert_eq!(json, "\"object-store\"");
        let kind: ResourceKind = serde_json::from_str("\"tracking-server\"").unwrap();
        assert_eq!(kind, ResourceKind::Other("tracking-server".into()));
    }

    #[test]
    fn test_spec_digest_ignores_insertion_order() {
        let a = ResourceSpec::new("db", "managed-database")
            .param("engine", "postgres")
            .param("size", "small");
        let b = ResourceSpec::new("db", "managed-database")
            .param("size", "small")
            .param("engine", "postgres");
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), a.clone().param("size", "large").digest());
    }

    #[test]
    fn test_node_follows_create_path() {
        let mut node = ResourceNode::new(Arc::new(ResourceSpec::new("network", "network")));
        node.advance(ResourceStatus::Creating).unwrap();
        node.advance(ResourceStatus::WaitingReady).unwrap();
        node.advance(ResourceStatus::Ready).unwrap();
        assert_eq!(node.status(), ResourceStatus::Ready);
        assert!(node.recorded_spec_digest().is_some());
    }

    #[test]
    fn test_node_rejects_illegal_transition() {
        let mut node = ResourceNode::new(Arc::new(ResourceSpec::new("network", "network")));
        let err = node.advance(ResourceStatus::Ready).unwrap_err();
        assert_eq!(err.from, ResourceStatus::Pending);
        assert_eq!(node.status(), ResourceStatus::Pending);
    }

    #[test]
    fn test_record_round_trip_preserves_handle_and_attributes() {
        let spec = Arc::new(ResourceSpec::new("database", "managed-database"));
        let mut node = ResourceNode::new(Arc::clone(&spec));
        node.sequence = 4;
        node.handle = Some(ProviderHandle::new("db-1"));
        node.attributes.insert("endpoint".into(), serde_json::json!("db:5432"));
        node.advance(ResourceStatus::Creating).unwrap();

        let record = node.to_record();
        assert_eq!(record.kind, "managed-database");
        let restored = ResourceNode::from_record(spec, &record);
        assert_eq!(restored.status(), ResourceStatus::Creating);
        assert_eq!(restored.handle, node.handle);
        assert_eq!(restored.attributes, node.attributes);
        assert_eq!(restored.sequence, 4);
    }
}
