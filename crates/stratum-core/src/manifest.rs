//! Manifest files: a table of resource id to declaration, in TOML or JSON.
//!
//! ```toml
//! [network]
//! kind = "network"
//! parameters = { cidr = "10.0.0.0/16" }
//!
//! [database]
//! kind = "managed-database"
//! create_depends_on = ["network"]
//! parameters = { vpc = "${network.vpc_id}" }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};
use crate::graph::validate_id;
use crate::model::{Parameters, ResourceSpec};

/// One resource as written in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDecl {
    pub kind: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default, alias = "depends_on")]
    pub create_depends_on: BTreeSet<String>,
    #[serde(default)]
    pub destroy_depends_on: BTreeSet<String>,
}

/// Parsed manifest, keyed by resource id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub resources: BTreeMap<String, ResourceDecl>,
}

impl Manifest {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ProvisionError::Manifest(e.to_string()))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| ProvisionError::Manifest(e.to_string()))
    }

    /// Load by extension: `.toml` or `.json`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProvisionError::Manifest(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("json") => Self::from_json_str(&text),
            _ => Err(ProvisionError::Manifest(format!(
                "{}: expected a .toml or .json file",
                path.display()
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Convert to specs, rejecting malformed ids. Graph-level checks happen
    /// when the specs are built into a graph.
    pub fn into_specs(self) -> Result<Vec<ResourceSpec>> {
        self.resources
            .into_iter()
            .map(|(id, decl)| -> Result<ResourceSpec> {
                validate_id(&id)?;
                Ok(ResourceSpec {
                    id,
                    kind: decl.kind.into(),
                    parameters: decl.parameters,
                    create_depends_on: decl.create_depends_on,
                    destroy_depends_on: decl.destroy_depends_on,
                })
            })
            .collect()
    }
}
