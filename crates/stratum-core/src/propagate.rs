//! Value propagation: producer outputs flowing into consumer parameters.
//!
//! Two markers are recognised anywhere inside a parameter value:
//!
//! - `${<producer-id>.<attribute>}` inside a string. A string that is exactly
//!   one reference takes the attribute's JSON value as-is; otherwise each
//!   reference is interpolated as text.
//! - `{"secret_ref": "<key>"}` as a whole object, resolved via a
//!   [`SecretStore`].
//!
//! Substitution happens once, when the consumer is about to be created, from
//! the producer attributes visible at that moment.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use stratum_state::Attributes;

use crate::error::{ResourceError, StructuralError};
use crate::model::Parameters;

const SECRET_REF_KEY: &str = "secret_ref";

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]*)\}").expect("static reference pattern"))
}

fn reference_body_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([a-z0-9][a-z0-9_-]*)\.([A-Za-z0-9_][A-Za-z0-9_.-]*)$")
            .expect("static reference body pattern")
    })
}

/// A `${producer.attribute}` occurrence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    pub producer: String,
    pub attribute: String,
    /// The full `${...}` text as written.
    pub raw: String,
}

fn parse_reference(owner: &str, raw: &str, body: &str) -> Result<Reference, StructuralError> {
    let caps = reference_body_pattern()
        .captures(body)
        .ok_or_else(|| StructuralError::MalformedReference {
            id: owner.to_string(),
            reference: raw.to_string(),
        })?;
    Ok(Reference {
        producer: caps[1].to_string(),
        attribute: caps[2].to_string(),
        raw: raw.to_string(),
    })
}

fn walk_strings<'a>(value: &'a Value, visit: &mut dyn FnMut(&'a str)) {
    match value {
        Value::String(s) => visit(s),
        Value::Array(items) => items.iter().for_each(|v| walk_strings(v, visit)),
        Value::Object(map) => map.values().for_each(|v| walk_strings(v, visit)),
        _ => {}
    }
}

/// All references in `parameters`, deduplicated and ordered.
pub fn collect_references(
    owner: &str,
    parameters: &Parameters,
) -> Result<Vec<Reference>, StructuralError> {
    let mut found = BTreeSet::new();
    let mut first_error = None;
    for value in parameters.values() {
        walk_strings(value, &mut |s| {
            for caps in reference_pattern().captures_iter(s) {
                match parse_reference(owner, &caps[0], &caps[1]) {
                    Ok(r) => {
                        found.insert(r);
                    }
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
        });
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(found.into_iter().collect()),
    }
}

fn as_secret_ref(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(SECRET_REF_KEY).and_then(Value::as_str),
        _ => None,
    }
}

fn collect_secret_keys(value: &Value, out: &mut BTreeSet<String>) {
    if let Some(key) = as_secret_ref(value) {
        out.insert(key.to_string());
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_secret_keys(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_secret_keys(v, out)),
        _ => {}
    }
}

/// Every secret key `parameters` asks for.
pub fn secret_keys(parameters: &Parameters) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for value in parameters.values() {
        collect_secret_keys(value, &mut keys);
    }
    keys
}

/// Failure to look up a secret.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Backend(String),
}

/// External secret collaborator consulted for `secret_ref` markers.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn resolve(&self, key: &str) -> Result<Value, SecretError>;
}

/// Secrets held in memory; for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: BTreeMap<String, Value>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.secrets.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn resolve(&self, key: &str) -> Result<Value, SecretError> {
        self.secrets.get(key).cloned().ok_or(SecretError::NotFound)
    }
}

/// Secrets read from environment variables.
///
/// Key `tracking/db-password` with prefix `STRATUM_SECRET_` reads
/// `STRATUM_SECRET_TRACKING_DB_PASSWORD`.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_for(&self, key: &str) -> String {
        let suffix: String = key
            .chars()
            .map(|c| match c {
                '/' | '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new("STRATUM_SECRET_")
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn resolve(&self, key: &str) -> Result<Value, SecretError> {
        match std::env::var(self.variable_for(key)) {
            Ok(v) => Ok(Value::String(v)),
            Err(std::env::VarError::NotPresent) => Err(SecretError::NotFound),
            Err(e) => Err(SecretError::Backend(e.to_string())),
        }
    }
}

/// Frozen producer outputs, keyed by producer id.
pub type Outputs = BTreeMap<String, Attributes>;

fn lookup<'a>(outputs: &'a Outputs, r: &Reference) -> Result<&'a Value, ResourceError> {
    outputs
        .get(&r.producer)
        .and_then(|attrs| attrs.get(&r.attribute))
        .ok_or_else(|| ResourceError::MissingOutput {
            producer: r.producer.clone(),
            attribute: r.attribute.clone(),
        })
}

fn substitute_string(owner: &str, s: &str, outputs: &Outputs) -> Result<Value, ResourceError> {
    let pattern = reference_pattern();
    let parse = |raw: &str, body: &str| {
        parse_reference(owner, raw, body).map_err(|e| ResourceError::Validation {
            message: e.to_string(),
        })
    };

    if let Some(caps) = pattern.captures(s) {
        if caps[0].len() == s.len() {
            let r = parse(&caps[0], &caps[1])?;
            return lookup(outputs, &r).cloned();
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in pattern.captures_iter(s) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let r = parse(&caps[0], &caps[1])?;
        out.push_str(&s[last..whole.start]);
        match lookup(outputs, &r)? {
            Value::String(v) => out.push_str(v),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end;
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

fn substitute(
    owner: &str,
    value: &Value,
    outputs: &Outputs,
    secrets: &BTreeMap<String, Value>,
) -> Result<Value, ResourceError> {
    if let Some(key) = as_secret_ref(value) {
        return secrets
            .get(key)
            .cloned()
            .ok_or_else(|| ResourceError::SecretUnavailable {
                key: key.to_string(),
                reason: "not resolved".to_string(),
            });
    }
    Ok(match value {
        Value::String(s) => substitute_string(owner, s, outputs)?,
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute(owner, v, outputs, secrets))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), substitute(owner, v, outputs, secrets)?)))
                .collect::<Result<_, ResourceError>>()?,
        ),
        other => other.clone(),
    })
}

/// Produce the concrete parameters for `owner`.
///
/// Fails with [`ResourceError::MissingOutput`] when a referenced attribute is
/// absent, rather than substituting an empty value, and with
/// [`ResourceError::SecretUnavailable`] when a secret cannot be resolved.
pub async fn resolve_parameters(
    owner: &str,
    parameters: &Parameters,
    outputs: &Outputs,
    secrets: Option<&dyn SecretStore>,
) -> Result<Parameters, ResourceError> {
    let mut resolved_secrets = BTreeMap::new();
    for key in secret_keys(parameters) {
        let store = secrets.ok_or_else(|| ResourceError::SecretUnavailable {
            key: key.clone(),
            reason: "no secret store configured".to_string(),
        })?;
        let value = store
            .resolve(&key)
            .await
            .map_err(|e| ResourceError::SecretUnavailable {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        resolved_secrets.insert(key, value);
    }

    parameters
        .iter()
        .map(|(k, v)| Ok((k.clone(), substitute(owner, v, outputs, &resolved_secrets)?)))
        .collect()
}
