//! Scriptable provider adapter (testing only)
//!
//! `ScriptedProvider` plays back a per-resource [`Script`] and records every
//! call in order, so tests can assert on ordering, retry counts, and which
//! parameters a resource was created with.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use stratum_state::{Attributes, ProviderHandle};

use crate::error::{ProviderError, ProviderResult};
use crate::model::Parameters;
use crate::provider::ProviderAdapter;
use crate::readiness::Poll;

const HANDLE_PREFIX: &str = "scripted:";

/// Behaviour of one resource. The default is "accept and be ready at once".
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub transient_create_failures: u32,
    pub reject_create: Option<String>,
    pub fatal_create: Option<String>,
    pub create_delay: Option<Duration>,
    /// Pending answers before the first Ready.
    pub pending_polls: u32,
    pub attributes: Attributes,
    pub probe_failure: Option<String>,
    pub never_ready: bool,
    pub transient_destroy_failures: u32,
    pub reject_destroy: Option<String>,
    pub pending_destroy_polls: u32,
}

impl Script {
    pub fn ready() -> Self {
        Self::default()
    }

    pub fn attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn transient_failures(mut self, n: u32) -> Self {
        self.transient_create_failures = n;
        self
    }

    pub fn reject(mut self, message: impl Into<String>) -> Self {
        self.reject_create = Some(message.into());
        self
    }

    pub fn fatal(mut self, message: impl Into<String>) -> Self {
        self.fatal_create = Some(message.into());
        self
    }

    pub fn create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn pending(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn probe_fails(mut self, reason: impl Into<String>) -> Self {
        self.probe_failure = Some(reason.into());
        self
    }

    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    pub fn destroy_transient(mut self, n: u32) -> Self {
        self.transient_destroy_failures = n;
        self
    }

    pub fn destroy_rejects(mut self, message: impl Into<String>) -> Self {
        self.reject_destroy = Some(message.into());
        self
    }

    pub fn destroy_pending(mut self, polls: u32) -> Self {
        self.pending_destroy_polls = polls;
        self
    }
}

/// One recorded interaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProviderCall {
    Create(String),
    ProbeReady(String),
    Destroy(String),
    ProbeDestroyed(String),
    /// `probe_destroyed` reported the resource gone.
    Gone(String),
}

#[derive(Debug, Default)]
struct Inner {
    scripts: HashMap<String, Script>,
    calls: Vec<ProviderCall>,
    create_attempts: HashMap<String, u32>,
    ready_polls: HashMap<String, u32>,
    destroy_attempts: HashMap<String, u32>,
    destroy_polls: HashMap<String, u32>,
    created_with: HashMap<String, Parameters>,
    live: BTreeSet<String>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Adapter whose behaviour is scripted per resource id.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    inner: Mutex<Inner>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, id: impl Into<String>, script: Script) -> Self {
        self.set_script(id, script);
        self
    }

    pub fn set_script(&self, id: impl Into<String>, script: Script) {
        self.inner.lock().unwrap().scripts.insert(id.into(), script);
    }

    /// Change what `id` reports from now on, as a live resource might.
    pub fn set_attributes(&self, id: &str, attributes: Attributes) {
        let mut inner = self.inner.lock().unwrap();
        inner.scripts.entry(id.to_string()).or_default().attributes = attributes;
    }

    pub fn handle_for(id: &str) -> ProviderHandle {
        ProviderHandle::new(format!("{HANDLE_PREFIX}{id}"))
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Index of the first occurrence of `call`.
    pub fn position(&self, call: &ProviderCall) -> Option<usize> {
        self.inner.lock().unwrap().calls.iter().position(|c| c == call)
    }

    pub fn creates(&self, id: &str) -> u32 {
        self.count(|c| matches!(c, ProviderCall::Create(x) if x == id))
    }

    pub fn total_creates(&self) -> u32 {
        self.count(|c| matches!(c, ProviderCall::Create(_)))
    }

    pub fn destroys(&self, id: &str) -> u32 {
        self.count(|c| matches!(c, ProviderCall::Destroy(x) if x == id))
    }

    pub fn total_destroys(&self) -> u32 {
        self.count(|c| matches!(c, ProviderCall::Destroy(_)))
    }

    fn count(&self, pred: impl Fn(&ProviderCall) -> bool) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.calls.iter().filter(|c| pred(c)).count() as u32
    }

    /// Resolved parameters of the last successful create of `id`.
    pub fn created_with(&self, id: &str) -> Option<Parameters> {
        self.inner.lock().unwrap().created_with.get(id).cloned()
    }

    /// Ids created and not yet reported gone.
    pub fn live(&self) -> BTreeSet<String> {
        self.inner.lock().unwrap().live.clone()
    }

    /// Highest number of `create` calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.inner.lock().unwrap().max_in_flight
    }

    fn id_of(handle: &ProviderHandle) -> ProviderResult<String> {
        handle
            .as_str()
            .strip_prefix(HANDLE_PREFIX)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::fatal(format!("unknown handle {handle}")))
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    async fn create(&self, id: &str, parameters: &Parameters) -> ProviderResult<ProviderHandle> {
        let (script, attempt) = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(ProviderCall::Create(id.to_string()));
            let attempt = {
                let n = inner.create_attempts.entry(id.to_string()).or_default();
                *n += 1;
                *n
            };
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
            (inner.scripts.get(id).cloned().unwrap_or_default(), attempt)
        };

        if let Some(delay) = script.create_delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.in_flight -= 1;
        if let Some(message) = script.reject_create {
            return Err(ProviderError::validation(message));
        }
        if let Some(message) = script.fatal_create {
            return Err(ProviderError::fatal(message));
        }
        if attempt <= script.transient_create_failures {
            return Err(ProviderError::rate_limited(format!(
                "throttled on attempt {attempt}"
            )));
        }
        inner.created_with.insert(id.to_string(), parameters.clone());
        inner.ready_polls.insert(id.to_string(), 0);
        inner.live.insert(id.to_string());
        Ok(Self::handle_for(id))
    }

    async fn probe_ready(&self, handle: &ProviderHandle) -> ProviderResult<Poll<Attributes>> {
        let id = Self::id_of(handle)?;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(ProviderCall::ProbeReady(id.clone()));
        let polls = {
            let n = inner.ready_polls.entry(id.clone()).or_default();
            *n += 1;
            *n
        };
        let script = inner.scripts.get(&id).cloned().unwrap_or_default();
        if let Some(reason) = script.probe_failure {
            return Ok(Poll::failed(reason));
        }
        if script.never_ready || polls <= script.pending_polls {
            return Ok(Poll::pending_with("PROVISIONING"));
        }
        Ok(Poll::Ready(script.attributes))
    }

    async fn destroy(&self, handle: &ProviderHandle) -> ProviderResult<()> {
        let id = Self::id_of(handle)?;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(ProviderCall::Destroy(id.clone()));
        let attempt = {
            let n = inner.destroy_attempts.entry(id.clone()).or_default();
            *n += 1;
            *n
        };
        let script = inner.scripts.get(&id).cloned().unwrap_or_default();
        if let Some(message) = script.reject_destroy {
            return Err(ProviderError::validation(message));
        }
        if attempt <= script.transient_destroy_failures {
            return Err(ProviderError::rate_limited(format!(
                "throttled on attempt {attempt}"
            )));
        }
        inner.destroy_polls.insert(id, 0);
        Ok(())
    }

    async fn probe_destroyed(&self, handle: &ProviderHandle) -> ProviderResult<Poll<()>> {
        let id = Self::id_of(handle)?;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(ProviderCall::ProbeDestroyed(id.clone()));
        let polls = {
            let n = inner.destroy_polls.entry(id.clone()).or_default();
            *n += 1;
            *n
        };
        let pending = inner
            .scripts
            .get(&id)
            .map_or(0, |s| s.pending_destroy_polls);
        if polls <= pending {
            return Ok(Poll::pending_with("DELETING"));
        }
        inner.live.remove(&id);
        inner.calls.push(ProviderCall::Gone(id));
        Ok(Poll::Ready(()))
    }
}

/// Attributes literal for tests: `attrs([("endpoint", json!("db:5432"))])`.
pub fn attrs<const N: usize>(pairs: [(&str, serde_json::Value); N]) -> Attributes {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect::<BTreeMap<_, _>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_transient_then_ready() {
        let provider = ScriptedProvider::new().script(
            "cluster",
            Script::ready()
                .transient_failures(1)
                .pending(1)
                .attribute("endpoint", "https://k8s"),
        );
        let params = Parameters::new();
        assert!(provider.create("cluster", &params).await.unwrap_err().is_retryable());
        let handle = provider.create("cluster", &params).await.unwrap();
        assert!(matches!(
            provider.probe_ready(&handle).await.unwrap(),
            Poll::Pending { .. }
        ));
        assert_eq!(
            provider.probe_ready(&handle).await.unwrap(),
            Poll::Ready(attrs([("endpoint", json!("https://k8s"))]))
        );
        assert_eq!(provider.creates("cluster"), 2);
        assert!(provider.live().contains("cluster"));
    }

    #[tokio::test]
    async fn test_scripted_destroy_records_gone() {
        let provider = ScriptedProvider::new();
        let handle = provider.create("network", &Parameters::new()).await.unwrap();
        provider.destroy(&handle).await.unwrap();
        assert_eq!(provider.probe_destroyed(&handle).await.unwrap(), Poll::Ready(()));
        assert!(provider.live().is_empty());
        assert!(provider
            .position(&ProviderCall::Gone("network".into()))
            .is_some());
    }
}
