//! Adapters that need no external API.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use stratum_state::{Attributes, ProviderHandle};
use tokio::time::Instant;

use crate::error::{ProviderError, ProviderResult};
use crate::model::Parameters;
use crate::provider::ProviderAdapter;
use crate::readiness::Poll;

/// Parameter naming the teardown delay of a `wait` node.
pub const DESTROY_DELAY_PARAM: &str = "destroy_delay_secs";

/// Explicit drain node for kind `wait`.
///
/// Creation has no effect and is immediately ready. Destruction is accepted
/// at once but only reported gone after `destroy_delay_secs` have elapsed.
/// Placed between two resources with `destroy_depends_on` edges, it delays
/// the second teardown until the first has drained:
///
/// ```toml
/// [lb]
/// kind = "load-balancer"
/// destroy_depends_on = ["eni-drain"]
///
/// [eni-drain]
/// kind = "wait"
/// parameters = { destroy_delay_secs = 300 }
/// destroy_depends_on = ["network"]
/// ```
#[derive(Debug, Default)]
pub struct WaitProvider {
    deadlines: Mutex<HashMap<String, Instant>>,
}

impl WaitProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn delay_of(handle: &ProviderHandle) -> ProviderResult<Duration> {
        handle
            .as_str()
            .rsplit_once(':')
            .and_then(|(_, secs)| secs.parse::<u64>().ok())
            .map(Duration::from_secs)
            .ok_or_else(|| ProviderError::fatal(format!("malformed wait handle {handle}")))
    }
}

#[async_trait]
impl ProviderAdapter for WaitProvider {
    async fn create(&self, id: &str, parameters: &Parameters) -> ProviderResult<ProviderHandle> {
        let secs = match parameters.get(DESTROY_DELAY_PARAM) {
            None => 0,
            Some(value) => value.as_u64().ok_or_else(|| {
                ProviderError::validation(format!(
                    "{DESTROY_DELAY_PARAM} must be a non-negative integer, got {value}"
                ))
            })?,
        };
        Ok(ProviderHandle::new(format!("wait:{id}:{secs}")))
    }

    async fn probe_ready(&self, _handle: &ProviderHandle) -> ProviderResult<Poll<Attributes>> {
        Ok(Poll::Ready(Attributes::new()))
    }

    async fn destroy(&self, handle: &ProviderHandle) -> ProviderResult<()> {
        let deadline = Instant::now() + Self::delay_of(handle)?;
        self.deadlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.as_str().to_string(), deadline);
        Ok(())
    }

    async fn probe_destroyed(&self, handle: &ProviderHandle) -> ProviderResult<Poll<()>> {
        let delay = Self::delay_of(handle)?;
        let now = Instant::now();
        let mut deadlines = self.deadlines.lock().unwrap_or_else(PoisonError::into_inner);
        // A resumed destroy has no recorded deadline; the delay restarts.
        let deadline = *deadlines
            .entry(handle.as_str().to_string())
            .or_insert(now + delay);
        if now >= deadline {
            deadlines.remove(handle.as_str());
            Ok(Poll::Ready(()))
        } else {
            let left = deadline - now;
            Ok(Poll::pending_with(format!(
                "draining, {}s left",
                left.as_secs_f64().ceil() as u64
            )))
        }
    }
}

const NULL_HANDLE_PREFIX: &str = "null:";

/// Kind `null`: ready immediately, echoing its resolved parameters as
/// attributes. Publishes computed values and lets manifests be wired up
/// without a real provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProvider;

#[async_trait]
impl ProviderAdapter for NullProvider {
    async fn create(&self, _id: &str, parameters: &Parameters) -> ProviderResult<ProviderHandle> {
        let body = serde_json::to_string(parameters)
            .map_err(|e| ProviderError::validation(e.to_string()))?;
        Ok(ProviderHandle::new(format!("{NULL_HANDLE_PREFIX}{body}")))
    }

    async fn probe_ready(&self, handle: &ProviderHandle) -> ProviderResult<Poll<Attributes>> {
        let body = handle
            .as_str()
            .strip_prefix(NULL_HANDLE_PREFIX)
            .ok_or_else(|| ProviderError::fatal(format!("not a null handle: {handle}")))?;
        let attributes: Attributes =
            serde_json::from_str(body).map_err(|e| ProviderError::fatal(e.to_string()))?;
        Ok(Poll::Ready(attributes))
    }

    async fn destroy(&self, _handle: &ProviderHandle) -> ProviderResult<()> {
        Ok(())
    }

    async fn probe_destroyed(&self, _handle: &ProviderHandle) -> ProviderResult<Poll<()>> {
        Ok(Poll::Ready(()))
    }
}
