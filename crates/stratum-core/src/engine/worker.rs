//! Drives one resource through its create or destroy path.
//!
//! The worker is the single writer of its node: every status transition is
//! persisted before the next provider call, so a crash loses at most the
//! in-flight step.

use std::sync::Arc;

use stratum_state::{ResourceStatus, StateStore};
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::error::ResourceError;
use crate::metrics::METRICS;
use crate::model::{parameters_digest, Direction, ResourceNode};
use crate::obs;
use crate::propagate::{resolve_parameters, Outputs, SecretStore};
use crate::provider::ProviderAdapter;
use crate::readiness::{GateOutcome, ReadinessGate};
use crate::retry::{call_with_retry, RetryOutcome, RetryPolicy};

use super::result::{OutcomeStatus, SkipReason};

/// What a worker hands back to the engine.
#[derive(Debug)]
pub(crate) struct NodeReport {
    pub node: ResourceNode,
    pub status: OutcomeStatus,
    pub changed: bool,
    pub error: Option<ResourceError>,
    pub skip_reason: Option<SkipReason>,
    /// A state write failed; the engine must stop dispatching.
    pub state_failed: bool,
}

/// Why a drive stopped short of its goal.
enum Stop {
    Failed(ResourceError),
    Interrupted(ResourceError),
    State(ResourceError),
}

pub(crate) struct Worker {
    pub store: Arc<dyn StateStore>,
    pub secrets: Option<Arc<dyn SecretStore>>,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub retry: RetryPolicy,
    pub gate: ReadinessGate,
    pub cancel: CancelSignal,
}

fn interrupted(message: &str) -> ResourceError {
    ResourceError::Interrupted {
        message: message.to_string(),
    }
}

impl Worker {
    pub async fn create(self, mut node: ResourceNode, outputs: Outputs) -> NodeReport {
        if self.cancel.is_cancelled() {
            return not_started(node);
        }
        let mut changed = false;
        let result = self.drive_create(&mut node, &outputs, &mut changed).await;
        self.finish(node, result, changed, Direction::Create).await
    }

    pub async fn destroy(self, mut node: ResourceNode) -> NodeReport {
        if self.cancel.is_cancelled() {
            return not_started(node);
        }
        let mut changed = false;
        let result = self.drive_destroy(&mut node, &mut changed).await;
        self.finish(node, result, changed, Direction::Destroy).await
    }

    fn transition(&self, node: &mut ResourceNode, to: ResourceStatus) -> Result<(), Stop> {
        let from = node
            .advance(to)
            .map_err(|e| Stop::Failed(ResourceError::Validation {
                message: e.to_string(),
            }))?;
        obs::emit_transition(node.id(), from, to);
        Ok(())
    }

    async fn persist(&self, node: &ResourceNode) -> Result<(), Stop> {
        self.store.put(node.to_record()).await.map_err(|e| {
            Stop::State(ResourceError::State {
                message: e.to_string(),
            })
        })
    }

    async fn step(&self, node: &mut ResourceNode, to: ResourceStatus) -> Result<(), Stop> {
        self.transition(node, to)?;
        self.persist(node).await
    }

    async fn drive_create(
        &self,
        node: &mut ResourceNode,
        outputs: &Outputs,
        changed: &mut bool,
    ) -> Result<(), Stop> {
        // Once a provider has handed out a handle the resource exists; a new
        // create would orphan it.
        let resumable = matches!(
            node.status(),
            ResourceStatus::Creating | ResourceStatus::WaitingReady | ResourceStatus::CreatingFailed
        ) && node.handle.is_some();

        if resumable {
            debug!(id = %node.id(), from = %node.status(), "resuming at readiness gate");
            if node.status() != ResourceStatus::WaitingReady {
                node.last_error = None;
                self.step(node, ResourceStatus::WaitingReady).await?;
            }
        } else {
            if node.status() == ResourceStatus::Creating {
                // Create was in flight when the previous run stopped and no
                // handle came back; start over.
                self.transition(node, ResourceStatus::CreatingFailed)?;
            }
            node.last_error = None;
            node.attempts = 0;
            self.step(node, ResourceStatus::Creating).await?;

            let spec = Arc::clone(&node.spec);
            let parameters =
                resolve_parameters(&spec.id, &spec.parameters, outputs, self.secrets.as_deref())
                    .await
                    .map_err(Stop::Failed)?;
            node.input_digest = Some(parameters_digest(&parameters));

            *changed = true;
            let adapter = &self.adapter;
            let outcome = call_with_retry(&self.retry, &spec.id, "create", &self.cancel, || {
                METRICS.inc_provider_creates();
                adapter.create(&spec.id, &parameters)
            })
            .await;

            match outcome {
                RetryOutcome::Done {
                    result: Ok(handle),
                    attempts,
                } => {
                    node.attempts = attempts;
                    node.handle = Some(handle);
                    self.step(node, ResourceStatus::WaitingReady).await?;
                }
                RetryOutcome::Done {
                    result: Err(err),
                    attempts,
                } => {
                    node.attempts = attempts;
                    return Err(Stop::Failed(ResourceError::from_provider(err, attempts)));
                }
                RetryOutcome::Cancelled {
                    attempts,
                    last_error,
                } => {
                    node.attempts = attempts;
                    self.transition(node, ResourceStatus::CreatingFailed)?;
                    return Err(Stop::Interrupted(interrupted(&format!(
                        "cancelled while retrying create after: {last_error}"
                    ))));
                }
            }
        }

        let Some(handle) = node.handle.clone() else {
            return Err(Stop::Failed(ResourceError::Provider {
                message: "no provider handle to probe".into(),
            }));
        };
        let adapter = &self.adapter;
        match self.gate.wait(|| adapter.probe_ready(&handle), &self.cancel).await {
            GateOutcome::Ready { value, polls } => {
                debug!(id = %node.id(), polls, "ready");
                node.attributes = value;
                self.step(node, ResourceStatus::Ready).await
            }
            GateOutcome::Failed { reason, .. } => {
                Err(Stop::Failed(ResourceError::ProbeFailed { reason }))
            }
            GateOutcome::TimedOut {
                waited,
                last_observed,
            } => Err(Stop::Failed(ResourceError::ReadinessTimeout {
                waited_secs: waited.as_secs(),
                last_observed,
            })),
            GateOutcome::Cancelled { .. } => Err(Stop::Interrupted(interrupted(
                "cancelled while waiting for readiness",
            ))),
        }
    }

    async fn drive_destroy(&self, node: &mut ResourceNode, changed: &mut bool) -> Result<(), Stop> {
        let Some(handle) = node.handle.clone() else {
            return Err(Stop::Failed(ResourceError::Provider {
                message: "no provider handle to destroy".into(),
            }));
        };

        if node.status() == ResourceStatus::Destroying {
            debug!(id = %node.id(), "resuming at destroy probe");
        } else {
            if node.status() == ResourceStatus::Creating {
                self.transition(node, ResourceStatus::CreatingFailed)?;
            }
            node.last_error = None;
            self.step(node, ResourceStatus::Destroying).await?;

            *changed = true;
            let adapter = &self.adapter;
            let id = node.id().to_string();
            let outcome = call_with_retry(&self.retry, &id, "destroy", &self.cancel, || {
                METRICS.inc_provider_destroys();
                adapter.destroy(&handle)
            })
            .await;

            match outcome {
                RetryOutcome::Done {
                    result: Ok(()),
                    attempts,
                } => node.attempts = attempts,
                RetryOutcome::Done {
                    result: Err(err),
                    attempts,
                } => {
                    node.attempts = attempts;
                    return Err(Stop::Failed(ResourceError::from_provider(err, attempts)));
                }
                RetryOutcome::Cancelled {
                    attempts,
                    last_error,
                } => {
                    node.attempts = attempts;
                    self.transition(node, ResourceStatus::DestroyFailed)?;
                    return Err(Stop::Interrupted(interrupted(&format!(
                        "cancelled while retrying destroy after: {last_error}"
                    ))));
                }
            }
        }

        let adapter = &self.adapter;
        match self
            .gate
            .wait(|| adapter.probe_destroyed(&handle), &self.cancel)
            .await
        {
            GateOutcome::Ready { .. } => {
                self.transition(node, ResourceStatus::Destroyed)?;
                self.store.remove(node.id()).await.map_err(|e| {
                    Stop::State(ResourceError::State {
                        message: e.to_string(),
                    })
                })
            }
            GateOutcome::Failed { reason, .. } => {
                Err(Stop::Failed(ResourceError::ProbeFailed { reason }))
            }
            GateOutcome::TimedOut {
                waited,
                last_observed,
            } => Err(Stop::Failed(ResourceError::ReadinessTimeout {
                waited_secs: waited.as_secs(),
                last_observed,
            })),
            GateOutcome::Cancelled { .. } => Err(Stop::Interrupted(interrupted(
                "cancelled while waiting for deletion",
            ))),
        }
    }

    /// Turn a drive result into a report, recording failures durably.
    async fn finish(
        &self,
        mut node: ResourceNode,
        result: Result<(), Stop>,
        changed: bool,
        direction: Direction,
    ) -> NodeReport {
        let (done, failed, failed_status) = match direction {
            Direction::Create => (
                OutcomeStatus::Ready,
                OutcomeStatus::CreateFailed,
                ResourceStatus::CreatingFailed,
            ),
            Direction::Destroy => (
                OutcomeStatus::Destroyed,
                OutcomeStatus::DestroyFailed,
                ResourceStatus::DestroyFailed,
            ),
        };

        let mut report = NodeReport {
            status: done,
            changed,
            error: None,
            skip_reason: None,
            state_failed: false,
            node: ResourceNode::new(Arc::clone(&node.spec)),
        };

        match result {
            Ok(()) => {}
            Err(Stop::Failed(err)) => {
                warn!(id = %node.id(), error = %err, "{direction} failed");
                node.last_error = Some(err.clone());
                report.status = failed;
                report.error = Some(err);
                if node.status().can_transition_to(failed_status) {
                    let from = node.status();
                    if node.advance(failed_status).is_ok() {
                        obs::emit_transition(node.id(), from, failed_status);
                    }
                }
                if let Err(Stop::State(state_err)) = self.persist(&node).await {
                    report.error = Some(state_err);
                    report.state_failed = true;
                }
            }
            Err(Stop::Interrupted(err)) => {
                node.last_error = Some(err.clone());
                report.status = OutcomeStatus::Interrupted;
                report.error = Some(err);
                if let Err(Stop::State(state_err)) = self.persist(&node).await {
                    report.error = Some(state_err);
                    report.state_failed = true;
                }
            }
            Err(Stop::State(err)) => {
                warn!(id = %node.id(), error = %err, "state write failed");
                node.last_error = Some(err.clone());
                report.status = failed;
                report.error = Some(err);
                report.state_failed = true;
            }
        }

        report.node = node;
        report
    }
}

/// The run was cancelled before this node got a concurrency slot.
fn not_started(node: ResourceNode) -> NodeReport {
    NodeReport {
        node,
        status: OutcomeStatus::Skipped,
        changed: false,
        error: None,
        skip_reason: Some(SkipReason::Cancelled),
        state_failed: false,
    }
}
