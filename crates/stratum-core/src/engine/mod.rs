//! Execution engine: walks the batches of a validated graph, dispatching each
//! batch's resources concurrently and recording every transition in the
//! state store.

mod result;
mod worker;

pub use result::{OutcomeStatus, ResourceOutcome, RunResult, SkipReason};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use stratum_state::{ResourceStatus, StateRecord, StateStore};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::builtin::{NullProvider, WaitProvider};
use crate::cancel::{CancelHandle, CancelSignal};
use crate::config::EngineConfig;
use crate::error::{ResourceError, Result, StructuralError};
use crate::graph::ResourceGraph;
use crate::metrics::METRICS;
use crate::model::{Direction, ResourceKind, ResourceNode, ResourceSpec};
use crate::obs;
use crate::propagate::{Outputs, SecretStore};
use crate::provider::{ProviderAdapter, ProviderRegistry};
use crate::scheduler::{self, Batch, SkipTracker};

use worker::{NodeReport, Worker};

/// Builder for [`Engine`].
pub struct EngineBuilder {
    providers: ProviderRegistry,
    store: Arc<dyn StateStore>,
    secrets: Option<Arc<dyn SecretStore>>,
    config: EngineConfig,
    cancel: Option<CancelHandle>,
}

impl EngineBuilder {
    pub fn provider(
        mut self,
        kind: impl Into<ResourceKind>,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Self {
        self.providers.register(kind, adapter);
        self
    }

    pub fn providers(mut self, registry: ProviderRegistry) -> Self {
        self.providers = registry;
        self
    }

    /// Register the `wait` and `null` adapters.
    pub fn with_builtins(self) -> Self {
        self.provider(ResourceKind::Wait, Arc::new(WaitProvider::new()))
            .provider(ResourceKind::Null, Arc::new(NullProvider))
    }

    pub fn secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cancel_handle(mut self, handle: CancelHandle) -> Self {
        self.cancel = Some(handle);
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        Ok(Engine {
            providers: self.providers,
            store: self.store,
            secrets: self.secrets,
            config: self.config,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

/// Provisioning engine. One instance can run any number of applies and
/// destroys; once its cancel handle fires, later runs dispatch nothing.
pub struct Engine {
    providers: ProviderRegistry,
    store: Arc<dyn StateStore>,
    secrets: Option<Arc<dyn SecretStore>>,
    config: EngineConfig,
    cancel: CancelHandle,
}

/// Mutable bookkeeping of one run, owned by the dispatch loop.
struct RunState {
    outcomes: Vec<ResourceOutcome>,
    outputs: Outputs,
    tracker: SkipTracker,
    halt: Option<SkipReason>,
}

impl RunState {
    fn halt(&mut self, reason: SkipReason) {
        self.halt.get_or_insert(reason);
    }

    fn skip(&mut self, mut outcome: ResourceOutcome, reason: SkipReason) {
        obs::emit_skipped(&outcome.id, &reason);
        METRICS.inc_resources_skipped();
        outcome.status = OutcomeStatus::Skipped;
        outcome.skip_reason = Some(reason);
        self.outcomes.push(outcome);
    }
}

impl Engine {
    pub fn builder(store: Arc<dyn StateStore>) -> EngineBuilder {
        EngineBuilder {
            providers: ProviderRegistry::new(),
            store,
            secrets: None,
            config: EngineConfig::default(),
            cancel: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Handle that stops runs of this engine.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Build the graph and check every kind has an adapter. No side effects.
    pub fn validate(
        &self,
        specs: impl IntoIterator<Item = ResourceSpec>,
    ) -> std::result::Result<ResourceGraph, StructuralError> {
        let graph = ResourceGraph::build(specs)?;
        if let Some(spec) = graph
            .specs()
            .find(|s| !self.providers.contains(s.kind.as_str()))
        {
            return Err(StructuralError::NoProvider {
                id: spec.id.clone(),
                kind: spec.kind.to_string(),
            });
        }
        Ok(graph)
    }

    /// The batches a run in `direction` would dispatch.
    pub fn plan(
        &self,
        specs: impl IntoIterator<Item = ResourceSpec>,
        direction: Direction,
    ) -> Result<Vec<Batch>> {
        let graph = self.validate(specs)?;
        Ok(scheduler::plan(&graph, direction)?)
    }

    /// Create everything in `specs` that is not already Ready.
    pub async fn apply(&self, specs: impl IntoIterator<Item = ResourceSpec>) -> Result<RunResult> {
        self.run(specs.into_iter().collect(), Direction::Create).await
    }

    /// Tear down everything in `specs`, plus tracked resources no longer
    /// declared.
    pub async fn destroy(
        &self,
        specs: impl IntoIterator<Item = ResourceSpec>,
    ) -> Result<RunResult> {
        self.run(specs.into_iter().collect(), Direction::Destroy).await
    }

    async fn run(&self, specs: Vec<ResourceSpec>, direction: Direction) -> Result<RunResult> {
        let graph = self.validate(specs)?;
        let batches = scheduler::plan(&graph, direction)?;
        let records: BTreeMap<String, StateRecord> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let orphans = self.orphans(&graph, &records, direction)?;

        let run_id = Uuid::new_v4().to_string();
        self.execute(graph, batches, records, orphans, run_id, direction)
            .await
    }

    /// Records whose id is no longer declared, newest first.
    fn orphans(
        &self,
        graph: &ResourceGraph,
        records: &BTreeMap<String, StateRecord>,
        direction: Direction,
    ) -> std::result::Result<Vec<StateRecord>, StructuralError> {
        let mut orphans: Vec<StateRecord> = records
            .values()
            .filter(|r| !graph.contains(&r.id))
            .cloned()
            .collect();

        if direction == Direction::Create {
            for orphan in &orphans {
                warn!(id = %orphan.id, kind = %orphan.kind, "tracked resource is no longer declared; run destroy to remove it");
            }
            return Ok(Vec::new());
        }

        orphans.sort_by(|a, b| b.sequence.cmp(&a.sequence).then_with(|| a.id.cmp(&b.id)));
        if let Some(r) = orphans
            .iter()
            .find(|r| r.handle.is_some() && !self.providers.contains(&r.kind))
        {
            return Err(StructuralError::NoProvider {
                id: r.id.clone(),
                kind: r.kind.clone(),
            });
        }
        Ok(orphans)
    }

    fn worker(&self, kind: &str, direction: Direction, cancel: &CancelSignal) -> Option<Worker> {
        Some(Worker {
            store: Arc::clone(&self.store),
            secrets: self.secrets.clone(),
            adapter: self.providers.get(kind)?,
            retry: self.config.retry_policy(),
            gate: self.config.readiness_gate(kind, direction),
            cancel: cancel.clone(),
        })
    }

    #[instrument(name = "stratum.run", skip_all, fields(run_id = %run_id, direction = %direction))]
    async fn execute(
        &self,
        graph: ResourceGraph,
        batches: Vec<Batch>,
        records: BTreeMap<String, StateRecord>,
        orphans: Vec<StateRecord>,
        run_id: String,
        direction: Direction,
    ) -> Result<RunResult> {
        let started = Instant::now();
        obs::emit_run_started(&run_id, direction, graph.len() + orphans.len(), batches.len());

        let cancel = self.cancel.signal();
        let mut run = RunState {
            outcomes: Vec::new(),
            outputs: Outputs::new(),
            tracker: SkipTracker::new(),
            halt: None,
        };

        for record in orphans {
            self.destroy_orphan(record, &cancel, &mut run).await;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        for batch in &batches {
            if cancel.is_cancelled() {
                run.halt(SkipReason::Cancelled);
            }
            if let Some(reason) = run.halt.clone() {
                for id in &batch.ids {
                    let outcome = planned(&graph, id, batch.index);
                    run.skip(outcome, reason.clone());
                }
                continue;
            }
            self.run_batch(&graph, batch, &records, &cancel, &semaphore, direction, &mut run)
                .await;
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let result = RunResult {
            run_id,
            direction,
            outcomes: run.outcomes,
            duration_ms,
        };
        obs::emit_run_finished(&result.run_id, direction, duration_ms, result.success());
        METRICS.flush();
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_batch(
        &self,
        graph: &ResourceGraph,
        batch: &Batch,
        records: &BTreeMap<String, StateRecord>,
        cancel: &CancelSignal,
        semaphore: &Arc<Semaphore>,
        direction: Direction,
        run: &mut RunState,
    ) {
        let mut dispatched = Vec::new();
        for id in &batch.ids {
            match run.tracker.check(graph, id, direction) {
                Some(dependency) => {
                    run.skip(
                        planned(graph, id, batch.index),
                        SkipReason::DependencyFailed { dependency },
                    );
                }
                None => dispatched.push(id.clone()),
            }
        }
        obs::emit_batch_dispatched(batch.index, &dispatched);

        let mut tasks: Vec<(ResourceOutcome, JoinHandle<NodeReport>)> = Vec::new();
        for id in dispatched {
            let Some(spec) = graph.get(&id).cloned() else {
                continue;
            };
            let mut outcome = planned(graph, &id, batch.index);
            let record = records.get(&id);

            if let Some(settled) = self
                .settle_without_provider(&spec, record, direction, run)
                .await
            {
                let settled = ResourceOutcome {
                    batch: Some(batch.index),
                    ..settled
                };
                run.outcomes.push(settled);
                continue;
            }

            let sequence = match self.store.next_sequence().await {
                Ok(sequence) => sequence,
                Err(e) => {
                    self.record_state_failure(&mut outcome, direction, e.to_string(), run);
                    continue;
                }
            };
            outcome.sequence = Some(sequence);

            let Some(worker) = self.worker(spec.kind.as_str(), direction, cancel) else {
                missing_provider(&mut outcome, direction, run);
                continue;
            };
            let mut node = match record {
                Some(r) => ResourceNode::from_record(Arc::clone(&spec), r),
                None => ResourceNode::new(Arc::clone(&spec)),
            };
            node.sequence = sequence;

            let outputs: Outputs = match direction {
                Direction::Create => graph
                    .prerequisites(&id, Direction::Create)
                    .filter_map(|p| run.outputs.get(p).map(|a| (p.to_string(), a.clone())))
                    .collect(),
                Direction::Destroy => Outputs::new(),
            };

            let semaphore = Arc::clone(semaphore);
            let span = tracing::info_span!("resource", id = %id, kind = %spec.kind);
            let handle = tokio::spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    match direction {
                        Direction::Create => worker.create(node, outputs).await,
                        Direction::Destroy => worker.destroy(node).await,
                    }
                }
                .instrument(span),
            );
            tasks.push((outcome, handle));
        }

        for (mut outcome, handle) in tasks {
            match handle.await {
                Ok(report) => {
                    fill(&mut outcome, &report);
                    match report.status {
                        OutcomeStatus::Ready => {
                            run.outputs
                                .insert(outcome.id.clone(), report.node.attributes.clone());
                        }
                        OutcomeStatus::Skipped => {
                            note_unstarted(&outcome.id);
                            run.halt(SkipReason::Cancelled);
                        }
                        OutcomeStatus::Interrupted => {
                            run.tracker.record_failure(outcome.id.clone());
                            run.halt(SkipReason::Cancelled);
                        }
                        status if status.is_failure() => {
                            run.tracker.record_failure(outcome.id.clone());
                        }
                        _ => {}
                    }
                    if report.state_failed {
                        run.halt(SkipReason::Halted);
                    }
                }
                Err(join_err) => {
                    warn!(id = %outcome.id, error = %join_err, "resource task failed");
                    outcome.status = failed_status(direction);
                    outcome.error = Some(ResourceError::Provider {
                        message: format!("resource task failed: {join_err}"),
                    });
                    run.tracker.record_failure(outcome.id.clone());
                }
            }
            run.outcomes.push(outcome);
        }
    }

    /// Resolve a node from its record alone, when no provider call is needed.
    async fn settle_without_provider(
        &self,
        spec: &ResourceSpec,
        record: Option<&StateRecord>,
        direction: Direction,
        run: &mut RunState,
    ) -> Option<ResourceOutcome> {
        let mut outcome =
            ResourceOutcome::new(spec.id.clone(), spec.kind.as_str(), OutcomeStatus::Ready);
        match (direction, record) {
            (Direction::Create, Some(r)) if r.status == ResourceStatus::Ready => {
                if r.spec_digest.as_deref() != Some(spec.digest().as_str()) {
                    warn!(id = %spec.id, "parameters changed since creation; in-place updates are not supported, keeping existing resource");
                }
                info!(id = %spec.id, "already ready, skipping");
                run.outputs.insert(spec.id.clone(), r.attributes.clone());
                outcome.sequence = Some(r.sequence);
                Some(outcome)
            }
            (Direction::Create, Some(r))
                if matches!(
                    r.status,
                    ResourceStatus::Destroying | ResourceStatus::DestroyFailed
                ) =>
            {
                let err = ResourceError::Validation {
                    message: format!(
                        "resource is partially destroyed ({}); run destroy before applying again",
                        r.status
                    ),
                };
                warn!(id = %spec.id, error = %err, "refusing to create");
                outcome.status = OutcomeStatus::CreateFailed;
                outcome.sequence = Some(r.sequence);
                outcome.error = Some(err);
                run.tracker.record_failure(spec.id.clone());
                Some(outcome)
            }
            (Direction::Create, _) => None,
            (Direction::Destroy, Some(r)) if r.handle.is_some() => None,
            (Direction::Destroy, record) => {
                outcome.status = OutcomeStatus::Destroyed;
                if let Some(r) = record {
                    if r.status == ResourceStatus::Creating {
                        warn!(id = %spec.id, "record has no provider handle; a create may have been interrupted, verify nothing was left behind");
                    }
                    if let Err(e) = self.store.remove(&r.id).await {
                        self.record_state_failure(&mut outcome, direction, e.to_string(), run);
                    }
                }
                Some(outcome)
            }
        }
    }

    fn record_state_failure(
        &self,
        outcome: &mut ResourceOutcome,
        direction: Direction,
        message: String,
        run: &mut RunState,
    ) {
        warn!(id = %outcome.id, error = %message, "state write failed");
        outcome.status = failed_status(direction);
        outcome.error = Some(ResourceError::State { message });
        run.tracker.record_failure(outcome.id.clone());
        run.halt(SkipReason::Halted);
    }

    /// Orphans go one at a time; a failure halts everything after it.
    async fn destroy_orphan(&self, record: StateRecord, cancel: &CancelSignal, run: &mut RunState) {
        let mut outcome = ResourceOutcome::new(
            record.id.clone(),
            record.kind.clone(),
            OutcomeStatus::Destroyed,
        );
        outcome.orphan = true;
        outcome.sequence = Some(record.sequence);

        if cancel.is_cancelled() {
            run.halt(SkipReason::Cancelled);
        }
        if let Some(reason) = run.halt.clone() {
            run.skip(outcome, reason);
            return;
        }

        info!(id = %record.id, kind = %record.kind, "destroying resource no longer declared");
        if record.handle.is_none() {
            if let Err(e) = self.store.remove(&record.id).await {
                self.record_state_failure(&mut outcome, Direction::Destroy, e.to_string(), run);
            }
            run.outcomes.push(outcome);
            return;
        }

        let sequence = match self.store.next_sequence().await {
            Ok(sequence) => sequence,
            Err(e) => {
                self.record_state_failure(&mut outcome, Direction::Destroy, e.to_string(), run);
                run.outcomes.push(outcome);
                return;
            }
        };
        let Some(worker) = self.worker(&record.kind, Direction::Destroy, cancel) else {
            missing_provider(&mut outcome, Direction::Destroy, run);
            run.halt(SkipReason::Halted);
            return;
        };
        outcome.sequence = Some(sequence);
        let spec = Arc::new(ResourceSpec::new(record.id.clone(), record.kind.as_str()));
        let mut node = ResourceNode::from_record(spec, &record);
        node.sequence = sequence;

        let span = tracing::info_span!("resource", id = %record.id, kind = %record.kind);
        let report = worker.destroy(node).instrument(span).await;
        fill(&mut outcome, &report);
        match report.status {
            OutcomeStatus::Destroyed => {}
            OutcomeStatus::Skipped => {
                note_unstarted(&outcome.id);
                run.halt(SkipReason::Cancelled);
            }
            OutcomeStatus::Interrupted => run.halt(SkipReason::Cancelled),
            _ => run.halt(SkipReason::Halted),
        }
        if report.state_failed {
            run.halt(SkipReason::Halted);
        }
        run.outcomes.push(outcome);
    }
}

/// The run was cancelled while the worker waited for a concurrency slot.
fn note_unstarted(id: &str) {
    obs::emit_skipped(id, &SkipReason::Cancelled);
    METRICS.inc_resources_skipped();
}

fn failed_status(direction: Direction) -> OutcomeStatus {
    match direction {
        Direction::Create => OutcomeStatus::CreateFailed,
        Direction::Destroy => OutcomeStatus::DestroyFailed,
    }
}

fn missing_provider(outcome: &mut ResourceOutcome, direction: Direction, run: &mut RunState) {
    outcome.status = failed_status(direction);
    outcome.error = Some(ResourceError::Provider {
        message: format!("no provider registered for kind {}", outcome.kind),
    });
    run.tracker.record_failure(outcome.id.clone());
    run.outcomes.push(outcome.clone());
}

/// Outcome skeleton for a declared resource in `batch`.
fn planned(graph: &ResourceGraph, id: &str, batch: usize) -> ResourceOutcome {
    let kind = graph
        .get(id)
        .map(|s| s.kind.to_string())
        .unwrap_or_default();
    let mut outcome = ResourceOutcome::new(id, kind, OutcomeStatus::Skipped);
    outcome.batch = Some(batch);
    outcome
}

fn fill(outcome: &mut ResourceOutcome, report: &NodeReport) {
    outcome.status = report.status;
    outcome.attempts = report.node.attempts;
    outcome.changed = report.changed;
    outcome.error = report.error.clone();
    outcome.skip_reason = report.skip_reason.clone();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fakes::{Script, ScriptedProvider};
    use stratum_state::MemoryStateStore;
    use tracing_test::traced_test;

    fn engine(provider: Arc<ScriptedProvider>) -> Engine {
        Engine::builder(Arc::new(MemoryStateStore::new()))
            .provider("network", provider.clone())
            .provider("cluster", provider)
            .build()
            .unwrap()
    }

    fn specs() -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::new("network", "network"),
            ResourceSpec::new("cluster", "cluster").depends_on("network"),
        ]
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.max_concurrency = 0;
        let result = Engine::builder(Arc::new(MemoryStateStore::new()))
            .config(config)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_plan_has_no_side_effects() {
        let provider = Arc::new(ScriptedProvider::new());
        let engine = engine(provider.clone());
        let batches = engine.plan(specs(), Direction::Destroy).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].ids, vec!["cluster".to_string()]);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_run_emits_lifecycle_events() {
        let provider = Arc::new(
            ScriptedProvider::new().script("cluster", Script::ready().transient_failures(1)),
        );
        let result = engine(provider).apply(specs()).await.unwrap();
        assert!(result.success());

        assert!(logs_contain("run.started"));
        assert!(logs_contain("batch.dispatched"));
        assert!(logs_contain("resource.transition"));
        assert!(logs_contain("resource.retry"));
        assert!(logs_contain("run.finished"));
        assert!(logs_contain("stratum.run"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_skips_are_logged() {
        let provider =
            Arc::new(ScriptedProvider::new().script("network", Script::ready().reject("bad cidr")));
        let result = engine(provider).apply(specs()).await.unwrap();
        assert_eq!(result.count(OutcomeStatus::Skipped), 1);
        assert!(logs_contain("resource.skipped"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_cancel_while_waiting_for_slot_is_logged_as_skip() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .script("a", Script::ready().create_delay(Duration::from_secs(30))),
        );
        let mut config = EngineConfig::default();
        config.max_concurrency = 1;
        let engine = Engine::builder(Arc::new(MemoryStateStore::new()))
            .provider("network", provider.clone())
            .config(config)
            .build()
            .unwrap();
        let cancel = engine.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        let specs = vec![
            ResourceSpec::new("a", "network"),
            ResourceSpec::new("b", "network"),
        ];
        let result = engine.apply(specs).await.unwrap();

        assert_eq!(result.outcome("a").unwrap().status, OutcomeStatus::Interrupted);
        let b = result.outcome("b").unwrap();
        assert_eq!(b.status, OutcomeStatus::Skipped);
        assert_eq!(b.skip_reason, Some(SkipReason::Cancelled));
        assert_eq!(provider.creates("b"), 0);
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|l| l.contains("resource.skipped") && l.contains("id=b"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one skip event for b, saw {n}")),
            }
        });
    }
}
