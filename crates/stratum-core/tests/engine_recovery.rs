//! Cancellation and resume tests, against both state store implementations.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stratum_core::fakes::{ProviderCall, Script, ScriptedProvider};
use stratum_core::{
    Attributes, CancelHandle, Engine, EngineConfig, OutcomeStatus, Parameters, Poll,
    ProviderAdapter, ProviderHandle, ProviderResult, ResourceError, ResourceSpec, ResourceStatus,
    SkipReason, StateStore,
};
use stratum_state::{FsStateStore, MemoryStateStore};

fn specs() -> Vec<ResourceSpec> {
    vec![
        ResourceSpec::new("network", "network"),
        ResourceSpec::new("cluster", "cluster").depends_on("network"),
        ResourceSpec::new("app", "workload").depends_on("cluster"),
    ]
}

fn engine(
    store: Arc<dyn StateStore>,
    provider: &Arc<ScriptedProvider>,
    cancel: CancelHandle,
) -> Engine {
    let mut builder = Engine::builder(store).cancel_handle(cancel);
    for kind in ["network", "cluster", "workload"] {
        builder = builder.provider(kind, provider.clone());
    }
    builder.build().unwrap()
}

/// Issues a new handle on every create. Probes stay pending until `settle`.
#[derive(Default)]
struct FreshHandles {
    inner: Mutex<FreshState>,
}

#[derive(Default)]
struct FreshState {
    issued: u32,
    settled: bool,
    live: BTreeSet<String>,
}

impl FreshHandles {
    fn settle(&self) {
        self.inner.lock().unwrap().settled = true;
    }

    fn issued(&self) -> u32 {
        self.inner.lock().unwrap().issued
    }

    fn live(&self) -> BTreeSet<String> {
        self.inner.lock().unwrap().live.clone()
    }
}

#[async_trait]
impl ProviderAdapter for FreshHandles {
    async fn create(&self, _id: &str, _parameters: &Parameters) -> ProviderResult<ProviderHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner.issued += 1;
        let handle = format!("h-{}", inner.issued);
        inner.live.insert(handle.clone());
        Ok(ProviderHandle::new(handle))
    }

    async fn probe_ready(&self, _handle: &ProviderHandle) -> ProviderResult<Poll<Attributes>> {
        if self.inner.lock().unwrap().settled {
            Ok(Poll::Ready(Attributes::new()))
        } else {
            Ok(Poll::pending_with("PROVISIONING"))
        }
    }

    async fn destroy(&self, _handle: &ProviderHandle) -> ProviderResult<()> {
        Ok(())
    }

    async fn probe_destroyed(&self, handle: &ProviderHandle) -> ProviderResult<Poll<()>> {
        self.inner.lock().unwrap().live.remove(handle.as_str());
        Ok(Poll::Ready(()))
    }
}

fn cancel_after(handle: CancelHandle, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        handle.cancel();
    });
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_gate_and_resume_skips_create() {
    let store = Arc::new(MemoryStateStore::new());
    let provider =
        Arc::new(ScriptedProvider::new().script("cluster", Script::ready().never_ready()));
    let cancel = CancelHandle::new();
    let first = engine(store.clone(), &provider, cancel.clone());
    cancel_after(cancel, Duration::from_secs(20));

    let result = first.apply(specs()).await.unwrap();

    assert_eq!(result.outcome("network").unwrap().status, OutcomeStatus::Ready);
    let cluster = result.outcome("cluster").unwrap();
    assert_eq!(cluster.status, OutcomeStatus::Interrupted);
    assert!(matches!(cluster.error, Some(ResourceError::Interrupted { .. })));
    let app = result.outcome("app").unwrap();
    assert_eq!(app.status, OutcomeStatus::Skipped);
    assert_eq!(app.skip_reason, Some(SkipReason::Cancelled));
    assert_eq!(result.exit_code(), 1);

    let record = store.get("cluster").await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::WaitingReady);
    assert_eq!(record.handle, Some(ScriptedProvider::handle_for("cluster")));

    // A fresh engine over the same state picks up where the first stopped.
    provider.set_script("cluster", Script::ready());
    let second = engine(store.clone(), &provider, CancelHandle::new());
    let resumed = second.apply(specs()).await.unwrap();

    assert!(resumed.success());
    assert_eq!(provider.creates("cluster"), 1);
    assert!(!resumed.outcome("cluster").unwrap().changed);
    assert_eq!(provider.creates("app"), 1);
    assert_eq!(provider.creates("network"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_lets_accepted_create_finish() {
    let store = Arc::new(MemoryStateStore::new());
    let provider = Arc::new(
        ScriptedProvider::new()
            .script("network", Script::ready().create_delay(Duration::from_secs(30))),
    );
    let cancel = CancelHandle::new();
    let engine = engine(store.clone(), &provider, cancel.clone());
    cancel_after(cancel, Duration::from_secs(5));

    let result = engine.apply(specs()).await.unwrap();

    // The create call was already issued, so it ran to completion and its
    // handle was recorded; only the readiness wait was cut short.
    assert_eq!(provider.creates("network"), 1);
    assert_eq!(result.outcome("network").unwrap().status, OutcomeStatus::Interrupted);
    let record = store.get("network").await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::WaitingReady);
    assert!(record.handle.is_some());
    assert_eq!(provider.total_creates(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_engine_dispatches_nothing() {
    let store = Arc::new(MemoryStateStore::new());
    let provider = Arc::new(ScriptedProvider::new());
    let cancel = CancelHandle::new();
    cancel.cancel();

    let result = engine(store.clone(), &provider, cancel)
        .apply(specs())
        .await
        .unwrap();

    assert_eq!(result.count(OutcomeStatus::Skipped), 3);
    assert!(result
        .outcomes
        .iter()
        .all(|o| o.skip_reason == Some(SkipReason::Cancelled)));
    assert!(provider.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_destroy_resumes_at_probe() {
    let store = Arc::new(MemoryStateStore::new());
    let provider = Arc::new(
        ScriptedProvider::new().script("network", Script::ready().destroy_pending(1_000)),
    );
    let setup = engine(store.clone(), &provider, CancelHandle::new());
    setup.apply(specs()).await.unwrap();

    let cancel = CancelHandle::new();
    let first = engine(store.clone(), &provider, cancel.clone());
    cancel_after(cancel, Duration::from_secs(60));
    let result = first.destroy(specs()).await.unwrap();

    assert_eq!(result.outcome("app").unwrap().status, OutcomeStatus::Destroyed);
    assert_eq!(result.outcome("network").unwrap().status, OutcomeStatus::Interrupted);
    assert_eq!(
        store.get("network").await.unwrap().unwrap().status,
        ResourceStatus::Destroying
    );

    provider.set_script("network", Script::ready());
    let second = engine(store.clone(), &provider, CancelHandle::new());
    let resumed = second.destroy(specs()).await.unwrap();

    assert!(resumed.success());
    assert_eq!(provider.destroys("network"), 1);
    assert!(provider
        .position(&ProviderCall::Gone("network".into()))
        .is_some());
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fs_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("stratum.json");
    let provider = Arc::new(
        ScriptedProvider::new()
            .script("cluster", Script::ready().attribute("endpoint", "https://k8s")),
    );

    {
        let store = Arc::new(FsStateStore::open(&path).unwrap());
        let result = engine(store, &provider, CancelHandle::new())
            .apply(specs())
            .await
            .unwrap();
        assert!(result.success());
    }

    let reopened = Arc::new(FsStateStore::open(&path).unwrap());
    let records = reopened.list().await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == ResourceStatus::Ready));
    let cluster = reopened.get("cluster").await.unwrap().unwrap();
    assert_eq!(cluster.attributes["endpoint"], "https://k8s");

    let engine = engine(reopened.clone(), &provider, CancelHandle::new());
    assert!(engine.apply(specs()).await.unwrap().success());
    assert_eq!(provider.total_creates(), 3);

    assert!(engine.destroy(specs()).await.unwrap().success());
    let after = FsStateStore::open(&path).unwrap();
    assert!(after.list().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_create_with_handle_is_resumed_not_recreated() {
    let store = Arc::new(MemoryStateStore::new());
    let adapter = Arc::new(FreshHandles::default());
    let mut config = EngineConfig::default();
    config.readiness.timeout_secs = 10;
    let engine = Engine::builder(store.clone())
        .provider("cluster", adapter.clone())
        .config(config)
        .build()
        .unwrap();
    let specs = vec![ResourceSpec::new("cluster", "cluster")];

    let first = engine.apply(specs.clone()).await.unwrap();
    assert_eq!(first.outcome("cluster").unwrap().status, OutcomeStatus::CreateFailed);
    let record = store.get("cluster").await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::CreatingFailed);
    assert_eq!(record.handle, Some(ProviderHandle::new("h-1")));

    // Still not ready: the same handle stays tracked.
    let second = engine.apply(specs.clone()).await.unwrap();
    let cluster = second.outcome("cluster").unwrap();
    assert_eq!(cluster.status, OutcomeStatus::CreateFailed);
    assert!(!cluster.changed);
    assert_eq!(adapter.issued(), 1);
    assert_eq!(
        store.get("cluster").await.unwrap().unwrap().handle,
        Some(ProviderHandle::new("h-1"))
    );

    adapter.settle();
    let third = engine.apply(specs.clone()).await.unwrap();
    assert!(third.success());
    assert_eq!(adapter.issued(), 1);
    let record = store.get("cluster").await.unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Ready);
    assert_eq!(record.handle, Some(ProviderHandle::new("h-1")));
    assert!(record.last_error.is_none());

    assert!(engine.destroy(specs).await.unwrap().success());
    assert!(adapter.live().is_empty());
    assert!(store.list().await.unwrap().is_empty());
}
