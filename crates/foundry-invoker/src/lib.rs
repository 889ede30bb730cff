//! The command-invocation pipeline.
//!
//! Every request flows through two phases: a side-effect-free
//! prerequisite check, then the kind-specific invocation. The pipeline
//! also takes executor progress reports into the event stream and runs
//! the sweep that marks tasks failed when their GPU lease expires.

mod info;
mod invoker;
mod runtime;
mod task;

pub use info::{GpuQueryInvoker, SandboxVersionInvoker};
pub use invoker::{Invoker, InvokerContext};
pub use runtime::{container_name, ContainerRuntime, DockerRuntime, MockRuntime, SpawnSpec};
pub use task::{KillInvoker, LabelInvoker, WorkloadInvoker};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use foundry_common::util::now_ms;
use foundry_common::{
    state_code, GeneralResponse, ResCode, TaskKind, TaskPhase, TaskRequest, TaskState,
};

/// Pipeline counters, exported on /metrics.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    invocations: AtomicU64,
    invocations_rejected: AtomicU64,
    invocations_failed: AtomicU64,
    progress_reports: AtomicU64,
    sweeps: AtomicU64,
    tasks_expired: AtomicU64,
}

impl PipelineMetrics {
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn invocations_rejected(&self) -> u64 {
        self.invocations_rejected.load(Ordering::Relaxed)
    }

    pub fn invocations_failed(&self) -> u64 {
        self.invocations_failed.load(Ordering::Relaxed)
    }

    pub fn progress_reports(&self) -> u64 {
        self.progress_reports.load(Ordering::Relaxed)
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn tasks_expired(&self) -> u64 {
        self.tasks_expired.load(Ordering::Relaxed)
    }
}

/// Routes requests to invokers and owns the cross-cutting flows.
pub struct Pipeline {
    ctx: InvokerContext,
    invokers: HashMap<TaskKind, Box<dyn Invoker>>,
    metrics: PipelineMetrics,
}

impl Pipeline {
    /// Build the pipeline with every kind wired to its invoker. The table
    /// is closed: kinds and invokers change together, at compile time.
    pub fn new(ctx: InvokerContext) -> Arc<Self> {
        let mut invokers: HashMap<TaskKind, Box<dyn Invoker>> = HashMap::new();
        for kind in [TaskKind::Training, TaskKind::Mining, TaskKind::Infer] {
            invokers.insert(kind, Box::new(WorkloadInvoker::new(kind)));
        }
        invokers.insert(TaskKind::Label, Box::new(LabelInvoker));
        invokers.insert(TaskKind::Kill, Box::new(KillInvoker));
        invokers.insert(TaskKind::GpuQuery, Box::new(GpuQueryInvoker));
        invokers.insert(
            TaskKind::SandboxVersionQuery,
            Box::new(SandboxVersionInvoker),
        );

        Arc::new(Pipeline {
            ctx,
            invokers,
            metrics: PipelineMetrics::default(),
        })
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Serve one invocation: prerequisite phase, then the invocation
    /// phase, stopping at the first non-ok answer.
    pub async fn handle(&self, req: &TaskRequest) -> GeneralResponse {
        self.metrics.invocations.fetch_add(1, Ordering::Relaxed);
        let invoker = self
            .invokers
            .get(&req.kind)
            .unwrap_or_else(|| panic!("no invoker wired for kind {}", req.kind));

        let pre = invoker.pre_invoke(req, &self.ctx).await;
        if !pre.is_ok() {
            self.metrics
                .invocations_rejected
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                kind = %req.kind,
                task_id = %req.task_id,
                user_id = %req.user_id,
                code = u32::from(pre.code),
                message = pre.message.as_deref().unwrap_or("-"),
                "prerequisite check failed"
            );
            return pre;
        }

        let resp = invoker.invoke(req, &self.ctx).await;
        if !resp.is_ok() {
            self.metrics
                .invocations_failed
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                kind = %req.kind,
                task_id = %req.task_id,
                code = u32::from(resp.code),
                message = resp.message.as_deref().unwrap_or("-"),
                "invocation failed"
            );
        }
        resp
    }

    /// Take one executor progress report: validate it, append it to the
    /// event stream, and free the task's GPU leases when it is terminal.
    pub async fn report_progress(&self, event: &TaskState) -> GeneralResponse {
        self.metrics.progress_reports.fetch_add(1, Ordering::Relaxed);
        if event.task_id.is_empty() || event.user_id.is_empty() {
            return GeneralResponse::error(
                ResCode::InvalidRequest,
                "task_id and user_id must not be empty",
            );
        }
        if !(0.0..=1.0).contains(&event.percent) {
            return GeneralResponse::error(
                ResCode::InvalidRequest,
                format!("percent {} is outside [0.0, 1.0]", event.percent),
            );
        }

        if let Err(err) = self.ctx.relay.publish(event).await {
            return GeneralResponse::error(
                ResCode::Internal,
                format!("failed to record progress: {err:#}"),
            );
        }

        if event.state.is_terminal() {
            // the TTL sweep is only the net; the normal path frees here
            match self.ctx.lease.release(&event.task_id).await {
                Ok(freed) if !freed.is_empty() => {
                    tracing::info!(
                        task_id = %event.task_id,
                        gpus = ?freed,
                        "leases released on terminal report"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        task_id = %event.task_id,
                        error = %err,
                        "failed to release leases on terminal report"
                    );
                }
            }
        }
        GeneralResponse::ok()
    }

    /// Reclaim expired leases and mark every swept task failed.
    pub async fn sweep_once(&self) -> Result<usize> {
        let swept = self.ctx.lease.sweep_expired().await?;
        for (task_id, user_id) in &swept {
            let event = TaskState {
                task_id: task_id.clone(),
                user_id: user_id.clone(),
                timestamp_ms: now_ms(),
                percent: 0.0,
                state: TaskPhase::Error,
                state_code: state_code::LEASE_EXPIRED,
                error_info: Some("GPU lease expired".to_string()),
            };
            if let Err(err) = self.ctx.relay.publish(&event).await {
                tracing::warn!(task_id = %task_id, error = %err, "failed to record lease expiry");
            }
        }
        self.metrics.sweeps.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .tasks_expired
            .fetch_add(swept.len() as u64, Ordering::Relaxed);
        Ok(swept.len())
    }
}

/// Drive lease expiry sweeps on a fixed interval, forever.
pub async fn sweep_loop(pipeline: Arc<Pipeline>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        match pipeline.sweep_once().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(tasks = n, "marked tasks failed after lease expiry"),
            Err(err) => tracing::warn!(error = %err, "lease sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;

    use anyhow::bail;
    use async_trait::async_trait;

    use foundry_common::TaskParams;
    use foundry_lease::gpu::FixedTelemetry;
    use foundry_lease::{Lease, LeaseConfig, LeaseManager};
    use foundry_meta::{MemoryMetaStore, MetaStore, WatchStream};
    use foundry_relay::{EventRelay, RelayConfig, StreamEntry, SubscriberRegistry};

    const STREAM_ITEMS_PREFIX: &str = "/relay/stream/items/";

    struct TestBed {
        pipeline: Arc<Pipeline>,
        runtime: Arc<MockRuntime>,
        lease: Arc<LeaseManager>,
        store: Arc<dyn MetaStore>,
    }

    fn make_parts(
        gpu_count: u32,
        sandbox_root: &str,
    ) -> (InvokerContext, Arc<MockRuntime>, Arc<LeaseManager>, Arc<dyn MetaStore>) {
        make_parts_on(Arc::new(MemoryMetaStore::new()), gpu_count, sandbox_root)
    }

    fn make_parts_on(
        store: Arc<dyn MetaStore>,
        gpu_count: u32,
        sandbox_root: &str,
    ) -> (InvokerContext, Arc<MockRuntime>, Arc<LeaseManager>, Arc<dyn MetaStore>) {
        let telemetry = Arc::new(FixedTelemetry::idle(gpu_count, 80_000));
        let lease = LeaseManager::new(store.clone(), telemetry, LeaseConfig::default());
        let relay = EventRelay::new(
            store.clone(),
            SubscriberRegistry::new(),
            RelayConfig::default(),
        );
        let runtime = Arc::new(MockRuntime::new());
        let ctx = InvokerContext {
            lease: lease.clone(),
            relay,
            runtime: runtime.clone(),
            sandbox_root: sandbox_root.to_string(),
        };
        (ctx, runtime, lease, store)
    }

    fn make_bed(gpu_count: u32) -> TestBed {
        let (ctx, runtime, lease, store) = make_parts(gpu_count, "/nonexistent");
        TestBed {
            pipeline: Pipeline::new(ctx),
            runtime,
            lease,
            store,
        }
    }

    fn workload_request(kind: TaskKind, task_id: &str, gpu_count: u32) -> TaskRequest {
        TaskRequest {
            task_id: task_id.to_string(),
            user_id: "u1".to_string(),
            kind,
            executor_instance: None,
            params: TaskParams {
                work_dir: Some(std::env::temp_dir().to_string_lossy().into_owned()),
                executor_image: Some("foundry/executor:test".to_string()),
                gpu_count,
                config: None,
            },
        }
    }

    fn info_request(kind: TaskKind) -> TaskRequest {
        TaskRequest {
            task_id: String::new(),
            user_id: "u1".to_string(),
            kind,
            executor_instance: None,
            params: TaskParams::default(),
        }
    }

    async fn stream_events(store: &Arc<dyn MetaStore>) -> Vec<TaskState> {
        store
            .list_prefix(STREAM_ITEMS_PREFIX)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, bytes, _)| serde_json::from_slice::<StreamEntry>(&bytes).unwrap().event)
            .collect()
    }

    /// Store whose conditional deletes can be switched to fail, as if the
    /// backing store dropped off mid-operation.
    struct FailingStore {
        inner: MemoryMetaStore,
        fail_delete: AtomicBool,
    }

    impl FailingStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryMetaStore::new(),
                fail_delete: AtomicBool::new(false),
            })
        }

        fn fail_deletes(&self) {
            self.fail_delete.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MetaStore for FailingStore {
        async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
            self.inner.put(key, value).await
        }

        async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<u64> {
            self.inner.delete(key).await
        }

        async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
            self.inner.list_prefix(prefix).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected_revision: u64,
            value: Vec<u8>,
        ) -> Result<(bool, u64)> {
            self.inner
                .compare_and_swap(key, expected_revision, value)
                .await
        }

        async fn compare_and_delete(&self, key: &str, expected_revision: u64) -> Result<bool> {
            if self.fail_delete.load(Ordering::SeqCst) {
                bail!("store is unreachable");
            }
            self.inner.compare_and_delete(key, expected_revision).await
        }

        async fn watch_prefix(
            &self,
            prefix: &str,
            start_revision_exclusive: Option<u64>,
        ) -> Result<WatchStream> {
            self.inner.watch_prefix(prefix, start_revision_exclusive).await
        }
    }

    #[tokio::test]
    async fn test_empty_user_is_rejected() {
        let bed = make_bed(1);
        let mut req = info_request(TaskKind::GpuQuery);
        req.user_id = String::new();

        let resp = bed.pipeline.handle(&req).await;
        assert_eq!(resp.code, ResCode::InvalidRequest);
        assert_eq!(bed.pipeline.metrics().invocations_rejected(), 1);
    }

    #[tokio::test]
    async fn test_failed_prerequisite_stops_before_invoke() {
        let bed = make_bed(2);
        let mut req = workload_request(TaskKind::Training, "t1", 1);
        req.params.work_dir = None;

        let resp = bed.pipeline.handle(&req).await;
        assert_eq!(resp.code, ResCode::InvalidRequest);

        // the invocation phase never ran: nothing spawned, nothing leased
        assert_eq!(bed.runtime.spawn_calls(), 0);
        assert!(bed.store.list_prefix("/leases/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_work_dir_path_is_rejected() {
        let bed = make_bed(2);
        let mut req = workload_request(TaskKind::Training, "t1", 1);
        req.params.work_dir = Some("/definitely/not/a/real/path".to_string());

        let resp = bed.pipeline.handle(&req).await;
        assert_eq!(resp.code, ResCode::InvalidRequest);
        assert_eq!(bed.runtime.spawn_calls(), 0);
    }

    #[tokio::test]
    async fn test_workload_leases_spawns_and_records() {
        let bed = make_bed(4);
        let req = workload_request(TaskKind::Training, "t1", 2);

        let resp = bed.pipeline.handle(&req).await;
        assert!(resp.is_ok(), "unexpected response: {resp:?}");
        assert_eq!(
            resp.executor_instance.as_deref(),
            Some("foundry-training-t1")
        );
        assert_eq!(resp.gpu_indices, Some(vec![0, 1]));

        assert!(bed.runtime.is_running("foundry-training-t1").await);
        assert_eq!(
            bed.lease.held_by("t1").await.unwrap(),
            std::collections::BTreeSet::from([0, 1])
        );

        let events = stream_events(&bed.store).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, TaskPhase::Pending);
        assert_eq!(events[0].task_id, "t1");
    }

    #[tokio::test]
    async fn test_insufficient_gpus_spawns_nothing() {
        let bed = make_bed(2);
        let req = workload_request(TaskKind::Mining, "t1", 3);

        let resp = bed.pipeline.handle(&req).await;
        assert_eq!(resp.code, ResCode::InsufficientGpus);
        assert_eq!(bed.runtime.spawn_calls(), 0);
        assert!(bed.store.list_prefix("/leases/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_the_lease() {
        let bed = make_bed(2);
        bed.runtime.fail_spawns();
        let req = workload_request(TaskKind::Infer, "t1", 2);

        let resp = bed.pipeline.handle(&req).await;
        assert_eq!(resp.code, ResCode::InvokeFailed);

        // the grant was rolled back, so the GPUs are immediately reusable
        assert!(bed.store.list_prefix("/leases/").await.unwrap().is_empty());
        assert_eq!(
            bed.lease.list_available().await.unwrap(),
            std::collections::BTreeSet::from([0, 1])
        );
    }

    #[tokio::test]
    async fn test_kill_requires_a_live_instance() {
        let bed = make_bed(1);
        let req = TaskRequest {
            task_id: "t1".to_string(),
            user_id: "u1".to_string(),
            kind: TaskKind::Kill,
            executor_instance: Some("ghost".to_string()),
            params: TaskParams::default(),
        };

        let resp = bed.pipeline.handle(&req).await;
        assert_eq!(resp.code, ResCode::InvalidRequest);
        assert_eq!(bed.runtime.kill_calls(), 0, "kill must not reach the runtime");
    }

    #[tokio::test]
    async fn test_kill_stops_container_frees_lease_and_records() {
        let bed = make_bed(2);
        let start = bed
            .pipeline
            .handle(&workload_request(TaskKind::Training, "t1", 1))
            .await;
        let instance = start.executor_instance.unwrap();

        let kill = TaskRequest {
            task_id: "t1".to_string(),
            user_id: "u1".to_string(),
            kind: TaskKind::Kill,
            executor_instance: Some(instance.clone()),
            params: TaskParams::default(),
        };
        let resp = bed.pipeline.handle(&kill).await;
        assert!(resp.is_ok(), "unexpected response: {resp:?}");

        assert!(!bed.runtime.is_running(&instance).await);
        assert!(bed.lease.held_by("t1").await.unwrap().is_empty());

        let events = stream_events(&bed.store).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].state, TaskPhase::Error);
        assert_eq!(events[1].state_code, state_code::KILLED);
    }

    #[tokio::test]
    async fn test_kill_surfaces_lease_release_failure() {
        let store = FailingStore::new();
        let (ctx, runtime, lease, _) = make_parts_on(store.clone(), 1, "/nonexistent");
        let pipeline = Pipeline::new(ctx);

        let start = pipeline
            .handle(&workload_request(TaskKind::Training, "t1", 1))
            .await;
        let instance = start.executor_instance.unwrap();

        store.fail_deletes();
        let kill = TaskRequest {
            task_id: "t1".to_string(),
            user_id: "u1".to_string(),
            kind: TaskKind::Kill,
            executor_instance: Some(instance.clone()),
            params: TaskParams::default(),
        };
        let resp = pipeline.handle(&kill).await;
        assert_eq!(resp.code, ResCode::Internal);

        // the container went down but the lease could not be freed
        assert!(!runtime.is_running(&instance).await);
        assert_eq!(
            lease.held_by("t1").await.unwrap(),
            std::collections::BTreeSet::from([0])
        );
    }

    #[tokio::test]
    async fn test_gpu_query_counts_available() {
        let bed = make_bed(3);
        bed.pipeline
            .handle(&workload_request(TaskKind::Training, "t1", 1))
            .await;

        let resp = bed.pipeline.handle(&info_request(TaskKind::GpuQuery)).await;
        assert!(resp.is_ok());
        assert_eq!(resp.available_gpus, Some(2));
    }

    #[tokio::test]
    async fn test_sandbox_version_comes_from_the_version_file() {
        let root = std::env::temp_dir().join("foundry-invoker-version-test");
        tokio::fs::create_dir_all(&root).await.unwrap();
        tokio::fs::write(root.join("VERSION"), "2.4.1\n").await.unwrap();

        let (ctx, _, _, _) = make_parts(1, &root.to_string_lossy());
        let pipeline = Pipeline::new(ctx);

        let resp = pipeline
            .handle(&info_request(TaskKind::SandboxVersionQuery))
            .await;
        assert!(resp.is_ok());
        assert_eq!(resp.sandbox_version.as_deref(), Some("2.4.1"));
    }

    #[tokio::test]
    async fn test_missing_version_file_is_an_info_error() {
        let bed = make_bed(1);
        let resp = bed
            .pipeline
            .handle(&info_request(TaskKind::SandboxVersionQuery))
            .await;
        assert_eq!(resp.code, ResCode::InfoInvoker);
    }

    #[tokio::test]
    async fn test_progress_percent_is_validated() {
        let bed = make_bed(1);
        let event = TaskState {
            task_id: "t1".to_string(),
            user_id: "u1".to_string(),
            timestamp_ms: now_ms(),
            percent: 1.5,
            state: TaskPhase::Running,
            state_code: state_code::OK,
            error_info: None,
        };

        let resp = bed.pipeline.report_progress(&event).await;
        assert_eq!(resp.code, ResCode::InvalidRequest);
        assert!(stream_events(&bed.store).await.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_progress_frees_leases() {
        let bed = make_bed(2);
        bed.pipeline
            .handle(&workload_request(TaskKind::Training, "t1", 2))
            .await;
        assert_eq!(bed.lease.held_by("t1").await.unwrap().len(), 2);

        let done = TaskState {
            task_id: "t1".to_string(),
            user_id: "u1".to_string(),
            timestamp_ms: now_ms(),
            percent: 1.0,
            state: TaskPhase::Done,
            state_code: state_code::OK,
            error_info: None,
        };
        let resp = bed.pipeline.report_progress(&done).await;
        assert!(resp.is_ok());

        assert!(bed.lease.held_by("t1").await.unwrap().is_empty());
        assert_eq!(stream_events(&bed.store).await.len(), 2);
    }

    #[tokio::test]
    async fn test_running_progress_keeps_leases() {
        let bed = make_bed(1);
        bed.pipeline
            .handle(&workload_request(TaskKind::Training, "t1", 1))
            .await;

        let running = TaskState {
            task_id: "t1".to_string(),
            user_id: "u1".to_string(),
            timestamp_ms: now_ms(),
            percent: 0.4,
            state: TaskPhase::Running,
            state_code: state_code::OK,
            error_info: None,
        };
        assert!(bed.pipeline.report_progress(&running).await.is_ok());
        assert_eq!(bed.lease.held_by("t1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_marks_expired_tasks_failed() {
        let bed = make_bed(1);
        let stale = Lease {
            gpu_index: 0,
            task_id: "t-old".to_string(),
            user_id: "u9".to_string(),
            acquired_at_ms: now_ms().saturating_sub(600_000),
            ttl_ms: 1_000,
        };
        bed.store
            .put("/leases/0", serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();

        let swept = bed.pipeline.sweep_once().await.unwrap();
        assert_eq!(swept, 1);
        assert!(bed.store.list_prefix("/leases/").await.unwrap().is_empty());

        let events = stream_events(&bed.store).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task_id, "t-old");
        assert_eq!(events[0].user_id, "u9");
        assert_eq!(events[0].state, TaskPhase::Error);
        assert_eq!(events[0].state_code, state_code::LEASE_EXPIRED);
        assert_eq!(bed.pipeline.metrics().tasks_expired(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "wrong invoker")]
    async fn test_mismatched_kind_panics() {
        let (ctx, _, _, _) = make_parts(1, "/nonexistent");
        let invoker = WorkloadInvoker::new(TaskKind::Training);
        let mut req = workload_request(TaskKind::Training, "t1", 1);
        req.kind = TaskKind::Mining;
        let _ = invoker.pre_invoke(&req, &ctx).await;
    }
}
