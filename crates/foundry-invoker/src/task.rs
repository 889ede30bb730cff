use async_trait::async_trait;

use foundry_common::{state_code, GeneralResponse, ResCode, TaskKind, TaskPhase, TaskRequest};
use foundry_lease::LeaseError;

use crate::invoker::{task_event, Invoker, InvokerContext};
use crate::runtime::SpawnSpec;

/// Starts a GPU workload container: training, mining, or infer. One
/// instance per kind, sharing the lease-spawn-record sequence.
pub struct WorkloadInvoker {
    kind: TaskKind,
}

impl WorkloadInvoker {
    pub fn new(kind: TaskKind) -> Self {
        assert!(kind.needs_gpus(), "workload invoker needs a GPU-backed kind");
        WorkloadInvoker { kind }
    }
}

#[async_trait]
impl Invoker for WorkloadInvoker {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    async fn pre_invoke(&self, req: &TaskRequest, _ctx: &InvokerContext) -> GeneralResponse {
        assert_eq!(req.kind, self.kind, "request routed to the wrong invoker");
        if req.user_id.is_empty() {
            return GeneralResponse::error(ResCode::InvalidRequest, "user_id must not be empty");
        }
        if req.task_id.is_empty() {
            return GeneralResponse::error(
                ResCode::InvalidRequest,
                format!("task_id is required for {}", self.kind),
            );
        }
        let Some(work_dir) = req.params.work_dir.as_deref() else {
            return GeneralResponse::error(
                ResCode::InvalidRequest,
                format!("work_dir is required for {}", self.kind),
            );
        };
        match tokio::fs::try_exists(work_dir).await {
            Ok(true) => {}
            Ok(false) => {
                return GeneralResponse::error(
                    ResCode::InvalidRequest,
                    format!("work_dir {work_dir} does not exist"),
                );
            }
            Err(err) => {
                return GeneralResponse::error(
                    ResCode::InvalidRequest,
                    format!("work_dir {work_dir} is not accessible: {err}"),
                );
            }
        }
        if req.params.executor_image.as_deref().unwrap_or("").is_empty() {
            return GeneralResponse::error(
                ResCode::InvalidRequest,
                format!("executor_image is required for {}", self.kind),
            );
        }
        if req.params.gpu_count == 0 {
            return GeneralResponse::error(ResCode::InvalidRequest, "gpu_count must be at least 1");
        }
        GeneralResponse::ok()
    }

    async fn invoke(&self, req: &TaskRequest, ctx: &InvokerContext) -> GeneralResponse {
        assert_eq!(req.kind, self.kind, "request routed to the wrong invoker");
        let (Some(work_dir), Some(image)) = (
            req.params.work_dir.as_deref(),
            req.params.executor_image.as_deref(),
        ) else {
            return GeneralResponse::error(
                ResCode::InvalidRequest,
                "workload request is missing work_dir or executor_image",
            );
        };

        let granted = match ctx
            .lease
            .acquire(&req.task_id, &req.user_id, req.params.gpu_count)
            .await
        {
            Ok(granted) => granted,
            Err(LeaseError::InsufficientGpus {
                requested,
                available,
            }) => {
                return GeneralResponse::error(
                    ResCode::InsufficientGpus,
                    format!("requested {requested} GPUs, {available} available"),
                );
            }
            Err(LeaseError::Store(err)) => {
                return GeneralResponse::error(
                    ResCode::Internal,
                    format!("lease acquisition failed: {err:#}"),
                );
            }
        };

        let spec = SpawnSpec {
            task_id: req.task_id.clone(),
            user_id: req.user_id.clone(),
            kind: self.kind,
            image: image.to_string(),
            work_dir: work_dir.to_string(),
            gpu_indices: granted.iter().copied().collect(),
            config: req.params.config.clone(),
        };
        let instance = match ctx.runtime.spawn(&spec).await {
            Ok(instance) => instance,
            Err(err) => {
                // the workload never started; hand the GPUs back right away
                if let Err(release_err) = ctx.lease.release(&req.task_id).await {
                    tracing::warn!(
                        task_id = %req.task_id,
                        error = %release_err,
                        "failed to release leases after spawn failure"
                    );
                }
                return GeneralResponse::error(
                    ResCode::InvokeFailed,
                    format!("executor start failed: {err:#}"),
                );
            }
        };

        let event = task_event(req, TaskPhase::Pending, state_code::OK, 0.0, None);
        if let Err(err) = ctx.relay.publish(&event).await {
            tracing::warn!(task_id = %req.task_id, error = %err, "failed to record pending event");
        }

        tracing::info!(
            task_id = %req.task_id,
            kind = %self.kind,
            instance = %instance,
            gpus = ?granted,
            "workload started"
        );
        let mut resp = GeneralResponse::ok();
        resp.executor_instance = Some(instance);
        resp.gpu_indices = Some(granted.into_iter().collect());
        resp
    }
}

/// Registers a labeling task. Label work runs on CPU in the data plane,
/// so there is no lease and no container to start here.
pub struct LabelInvoker;

#[async_trait]
impl Invoker for LabelInvoker {
    fn kind(&self) -> TaskKind {
        TaskKind::Label
    }

    async fn pre_invoke(&self, req: &TaskRequest, _ctx: &InvokerContext) -> GeneralResponse {
        assert_eq!(req.kind, TaskKind::Label, "request routed to the wrong invoker");
        if req.user_id.is_empty() {
            return GeneralResponse::error(ResCode::InvalidRequest, "user_id must not be empty");
        }
        if req.task_id.is_empty() {
            return GeneralResponse::error(ResCode::InvalidRequest, "task_id is required for label");
        }
        let Some(work_dir) = req.params.work_dir.as_deref() else {
            return GeneralResponse::error(ResCode::InvalidRequest, "work_dir is required for label");
        };
        match tokio::fs::try_exists(work_dir).await {
            Ok(true) => GeneralResponse::ok(),
            Ok(false) => GeneralResponse::error(
                ResCode::InvalidRequest,
                format!("work_dir {work_dir} does not exist"),
            ),
            Err(err) => GeneralResponse::error(
                ResCode::InvalidRequest,
                format!("work_dir {work_dir} is not accessible: {err}"),
            ),
        }
    }

    async fn invoke(&self, req: &TaskRequest, ctx: &InvokerContext) -> GeneralResponse {
        assert_eq!(req.kind, TaskKind::Label, "request routed to the wrong invoker");
        let event = task_event(req, TaskPhase::Pending, state_code::OK, 0.0, None);
        if let Err(err) = ctx.relay.publish(&event).await {
            return GeneralResponse::error(
                ResCode::Internal,
                format!("failed to record label task: {err:#}"),
            );
        }
        tracing::info!(task_id = %req.task_id, "label task registered");
        GeneralResponse::ok()
    }
}

/// Force-terminates a task's executor container, frees its leases, and
/// records the kill as a terminal error state.
pub struct KillInvoker;

#[async_trait]
impl Invoker for KillInvoker {
    fn kind(&self) -> TaskKind {
        TaskKind::Kill
    }

    async fn pre_invoke(&self, req: &TaskRequest, ctx: &InvokerContext) -> GeneralResponse {
        assert_eq!(req.kind, TaskKind::Kill, "request routed to the wrong invoker");
        if req.user_id.is_empty() {
            return GeneralResponse::error(ResCode::InvalidRequest, "user_id must not be empty");
        }
        if req.task_id.is_empty() {
            return GeneralResponse::error(ResCode::InvalidRequest, "task_id is required for kill");
        }
        let Some(instance) = req.executor_instance.as_deref().filter(|s| !s.is_empty()) else {
            return GeneralResponse::error(
                ResCode::InvalidRequest,
                "executor_instance is required for kill",
            );
        };
        if !ctx.runtime.is_running(instance).await {
            return GeneralResponse::error(
                ResCode::InvalidRequest,
                format!("executor_instance {instance} is not a live container"),
            );
        }
        GeneralResponse::ok()
    }

    async fn invoke(&self, req: &TaskRequest, ctx: &InvokerContext) -> GeneralResponse {
        assert_eq!(req.kind, TaskKind::Kill, "request routed to the wrong invoker");
        let Some(instance) = req.executor_instance.as_deref() else {
            return GeneralResponse::error(
                ResCode::InvalidRequest,
                "executor_instance is required for kill",
            );
        };

        if let Err(err) = ctx.runtime.kill(instance).await {
            // container may still be alive, so its leases stay put
            return GeneralResponse::error(
                ResCode::InvokeFailed,
                format!("failed to kill {instance}: {err:#}"),
            );
        }

        match ctx.lease.release(&req.task_id).await {
            Ok(freed) if !freed.is_empty() => {
                tracing::info!(task_id = %req.task_id, gpus = ?freed, "leases released on kill");
            }
            Ok(_) => {}
            Err(err) => {
                // the container is already gone; the lease lingers until the
                // sweep nets it
                tracing::warn!(task_id = %req.task_id, error = %err, "failed to release leases on kill");
                return GeneralResponse::error(
                    ResCode::Internal,
                    format!("{instance} stopped but releasing its leases failed: {err:#}"),
                );
            }
        }

        let event = task_event(
            req,
            TaskPhase::Error,
            state_code::KILLED,
            0.0,
            Some("killed on user request".to_string()),
        );
        if let Err(err) = ctx.relay.publish(&event).await {
            tracing::warn!(task_id = %req.task_id, error = %err, "failed to record kill event");
        }

        tracing::info!(task_id = %req.task_id, instance = %instance, "task killed");
        GeneralResponse::ok()
    }
}
