use async_trait::async_trait;

use foundry_common::{GeneralResponse, ResCode, TaskKind, TaskRequest};

use crate::invoker::{Invoker, InvokerContext};

/// Answers how many GPUs a new workload could lease right now.
pub struct GpuQueryInvoker;

#[async_trait]
impl Invoker for GpuQueryInvoker {
    fn kind(&self) -> TaskKind {
        TaskKind::GpuQuery
    }

    async fn pre_invoke(&self, req: &TaskRequest, _ctx: &InvokerContext) -> GeneralResponse {
        assert_eq!(req.kind, TaskKind::GpuQuery, "request routed to the wrong invoker");
        if req.user_id.is_empty() {
            return GeneralResponse::error(ResCode::InvalidRequest, "user_id must not be empty");
        }
        GeneralResponse::ok()
    }

    async fn invoke(&self, req: &TaskRequest, ctx: &InvokerContext) -> GeneralResponse {
        assert_eq!(req.kind, TaskKind::GpuQuery, "request routed to the wrong invoker");
        match ctx.lease.list_available().await {
            Ok(available) => {
                let mut resp = GeneralResponse::ok();
                resp.available_gpus = Some(available.len() as u32);
                resp
            }
            Err(err) => GeneralResponse::error(
                ResCode::InfoInvoker,
                format!("GPU availability query failed: {err:#}"),
            ),
        }
    }
}

/// Reports the installed sandbox version from the VERSION file.
pub struct SandboxVersionInvoker;

#[async_trait]
impl Invoker for SandboxVersionInvoker {
    fn kind(&self) -> TaskKind {
        TaskKind::SandboxVersionQuery
    }

    async fn pre_invoke(&self, req: &TaskRequest, _ctx: &InvokerContext) -> GeneralResponse {
        assert_eq!(
            req.kind,
            TaskKind::SandboxVersionQuery,
            "request routed to the wrong invoker"
        );
        if req.user_id.is_empty() {
            return GeneralResponse::error(ResCode::InvalidRequest, "user_id must not be empty");
        }
        GeneralResponse::ok()
    }

    async fn invoke(&self, req: &TaskRequest, ctx: &InvokerContext) -> GeneralResponse {
        assert_eq!(
            req.kind,
            TaskKind::SandboxVersionQuery,
            "request routed to the wrong invoker"
        );
        let path = format!("{}/VERSION", ctx.sandbox_root.trim_end_matches('/'));
        match tokio::fs::read_to_string(&path).await {
            Ok(version) => {
                let mut resp = GeneralResponse::ok();
                resp.sandbox_version = Some(version.trim().to_string());
                resp
            }
            Err(err) => GeneralResponse::error(
                ResCode::InfoInvoker,
                format!("sandbox version unavailable at {path}: {err}"),
            ),
        }
    }
}
