use std::sync::Arc;

use async_trait::async_trait;

use foundry_common::util::now_ms;
use foundry_common::{GeneralResponse, TaskKind, TaskPhase, TaskRequest, TaskState};
use foundry_lease::LeaseManager;
use foundry_relay::EventRelay;

use crate::runtime::ContainerRuntime;

/// Everything an invoker may touch while serving a request.
pub struct InvokerContext {
    pub lease: Arc<LeaseManager>,
    pub relay: Arc<EventRelay>,
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Sandbox install root; its VERSION file answers version queries.
    pub sandbox_root: String,
}

/// One task kind's implementation, split into a side-effect-free
/// prerequisite phase and the invocation phase that does the work.
///
/// Handing an invoker a request of a kind it does not own is a wiring
/// bug; both phases panic on it rather than degrade into a wrong answer.
#[async_trait]
pub trait Invoker: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Check prerequisites without side effects. Anything but an ok
    /// response stops the pipeline before `invoke` runs.
    async fn pre_invoke(&self, req: &TaskRequest, ctx: &InvokerContext) -> GeneralResponse;

    /// Perform the work. Runs only after `pre_invoke` passed.
    async fn invoke(&self, req: &TaskRequest, ctx: &InvokerContext) -> GeneralResponse;
}

/// The state event an invocation emits for `req`.
pub(crate) fn task_event(
    req: &TaskRequest,
    state: TaskPhase,
    state_code: u32,
    percent: f32,
    error_info: Option<String>,
) -> TaskState {
    TaskState {
        task_id: req.task_id.clone(),
        user_id: req.user_id.clone(),
        timestamp_ms: now_ms(),
        percent,
        state,
        state_code,
        error_info,
    }
}
