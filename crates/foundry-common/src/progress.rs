use serde::{Deserialize, Serialize};

/// Lifecycle phase of a task. `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Pending,
    Running,
    Done,
    Error,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Done | TaskPhase::Error)
    }
}

/// Cause codes carried in `TaskState::state_code`.
pub mod state_code {
    /// Nominal transition.
    pub const OK: u32 = 0;
    /// Task was killed on user request.
    pub const KILLED: u32 = 1;
    /// The task's GPU lease expired and was swept.
    pub const LEASE_EXPIRED: u32 = 2;
    /// The executor container failed.
    pub const EXECUTOR_FAILED: u32 = 3;
}

/// A task state change, emitted on every state-affecting action and relayed
/// to subscribers.
///
/// Producers keep `timestamp_ms` monotonically increasing per task; the
/// relay keys deduplication on `(task_id, timestamp_ms, namespace)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskState {
    pub task_id: String,
    pub user_id: String,

    /// Producer-side wall clock, milliseconds since the epoch.
    pub timestamp_ms: u64,

    /// Completion in [0.0, 1.0].
    pub percent: f32,

    pub state: TaskPhase,

    /// Cause of the transition, one of the `state_code` constants.
    #[serde(default)]
    pub state_code: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<String>,
}

impl TaskState {
    /// Delivery channel name for this event's task/user pairing.
    pub fn namespace(&self) -> String {
        namespace(&self.user_id, &self.task_id)
    }
}

/// One delivery channel per task/user pairing.
pub fn namespace(user_id: &str, task_id: &str) -> String {
    format!("{user_id}:{task_id}")
}
