use serde::{Deserialize, Serialize};

/// The kind of work a request asks the control plane to perform.
///
/// Task kinds (`Training` through `Kill`) operate on a specific task and may
/// touch GPU leases and containers; info kinds (`GpuQuery`,
/// `SandboxVersionQuery`) only read shared state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Training,
    Mining,
    Infer,
    Label,
    Kill,
    GpuQuery,
    SandboxVersionQuery,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Training => "training",
            TaskKind::Mining => "mining",
            TaskKind::Infer => "infer",
            TaskKind::Label => "label",
            TaskKind::Kill => "kill",
            TaskKind::GpuQuery => "gpu-query",
            TaskKind::SandboxVersionQuery => "sandbox-version-query",
        }
    }

    /// Kinds that carry a task id and act on a concrete task.
    pub fn is_task_kind(&self) -> bool {
        matches!(
            self,
            TaskKind::Training | TaskKind::Mining | TaskKind::Infer | TaskKind::Label | TaskKind::Kill
        )
    }

    /// Kinds that run a workload container and hold GPU leases.
    pub fn needs_gpus(&self) -> bool {
        matches!(self, TaskKind::Training | TaskKind::Mining | TaskKind::Infer)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific parameters of a task request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskParams {
    /// Working directory mounted into the executor container
    /// (e.g., "/data/tasks/t42")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,

    /// Container image the executor runs (e.g., "foundry/executor:2.1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_image: Option<String>,

    /// Number of GPUs the workload needs (default: 1)
    #[serde(default = "default_gpu_count")]
    pub gpu_count: u32,

    /// Free-form executor configuration, passed through as-is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

fn default_gpu_count() -> u32 {
    1
}

impl Default for TaskParams {
    fn default() -> Self {
        TaskParams {
            work_dir: None,
            executor_image: None,
            gpu_count: default_gpu_count(),
            config: None,
        }
    }
}

/// A single command submitted to the control plane. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Caller-assigned task id. Required for task kinds, ignored by info kinds.
    #[serde(default)]
    pub task_id: String,

    /// Id of the user the task belongs to. Must be non-empty.
    pub user_id: String,

    /// What to do.
    pub kind: TaskKind,

    /// Container instance the request targets (required for kill).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_instance: Option<String>,

    #[serde(default)]
    pub params: TaskParams,
}
