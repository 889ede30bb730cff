pub mod gpu;
pub mod progress;
pub mod response;
pub mod task;

pub use gpu::GpuStatus;
pub use progress::{namespace, state_code, TaskPhase, TaskState};
pub use response::{GeneralResponse, ResCode, UnknownResCode};
pub use task::{TaskKind, TaskParams, TaskRequest};

pub mod telemetry;
pub mod util;
