use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric result codes returned with every invocation response.
///
/// The values are part of the wire contract with the API layer and must not
/// be renumbered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(into = "u32", try_from = "u32")]
pub enum ResCode {
    /// Request succeeded.
    Ok,
    /// Unclassified internal error.
    Internal,
    /// The request failed a prerequisite check and was not executed.
    InvalidRequest,
    /// A downstream service (container runtime, store) failed during execution.
    InvokeFailed,
    /// A downstream service answered with something we could not interpret.
    UnexpectedResponse,
    /// Task-invoker specific failure.
    TaskInvoker,
    /// Info-invoker specific failure.
    InfoInvoker,
    /// Not enough GPUs were available to grant the lease.
    InsufficientGpus,
}

impl From<ResCode> for u32 {
    fn from(code: ResCode) -> u32 {
        match code {
            ResCode::Ok => 0,
            ResCode::Internal => 1000,
            ResCode::InvalidRequest => 1001,
            ResCode::InvokeFailed => 1002,
            ResCode::UnexpectedResponse => 1003,
            ResCode::TaskInvoker => 1004,
            ResCode::InfoInvoker => 1005,
            ResCode::InsufficientGpus => 1006,
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown response code {0}")]
pub struct UnknownResCode(pub u32);

impl TryFrom<u32> for ResCode {
    type Error = UnknownResCode;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResCode::Ok),
            1000 => Ok(ResCode::Internal),
            1001 => Ok(ResCode::InvalidRequest),
            1002 => Ok(ResCode::InvokeFailed),
            1003 => Ok(ResCode::UnexpectedResponse),
            1004 => Ok(ResCode::TaskInvoker),
            1005 => Ok(ResCode::InfoInvoker),
            1006 => Ok(ResCode::InsufficientGpus),
            other => Err(UnknownResCode(other)),
        }
    }
}

/// Uniform response for every invocation, task and info kinds alike.
///
/// `code` is always present; the payload fields are filled per kind and
/// omitted from the wire when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralResponse {
    pub code: ResCode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Container instance started for the task (workload kinds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_instance: Option<String>,

    /// GPU indices granted to the task (workload kinds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_indices: Option<Vec<u32>>,

    /// Number of currently available GPUs (gpu-query).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_gpus: Option<u32>,

    /// Sandbox version string (sandbox-version-query).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_version: Option<String>,
}

impl GeneralResponse {
    pub fn ok() -> Self {
        GeneralResponse {
            code: ResCode::Ok,
            message: None,
            executor_instance: None,
            gpu_indices: None,
            available_gpus: None,
            sandbox_version: None,
        }
    }

    pub fn error(code: ResCode, message: impl Into<String>) -> Self {
        GeneralResponse {
            code,
            message: Some(message.into()),
            ..GeneralResponse::ok()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResCode::Ok
    }
}
