use serde::{Deserialize, Serialize};

use foundry_common::TaskState;

/// Where a delivery stands. `Delivered` and `Abandoned` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Claimed by a dispatcher, first attempt not yet settled.
    Pending,
    /// At least one attempt failed; redelivery is scheduled.
    Retrying,
    /// Every subscriber accepted the event.
    Delivered,
    /// The event aged out of the stream before delivery succeeded.
    Abandoned,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Abandoned)
    }
}

/// Identity of one delivery attempt chain. Two publishes of the same
/// task event (same task, same producer timestamp, same namespace)
/// collapse onto one record, which is what makes redelivery idempotent.
pub fn dedup_key(task_id: &str, timestamp_ms: u64, namespace: &str) -> String {
    format!("{task_id}:{timestamp_ms}:{namespace}")
}

/// Durable per-event delivery bookkeeping, stored next to the stream.
///
/// The event itself is embedded so the retry sweep can redeliver after
/// the stream entry has been trimmed out from under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub dedup_key: String,
    pub namespace: String,
    /// Stream sequence the event was published at. Compared against the
    /// stream tail to decide abandonment.
    pub seq: u64,
    pub event: TaskState,
    pub status: DeliveryStatus,
    /// Attempts that have actually run, successful or not.
    pub attempts: u32,
    /// Wall-clock ms after which the record is due for (re)delivery.
    pub next_attempt_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DeliveryRecord {
    /// Fresh record claiming an event for delivery. `next_attempt_ms` is
    /// set one retry interval out so that a dispatcher which crashes
    /// mid-attempt leaves a record the sweep will pick up as due.
    pub fn claim(namespace: &str, seq: u64, event: &TaskState, next_attempt_ms: u64) -> Self {
        DeliveryRecord {
            dedup_key: dedup_key(&event.task_id, event.timestamp_ms, namespace),
            namespace: namespace.to_string(),
            seq,
            event: event.clone(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_attempt_ms,
            last_error: None,
        }
    }

    pub fn notice(&self) -> DeliveryNotice {
        DeliveryNotice {
            dedup_key: self.dedup_key.clone(),
            namespace: self.namespace.clone(),
            seq: self.seq,
            status: self.status,
            attempts: self.attempts,
            error: self.last_error.clone(),
        }
    }
}

/// Retry bookkeeping event fanned out on the inner topic whenever a
/// delivery fails or is abandoned. Never persisted, never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryNotice {
    pub dedup_key: String,
    pub namespace: String,
    pub seq: u64,
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
