use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

/// A change observed under a watched prefix. `value: None` means the key was
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub revision: u64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// Revisioned key-value store shared by the lease table and the event
/// stream.
///
/// Every mutation returns the store revision it committed at; `get` and
/// `list_prefix` return the revision each entry was last modified at. The
/// conditional operations compare against that per-entry revision:
/// `expected_revision == 0` in `compare_and_swap` means "create only if the
/// key does not exist", while `compare_and_delete` expects a revision that
/// was actually read from a live entry.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;
    async fn delete(&self, key: &str) -> Result<u64>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>>;

    /// Write `value` only if the key's current revision equals
    /// `expected_revision`. Returns `(true, committed_revision)` on success,
    /// `(false, current_revision)` when the entry moved underneath us.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)>;

    /// Delete the key only if its current revision equals
    /// `expected_revision`. Returns whether the delete happened.
    async fn compare_and_delete(&self, key: &str, expected_revision: u64) -> Result<bool>;

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream>;
}
