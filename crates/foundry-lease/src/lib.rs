use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use foundry_common::util::now_ms;
use foundry_meta::MetaStore;

pub mod gpu;

use gpu::GpuTelemetry;

/// Store prefix of the lease table; one entry per GPU index.
const LEASE_PREFIX: &str = "/leases/";

/// Arbitrates exclusive, time-bounded GPU access among concurrent requests.
///
/// All shared state lives in the store, one entry per GPU index, and every
/// mutation goes through a revision-checked operation. Two managers (or two
/// tasks on one manager) can race freely: each index has exactly one CAS
/// winner.
pub struct LeaseManager {
    store: Arc<dyn MetaStore>,
    telemetry: Arc<dyn GpuTelemetry>,
    cfg: LeaseConfig,
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Free-memory fraction (0.0–1.0) a GPU must exceed to count as available.
    pub free_ratio_threshold: f64,

    /// How long a lease lives without a release before the sweeper reclaims it.
    pub ttl: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            free_ratio_threshold: 0.8,
            ttl: Duration::from_secs(180),
        }
    }
}

/// One granted lease, as persisted at `/leases/{gpu_index}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub gpu_index: u32,
    pub task_id: String,
    pub user_id: String,
    pub acquired_at_ms: u64,
    pub ttl_ms: u64,
}

impl Lease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.acquired_at_ms) > self.ttl_ms
    }
}

#[derive(Debug, Error)]
pub enum LeaseError {
    /// Fewer GPUs available than requested. Nothing was granted.
    #[error("insufficient GPUs: requested {requested}, available {available}")]
    InsufficientGpus { requested: u32, available: u32 },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn MetaStore>,
        telemetry: Arc<dyn GpuTelemetry>,
        cfg: LeaseConfig,
    ) -> Arc<Self> {
        tracing::info!(
            threshold = cfg.free_ratio_threshold,
            ttl_secs = cfg.ttl.as_secs(),
            "lease manager initialized"
        );
        Arc::new(Self {
            store,
            telemetry,
            cfg,
        })
    }

    fn lease_key(gpu_index: u32) -> String {
        format!("{LEASE_PREFIX}{gpu_index}")
    }

    async fn load_leases(&self) -> Result<BTreeMap<u32, (Lease, u64)>> {
        let mut out = BTreeMap::new();
        for (key, value, rev) in self.store.list_prefix(LEASE_PREFIX).await? {
            match serde_json::from_slice::<Lease>(&value) {
                Ok(lease) => {
                    out.insert(lease.gpu_index, (lease, rev));
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "skipping unparseable lease entry");
                }
            }
        }
        Ok(out)
    }

    /// Claimable indices in ascending order. For each: `None` if the slot is
    /// free, `Some((lease, rev))` if an expired lease must be taken over.
    async fn candidates(&self) -> Result<Vec<(u32, Option<(Lease, u64)>)>> {
        let now = now_ms();
        let gpus = self.telemetry.sample().await;
        let leases = self.load_leases().await?;

        let mut out = Vec::new();
        for gpu in gpus {
            if gpu.memory_free_ratio() <= self.cfg.free_ratio_threshold {
                continue;
            }
            match leases.get(&gpu.index) {
                None => out.push((gpu.index, None)),
                Some((lease, rev)) if lease.is_expired(now) => {
                    out.push((gpu.index, Some((lease.clone(), *rev))));
                }
                Some(_) => {}
            }
        }
        out.sort_by_key(|(index, _)| *index);
        Ok(out)
    }

    /// GPUs currently available for leasing: free-memory ratio above the
    /// threshold and no live lease on the index. A point-in-time snapshot.
    pub async fn list_available(&self) -> Result<BTreeSet<u32>> {
        let candidates = self.candidates().await?;
        Ok(candidates.into_iter().map(|(index, _)| index).collect())
    }

    /// Grant `count` GPUs to `task_id`, all or nothing.
    ///
    /// Candidates are claimed in ascending index order, free slots by
    /// create-if-absent, expired leases by replacing the exact revision that
    /// was read (takeover). If concurrent claimers leave us short, every
    /// claim this call made is rolled back before the error returns.
    pub async fn acquire(
        &self,
        task_id: &str,
        user_id: &str,
        count: u32,
    ) -> Result<BTreeSet<u32>, LeaseError> {
        let candidates = self.candidates().await?;
        if (candidates.len() as u32) < count {
            return Err(LeaseError::InsufficientGpus {
                requested: count,
                available: candidates.len() as u32,
            });
        }

        let now = now_ms();
        let ttl_ms = self.cfg.ttl.as_millis() as u64;
        let mut claimed: Vec<(u32, u64)> = Vec::new();

        for (index, takeover) in candidates {
            if claimed.len() as u32 == count {
                break;
            }
            let lease = Lease {
                gpu_index: index,
                task_id: task_id.to_string(),
                user_id: user_id.to_string(),
                acquired_at_ms: now,
                ttl_ms,
            };
            let value = serde_json::to_vec(&lease).map_err(anyhow::Error::from)?;
            let expected = takeover.map(|(_, rev)| rev).unwrap_or(0);

            match self
                .store
                .compare_and_swap(&Self::lease_key(index), expected, value)
                .await
            {
                Ok((true, rev)) => claimed.push((index, rev)),
                Ok((false, _)) => {
                    tracing::debug!(gpu_index = index, task_id = %task_id, "lost claim race");
                }
                Err(err) => {
                    self.rollback(task_id, &claimed).await;
                    return Err(LeaseError::Store(err));
                }
            }
        }

        if (claimed.len() as u32) < count {
            let available = claimed.len() as u32;
            self.rollback(task_id, &claimed).await;
            return Err(LeaseError::InsufficientGpus {
                requested: count,
                available,
            });
        }

        let indices: BTreeSet<u32> = claimed.into_iter().map(|(index, _)| index).collect();
        tracing::info!(task_id = %task_id, user_id = %user_id, gpus = ?indices, "lease acquired");
        Ok(indices)
    }

    async fn rollback(&self, task_id: &str, claimed: &[(u32, u64)]) {
        for (index, rev) in claimed {
            if let Err(err) = self
                .store
                .compare_and_delete(&Self::lease_key(*index), *rev)
                .await
            {
                tracing::warn!(gpu_index = index, task_id = %task_id, error = %err, "failed to roll back claim");
            }
        }
    }

    /// Release every lease held by `task_id`. Idempotent: releasing a task
    /// that holds nothing is a no-op. Returns the indices actually freed.
    pub async fn release(&self, task_id: &str) -> Result<Vec<u32>> {
        let leases = self.load_leases().await?;
        let mut released = Vec::new();
        for (index, (lease, rev)) in leases {
            if lease.task_id != task_id {
                continue;
            }
            // A false CAS here means the slot was re-leased underneath us;
            // that lease is not ours to free.
            if self
                .store
                .compare_and_delete(&Self::lease_key(index), rev)
                .await?
            {
                released.push(index);
            }
        }
        if !released.is_empty() {
            tracing::info!(task_id = %task_id, gpus = ?released, "lease released");
        }
        Ok(released)
    }

    /// Reclaim every expired lease and return the tasks this sweep actually
    /// removed leases for, keyed by task id with the owning user. A racing
    /// sweeper or claimer wins the revision check at most once per entry,
    /// so nobody double-reclaims.
    pub async fn sweep_expired(&self) -> Result<BTreeMap<String, String>> {
        let now = now_ms();
        let leases = self.load_leases().await?;
        let mut swept = BTreeMap::new();
        for (index, (lease, rev)) in leases {
            if !lease.is_expired(now) {
                continue;
            }
            if self
                .store
                .compare_and_delete(&Self::lease_key(index), rev)
                .await?
            {
                tracing::warn!(
                    task_id = %lease.task_id,
                    gpu_index = index,
                    age_ms = now.saturating_sub(lease.acquired_at_ms),
                    "swept expired lease"
                );
                swept.insert(lease.task_id, lease.user_id);
            }
        }
        Ok(swept)
    }

    /// Live (unexpired) leases currently held by `task_id`.
    pub async fn held_by(&self, task_id: &str) -> Result<BTreeSet<u32>> {
        let now = now_ms();
        let leases = self.load_leases().await?;
        Ok(leases
            .into_iter()
            .filter(|(_, (lease, _))| lease.task_id == task_id && !lease.is_expired(now))
            .map(|(index, _)| index)
            .collect())
    }
}
