//! Reliable fan-out of task-state events.
//!
//! Producers publish [`foundry_common::TaskState`] events into a durable,
//! length-capped stream in the meta store. A dispatcher walks the stream in
//! order and hands each event to every raw-topic subscriber, tracking the
//! outcome in a per-event [`DeliveryRecord`]. Failed deliveries are retried
//! on a fixed interval until they succeed or the event is trimmed out of
//! the stream, at which point the record is marked abandoned.

mod dispatch;
mod record;
mod subscriber;

pub use dispatch::{dispatch_loop, retry_loop};
pub use record::{dedup_key, DeliveryNotice, DeliveryRecord, DeliveryStatus};
pub use subscriber::{
    ChannelSubscriber, LogSubscriber, RelayEvent, Subscriber, SubscriberRegistry, Topic,
    WebhookSubscriber,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use foundry_common::util::now_ms;
use foundry_common::TaskState;
use foundry_meta::MetaStore;

/// Next sequence hint. The item write is what actually allocates a slot;
/// this key only spares publishers a walk.
const STREAM_HEAD_KEY: &str = "/relay/stream/head";
/// Lowest sequence still retained. Everything below it is trimmed.
const STREAM_TAIL_KEY: &str = "/relay/stream/tail";
const STREAM_ITEMS_PREFIX: &str = "/relay/stream/items/";
const DELIVERY_PREFIX: &str = "/relay/deliveries/";
/// Dispatcher position: the next sequence it has not yet handled.
const CURSOR_KEY: &str = "/relay/cursor";

/// Tuning for the stream and its delivery machinery.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Retained stream entries; sized for two days of traffic at roughly
    /// ten events per second.
    pub stream_cap: u64,
    /// Fixed pause before a failed delivery is attempted again.
    pub retry_interval: Duration,
    /// How often the dispatcher rescans the stream when the watch is quiet.
    pub rescan_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            stream_cap: 1_728_000,
            retry_interval: Duration::from_secs(60),
            rescan_interval: Duration::from_secs(30),
        }
    }
}

/// One durable stream slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    pub seq: u64,
    pub event: TaskState,
}

/// Relay counters, exported on /metrics.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    events_published: AtomicU64,
    entries_trimmed: AtomicU64,
    deliveries_ok: AtomicU64,
    deliveries_retried: AtomicU64,
    deliveries_abandoned: AtomicU64,
    dedup_hits: AtomicU64,
    records_pruned: AtomicU64,
}

impl RelayMetrics {
    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn entries_trimmed(&self) -> u64 {
        self.entries_trimmed.load(Ordering::Relaxed)
    }

    pub fn deliveries_ok(&self) -> u64 {
        self.deliveries_ok.load(Ordering::Relaxed)
    }

    pub fn deliveries_retried(&self) -> u64 {
        self.deliveries_retried.load(Ordering::Relaxed)
    }

    pub fn deliveries_abandoned(&self) -> u64 {
        self.deliveries_abandoned.load(Ordering::Relaxed)
    }

    pub fn dedup_hits(&self) -> u64 {
        self.dedup_hits.load(Ordering::Relaxed)
    }

    pub fn records_pruned(&self) -> u64 {
        self.records_pruned.load(Ordering::Relaxed)
    }
}

/// Outcome of one retry sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetrySweep {
    pub delivered: u64,
    pub rescheduled: u64,
    pub abandoned: u64,
    pub pruned: u64,
}

impl RetrySweep {
    pub fn is_empty(&self) -> bool {
        self.delivered + self.rescheduled + self.abandoned + self.pruned == 0
    }
}

/// The event relay: durable stream plus delivery bookkeeping.
pub struct EventRelay {
    store: Arc<dyn MetaStore>,
    registry: SubscriberRegistry,
    cfg: RelayConfig,
    metrics: RelayMetrics,
}

impl EventRelay {
    pub fn new(
        store: Arc<dyn MetaStore>,
        registry: SubscriberRegistry,
        cfg: RelayConfig,
    ) -> Arc<Self> {
        Arc::new(EventRelay {
            store,
            registry,
            cfg,
            metrics: RelayMetrics::default(),
        })
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &RelayConfig {
        &self.cfg
    }

    fn item_key(seq: u64) -> String {
        // zero-padded so key order is sequence order
        format!("{STREAM_ITEMS_PREFIX}{seq:020}")
    }

    fn delivery_key(namespace: &str, timestamp_ms: u64) -> String {
        format!("{DELIVERY_PREFIX}{namespace}/{timestamp_ms:020}")
    }

    /// Read a u64 counter key. Absent means zero at revision zero.
    async fn counter(&self, key: &str) -> Result<(u64, u64)> {
        match self.store.get(key).await? {
            Some((bytes, revision)) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("counter {key} is not a u64"))?;
                Ok((value, revision))
            }
            None => Ok((0, 0)),
        }
    }

    /// Append one event to the stream and return its sequence.
    ///
    /// The slot is claimed with a create-only write on the item key, so
    /// concurrent publishers can never overwrite each other; losing a slot
    /// means walking up to the next free one.
    pub async fn publish(&self, event: &TaskState) -> Result<u64> {
        let (head, _) = self.counter(STREAM_HEAD_KEY).await?;
        let (tail, _) = self.counter(STREAM_TAIL_KEY).await?;
        let mut seq = head.max(tail);
        loop {
            let entry = StreamEntry {
                seq,
                event: event.clone(),
            };
            let bytes = serde_json::to_vec(&entry)?;
            let (written, _) = self
                .store
                .compare_and_swap(&Self::item_key(seq), 0, bytes)
                .await?;
            if written {
                break;
            }
            seq += 1;
        }

        self.advance_head(seq + 1).await;
        self.metrics.events_published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(seq, task_id = %event.task_id, "event published");

        // trimming is housekeeping; the append above already succeeded
        if let Err(err) = self.trim(seq).await {
            tracing::warn!(error = %err, "stream trim failed");
        }
        Ok(seq)
    }

    /// Best-effort bump of the sequence hint.
    async fn advance_head(&self, to: u64) {
        let Ok((current, revision)) = self.counter(STREAM_HEAD_KEY).await else {
            return;
        };
        if to <= current {
            return;
        }
        let Ok(bytes) = serde_json::to_vec(&to) else {
            return;
        };
        let _ = self
            .store
            .compare_and_swap(STREAM_HEAD_KEY, revision, bytes)
            .await;
    }

    /// Drop entries older than the cap. The tail moves first so trimmed
    /// events count as out-of-window even while their items are still
    /// being deleted; one trimmer wins the tail swap, losers walk away.
    async fn trim(&self, latest_seq: u64) -> Result<()> {
        let (tail, tail_revision) = self.counter(STREAM_TAIL_KEY).await?;
        let retained = (latest_seq + 1).saturating_sub(tail);
        if retained <= self.cfg.stream_cap {
            return Ok(());
        }
        let new_tail = latest_seq + 1 - self.cfg.stream_cap;
        let (won, _) = self
            .store
            .compare_and_swap(STREAM_TAIL_KEY, tail_revision, serde_json::to_vec(&new_tail)?)
            .await?;
        if !won {
            return Ok(());
        }
        for seq in tail..new_tail {
            self.store.delete(&Self::item_key(seq)).await?;
        }
        self.metrics
            .entries_trimmed
            .fetch_add(new_tail - tail, Ordering::Relaxed);
        tracing::debug!(tail = new_tail, dropped = new_tail - tail, "stream trimmed");
        Ok(())
    }

    /// Deliver one stream entry to the raw topic, tracked by a durable
    /// record keyed on the event identity. Safe to call any number of
    /// times for the same event: repeat calls observe the record instead
    /// of delivering again.
    pub async fn dispatch(&self, entry: &StreamEntry, namespace: &str) -> Result<DeliveryStatus> {
        let key = Self::delivery_key(namespace, entry.event.timestamp_ms);

        if let Some((bytes, _)) = self.store.get(&key).await? {
            let record: DeliveryRecord = serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt delivery record at {key}"))?;
            if record.status == DeliveryStatus::Delivered {
                self.metrics.dedup_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(dedup_key = %record.dedup_key, "event already delivered, skipping");
            }
            // pending and retrying records belong to the sweep now
            return Ok(record.status);
        }

        let deadline = now_ms() + self.cfg.retry_interval.as_millis() as u64;
        let record = DeliveryRecord::claim(namespace, entry.seq, &entry.event, deadline);
        let (claimed, revision) = self
            .store
            .compare_and_swap(&key, 0, serde_json::to_vec(&record)?)
            .await?;
        if !claimed {
            // another dispatcher got here first; report what it decided
            let Some((bytes, _)) = self.store.get(&key).await? else {
                return Ok(DeliveryStatus::Pending);
            };
            let record: DeliveryRecord = serde_json::from_slice(&bytes)?;
            return Ok(record.status);
        }

        self.attempt(&key, record, revision).await
    }

    /// Run one delivery attempt and settle the record.
    async fn attempt(
        &self,
        key: &str,
        mut record: DeliveryRecord,
        revision: u64,
    ) -> Result<DeliveryStatus> {
        record.attempts += 1;
        match self.deliver_raw(&record).await {
            Ok(()) => {
                record.status = DeliveryStatus::Delivered;
                record.last_error = None;
                self.settle(key, &record, revision).await?;
                self.metrics.deliveries_ok.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    dedup_key = %record.dedup_key,
                    attempts = record.attempts,
                    "event delivered"
                );
                Ok(DeliveryStatus::Delivered)
            }
            Err(err) => {
                record.status = DeliveryStatus::Retrying;
                record.next_attempt_ms = now_ms() + self.cfg.retry_interval.as_millis() as u64;
                record.last_error = Some(err.to_string());
                self.settle(key, &record, revision).await?;
                self.metrics.deliveries_retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    dedup_key = %record.dedup_key,
                    attempts = record.attempts,
                    error = %err,
                    "delivery failed, retry scheduled"
                );
                self.notify_inner(&record).await;
                Ok(DeliveryStatus::Retrying)
            }
        }
    }

    async fn settle(&self, key: &str, record: &DeliveryRecord, revision: u64) -> Result<()> {
        let (swapped, _) = self
            .store
            .compare_and_swap(key, revision, serde_json::to_vec(record)?)
            .await?;
        if !swapped {
            tracing::warn!(dedup_key = %record.dedup_key, "delivery record moved mid-attempt");
        }
        Ok(())
    }

    /// Every raw subscriber must accept; the first refusal fails the event.
    async fn deliver_raw(&self, record: &DeliveryRecord) -> Result<()> {
        let event = RelayEvent::Task(record.event.clone());
        for sub in self.registry.topic(Topic::Raw) {
            sub.deliver(&record.namespace, &event)
                .await
                .with_context(|| format!("subscriber {} rejected event", sub.name()))?;
        }
        Ok(())
    }

    /// Inner-topic fan-out is fire-and-forget bookkeeping.
    async fn notify_inner(&self, record: &DeliveryRecord) {
        let event = RelayEvent::Delivery(record.notice());
        for sub in self.registry.topic(Topic::Inner) {
            if let Err(err) = sub.deliver(&record.namespace, &event).await {
                tracing::warn!(subscriber = sub.name(), error = %err, "inner notice dropped");
            }
        }
    }

    /// One pass over retained entries at or past the cursor, oldest first.
    /// Returns the highest store revision it saw so the caller can resume
    /// a watch from there.
    pub async fn dispatch_catch_up(&self) -> Result<u64> {
        let (mut cursor, _) = self.counter(CURSOR_KEY).await?;
        let mut max_revision = 0;
        for (key, bytes, revision) in self.store.list_prefix(STREAM_ITEMS_PREFIX).await? {
            max_revision = max_revision.max(revision);
            let entry: StreamEntry = match serde_json::from_slice(&bytes) {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "skipping unreadable stream entry");
                    continue;
                }
            };
            if entry.seq < cursor {
                continue;
            }
            let namespace = entry.event.namespace();
            self.dispatch(&entry, &namespace).await?;
            cursor = entry.seq + 1;
            self.store
                .put(CURSOR_KEY, serde_json::to_vec(&cursor)?)
                .await?;
        }
        Ok(max_revision)
    }

    /// Dispatch a freshly watched entry and move the cursor past it.
    pub async fn dispatch_entry(&self, entry: &StreamEntry) -> Result<()> {
        let (cursor, _) = self.counter(CURSOR_KEY).await?;
        if entry.seq < cursor {
            return Ok(());
        }
        let namespace = entry.event.namespace();
        self.dispatch(entry, &namespace).await?;
        self.store
            .put(CURSOR_KEY, serde_json::to_vec(&(entry.seq + 1))?)
            .await?;
        Ok(())
    }

    /// One pass over delivery records: redeliver what is due, abandon what
    /// the stream trimmed away, prune settled bookkeeping that fell below
    /// the tail.
    pub async fn retry_sweep_once(&self) -> Result<RetrySweep> {
        let (tail, _) = self.counter(STREAM_TAIL_KEY).await?;
        let now = now_ms();
        let mut sweep = RetrySweep::default();

        for (key, bytes, revision) in self.store.list_prefix(DELIVERY_PREFIX).await? {
            let record: DeliveryRecord = match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "skipping unreadable delivery record");
                    continue;
                }
            };

            if record.status.is_terminal() {
                if record.seq < tail && self.store.compare_and_delete(&key, revision).await? {
                    sweep.pruned += 1;
                }
                continue;
            }

            if record.seq < tail {
                self.abandon(&key, record, revision).await?;
                sweep.abandoned += 1;
                continue;
            }

            // covers both due retries and records stranded in pending by a
            // dispatcher that died mid-attempt
            if record.next_attempt_ms > now {
                continue;
            }
            match self.attempt(&key, record, revision).await? {
                DeliveryStatus::Delivered => sweep.delivered += 1,
                _ => sweep.rescheduled += 1,
            }
        }
        Ok(sweep)
    }

    async fn abandon(&self, key: &str, mut record: DeliveryRecord, revision: u64) -> Result<()> {
        record.status = DeliveryStatus::Abandoned;
        self.settle(key, &record, revision).await?;
        self.metrics
            .deliveries_abandoned
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            dedup_key = %record.dedup_key,
            seq = record.seq,
            attempts = record.attempts,
            "event trimmed before delivery could succeed, abandoning"
        );
        self.notify_inner(&record).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use foundry_common::{state_code, TaskPhase};
    use foundry_meta::MemoryMetaStore;

    struct RecordingSubscriber {
        fail_next: AtomicU32,
        tasks: Mutex<Vec<TaskState>>,
        notices: Mutex<Vec<DeliveryNotice>>,
    }

    impl RecordingSubscriber {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSubscriber {
                fail_next: AtomicU32::new(0),
                tasks: Mutex::new(Vec::new()),
                notices: Mutex::new(Vec::new()),
            })
        }

        fn failing(times: u32) -> Arc<Self> {
            let sub = Self::new();
            sub.fail_next.store(times, Ordering::SeqCst);
            sub
        }

        fn tasks(&self) -> Vec<TaskState> {
            self.tasks.lock().unwrap().clone()
        }

        fn notices(&self) -> Vec<DeliveryNotice> {
            self.notices.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Subscriber for RecordingSubscriber {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn deliver(&self, _namespace: &str, event: &RelayEvent) -> Result<()> {
            match event {
                RelayEvent::Task(state) => {
                    let remaining = self.fail_next.load(Ordering::SeqCst);
                    if remaining > 0 {
                        self.fail_next.store(remaining - 1, Ordering::SeqCst);
                        anyhow::bail!("injected failure");
                    }
                    self.tasks.lock().unwrap().push(state.clone());
                }
                RelayEvent::Delivery(notice) => {
                    self.notices.lock().unwrap().push(notice.clone());
                }
            }
            Ok(())
        }
    }

    fn make_event(task_id: &str, timestamp_ms: u64) -> TaskState {
        TaskState {
            task_id: task_id.to_string(),
            user_id: "u1".to_string(),
            timestamp_ms,
            percent: 0.5,
            state: TaskPhase::Running,
            state_code: state_code::OK,
            error_info: None,
        }
    }

    fn test_config() -> RelayConfig {
        RelayConfig {
            stream_cap: 100,
            retry_interval: Duration::from_secs(60),
            rescan_interval: Duration::from_secs(1),
        }
    }

    fn make_relay(
        store: Arc<dyn MetaStore>,
        cfg: RelayConfig,
        raw: Arc<RecordingSubscriber>,
        inner: Arc<RecordingSubscriber>,
    ) -> Arc<EventRelay> {
        let registry = SubscriberRegistry::new()
            .register(Topic::Raw, raw)
            .register(Topic::Inner, inner);
        EventRelay::new(store, registry, cfg)
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_sequences() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let relay = make_relay(
            store.clone(),
            test_config(),
            RecordingSubscriber::new(),
            RecordingSubscriber::new(),
        );

        for (i, ts) in [10u64, 20, 30].iter().enumerate() {
            let seq = relay.publish(&make_event("t1", *ts)).await.unwrap();
            assert_eq!(seq, i as u64);
        }

        let items = store.list_prefix(STREAM_ITEMS_PREFIX).await.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(relay.metrics().events_published(), 3);
    }

    #[tokio::test]
    async fn test_publish_trims_entries_beyond_cap() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let mut cfg = test_config();
        cfg.stream_cap = 3;
        let relay = make_relay(
            store.clone(),
            cfg,
            RecordingSubscriber::new(),
            RecordingSubscriber::new(),
        );

        for ts in 0..5u64 {
            relay.publish(&make_event("t1", ts)).await.unwrap();
        }

        let items = store.list_prefix(STREAM_ITEMS_PREFIX).await.unwrap();
        let seqs: Vec<u64> = items
            .iter()
            .map(|(_, bytes, _)| serde_json::from_slice::<StreamEntry>(bytes).unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![2, 3, 4]);

        let (tail, _) = relay.counter(STREAM_TAIL_KEY).await.unwrap();
        assert_eq!(tail, 2);
        assert_eq!(relay.metrics().entries_trimmed(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_delivers_and_settles_the_record() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let raw = RecordingSubscriber::new();
        let relay = make_relay(
            store.clone(),
            test_config(),
            raw.clone(),
            RecordingSubscriber::new(),
        );

        let event = make_event("t1", 42);
        let seq = relay.publish(&event).await.unwrap();
        let entry = StreamEntry { seq, event };

        let status = relay.dispatch(&entry, "u1:t1").await.unwrap();
        assert_eq!(status, DeliveryStatus::Delivered);
        assert_eq!(raw.tasks().len(), 1);
        assert_eq!(relay.metrics().deliveries_ok(), 1);

        let records = store.list_prefix(DELIVERY_PREFIX).await.unwrap();
        assert_eq!(records.len(), 1);
        let record: DeliveryRecord = serde_json::from_slice(&records[0].1).unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_dispatch_is_idempotent_per_event_identity() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let raw = RecordingSubscriber::new();
        let relay = make_relay(
            store.clone(),
            test_config(),
            raw.clone(),
            RecordingSubscriber::new(),
        );

        let event = make_event("t1", 42);
        let seq = relay.publish(&event).await.unwrap();
        let entry = StreamEntry { seq, event: event.clone() };

        relay.dispatch(&entry, "u1:t1").await.unwrap();

        // a duplicate publish of the same logical event lands at a new seq
        // but collapses onto the same delivery record
        let dup_seq = relay.publish(&event).await.unwrap();
        let dup = StreamEntry { seq: dup_seq, event };
        let status = relay.dispatch(&dup, "u1:t1").await.unwrap();

        assert_eq!(status, DeliveryStatus::Delivered);
        assert_eq!(raw.tasks().len(), 1, "subscriber must see the event once");
        assert_eq!(relay.metrics().dedup_hits(), 1);
        assert_eq!(store.list_prefix(DELIVERY_PREFIX).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_scheduled_for_retry() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let raw = RecordingSubscriber::failing(1);
        let inner = RecordingSubscriber::new();
        let relay = make_relay(store.clone(), test_config(), raw.clone(), inner.clone());

        let event = make_event("t1", 42);
        let seq = relay.publish(&event).await.unwrap();
        let entry = StreamEntry { seq, event };

        let status = relay.dispatch(&entry, "u1:t1").await.unwrap();
        assert_eq!(status, DeliveryStatus::Retrying);
        assert!(raw.tasks().is_empty());
        assert_eq!(relay.metrics().deliveries_retried(), 1);

        let records = store.list_prefix(DELIVERY_PREFIX).await.unwrap();
        let record: DeliveryRecord = serde_json::from_slice(&records[0].1).unwrap();
        assert_eq!(record.status, DeliveryStatus::Retrying);
        assert_eq!(record.attempts, 1);
        assert!(record.next_attempt_ms > now_ms() + 30_000);
        assert!(record.last_error.is_some());

        let notices = inner.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].status, DeliveryStatus::Retrying);
    }

    #[tokio::test]
    async fn test_retry_sweep_redelivers_due_records() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let mut cfg = test_config();
        // zero interval makes the failed record due immediately
        cfg.retry_interval = Duration::ZERO;
        let raw = RecordingSubscriber::failing(1);
        let relay = make_relay(store.clone(), cfg, raw.clone(), RecordingSubscriber::new());

        let event = make_event("t1", 42);
        let seq = relay.publish(&event).await.unwrap();
        let entry = StreamEntry { seq, event };
        assert_eq!(
            relay.dispatch(&entry, "u1:t1").await.unwrap(),
            DeliveryStatus::Retrying
        );

        let sweep = relay.retry_sweep_once().await.unwrap();
        assert_eq!(sweep.delivered, 1);
        assert_eq!(raw.tasks().len(), 1);

        let records = store.list_prefix(DELIVERY_PREFIX).await.unwrap();
        let record: DeliveryRecord = serde_json::from_slice(&records[0].1).unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_sweep_abandons_records_below_the_tail() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let raw = RecordingSubscriber::new();
        let inner = RecordingSubscriber::new();
        let relay = make_relay(store.clone(), test_config(), raw.clone(), inner.clone());

        store
            .put(STREAM_TAIL_KEY, serde_json::to_vec(&10u64).unwrap())
            .await
            .unwrap();

        let event = make_event("t1", 42);
        let mut record = DeliveryRecord::claim("u1:t1", 2, &event, 0);
        record.status = DeliveryStatus::Retrying;
        record.attempts = 3;
        let key = EventRelay::delivery_key("u1:t1", 42);
        store
            .put(&key, serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();

        let sweep = relay.retry_sweep_once().await.unwrap();
        assert_eq!(sweep.abandoned, 1);
        assert!(raw.tasks().is_empty(), "abandoned events are never retried");
        assert_eq!(relay.metrics().deliveries_abandoned(), 1);

        let (bytes, _) = store.get(&key).await.unwrap().unwrap();
        let settled: DeliveryRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(settled.status, DeliveryStatus::Abandoned);

        let notices = inner.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].status, DeliveryStatus::Abandoned);

        // terminal and below the tail: the next sweep prunes it for good
        let sweep = relay.retry_sweep_once().await.unwrap();
        assert_eq!(sweep.abandoned, 0);
        assert_eq!(sweep.pruned, 1);
        assert!(store.list_prefix(DELIVERY_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_sweep_picks_up_stranded_pending_records() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let raw = RecordingSubscriber::new();
        let relay = make_relay(store.clone(), test_config(), raw.clone(), RecordingSubscriber::new());

        // a dispatcher that died right after claiming leaves this behind
        let event = make_event("t1", 42);
        let record = DeliveryRecord::claim("u1:t1", 0, &event, now_ms() - 1);
        let key = EventRelay::delivery_key("u1:t1", 42);
        store
            .put(&key, serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();

        let sweep = relay.retry_sweep_once().await.unwrap();
        assert_eq!(sweep.delivered, 1);
        assert_eq!(raw.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_catch_up_dispatches_in_order_and_advances_the_cursor() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let raw = RecordingSubscriber::new();
        let relay = make_relay(store.clone(), test_config(), raw.clone(), RecordingSubscriber::new());

        relay.publish(&make_event("t1", 10)).await.unwrap();
        relay.publish(&make_event("t2", 11)).await.unwrap();
        relay.publish(&make_event("t1", 12)).await.unwrap();

        relay.dispatch_catch_up().await.unwrap();

        let seen: Vec<(String, u64)> = raw
            .tasks()
            .iter()
            .map(|s| (s.task_id.clone(), s.timestamp_ms))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("t1".to_string(), 10),
                ("t2".to_string(), 11),
                ("t1".to_string(), 12)
            ]
        );

        let (cursor, _) = relay.counter(CURSOR_KEY).await.unwrap();
        assert_eq!(cursor, 3);

        // a second pass starts past everything it already handled
        relay.dispatch_catch_up().await.unwrap();
        assert_eq!(raw.tasks().len(), 3);
        assert_eq!(relay.metrics().dedup_hits(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_entry_skips_already_handled_sequences() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let raw = RecordingSubscriber::new();
        let relay = make_relay(store.clone(), test_config(), raw.clone(), RecordingSubscriber::new());

        let event = make_event("t1", 42);
        let seq = relay.publish(&event).await.unwrap();
        let entry = StreamEntry { seq, event };

        relay.dispatch_entry(&entry).await.unwrap();
        relay.dispatch_entry(&entry).await.unwrap();

        assert_eq!(raw.tasks().len(), 1);
        let (cursor, _) = relay.counter(CURSOR_KEY).await.unwrap();
        assert_eq!(cursor, seq + 1);
    }
}
