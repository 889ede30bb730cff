use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use foundry_common::TaskState;

use crate::record::{DeliveryNotice, DeliveryStatus};

/// Per-receiver buffer for namespace broadcast channels. Slow readers
/// lag and skip rather than block the dispatcher.
const CHANNEL_CAPACITY: usize = 256;

/// The two fan-out lanes. `Raw` carries task-state events from
/// producers; `Inner` carries the relay's own retry bookkeeping so that
/// retry traffic is never mistaken for primary traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Raw,
    Inner,
}

/// Payload handed to subscribers. Tagged so webhook consumers can tell
/// the lanes apart without out-of-band context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum RelayEvent {
    Task(TaskState),
    Delivery(DeliveryNotice),
}

/// One delivery target. `deliver` returning `Err` counts as a failed
/// attempt for the whole event; having nobody listening does not.
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, namespace: &str, event: &RelayEvent) -> anyhow::Result<()>;
}

/// Static topic-to-subscriber mapping, assembled once at startup and
/// immutable afterwards.
#[derive(Default)]
pub struct SubscriberRegistry {
    raw: Vec<Arc<dyn Subscriber>>,
    inner: Vec<Arc<dyn Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, topic: Topic, subscriber: Arc<dyn Subscriber>) -> Self {
        match topic {
            Topic::Raw => self.raw.push(subscriber),
            Topic::Inner => self.inner.push(subscriber),
        }
        self
    }

    pub fn topic(&self, topic: Topic) -> &[Arc<dyn Subscriber>] {
        match topic {
            Topic::Raw => &self.raw,
            Topic::Inner => &self.inner,
        }
    }
}

/// In-process fan-out keyed by namespace, backing the live event feed.
///
/// Delivery into a namespace nobody is currently watching succeeds
/// vacuously; the durable stream is the source of record, the channels
/// are only a live tap.
#[derive(Default)]
pub struct ChannelSubscriber {
    channels: DashMap<String, broadcast::Sender<TaskState>>,
}

impl ChannelSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a live tap on one namespace. The channel is created on
    /// first subscribe and reused by later subscribers.
    pub fn subscribe(&self, namespace: &str) -> broadcast::Receiver<TaskState> {
        self.channels
            .entry(namespace.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn deliver(&self, namespace: &str, event: &RelayEvent) -> anyhow::Result<()> {
        let RelayEvent::Task(state) = event else {
            return Ok(());
        };
        if let Some(tx) = self.channels.get(namespace) {
            // send only errors when no receiver is connected
            let _ = tx.send(state.clone());
        }
        Ok(())
    }
}

/// POSTs each event to an external HTTP endpoint. Any transport error
/// or non-2xx answer fails the delivery so the relay schedules a retry.
pub struct WebhookSubscriber {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookSubscriber {
    pub fn new(url: &str, token: Option<&str>) -> anyhow::Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Arc::new(Self {
            http,
            url: url.to_string(),
            token: token.map(|t| t.to_string()),
        }))
    }
}

#[async_trait]
impl Subscriber for WebhookSubscriber {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, namespace: &str, event: &RelayEvent) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "sent_at": Utc::now().to_rfc3339(),
            "namespace": namespace,
            "event": event,
        });

        let mut req = self.http.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook endpoint answered {}", resp.status());
        }
        Ok(())
    }
}

/// Inner-topic sink that surfaces retry bookkeeping in the service log.
#[derive(Default)]
pub struct LogSubscriber;

impl LogSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Subscriber for LogSubscriber {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, _namespace: &str, event: &RelayEvent) -> anyhow::Result<()> {
        let RelayEvent::Delivery(notice) = event else {
            return Ok(());
        };
        match notice.status {
            DeliveryStatus::Abandoned => tracing::warn!(
                namespace = %notice.namespace,
                seq = notice.seq,
                attempts = notice.attempts,
                error = notice.error.as_deref().unwrap_or("-"),
                "delivery abandoned"
            ),
            _ => tracing::info!(
                namespace = %notice.namespace,
                seq = notice.seq,
                attempts = notice.attempts,
                error = notice.error.as_deref().unwrap_or("-"),
                "delivery will be retried"
            ),
        }
        Ok(())
    }
}
