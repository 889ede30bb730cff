use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::types::{MetaStore, WatchEvent, WatchStream};

/// In-process store for tests and single-node deployments. Shares revision
/// semantics with the etcd implementation: a single counter, bumped on every
/// mutation.
#[derive(Debug, Clone)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<WatchEvent>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    revision: u64,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, Entry>,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }

    fn current_revision(&self, key: &str) -> u64 {
        self.kv.get(key).map(|e| e.revision).unwrap_or(0)
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    fn emit(&self, event: WatchEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let (rev, event) = {
            let mut inner = self.inner.write().await;
            let rev = inner.next_revision();
            inner.kv.insert(key.to_string(), Entry { value: value.clone(), revision: rev });
            (rev, WatchEvent {
                key: key.to_string(),
                value: Some(value),
                revision: rev,
            })
        };
        self.emit(event);
        Ok(rev)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|e| (e.value.clone(), e.revision)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let (rev, existed) = {
            let mut inner = self.inner.write().await;
            let existed = inner.kv.remove(key).is_some();
            let rev = inner.next_revision();
            (rev, existed)
        };

        if existed {
            self.emit(WatchEvent {
                key: key.to_string(),
                value: None,
                revision: rev,
            });
        }

        Ok(rev)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        let out = inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone(), e.revision))
            .collect();
        Ok(out)
    }

    async fn compare_and_swap(&self, key: &str, expected_revision: u64, value: Vec<u8>) -> Result<(bool, u64)> {
        let (rev, event) = {
            let mut inner = self.inner.write().await;
            let current = inner.current_revision(key);
            if current != expected_revision {
                return Ok((false, current));
            }
            let rev = inner.next_revision();
            inner.kv.insert(key.to_string(), Entry { value: value.clone(), revision: rev });
            (rev, WatchEvent {
                key: key.to_string(),
                value: Some(value),
                revision: rev,
            })
        };

        self.emit(event);
        Ok((true, rev))
    }

    async fn compare_and_delete(&self, key: &str, expected_revision: u64) -> Result<bool> {
        let event = {
            let mut inner = self.inner.write().await;
            let current = inner.current_revision(key);
            if current == 0 || current != expected_revision {
                return Ok(false);
            }
            inner.kv.remove(key);
            let rev = inner.next_revision();
            WatchEvent {
                key: key.to_string(),
                value: None,
                revision: rev,
            }
        };

        self.emit(event);
        Ok(true)
    }

    async fn watch_prefix(&self, prefix: &str, start_revision_exclusive: Option<u64>) -> Result<WatchStream> {
        let prefix = prefix.to_string();
        let min_rev = start_revision_exclusive.unwrap_or(0);
        let rx = self.tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
            Ok(ev) => {
                if ev.revision <= min_rev {
                    return None;
                }
                if ev.key.starts_with(&prefix) {
                    Some(ev)
                } else {
                    None
                }
            }
            Err(_) => None,
        });

        Ok(Box::pin(stream))
    }
}
