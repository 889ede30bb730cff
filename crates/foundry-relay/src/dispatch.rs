use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use crate::{EventRelay, StreamEntry, STREAM_ITEMS_PREFIX};

/// Delay before resyncing after the watch ends or the store misbehaves.
const RESYNC_BACKOFF: Duration = Duration::from_secs(1);

/// Follow the stream and hand every entry to the dispatcher, in order.
///
/// Catches up from the persisted cursor first (which covers restarts),
/// then follows the store watch, with a periodic rescan in case the watch
/// goes quiet. Any store trouble drops back to a fresh catch-up pass.
pub async fn dispatch_loop(relay: Arc<EventRelay>) {
    loop {
        let start_rev = match relay.dispatch_catch_up().await {
            Ok(rev) => rev,
            Err(err) => {
                tracing::warn!(error = %err, "dispatch catch-up failed, will retry");
                tokio::time::sleep(RESYNC_BACKOFF).await;
                continue;
            }
        };

        let mut stream = match relay
            .store
            .watch_prefix(STREAM_ITEMS_PREFIX, Some(start_rev))
            .await
        {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "failed to watch stream, will retry");
                tokio::time::sleep(RESYNC_BACKOFF).await;
                continue;
            }
        };

        let mut rescan = tokio::time::interval(relay.cfg.rescan_interval);
        rescan.tick().await; // the first tick fires immediately

        'watching: loop {
            tokio::select! {
                maybe_ev = stream.next() => {
                    let Some(ev) = maybe_ev else {
                        tracing::warn!("stream watch ended, resyncing");
                        break 'watching;
                    };
                    // trim deletes show up here too; only additions matter
                    let Some(bytes) = ev.value else {
                        continue;
                    };
                    let Ok(entry) = serde_json::from_slice::<StreamEntry>(&bytes) else {
                        tracing::warn!(key = %ev.key, "unreadable stream entry in watch");
                        continue;
                    };
                    if let Err(err) = relay.dispatch_entry(&entry).await {
                        tracing::warn!(error = %err, seq = entry.seq, "dispatch failed, resyncing");
                        break 'watching;
                    }
                }
                _ = rescan.tick() => {
                    if let Err(err) = relay.dispatch_catch_up().await {
                        tracing::warn!(error = %err, "dispatch rescan failed, resyncing");
                        break 'watching;
                    }
                }
            }
        }

        tokio::time::sleep(RESYNC_BACKOFF).await;
    }
}

/// Drive retry sweeps on the configured fixed interval.
pub async fn retry_loop(relay: Arc<EventRelay>) {
    loop {
        tokio::time::sleep(relay.cfg.retry_interval).await;
        match relay.retry_sweep_once().await {
            Ok(sweep) if !sweep.is_empty() => {
                tracing::info!(
                    delivered = sweep.delivered,
                    rescheduled = sweep.rescheduled,
                    abandoned = sweep.abandoned,
                    pruned = sweep.pruned,
                    "retry sweep finished"
                );
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "retry sweep failed"),
        }
    }
}
