//! Reconnect-driven drain of the offline store.
//!
//! When connectivity returns (an online signal, a tab becoming visible
//! after one, or an explicit call) the sync manager reads the queued
//! backlog, sizes batches to the current conditions (network quality,
//! battery, background state, backlog age), and submits them through the
//! resilience pipeline — priority bands strictly in order, batches within a
//! band concurrently. Progress is published on a watch channel; partial
//! progress is durable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use revi::common::now_millis;
use revi::error::{AgentError, AgentResult};
use revi::event::{EventKind, Priority};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::coordinator::ResilienceCoordinator;
use crate::health::{HealthMonitor, NetworkQuality};
use crate::store::{OfflineStore, StoredItem};
use crate::transport::CaptureEndpoint;

/// Default batch size before condition factors.
pub const DEFAULT_BATCH_SIZE: usize = 20;
/// Default concurrent batches within a priority band.
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;
/// Default ceiling on one drain's duration.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(300);
/// Batch size never drops below this.
const MIN_BATCH_SIZE: usize = 3;
/// Backlogs older than this shrink batches.
const OLD_BACKLOG: Duration = Duration::from_secs(3600);

/// Sync manager configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Batch size before condition factors.
    pub base_batch_size: usize,
    /// Concurrent batches within a priority band.
    pub max_concurrency: usize,
    /// Ceiling on one drain's duration; remaining batches are skipped.
    pub max_duration: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            base_batch_size: DEFAULT_BATCH_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_duration: DEFAULT_MAX_DURATION,
        }
    }
}

/// Host-reported conditions that shape batch sizing.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostConditions {
    /// Battery level in [0, 1], when known.
    pub battery_level: Option<f64>,
    /// Whether the page is backgrounded.
    pub background: bool,
}

/// The state bundle captured at the start of a drain.
#[derive(Clone, Debug)]
pub struct SyncContext {
    /// Session requesting the drain.
    pub session_id: String,
    /// Persistent device id.
    pub device_id: String,
    /// Previous successful drain, ms since epoch; 0 when never.
    pub last_sync: u64,
    /// Time spent offline before this drain.
    pub offline_duration: Duration,
    /// Network quality at drain start.
    pub network_quality: NetworkQuality,
    /// Host conditions at drain start.
    pub conditions: HostConditions,
}

/// Drain lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    /// No drain has run yet.
    Idle,
    /// Reading the backlog and building batches.
    Preparing,
    /// Batches in flight.
    Syncing,
    /// Drain finished; some items may have failed.
    Completed,
    /// Drain could not run at all.
    Failed,
}

/// Progress of the current (or last) drain.
#[derive(Clone, Debug)]
pub struct SyncProgress {
    /// Lifecycle phase.
    pub phase: SyncPhase,
    /// Items eligible at drain start.
    pub total: usize,
    /// Items successfully submitted so far.
    pub synced: usize,
    /// Items whose batch failed so far.
    pub failed: usize,
    /// Payload bytes successfully submitted.
    pub bytes_sent: u64,
    /// Estimated time to drain the remainder.
    pub eta: Option<Duration>,
}

impl SyncProgress {
    fn idle() -> Self {
        SyncProgress {
            phase: SyncPhase::Idle,
            total: 0,
            synced: 0,
            failed: 0,
            bytes_sent: 0,
            eta: None,
        }
    }
}

/// Outcome summary of one drain.
#[derive(Clone, Debug)]
pub struct SyncSummary {
    /// Items successfully submitted.
    pub synced: usize,
    /// Items left in place (or dropped as terminal) after failures.
    pub failed: usize,
    /// Payload bytes successfully submitted.
    pub bytes_sent: u64,
    /// Wall time of the drain.
    pub duration: Duration,
}

struct Batch {
    endpoint: CaptureEndpoint,
    ids: Vec<String>,
    body: serde_json::Value,
    bytes: u64,
}

/// Drains the offline store when connectivity returns.
#[derive(Debug)]
pub struct SyncManager {
    store: Arc<OfflineStore>,
    coordinator: Arc<ResilienceCoordinator>,
    health: Option<Arc<HealthMonitor>>,
    config: SyncConfig,
    conditions: Mutex<HostConditions>,
    online: AtomicBool,
    // Set when an online transition happens while hidden; the next
    // visibility gain triggers the deferred drain.
    resync_on_visible: AtomicBool,
    running: AtomicBool,
    progress_tx: watch::Sender<SyncProgress>,
}

impl SyncManager {
    /// A manager draining `store` through `coordinator`.
    pub fn new(
        store: Arc<OfflineStore>,
        coordinator: Arc<ResilienceCoordinator>,
        health: Option<Arc<HealthMonitor>>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (progress_tx, _) = watch::channel(SyncProgress::idle());
        Arc::new(SyncManager {
            store,
            coordinator,
            health,
            config,
            conditions: Mutex::new(HostConditions::default()),
            online: AtomicBool::new(true),
            resync_on_visible: AtomicBool::new(false),
            running: AtomicBool::new(false),
            progress_tx,
        })
    }

    /// Observe drain progress.
    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress_tx.subscribe()
    }

    /// Update host conditions (battery, background state).
    pub fn set_conditions(&self, conditions: HostConditions) {
        if let Ok(mut current) = self.conditions.lock() {
            *current = conditions;
        }
    }

    /// Report an online/offline transition. Going online triggers a drain.
    pub fn notify_online(self: &Arc<Self>, online: bool, session_id: &str) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            let background = self
                .conditions
                .lock()
                .map(|conditions| conditions.background)
                .unwrap_or(false);
            if background {
                self.resync_on_visible.store(true, Ordering::SeqCst);
            } else {
                self.spawn_drain(session_id);
            }
        }
    }

    /// Report a visibility change. Becoming visible after an offline→online
    /// transition triggers the deferred drain.
    pub fn notify_visible(self: &Arc<Self>, visible: bool, session_id: &str) {
        if let Ok(mut conditions) = self.conditions.lock() {
            conditions.background = !visible;
        }
        if visible
            && self.online.load(Ordering::SeqCst)
            && self.resync_on_visible.swap(false, Ordering::SeqCst)
        {
            self.spawn_drain(session_id);
        }
    }

    fn spawn_drain(self: &Arc<Self>, session_id: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime; drain deferred to the next explicit sync");
            return;
        };
        let manager = Arc::clone(self);
        let session_id = session_id.to_string();
        handle.spawn(async move {
            if let Err(err) = manager.sync_now(&session_id).await {
                warn!(error = %err, "reconnect drain failed");
            }
        });
    }

    /// Run one drain to completion (or cancellation/deadline).
    pub async fn sync_now(&self, session_id: &str) -> AgentResult<SyncSummary> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AgentError::Internal("sync already in progress".into()));
        }
        let result = self.drain(session_id).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn drain(&self, session_id: &str) -> AgentResult<SyncSummary> {
        let started = Instant::now();
        // Persisted as the new last-sync marker: items enqueued while this
        // drain runs stay eligible for the next one.
        let started_wall = now_millis();
        let cancel = self.coordinator.cancel_token();
        let context = self.build_context(session_id);
        debug!(
            device_id = %context.device_id,
            quality = ?context.network_quality,
            offline_ms = context.offline_duration.as_millis() as u64,
            "sync context"
        );

        // Backlog: everything newer than the last drain, plus anything that
        // already failed a submission.
        let items: Vec<StoredItem> = self
            .store
            .all_items()
            .into_iter()
            .filter(|item| item.created_at > context.last_sync || item.retry_count > 0)
            .collect();
        let total = items.len();
        let mut progress = SyncProgress {
            phase: SyncPhase::Preparing,
            total,
            ..SyncProgress::idle()
        };
        let _ = self.progress_tx.send(progress.clone());

        if total == 0 {
            self.store.set_last_sync(started_wall);
            progress.phase = SyncPhase::Completed;
            let _ = self.progress_tx.send(progress);
            return Ok(SyncSummary {
                synced: 0,
                failed: 0,
                bytes_sent: 0,
                duration: started.elapsed(),
            });
        }

        let batch_size = self.adaptive_batch_size(&context);
        let drain_id = uuid::Uuid::new_v4().to_string();
        info!(total, batch_size, drain_id = %drain_id, "sync started");

        progress.phase = SyncPhase::Syncing;
        let _ = self.progress_tx.send(progress.clone());

        let deadline = started + self.config.max_duration;
        let mut synced = 0usize;
        let mut failed = 0usize;
        let mut bytes_sent = 0u64;

        // Priority bands run strictly in order; batches inside a band run
        // concurrently.
        'bands: for priority in [
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low,
        ] {
            let band: Vec<&StoredItem> =
                items.iter().filter(|item| item.priority == priority).collect();
            if band.is_empty() {
                continue;
            }
            let batches = build_batches(&band, batch_size);

            let mut outcomes = stream::iter(batches.into_iter().map(|batch| {
                let coordinator = Arc::clone(&self.coordinator);
                let drain_id = drain_id.clone();
                // Keys are drain-scoped: duplicates within one drain share a
                // submission, a later drain retries fresh.
                let key = crate::idempotency::default_key(&drain_id, batch.ids.join(",").as_bytes());
                async move {
                    let outcome = coordinator
                        .execute(batch.endpoint, batch.body.clone(), Some(drain_id), Some(key))
                        .await;
                    (batch, outcome)
                }
            }))
            .buffer_unordered(self.config.max_concurrency.max(1));

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("sync cancelled, remaining batches skipped");
                        break 'bands;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        debug!("sync deadline reached, remaining batches skipped");
                        break 'bands;
                    }
                    next = outcomes.next() => next,
                };
                let Some((batch, outcome)) = next else {
                    break;
                };
                match outcome {
                    Ok(_) => {
                        self.store.remove(&batch.ids);
                        synced += batch.ids.len();
                        bytes_sent += batch.bytes;
                    }
                    Err(AgentError::ServerTerminal { status }) => {
                        debug!(status, "terminal batch rejection, dropping items");
                        self.store.remove(&batch.ids);
                        failed += batch.ids.len();
                    }
                    Err(err) => {
                        warn!(error = %err, items = batch.ids.len(), "batch failed, keeping items");
                        self.store.bump_retry(&batch.ids);
                        failed += batch.ids.len();
                    }
                }

                let done = synced + failed;
                let remaining = total.saturating_sub(done);
                let eta = (synced > 0 && remaining > 0).then(|| {
                    started.elapsed().div_f64(synced as f64).mul_f64(remaining as f64)
                });
                progress = SyncProgress {
                    phase: SyncPhase::Syncing,
                    total,
                    synced,
                    failed,
                    bytes_sent,
                    eta,
                };
                let _ = self.progress_tx.send(progress.clone());
            }
        }

        self.store.set_last_sync(started_wall);
        progress.phase = SyncPhase::Completed;
        progress.eta = None;
        let _ = self.progress_tx.send(progress);
        info!(synced, failed, bytes_sent, "sync finished");

        Ok(SyncSummary {
            synced,
            failed,
            bytes_sent,
            duration: started.elapsed(),
        })
    }

    fn build_context(&self, session_id: &str) -> SyncContext {
        let last_sync = self.store.last_sync();
        let now = now_millis();
        SyncContext {
            session_id: session_id.to_string(),
            device_id: self.store.device_id(),
            last_sync,
            offline_duration: if last_sync == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(now.saturating_sub(last_sync))
            },
            network_quality: self
                .health
                .as_ref()
                .map(|health| health.overall_quality())
                .unwrap_or(NetworkQuality::Unknown),
            conditions: self
                .conditions
                .lock()
                .map(|conditions| *conditions)
                .unwrap_or_default(),
        }
    }

    fn adaptive_batch_size(&self, context: &SyncContext) -> usize {
        let mut size = self.config.base_batch_size as f64;
        size *= match context.network_quality {
            NetworkQuality::Poor => 0.3,
            NetworkQuality::Good => 0.8,
            NetworkQuality::Excellent => 1.5,
            NetworkQuality::Unknown => 1.0,
        };
        if context.conditions.battery_level.is_some_and(|level| level < 0.2) {
            size *= 0.5;
        }
        if context.conditions.background {
            size *= 0.6;
        }
        if context.offline_duration > OLD_BACKLOG {
            size *= 0.7;
        }
        (size.round() as usize).max(MIN_BATCH_SIZE)
    }
}

// Batches are per kind: each capture endpoint accepts one payload shape.
fn build_batches(band: &[&StoredItem], batch_size: usize) -> Vec<Batch> {
    let mut batches = Vec::new();
    for kind in [
        EventKind::Error,
        EventKind::Session,
        EventKind::Performance,
        EventKind::Network,
    ] {
        let of_kind: Vec<&&StoredItem> = band.iter().filter(|item| item.kind == kind).collect();
        for chunk in of_kind.chunks(batch_size.max(1)) {
            let ids = chunk.iter().map(|item| item.id.clone()).collect();
            let bytes = chunk.iter().map(|item| item.size_bytes).sum();
            // Buffered network flushes store an array per item; flatten.
            let mut payloads = Vec::new();
            for item in chunk {
                match &item.payload {
                    serde_json::Value::Array(many) => payloads.extend(many.iter().cloned()),
                    one => payloads.push(one.clone()),
                }
            }
            let body = crate::transport::batch_body(kind, payloads);
            batches.push(Batch {
                endpoint: CaptureEndpoint::for_kind(kind),
                ids,
                body,
                bytes,
            });
        }
    }
    batches
}
