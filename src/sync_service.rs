//! Cloud sync orchestration: per-event streaming, backlog drain, reconnect
//! handling, and the stopped/running/paused state machine.
//!
//! Grounded on `services/forwarder/src/uplink.rs`'s retry/session shape.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tracing::{info, warn};

use crate::batch_manager::BatchManager;
use crate::bus::{Bus, Notification};
use crate::cloud::{CloudClient, EventPayload};
use crate::device_registry::DeviceRegistry;
use crate::event_processor::EventProcessor;
use crate::store::{EventRow, SyncStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
    Stopped = 0,
    Running = 1,
    Paused = 2,
}

pub struct SyncService {
    store: Arc<std::sync::Mutex<crate::store::Store>>,
    cloud: Arc<CloudClient>,
    processor: Arc<EventProcessor>,
    batches: Arc<BatchManager>,
    #[allow(dead_code)]
    registry: Arc<DeviceRegistry>,
    state: AtomicU8,
    batch_size: usize,
    batch_interval: Duration,
    global_id_prefix: String,
}

impl SyncService {
    pub fn new(
        store: Arc<std::sync::Mutex<crate::store::Store>>,
        cloud: Arc<CloudClient>,
        processor: Arc<EventProcessor>,
        batches: Arc<BatchManager>,
        registry: Arc<DeviceRegistry>,
        batch_size: usize,
        batch_interval: Duration,
        global_id_prefix: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cloud,
            processor,
            batches,
            registry,
            state: AtomicU8::new(SyncState::Stopped as u8),
            batch_size,
            batch_interval,
            global_id_prefix,
        })
    }

    pub fn state(&self) -> SyncState {
        match self.state.load(Ordering::SeqCst) {
            1 => SyncState::Running,
            2 => SyncState::Paused,
            _ => SyncState::Stopped,
        }
    }

    pub fn start(&self) {
        // Idempotent: starting an already-running service is a no-op.
        let _ = self
            .state
            .compare_exchange(SyncState::Stopped as u8, SyncState::Running as u8, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.state.store(SyncState::Stopped as u8, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.state.store(SyncState::Paused as u8, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        let _ = self
            .state
            .compare_exchange(SyncState::Paused as u8, SyncState::Running as u8, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn event_payload(&self, row: &EventRow) -> EventPayload {
        EventPayload {
            local_event_id: row.id.clone(),
            device_id: row.device_id.clone(),
            global_device_id: format!("{}-{}", self.global_id_prefix, row.device_id),
            cloud_session_id: row.cloud_session_id.clone(),
            offline_mode: row.offline_mode,
            offline_batch_id: row.offline_batch_id.clone(),
            plu_code: row.plu_code.clone(),
            product_name: row.product_name.clone(),
            weight_grams: row.net_weight_grams,
            barcode: row.barcode.clone(),
            scale_timestamp: row.scale_timestamp.clone(),
            received_at: row.received_at.clone(),
        }
    }

    async fn stream_one(&self, row: EventRow) {
        let _ = self.processor.update_sync_status(&row.id, SyncStatus::Pending);
        let payload = self.event_payload(&row);
        match self.cloud.post_event(&payload).await {
            Ok(resp) => {
                let _ = self.processor.mark_event_synced(&row.id, &resp.cloud_event_id);
            }
            Err(e) => {
                let _ = self.processor.mark_event_failed(&row.id, &e.to_string());
            }
        }
    }

    /// Fetch up to `batch_size` pending/failed events and post them,
    /// singly or batched depending on the fetched count.
    async fn drain_once(&self) {
        let pending = {
            let store = self.store_handle();
            store.fetch_pending_events(self.batch_size as i64)
        };
        let pending = match pending {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to fetch pending events for drain");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        if pending.len() == 1 {
            self.stream_one(pending[0].clone()).await;
        } else {
            let payloads: Vec<EventPayload> = pending.iter().map(|r| self.event_payload(r)).collect();
            match self.cloud.post_events_batch(&payloads).await {
                Ok(results) => {
                    for item in results {
                        match item.status.as_str() {
                            "accepted" | "duplicate" => {
                                if let Some(cloud_id) = item.cloud_event_id {
                                    let _ = self.processor.mark_event_synced(&item.local_event_id, &cloud_id);
                                }
                            }
                            _ => {
                                let _ = self
                                    .processor
                                    .mark_event_failed(&item.local_event_id, item.error.as_deref().unwrap_or("unknown"));
                            }
                        }
                    }
                }
                Err(e) => {
                    for row in &pending {
                        let _ = self.processor.mark_event_failed(&row.id, &e.to_string());
                    }
                }
            }
        }

        self.reconcile_synced_batches(&pending);
    }

    fn reconcile_synced_batches(&self, rows: &[EventRow]) {
        let mut seen_batches: std::collections::HashSet<String> = std::collections::HashSet::new();
        for row in rows {
            if let Some(batch_id) = &row.offline_batch_id {
                seen_batches.insert(batch_id.clone());
            }
        }
        for batch_id in seen_batches {
            if let Ok(0) = self.store_unsynced_count(&batch_id) {
                let _ = self.batches.mark_batch_synced(&batch_id, None);
            }
        }
    }

    fn store_unsynced_count(&self, batch_id: &str) -> crate::store::StoreResult<i64> {
        self.store_handle().count_unsynced_for_batch(batch_id)
    }

    fn store_handle(&self) -> std::sync::MutexGuard<'_, crate::store::Store> {
        self.store.lock().unwrap()
    }

    async fn on_reconnect(&self) {
        info!("cloud reconnected, closing open offline batches and draining backlog");
        if let Err(e) = self.batches.end_all_open_batches() {
            warn!(error = %e, "failed to close open batches on reconnect");
        }
        self.drain_once().await;
    }

    /// Subscribes to `event:captured` and streams non-offline events as they
    /// are captured; drives the periodic backlog drain and reconnect drain.
    pub async fn run(
        self: Arc<Self>,
        bus: Bus,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.start();
        let mut events = bus.subscribe();
        let mut connected = self.cloud.subscribe_connected();
        let mut ticker = tokio::time::interval(self.batch_interval);

        loop {
            if self.state() == SyncState::Stopped {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.stop();
                        break;
                    }
                }
                changed = connected.changed() => {
                    if changed.is_ok() && *connected.borrow() && self.state() == SyncState::Running {
                        self.on_reconnect().await;
                    }
                }
                _ = ticker.tick(), if self.state() == SyncState::Running => {
                    self.drain_once().await;
                }
                notification = events.recv() => {
                    if self.state() != SyncState::Running {
                        continue;
                    }
                    match notification {
                        Ok(Notification::EventCaptured(row)) if !row.offline_mode => {
                            self.stream_one(row).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(n, "sync service lagged behind event bus, relying on next drain");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        info!("sync service stopped");
    }
}

/// Wraps an `AsyncMutex`-guarded `SyncService` handle so `main` can issue
/// pause/resume without racing the background task.
pub type SharedSyncService = Arc<AsyncMutex<Arc<SyncService>>>;
