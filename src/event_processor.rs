//! Normalizes parsed weighing packets into persisted events: dedup, tagging,
//! persistence, and sync-state transitions.
//!
//! Grounded on `services/receiver/src/session.rs`'s dedup-by-key-set pattern
//! in `apply_batch_counts`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use edge_protocol::{decode_weight_grams, WeighingRecord};
use tracing::{debug, info, warn};

use crate::batch_manager::BatchManager;
use crate::bus::{Bus, Notification};
use crate::cloud::CloudClient;
use crate::session_cache::SessionCache;
use crate::store::{NewEvent, Store, StoreError, StoreResult, SyncStatus};

#[derive(Debug, thiserror::Error)]
pub enum EventProcessorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Hash, Eq, PartialEq, Clone)]
struct DedupKey {
    device_id: String,
    plu_code: String,
    net_weight_grams: i64,
}

pub struct EventProcessor {
    store: Arc<Mutex<Store>>,
    bus: Bus,
    batches: Arc<BatchManager>,
    sessions: Arc<tokio::sync::Mutex<SessionCache>>,
    cloud: Arc<CloudClient>,
    dedup: Mutex<HashMap<DedupKey, Instant>>,
    dedup_window: Duration,
}

impl EventProcessor {
    pub fn new(
        store: Arc<Mutex<Store>>,
        bus: Bus,
        batches: Arc<BatchManager>,
        sessions: Arc<tokio::sync::Mutex<SessionCache>>,
        cloud: Arc<CloudClient>,
        dedup_window: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            batches,
            sessions,
            cloud,
            dedup: Mutex::new(HashMap::new()),
            dedup_window,
        }
    }

    /// Returns `Ok(None)` if the packet was discarded as a duplicate.
    pub async fn process(
        &self,
        device_id: &str,
        source_ip: Option<&str>,
        small_unit_is_grams: bool,
        record: WeighingRecord,
    ) -> Result<Option<crate::store::EventRow>, EventProcessorError> {
        let net_grams = decode_weight_grams(record.net_weight_grams, small_unit_is_grams);
        let tare_grams = decode_weight_grams(record.tare_weight_grams, small_unit_is_grams);

        if self.is_duplicate(device_id, &record.plu_code, net_grams) {
            debug!(device_id, plu = %record.plu_code, "discarded duplicate weighing packet");
            return Ok(None);
        }

        let online = self.cloud.is_online();
        let (cloud_session_id, offline_batch_id) = if online {
            let session = {
                let cache = self.sessions.lock().await;
                cache.get_active_session_for_device(device_id)?
            };
            (session.map(|s| s.id), None)
        } else {
            let batch = self.batches.get_or_start_current(device_id)?;
            (None, Some(batch.id))
        };

        let id = uuid::Uuid::new_v4().to_string();
        let new_event = NewEvent {
            id: id.clone(),
            device_id: device_id.to_owned(),
            cloud_session_id,
            offline_mode: !online,
            offline_batch_id: offline_batch_id.clone(),
            plu_code: record.plu_code.clone(),
            product_name: Some(record.product_name.clone()),
            net_weight_grams: net_grams,
            tare_weight_grams: tare_grams,
            barcode: record.plu_code.clone(),
            scale_timestamp: record.scale_timestamp.to_string(),
            received_at: Utc::now(),
            source_ip: source_ip.map(str::to_owned),
            raw_line: record.raw_line.clone(),
        };

        {
            let store = self.store.lock().unwrap();
            store.insert_event(&new_event)?;
        }

        if let Some(batch_id) = &offline_batch_id {
            self.batches.increment_event_count(batch_id, net_grams)?;
        }

        let row = {
            let store = self.store.lock().unwrap();
            store.get_event(&id)?.expect("just inserted")
        };

        info!(event_id = %id, device_id, plu = %record.plu_code, net_grams, offline = !online, "event captured");
        self.bus.publish(Notification::EventCaptured(row.clone()));
        Ok(Some(row))
    }

    fn is_duplicate(&self, device_id: &str, plu_code: &str, net_weight_grams: i64) -> bool {
        let key = DedupKey {
            device_id: device_id.to_owned(),
            plu_code: plu_code.to_owned(),
            net_weight_grams,
        };
        let now = Instant::now();
        let mut map = self.dedup.lock().unwrap();
        map.retain(|_, seen_at| now.duration_since(*seen_at) < self.dedup_window);
        if map.contains_key(&key) {
            return true;
        }
        map.insert(key, now);
        false
    }

    pub fn mark_event_synced(&self, event_id: &str, cloud_event_id: &str) -> Result<(), EventProcessorError> {
        self.store.lock().unwrap().mark_event_synced(event_id, cloud_event_id)?;
        self.bus.publish(Notification::EventSynced {
            event_id: event_id.to_owned(),
            cloud_event_id: cloud_event_id.to_owned(),
        });
        Ok(())
    }

    pub fn mark_event_failed(&self, event_id: &str, error: &str) -> Result<(), EventProcessorError> {
        self.store.lock().unwrap().mark_event_failed(event_id, error)?;
        warn!(event_id, error, "event sync failed");
        self.bus.publish(Notification::EventFailed {
            event_id: event_id.to_owned(),
            error: error.to_owned(),
        });
        Ok(())
    }

    pub fn update_sync_status(&self, event_id: &str, status: SyncStatus) -> StoreResult<()> {
        self.store.lock().unwrap().update_sync_status(event_id, status)
    }
}
