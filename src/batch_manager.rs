//! Offline-batch manager: groups events captured while the cloud is
//! unreachable into reconcilable units.
//!
//! Grounded on `services/forwarder/src/storage/journal.rs`'s
//! single-row-per-key `stream_state` pattern — here the key is `device_id`
//! and the row is the currently-open batch for that device.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::info;

use crate::bus::{Bus, Notification};
use crate::store::{BatchRow, Store, StoreResult};

pub struct BatchManager {
    store: std::sync::Arc<Mutex<Store>>,
    bus: Bus,
    /// device_id -> open batch_id. At most one entry per device, mirroring
    /// the "at most one open batch per device" data-model invariant.
    current: Mutex<HashMap<String, String>>,
}

impl BatchManager {
    pub fn new(store: std::sync::Arc<Mutex<Store>>, bus: Bus) -> Self {
        Self {
            store,
            bus,
            current: Mutex::new(HashMap::new()),
        }
    }

    /// Scan the store for batches left open by a prior process and adopt
    /// them as current, rather than starting fresh ones.
    pub fn adopt_open_batches_on_startup(&self) -> StoreResult<()> {
        let open = self.store.lock().unwrap().list_open_batches()?;
        let mut current = self.current.lock().unwrap();
        for batch in &open {
            current.insert(batch.device_id.clone(), batch.id.clone());
        }
        info!(count = open.len(), "adopted open offline batches from store");
        Ok(())
    }

    pub fn start_batch(&self, device_id: &str) -> StoreResult<BatchRow> {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let store = self.store.lock().unwrap();
            store.insert_batch(&id, device_id)?;
        }
        self.current
            .lock()
            .unwrap()
            .insert(device_id.to_owned(), id.clone());
        let batch = self
            .store
            .lock()
            .unwrap()
            .get_batch(&id)?
            .expect("just inserted");
        info!(batch_id = %id, device_id, "offline batch started");
        self.bus.publish(Notification::BatchStarted(batch.clone()));
        Ok(batch)
    }

    pub fn end_batch(&self, batch_id: &str) -> StoreResult<()> {
        {
            let store = self.store.lock().unwrap();
            store.end_batch(batch_id)?;
        }
        let mut current = self.current.lock().unwrap();
        current.retain(|_, id| id != batch_id);
        drop(current);

        if let Some(batch) = self.store.lock().unwrap().get_batch(batch_id)? {
            info!(batch_id, "offline batch ended");
            self.bus.publish(Notification::BatchEnded(batch));
        }
        Ok(())
    }

    pub fn increment_event_count(&self, batch_id: &str, weight_grams: i64) -> StoreResult<()> {
        self.store.lock().unwrap().increment_batch_counts(batch_id, weight_grams)
    }

    pub fn mark_batch_syncing(&self, batch_id: &str) -> StoreResult<()> {
        self.store.lock().unwrap().mark_batch_syncing(batch_id)
    }

    pub fn mark_batch_synced(&self, batch_id: &str, cloud_session_id: Option<&str>) -> StoreResult<()> {
        self.store.lock().unwrap().mark_batch_synced(batch_id, cloud_session_id)?;
        if let Some(batch) = self.store.lock().unwrap().get_batch(batch_id)? {
            self.bus.publish(Notification::BatchSynced(batch));
        }
        Ok(())
    }

    /// Return the device's currently-open batch, starting a new one if none exists.
    pub fn get_or_start_current(&self, device_id: &str) -> StoreResult<BatchRow> {
        let existing = self.current.lock().unwrap().get(device_id).cloned();
        match existing {
            Some(id) => {
                if let Some(batch) = self.store.lock().unwrap().get_batch(&id)? {
                    return Ok(batch);
                }
                self.start_batch(device_id)
            }
            None => self.start_batch(device_id),
        }
    }

    pub fn current_batch_id(&self, device_id: &str) -> Option<String> {
        self.current.lock().unwrap().get(device_id).cloned()
    }

    /// Called on cloud reconnect: close every still-open batch.
    pub fn end_all_open_batches(&self) -> StoreResult<()> {
        let ids: Vec<String> = self.current.lock().unwrap().values().cloned().collect();
        for id in ids {
            self.end_batch(&id)?;
        }
        Ok(())
    }

    pub fn get_batch(&self, batch_id: &str) -> StoreResult<Option<BatchRow>> {
        self.store.lock().unwrap().get_batch(batch_id)
    }
}
