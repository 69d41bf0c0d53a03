//! Mirror of cloud-owned weighing sessions.
//!
//! Grounded on `services/receiver/src/cache.rs` (TTL/expiry-sweep pattern)
//! and `services/forwarder/src/replay.rs` (poll-and-reconcile shape).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::cloud::{CloudClient, CloudError};
use crate::device_registry::DeviceRegistry;
use crate::store::{SessionRow, SessionStatus, SessionUpsert, Store, StoreResult};

#[derive(Debug, thiserror::Error)]
pub enum SessionCacheError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

pub struct SessionCache {
    store: Arc<std::sync::Mutex<Store>>,
    expiry: Duration,
}

impl SessionCache {
    pub fn new(store: Arc<std::sync::Mutex<Store>>, expiry: Duration) -> Self {
        Self { store, expiry }
    }

    fn upsert(&self, row: &CloudSessionPush) -> StoreResult<()> {
        let store = self.store.lock().unwrap();
        store.upsert_session(&SessionUpsert {
            id: row.cloud_session_id.clone(),
            device_id: row.device_id.clone(),
            animal_id: row.animal_id.clone(),
            animal_tag: row.animal_tag.clone(),
            animal_species: row.animal_species.clone(),
            operator_id: row.operator_id.clone(),
            status: row.status,
            expires_at: Utc::now() + chrono::Duration::from_std(self.expiry).unwrap(),
        })
    }

    pub fn handle_session_start(&self, push: &CloudSessionPush) -> StoreResult<()> {
        self.upsert(push)?;
        info!(session_id = %push.cloud_session_id, device_id = %push.device_id, "session started");
        Ok(())
    }

    pub fn handle_session_update(&self, push: &CloudSessionPush) -> StoreResult<()> {
        self.upsert(push)?;
        debug!(session_id = %push.cloud_session_id, "session updated");
        Ok(())
    }

    pub fn handle_session_end(&mut self, cloud_session_id: &str) -> StoreResult<()> {
        let mut store = self.store.lock().unwrap();
        store.delete_session(cloud_session_id)?;
        info!(session_id = cloud_session_id, "session ended");
        Ok(())
    }

    pub fn get_active_session_for_device(&self, device_id: &str) -> StoreResult<Option<SessionRow>> {
        self.store.lock().unwrap().get_active_session_for_device(device_id)
    }

    /// Every cached session for a device regardless of status (active or
    /// paused), used by `reconcile` so a stale paused session isn't missed.
    pub fn list_cached_sessions_for_device(&self, device_id: &str) -> StoreResult<Vec<SessionRow>> {
        self.store.lock().unwrap().list_cached_sessions_for_device(device_id)
    }

    /// Delete every cached session past `expires_at`. Returns the count removed.
    pub fn sweep_expired(&self) -> StoreResult<usize> {
        let mut store = self.store.lock().unwrap();
        let removed = store.sweep_expired_sessions()?;
        if removed > 0 {
            debug!(removed, "swept expired sessions");
        }
        Ok(removed)
    }

    /// Reconcile the cache against a cloud `/sessions` response: insert new,
    /// update changed, delete any cached session not present in the response.
    pub fn reconcile(&mut self, device_ids: &[String], cloud_sessions: Vec<CloudSessionPush>) -> StoreResult<()> {
        let seen: std::collections::HashSet<&str> =
            cloud_sessions.iter().map(|s| s.cloud_session_id.as_str()).collect();

        for push in &cloud_sessions {
            self.upsert(push)?;
        }

        for device_id in device_ids {
            for existing in self.list_cached_sessions_for_device(device_id)? {
                if !seen.contains(existing.id.as_str()) {
                    self.handle_session_end(&existing.id)?;
                }
            }
        }
        Ok(())
    }
}

/// The shape of one entry in a cloud `/sessions` response — also reused for
/// push-channel session-start/update payloads.
#[derive(Debug, Clone)]
pub struct CloudSessionPush {
    pub cloud_session_id: String,
    pub device_id: String,
    pub animal_id: Option<String>,
    pub animal_tag: Option<String>,
    pub animal_species: Option<String>,
    pub operator_id: Option<String>,
    pub status: SessionStatus,
}

/// Periodic poller: every `interval`, collect the live device IDs from the
/// registry, fetch `/sessions`, and reconcile.
pub async fn run_poller(
    cache: Arc<AsyncMutex<SessionCache>>,
    registry: Arc<DeviceRegistry>,
    cloud: Arc<CloudClient>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("session poller shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                let device_ids = registry.live_device_ids();
                if device_ids.is_empty() {
                    continue;
                }
                match cloud.fetch_sessions(&device_ids).await {
                    Ok(sessions) => {
                        if let Err(e) = cache.lock().await.reconcile(&device_ids, sessions) {
                            warn!(error = %e, "session reconcile failed");
                        }
                    }
                    Err(CloudError::Unreachable(_)) => {
                        debug!("session poll skipped: cloud unreachable");
                    }
                    Err(e) => warn!(error = %e, "session poll failed"),
                }
            }
        }
    }
}

/// Periodic sweep task for TTL expiry.
pub async fn run_expiry_sweeper(
    cache: Arc<AsyncMutex<SessionCache>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("session expiry sweeper shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = cache.lock().await.sweep_expired() {
                    warn!(error = %e, "session expiry sweep failed");
                }
            }
        }
    }
}
