//! In-memory device map plus the per-device connection state machine.
//!
//! Grounded on `services/receiver/src/cache.rs` (dual-keyed in-memory maps
//! guarded by a std mutex, short critical sections) and
//! `services/receiver/src/session.rs` (notification-on-transition pattern).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::bus::{Bus, Notification};
use crate::store::{DeviceStatus, DeviceType, Store, StoreResult};

/// Callback surface the TCP front-end implements so the registry's monitor
/// task can force-close a socket whose heartbeat deadline has passed,
/// without the registry depending on the front-end's concrete type.
pub trait SocketCloser: Send + Sync {
    fn close(&self, socket_id: &str, reason: &str);
}

/// A point-in-time, clonable copy of a device record, safe to fan out on
/// the notification bus (no socket handle — that part is in-memory-only and
/// never leaves the registry).
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub id: String,
    pub local_id: String,
    pub global_id: Option<String>,
    pub display_name: Option<String>,
    pub location: Option<String>,
    pub device_type: DeviceType,
    pub status: DeviceStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub heartbeat_count: i64,
    pub event_count: i64,
    pub connected_at: Option<DateTime<Utc>>,
    pub source_ip: Option<String>,
    pub small_unit_is_grams: bool,
}

#[derive(Debug, Clone)]
struct DeviceRecord {
    snapshot: DeviceSnapshot,
    socket_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("unknown socket id {0}")]
    UnknownSocket(String),
}

pub struct DeviceRegistry {
    store: Arc<Mutex<Store>>,
    bus: Bus,
    site_id: String,
    idle_threshold: Duration,
    heartbeat_timeout: Duration,
    by_device_id: Mutex<HashMap<String, DeviceRecord>>,
    by_socket_id: Mutex<HashMap<String, String>>,
    closer: OnceLock<Arc<dyn SocketCloser>>,
}

impl DeviceRegistry {
    pub fn new(
        store: Arc<Mutex<Store>>,
        bus: Bus,
        site_id: String,
        idle_threshold: Duration,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            site_id,
            idle_threshold,
            heartbeat_timeout,
            by_device_id: Mutex::new(HashMap::new()),
            by_socket_id: Mutex::new(HashMap::new()),
            closer: OnceLock::new(),
        }
    }

    /// Wired in once the TCP front-end exists (it needs a registry reference
    /// to construct, so this resolves the cycle).
    pub fn set_socket_closer(&self, closer: Arc<dyn SocketCloser>) {
        let _ = self.closer.set(closer);
    }

    /// Load all known devices from the store and mark each disconnected —
    /// no socket survives a process restart.
    pub fn load_on_startup(&self) -> StoreResult<()> {
        let store = self.store.lock().unwrap();
        store.mark_all_disconnected()?;
        let rows = store.load_all_devices()?;
        drop(store);

        let mut map = self.by_device_id.lock().unwrap();
        for row in rows {
            let snapshot = DeviceSnapshot {
                id: row.id.clone(),
                local_id: row.local_id,
                global_id: row.global_id,
                display_name: row.display_name,
                location: row.location,
                device_type: row.device_type,
                status: DeviceStatus::Disconnected,
                last_heartbeat_at: parse_ts(row.last_heartbeat_at.as_deref()),
                last_event_at: parse_ts(row.last_event_at.as_deref()),
                heartbeat_count: row.heartbeat_count,
                event_count: row.event_count,
                connected_at: None,
                source_ip: row.source_ip,
                small_unit_is_grams: row.small_unit_is_grams,
            };
            map.insert(row.id.clone(), DeviceRecord { snapshot, socket_id: None });
        }
        info!(count = map.len(), "loaded devices from store");
        Ok(())
    }

    pub fn register_device(
        &self,
        socket_id: &str,
        scale_number: &str,
        source_ip: &str,
    ) -> StoreResult<DeviceSnapshot> {
        let existing_id = {
            let map = self.by_device_id.lock().unwrap();
            map.values()
                .find(|r| r.snapshot.local_id == scale_number)
                .map(|r| r.snapshot.id.clone())
        };

        let snapshot = match existing_id {
            Some(device_id) => self.reconnect(&device_id, socket_id, source_ip)?,
            None => self.first_registration(scale_number, socket_id, source_ip)?,
        };

        self.by_socket_id
            .lock()
            .unwrap()
            .insert(socket_id.to_owned(), snapshot.id.clone());

        self.bus.publish(Notification::DeviceRegistered(snapshot.clone()));
        self.bus.publish(Notification::DeviceConnected(snapshot.clone()));
        Ok(snapshot)
    }

    fn first_registration(
        &self,
        scale_number: &str,
        socket_id: &str,
        source_ip: &str,
    ) -> StoreResult<DeviceSnapshot> {
        let id = uuid::Uuid::new_v4().to_string();
        let global_id = format!("{}-{}", self.site_id, scale_number);
        {
            let store = self.store.lock().unwrap();
            store.insert_device(&id, scale_number, &global_id, DeviceType::Disassembly, source_ip)?;
        }
        let snapshot = DeviceSnapshot {
            id: id.clone(),
            local_id: scale_number.to_owned(),
            global_id: Some(global_id),
            display_name: None,
            location: None,
            device_type: DeviceType::Disassembly,
            status: DeviceStatus::Online,
            last_heartbeat_at: Some(Utc::now()),
            last_event_at: None,
            heartbeat_count: 1,
            event_count: 0,
            connected_at: Some(Utc::now()),
            source_ip: Some(source_ip.to_owned()),
            small_unit_is_grams: false,
        };
        self.by_device_id.lock().unwrap().insert(
            id,
            DeviceRecord { snapshot: snapshot.clone(), socket_id: Some(socket_id.to_owned()) },
        );
        info!(device_id = %snapshot.id, local_id = %snapshot.local_id, "device registered");
        Ok(snapshot)
    }

    fn reconnect(&self, device_id: &str, socket_id: &str, source_ip: &str) -> StoreResult<DeviceSnapshot> {
        // Drop any stale socket mapping this device previously held.
        {
            let mut by_socket = self.by_socket_id.lock().unwrap();
            by_socket.retain(|_, id| id != device_id);
        }
        {
            let store = self.store.lock().unwrap();
            store.reconnect_device(device_id, source_ip)?;
        }
        let mut map = self.by_device_id.lock().unwrap();
        let record = map.get_mut(device_id).expect("device_id came from this map");
        record.socket_id = Some(socket_id.to_owned());
        record.snapshot.status = DeviceStatus::Online;
        record.snapshot.connected_at = Some(Utc::now());
        record.snapshot.source_ip = Some(source_ip.to_owned());
        record.snapshot.heartbeat_count += 1;
        info!(device_id, "device reconnected");
        Ok(record.snapshot.clone())
    }

    pub fn on_heartbeat(&self, socket_id: &str) -> StoreResult<Option<DeviceSnapshot>> {
        let Some(device_id) = self.socket_device_id(socket_id) else {
            return Ok(None);
        };
        let now = Utc::now();
        let transitioned;
        let snapshot = {
            let mut map = self.by_device_id.lock().unwrap();
            let record = map.get_mut(&device_id).expect("socket map is consistent");
            record.snapshot.last_heartbeat_at = Some(now);
            record.snapshot.heartbeat_count += 1;

            let was_stale = record.snapshot.status == DeviceStatus::Stale;
            if was_stale {
                record.snapshot.status = DeviceStatus::Online;
            }
            let idle_due = record
                .snapshot
                .last_event_at
                .map(|t| now.signed_duration_since(t).to_std().unwrap_or_default() >= self.idle_threshold)
                .unwrap_or(false);
            if record.snapshot.status == DeviceStatus::Online && idle_due {
                record.snapshot.status = DeviceStatus::Idle;
            }
            transitioned = was_stale || (record.snapshot.status == DeviceStatus::Idle);
            record.snapshot.clone()
        };

        {
            let store = self.store.lock().unwrap();
            store.record_heartbeat(&device_id)?;
            if transitioned {
                store.set_device_status(&device_id, snapshot.status)?;
            }
        }

        self.bus.publish(match snapshot.status {
            DeviceStatus::Idle => Notification::DeviceIdle(snapshot.clone()),
            _ => Notification::DeviceUpdated(snapshot.clone()),
        });
        Ok(Some(snapshot))
    }

    pub fn on_event(&self, socket_id: &str) -> StoreResult<Option<DeviceSnapshot>> {
        let Some(device_id) = self.socket_device_id(socket_id) else {
            return Ok(None);
        };
        let now = Utc::now();
        let snapshot = {
            let mut map = self.by_device_id.lock().unwrap();
            let record = map.get_mut(&device_id).expect("socket map is consistent");
            record.snapshot.last_event_at = Some(now);
            record.snapshot.event_count += 1;
            record.snapshot.status = DeviceStatus::Online;
            record.snapshot.clone()
        };
        {
            let store = self.store.lock().unwrap();
            store.record_event(&device_id)?;
            store.set_device_status(&device_id, DeviceStatus::Online)?;
        }
        self.bus.publish(Notification::DeviceOnline(snapshot.clone()));
        Ok(Some(snapshot))
    }

    pub fn disconnect_device(&self, socket_id: &str, reason: &str) -> StoreResult<()> {
        let Some(device_id) = self.by_socket_id.lock().unwrap().remove(socket_id) else {
            return Ok(());
        };
        let snapshot = {
            let mut map = self.by_device_id.lock().unwrap();
            let record = map.get_mut(&device_id).expect("socket map is consistent");
            record.socket_id = None;
            record.snapshot.status = DeviceStatus::Disconnected;
            record.snapshot.clone()
        };
        {
            let store = self.store.lock().unwrap();
            store.set_device_status(&device_id, DeviceStatus::Disconnected)?;
        }
        info!(device_id, reason, "device disconnected");
        self.bus.publish(Notification::DeviceDisconnected(snapshot));
        Ok(())
    }

    pub fn mark_stale(&self, device_id: &str) -> StoreResult<()> {
        let changed = {
            let mut map = self.by_device_id.lock().unwrap();
            match map.get_mut(device_id) {
                Some(record) if record.snapshot.status == DeviceStatus::Online => {
                    record.snapshot.status = DeviceStatus::Stale;
                    Some(record.snapshot.clone())
                }
                _ => None,
            }
        };
        if let Some(snapshot) = changed {
            let store = self.store.lock().unwrap();
            store.set_device_status(device_id, DeviceStatus::Stale)?;
            drop(store);
            warn!(device_id, "device marked stale: heartbeat deadline approaching");
            self.bus.publish(Notification::DeviceStale(snapshot));
        }
        Ok(())
    }

    fn socket_device_id(&self, socket_id: &str) -> Option<String> {
        self.by_socket_id.lock().unwrap().get(socket_id).cloned()
    }

    /// Public lookup used by the TCP front-end to resolve a weighing packet's
    /// socket to the device it belongs to.
    pub fn snapshot_id_for_socket(&self, socket_id: &str) -> Option<String> {
        self.socket_device_id(socket_id)
    }

    pub fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.by_device_id
            .lock()
            .unwrap()
            .get(device_id)
            .map(|r| r.snapshot.clone())
    }

    /// All device IDs currently holding a live socket, for the session
    /// poller's `device_ids` query parameter.
    pub fn live_device_ids(&self) -> Vec<String> {
        self.by_device_id
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.socket_id.is_some())
            .map(|r| r.snapshot.id.clone())
            .collect()
    }

    /// Periodic sweep: devices whose heartbeat is overdue by more than half
    /// the timeout become `stale`; devices overdue by the full timeout have
    /// their socket forcibly closed (the close itself drives them to
    /// `disconnected` through the normal close callback).
    pub fn monitor_tick(&self) -> StoreResult<()> {
        let now = Utc::now();
        let half_timeout = self.heartbeat_timeout / 2;
        let mut to_stale = Vec::new();
        let mut to_close: Vec<(String, String)> = Vec::new();

        {
            let map = self.by_device_id.lock().unwrap();
            for record in map.values() {
                if record.snapshot.status == DeviceStatus::Disconnected {
                    continue;
                }
                let Some(last_hb) = record.snapshot.last_heartbeat_at else {
                    continue;
                };
                let overdue = now.signed_duration_since(last_hb).to_std().unwrap_or_default();
                if overdue >= self.heartbeat_timeout {
                    if let Some(socket_id) = &record.socket_id {
                        to_close.push((record.snapshot.id.clone(), socket_id.clone()));
                    }
                } else if overdue >= half_timeout && record.snapshot.status == DeviceStatus::Online {
                    to_stale.push(record.snapshot.id.clone());
                }
            }
        }

        for device_id in to_stale {
            self.mark_stale(&device_id)?;
        }

        if let Some(closer) = self.closer.get() {
            for (device_id, socket_id) in to_close {
                debug!(device_id, socket_id, "heartbeat deadline exceeded, forcing close");
                closer.close(&socket_id, "heartbeat timeout");
            }
        }
        Ok(())
    }
}

fn parse_ts(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
