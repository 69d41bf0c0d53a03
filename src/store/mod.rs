//! Durable SQLite store: append-only event log plus mutable registries.
//!
//! Grounded on `services/forwarder/src/storage/journal.rs` (WAL pragmas,
//! integrity check, idempotent forward-only migrations under a transaction)
//! and `services/receiver/src/db.rs` (repository-style query methods).

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

mod migrations;
pub mod model;

pub use model::*;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("duplicate event for (device, scale_timestamp, plu, weight)")]
    DuplicateEvent,
    #[error("not found")]
    NotFound,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The durable store. All writes go through the one connection held here;
/// callers serialize writers externally (the event processor and cloud sync
/// each hold their own handle behind an async mutex — see `src/lib.rs`).
pub struct Store {
    conn: Connection,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> StoreResult<Self> {
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        migrations::apply(&mut conn)?;
        Ok(Self { conn })
    }

    // -----------------------------------------------------------------
    // edge_config
    // -----------------------------------------------------------------

    pub fn get_config(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM edge_config WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn set_config(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO edge_config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // devices
    // -----------------------------------------------------------------

    pub fn load_all_devices(&self) -> StoreResult<Vec<DeviceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, local_id, global_id, display_name, location, device_type, status,
                    last_heartbeat_at, last_event_at, heartbeat_count, event_count,
                    connected_at, source_ip, small_unit_is_grams
             FROM devices ORDER BY local_id",
        )?;
        let rows = stmt.query_map([], map_device)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn mark_all_disconnected(&self) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE devices SET status = 'disconnected'",
            [],
        )?;
        Ok(())
    }

    pub fn get_device_by_local_id(&self, local_id: &str) -> StoreResult<Option<DeviceRow>> {
        self.conn
            .query_row(
                "SELECT id, local_id, global_id, display_name, location, device_type, status,
                        last_heartbeat_at, last_event_at, heartbeat_count, event_count,
                        connected_at, source_ip, small_unit_is_grams
                 FROM devices WHERE local_id = ?1",
                params![local_id],
                map_device,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_device(&self, id: &str) -> StoreResult<Option<DeviceRow>> {
        self.conn
            .query_row(
                "SELECT id, local_id, global_id, display_name, location, device_type, status,
                        last_heartbeat_at, last_event_at, heartbeat_count, event_count,
                        connected_at, source_ip, small_unit_is_grams
                 FROM devices WHERE id = ?1",
                params![id],
                map_device,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Insert a brand-new device row (first-ever registration).
    pub fn insert_device(
        &self,
        id: &str,
        local_id: &str,
        global_id: &str,
        device_type: DeviceType,
        source_ip: &str,
    ) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO devices
                (id, local_id, global_id, device_type, status, connected_at,
                 source_ip, heartbeat_count, event_count)
             VALUES (?1, ?2, ?3, ?4, 'online', ?5, ?6, 1, 0)",
            params![id, local_id, global_id, device_type.as_str(), now(), source_ip],
        )?;
        Ok(())
    }

    /// Reconnection of a previously-known device: bump heartbeat count,
    /// refresh `connected_at`/`source_ip`, set status online.
    pub fn reconnect_device(&self, id: &str, source_ip: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE devices
             SET status = 'online', connected_at = ?2, source_ip = ?3,
                 heartbeat_count = heartbeat_count + 1
             WHERE id = ?1",
            params![id, now(), source_ip],
        )?;
        Ok(())
    }

    pub fn set_device_status(&self, id: &str, status: DeviceStatus) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE devices SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn record_heartbeat(&self, id: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE devices SET last_heartbeat_at = ?2, heartbeat_count = heartbeat_count + 1
             WHERE id = ?1",
            params![id, now()],
        )?;
        Ok(())
    }

    pub fn record_event(&self, id: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE devices SET last_event_at = ?2, event_count = event_count + 1
             WHERE id = ?1",
            params![id, now()],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // active_sessions_cache
    // -----------------------------------------------------------------

    pub fn upsert_session(&self, s: &SessionUpsert) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO active_sessions_cache
                (id, device_id, animal_id, animal_tag, animal_species, operator_id,
                 status, cached_at, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                device_id = excluded.device_id,
                animal_id = excluded.animal_id,
                animal_tag = excluded.animal_tag,
                animal_species = excluded.animal_species,
                operator_id = excluded.operator_id,
                status = excluded.status,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at",
            params![
                s.id,
                s.device_id,
                s.animal_id,
                s.animal_tag,
                s.animal_species,
                s.operator_id,
                s.status.as_str(),
                now(),
                s.expires_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ],
        )?;
        Ok(())
    }

    /// Delete a session, first nulling the FK on any referencing events
    /// (events are retained — session linkage is best-effort metadata).
    pub fn delete_session(&mut self, id: &str) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE events SET cloud_session_id = NULL WHERE cloud_session_id = ?1",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM active_sessions_cache WHERE id = ?1",
            params![id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_active_session_for_device(
        &self,
        device_id: &str,
    ) -> StoreResult<Option<SessionRow>> {
        self.conn
            .query_row(
                "SELECT id, device_id, animal_id, animal_tag, animal_species, operator_id,
                        status, cached_at, updated_at, expires_at
                 FROM active_sessions_cache
                 WHERE device_id = ?1 AND status = 'active' AND expires_at > ?2
                 ORDER BY cached_at DESC LIMIT 1",
                params![device_id, now()],
                map_session,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Every cached session for a device, any status, not yet expired —
    /// unlike `get_active_session_for_device`, paused sessions are included
    /// so reconciliation can see and drop them too.
    pub fn list_cached_sessions_for_device(&self, device_id: &str) -> StoreResult<Vec<SessionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, device_id, animal_id, animal_tag, animal_species, operator_id,
                    status, cached_at, updated_at, expires_at
             FROM active_sessions_cache
             WHERE device_id = ?1 AND expires_at > ?2
             ORDER BY cached_at DESC",
        )?;
        let rows = stmt.query_map(params![device_id, now()], map_session)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Delete every cached session whose `expires_at` has passed. Returns the
    /// number of rows removed.
    pub fn sweep_expired_sessions(&mut self) -> StoreResult<usize> {
        let now_s = now();
        let expired: Vec<String> = {
            let mut stmt = self
                .conn
                .prepare("SELECT id FROM active_sessions_cache WHERE expires_at <= ?1")?;
            let rows = stmt.query_map(params![now_s], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for id in &expired {
            self.delete_session(id)?;
        }
        Ok(expired.len())
    }

    pub fn list_device_ids_with_sessions(&self) -> StoreResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT device_id FROM active_sessions_cache")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // -----------------------------------------------------------------
    // offline_batches
    // -----------------------------------------------------------------

    pub fn insert_batch(&self, id: &str, device_id: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO offline_batches (id, device_id, started_at, event_count, total_weight_grams, reconciliation_status)
             VALUES (?1, ?2, ?3, 0, 0, 'pending')",
            params![id, device_id, now()],
        )?;
        Ok(())
    }

    pub fn end_batch(&self, id: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE offline_batches SET ended_at = ?2 WHERE id = ?1 AND ended_at IS NULL",
            params![id, now()],
        )?;
        Ok(())
    }

    pub fn increment_batch_counts(&self, id: &str, weight_grams: i64) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE offline_batches
             SET event_count = event_count + 1, total_weight_grams = total_weight_grams + ?2
             WHERE id = ?1",
            params![id, weight_grams],
        )?;
        Ok(())
    }

    pub fn mark_batch_syncing(&self, id: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE offline_batches SET reconciliation_status = 'in_progress' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn mark_batch_synced(&self, id: &str, cloud_session_id: Option<&str>) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE offline_batches
             SET reconciliation_status = 'reconciled', reconciled_at = ?2, cloud_session_id = ?3
             WHERE id = ?1",
            params![id, now(), cloud_session_id],
        )?;
        Ok(())
    }

    pub fn mark_batch_failed(&self, id: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE offline_batches SET reconciliation_status = 'failed' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn get_open_batch_for_device(&self, device_id: &str) -> StoreResult<Option<BatchRow>> {
        self.conn
            .query_row(
                "SELECT id, device_id, started_at, ended_at, event_count, total_weight_grams,
                        reconciliation_status, cloud_session_id, reconciled_at
                 FROM offline_batches WHERE device_id = ?1 AND ended_at IS NULL",
                params![device_id],
                map_batch,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_batch(&self, id: &str) -> StoreResult<Option<BatchRow>> {
        self.conn
            .query_row(
                "SELECT id, device_id, started_at, ended_at, event_count, total_weight_grams,
                        reconciliation_status, cloud_session_id, reconciled_at
                 FROM offline_batches WHERE id = ?1",
                params![id],
                map_batch,
            )
            .optional()
            .map_err(Into::into)
    }

    /// All batches with `ended_at IS NULL`, for startup adoption / reconnect close-out.
    pub fn list_open_batches(&self) -> StoreResult<Vec<BatchRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, device_id, started_at, ended_at, event_count, total_weight_grams,
                    reconciliation_status, cloud_session_id, reconciled_at
             FROM offline_batches WHERE ended_at IS NULL",
        )?;
        let rows = stmt.query_map([], map_batch)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn count_open_batches_for_device(&self, device_id: &str) -> StoreResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM offline_batches WHERE device_id = ?1 AND ended_at IS NULL",
            params![device_id],
            |r| r.get(0),
        ).map_err(Into::into)
    }

    // -----------------------------------------------------------------
    // events
    // -----------------------------------------------------------------

    /// Insert a fully-tagged event row. A unique-index violation on
    /// (device, scale_timestamp, plu, weight) is translated to
    /// `StoreError::DuplicateEvent` rather than propagating the raw SQLite error.
    pub fn insert_event(&self, e: &NewEvent) -> StoreResult<()> {
        let result = self.conn.execute(
            "INSERT INTO events
                (id, device_id, cloud_session_id, offline_mode, offline_batch_id,
                 plu_code, product_name, net_weight_grams, tare_weight_grams, barcode,
                 scale_timestamp, received_at, source_ip, raw_line, sync_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 'pending')",
            params![
                e.id,
                e.device_id,
                e.cloud_session_id,
                e.offline_mode as i64,
                e.offline_batch_id,
                e.plu_code,
                e.product_name,
                e.net_weight_grams,
                e.tare_weight_grams,
                e.barcode,
                e.scale_timestamp,
                e.received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                e.source_ip,
                e.raw_line,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateEvent)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_event(&self, id: &str) -> StoreResult<Option<EventRow>> {
        self.conn
            .query_row(
                "SELECT id, device_id, cloud_session_id, offline_mode, offline_batch_id,
                        plu_code, product_name, net_weight_grams, tare_weight_grams, barcode,
                        scale_timestamp, received_at, source_ip, raw_line, sync_status,
                        cloud_event_id, synced_at, sync_attempts, last_error
                 FROM events WHERE id = ?1",
                params![id],
                map_event,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn mark_event_synced(&self, id: &str, cloud_event_id: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE events SET sync_status = 'synced', cloud_event_id = ?2, synced_at = ?3
             WHERE id = ?1",
            params![id, cloud_event_id, now()],
        )?;
        Ok(())
    }

    pub fn mark_event_failed(&self, id: &str, error: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE events SET sync_status = 'failed', last_error = ?2, sync_attempts = sync_attempts + 1
             WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    pub fn update_sync_status(&self, id: &str, status: SyncStatus) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE events SET sync_status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    /// Up to `limit` `pending`/`failed` events ordered by `received_at` ascending.
    pub fn fetch_pending_events(&self, limit: i64) -> StoreResult<Vec<EventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, device_id, cloud_session_id, offline_mode, offline_batch_id,
                    plu_code, product_name, net_weight_grams, tare_weight_grams, barcode,
                    scale_timestamp, received_at, source_ip, raw_line, sync_status,
                    cloud_event_id, synced_at, sync_attempts, last_error
             FROM events
             WHERE sync_status IN ('pending', 'failed')
             ORDER BY received_at ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], map_event)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn count_unsynced_for_batch(&self, batch_id: &str) -> StoreResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE offline_batch_id = ?1 AND sync_status != 'synced'",
            params![batch_id],
            |r| r.get(0),
        ).map_err(Into::into)
    }

    // -----------------------------------------------------------------
    // cloud_connection_log
    // -----------------------------------------------------------------

    pub fn log_connection_transition(&self, online: bool, detail: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO cloud_connection_log (online, changed_at, detail) VALUES (?1, ?2, ?3)",
            params![online as i64, now(), detail],
        )?;
        Ok(())
    }
}

fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> StoreResult<()> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn map_device(row: &rusqlite::Row<'_>) -> Result<DeviceRow, rusqlite::Error> {
    Ok(DeviceRow {
        id: row.get(0)?,
        local_id: row.get(1)?,
        global_id: row.get(2)?,
        display_name: row.get(3)?,
        location: row.get(4)?,
        device_type: DeviceType::from_str(&row.get::<_, String>(5)?),
        status: DeviceStatus::from_str(&row.get::<_, String>(6)?),
        last_heartbeat_at: row.get(7)?,
        last_event_at: row.get(8)?,
        heartbeat_count: row.get(9)?,
        event_count: row.get(10)?,
        connected_at: row.get(11)?,
        source_ip: row.get(12)?,
        small_unit_is_grams: row.get::<_, i64>(13)? != 0,
    })
}

fn map_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, rusqlite::Error> {
    Ok(SessionRow {
        id: row.get(0)?,
        device_id: row.get(1)?,
        animal_id: row.get(2)?,
        animal_tag: row.get(3)?,
        animal_species: row.get(4)?,
        operator_id: row.get(5)?,
        status: SessionStatus::from_str(&row.get::<_, String>(6)?),
        cached_at: row.get(7)?,
        updated_at: row.get(8)?,
        expires_at: row.get(9)?,
    })
}

fn map_batch(row: &rusqlite::Row<'_>) -> Result<BatchRow, rusqlite::Error> {
    Ok(BatchRow {
        id: row.get(0)?,
        device_id: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        event_count: row.get(4)?,
        total_weight_grams: row.get(5)?,
        reconciliation_status: BatchStatus::from_str(&row.get::<_, String>(6)?),
        cloud_session_id: row.get(7)?,
        reconciled_at: row.get(8)?,
    })
}

fn map_event(row: &rusqlite::Row<'_>) -> Result<EventRow, rusqlite::Error> {
    Ok(EventRow {
        id: row.get(0)?,
        device_id: row.get(1)?,
        cloud_session_id: row.get(2)?,
        offline_mode: row.get::<_, i64>(3)? != 0,
        offline_batch_id: row.get(4)?,
        plu_code: row.get(5)?,
        product_name: row.get(6)?,
        net_weight_grams: row.get(7)?,
        tare_weight_grams: row.get(8)?,
        barcode: row.get(9)?,
        scale_timestamp: row.get(10)?,
        received_at: row.get(11)?,
        source_ip: row.get(12)?,
        raw_line: row.get(13)?,
        sync_status: SyncStatus::from_str(&row.get::<_, String>(14)?),
        cloud_event_id: row.get(15)?,
        synced_at: row.get(16)?,
        sync_attempts: row.get(17)?,
        last_error: row.get(18)?,
    })
}

/// Re-exported for callers that need to stamp `received_at`/`cached_at`
/// consistently with what the store itself would write.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}
