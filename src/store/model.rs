//! Row types and small state enums for the durable store.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Disassembly,
    Retail,
    Receiving,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disassembly => "disassembly",
            Self::Retail => "retail",
            Self::Receiving => "receiving",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "retail" => Self::Retail,
            "receiving" => Self::Receiving,
            _ => Self::Disassembly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Idle,
    Stale,
    Disconnected,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Idle => "idle",
            Self::Stale => "stale",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "online" => Self::Online,
            "idle" => Self::Idle,
            "stale" => Self::Stale,
            _ => Self::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Paused,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "paused" => Self::Paused,
            _ => Self::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    InProgress,
    Reconciled,
    Failed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Reconciled => "reconciled",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "in_progress" => Self::InProgress,
            "reconciled" => Self::Reconciled,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "synced" => Self::Synced,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceRow {
    pub id: String,
    pub local_id: String,
    pub global_id: Option<String>,
    pub display_name: Option<String>,
    pub location: Option<String>,
    pub device_type: DeviceType,
    pub status: DeviceStatus,
    pub last_heartbeat_at: Option<String>,
    pub last_event_at: Option<String>,
    pub heartbeat_count: i64,
    pub event_count: i64,
    pub connected_at: Option<String>,
    pub source_ip: Option<String>,
    pub small_unit_is_grams: bool,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub device_id: String,
    pub animal_id: Option<String>,
    pub animal_tag: Option<String>,
    pub animal_species: Option<String>,
    pub operator_id: Option<String>,
    pub status: SessionStatus,
    pub cached_at: String,
    pub updated_at: String,
    pub expires_at: String,
}

/// Input to `Store::upsert_session` — the fields a cloud push/poll response
/// actually carries, before store-assigned bookkeeping columns are filled in.
pub struct SessionUpsert {
    pub id: String,
    pub device_id: String,
    pub animal_id: Option<String>,
    pub animal_tag: Option<String>,
    pub animal_species: Option<String>,
    pub operator_id: Option<String>,
    pub status: SessionStatus,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BatchRow {
    pub id: String,
    pub device_id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub event_count: i64,
    pub total_weight_grams: i64,
    pub reconciliation_status: BatchStatus,
    pub cloud_session_id: Option<String>,
    pub reconciled_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: String,
    pub device_id: String,
    pub cloud_session_id: Option<String>,
    pub offline_mode: bool,
    pub offline_batch_id: Option<String>,
    pub plu_code: String,
    pub product_name: Option<String>,
    pub net_weight_grams: i64,
    pub tare_weight_grams: i64,
    pub barcode: String,
    pub scale_timestamp: String,
    pub received_at: String,
    pub source_ip: Option<String>,
    pub raw_line: String,
    pub sync_status: SyncStatus,
    pub cloud_event_id: Option<String>,
    pub synced_at: Option<String>,
    pub sync_attempts: i64,
    pub last_error: Option<String>,
}

/// Input to `Store::insert_event` — everything the event processor has
/// determined by the time the record is ready to persist.
pub struct NewEvent {
    pub id: String,
    pub device_id: String,
    pub cloud_session_id: Option<String>,
    pub offline_mode: bool,
    pub offline_batch_id: Option<String>,
    pub plu_code: String,
    pub product_name: Option<String>,
    pub net_weight_grams: i64,
    pub tare_weight_grams: i64,
    pub barcode: String,
    pub scale_timestamp: String,
    pub received_at: DateTime<Utc>,
    pub source_ip: Option<String>,
    pub raw_line: String,
}
