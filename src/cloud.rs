//! Cloud HTTP client: transport, retry/backoff, and reachability tracking.
//!
//! Grounded on `services/receiver/src/control_api.rs`'s `reqwest::Client`
//! builder usage (timeout, bearer-style auth header, JSON bodies) and
//! `services/forwarder/src/uplink.rs`'s retry/reconnect shape, adapted from
//! a persistent WebSocket session to discrete retried HTTP calls.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::session_cache::CloudSessionPush;
use crate::store::{SessionStatus, Store, StoreError};

const CONSECUTIVE_FAILURES_OFFLINE_THRESHOLD: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cloud unreachable after retries: {0}")]
    Unreachable(String),
    #[error("invalid edge id format (HTTP 400): {0}")]
    InvalidEdgeId(String),
    #[error("unexpected response status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    #[serde(rename = "edgeId")]
    pub edge_id: Option<Uuid>,
    #[serde(rename = "siteId")]
    pub site_id: String,
    #[serde(rename = "siteName")]
    pub site_name: String,
    pub version: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    #[serde(rename = "edgeId")]
    pub edge_id: Uuid,
    #[serde(rename = "siteId")]
    pub site_id: String,
    #[serde(rename = "siteName")]
    pub site_name: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventPayload {
    #[serde(rename = "localEventId")]
    pub local_event_id: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "globalDeviceId")]
    pub global_device_id: String,
    #[serde(rename = "cloudSessionId")]
    pub cloud_session_id: Option<String>,
    #[serde(rename = "offlineMode")]
    pub offline_mode: bool,
    #[serde(rename = "offlineBatchId")]
    pub offline_batch_id: Option<String>,
    #[serde(rename = "pluCode")]
    pub plu_code: String,
    #[serde(rename = "productName")]
    pub product_name: Option<String>,
    #[serde(rename = "weightGrams")]
    pub weight_grams: i64,
    pub barcode: String,
    #[serde(rename = "scaleTimestamp")]
    pub scale_timestamp: String,
    #[serde(rename = "receivedAt")]
    pub received_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SingleEventResponse {
    #[serde(rename = "cloudEventId")]
    pub cloud_event_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchResultItem {
    #[serde(rename = "localEventId")]
    pub local_event_id: String,
    #[serde(rename = "cloudEventId")]
    pub cloud_event_id: Option<String>,
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchResponse {
    results: Vec<BatchResultItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct SessionsResponse {
    sessions: Vec<SessionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct SessionEntry {
    #[serde(rename = "cloudSessionId")]
    cloud_session_id: String,
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "animalId")]
    animal_id: Option<String>,
    #[serde(rename = "animalTag")]
    animal_tag: Option<String>,
    #[serde(rename = "animalSpecies")]
    animal_species: Option<String>,
    #[serde(rename = "operatorId")]
    operator_id: Option<String>,
    status: String,
}

pub struct CloudClient {
    http: Client,
    base_url: String,
    store: Arc<std::sync::Mutex<Store>>,
    edge_id: RwLock<Option<Uuid>>,
    site_id: String,
    site_name: String,
    registration_token: String,
    online: AtomicBool,
    consecutive_failures: AtomicU32,
    connected_tx: watch::Sender<bool>,
    max_retries: u32,
    retry_delay: Duration,
    backoff_multiplier: u32,
    max_retry_delay: Duration,
}

impl CloudClient {
    /// `store` supplies the persisted `edge_id` (if any) from a prior
    /// successful `/register`, read back here so a restart doesn't forget
    /// the edge's identity.
    pub fn new(cfg: &GatewayConfig, store: Arc<std::sync::Mutex<Store>>) -> Result<Self, CloudError> {
        let http = Client::builder()
            .timeout(cfg.event_send_timeout)
            .build()
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        let base_url = format!("{}/edge", cfg.cloud_api_url.trim_end_matches('/'));
        let (connected_tx, _rx) = watch::channel(false);

        let persisted_edge_id = store
            .lock()
            .unwrap()
            .get_config("edge_id")?
            .and_then(|s| Uuid::parse_str(&s).ok());

        Ok(Self {
            http,
            base_url,
            store,
            edge_id: RwLock::new(persisted_edge_id),
            site_id: cfg.site_id.clone(),
            site_name: cfg.site_name.clone(),
            registration_token: cfg.registration_token.clone(),
            online: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            connected_tx,
            max_retries: cfg.rest_max_retries,
            retry_delay: cfg.rest_retry_delay,
            backoff_multiplier: cfg.rest_backoff_multiplier,
            max_retry_delay: cfg.rest_max_retry_delay,
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Whether a `/register` response has already given this edge an id,
    /// either this run or a prior one (read back from the store at
    /// construction).
    pub fn is_registered(&self) -> bool {
        self.edge_id().is_some()
    }

    /// Force the reachability flag without a network round trip, firing the
    /// `connected` signal on a transition. Lets tests drive the
    /// online/offline paths of dependent components deterministically.
    pub fn force_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online != online {
            let _ = self.connected_tx.send(online);
        }
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    fn edge_id(&self) -> Option<Uuid> {
        *self.edge_id.read().unwrap()
    }

    fn note_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let was_online = self.online.swap(true, Ordering::SeqCst);
        if !was_online {
            info!("cloud connection restored");
            let _ = self.connected_tx.send(true);
        }
    }

    fn note_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= CONSECUTIVE_FAILURES_OFFLINE_THRESHOLD {
            let was_online = self.online.swap(false, Ordering::SeqCst);
            if was_online {
                warn!(failures, "cloud connection lost");
                let _ = self.connected_tx.send(false);
            }
        }
    }

    pub async fn register(&self, version: &str) -> Result<RegisterResponse, CloudError> {
        let body = RegisterRequest {
            edge_id: self.edge_id(),
            site_id: self.site_id.clone(),
            site_name: self.site_name.clone(),
            version: version.to_owned(),
            capabilities: vec!["tcp-scale-ingest".to_owned(), "offline-batching".to_owned()],
        };
        let url = format!("{}/register", self.base_url);
        let resp: RegisterResponse = self
            .with_retry(|| {
                let body = body.clone();
                let url = url.clone();
                async move {
                    let resp = self
                        .http
                        .post(&url)
                        .bearer_auth(&self.registration_token)
                        .json(&body)
                        .send()
                        .await
                        .map_err(|e| CloudError::Transport(e.to_string()))?;
                    parse_response(resp).await
                }
            })
            .await?;
        *self.edge_id.write().unwrap() = Some(resp.edge_id);
        self.persist_identity(&resp)?;
        info!(edge_id = %resp.edge_id, "registered with cloud");
        Ok(resp)
    }

    /// Persist the identity a `/register` response assigned, so the next
    /// startup reads it back instead of registering again.
    fn persist_identity(&self, resp: &RegisterResponse) -> Result<(), CloudError> {
        let store = self.store.lock().unwrap();
        store.set_config("edge_id", &resp.edge_id.to_string())?;
        store.set_config("site_id", &resp.site_id)?;
        store.set_config("site_name", &resp.site_name)?;
        Ok(())
    }

    pub async fn fetch_sessions(&self, device_ids: &[String]) -> Result<Vec<CloudSessionPush>, CloudError> {
        let csv = device_ids.join(",");
        let url = format!("{}/sessions?device_ids={}", self.base_url, csv);
        let resp: SessionsResponse = self
            .with_retry(|| {
                let url = url.clone();
                async move { self.authed_get(&url).await }
            })
            .await?;
        Ok(resp
            .sessions
            .into_iter()
            .map(|s| CloudSessionPush {
                cloud_session_id: s.cloud_session_id,
                device_id: s.device_id,
                animal_id: s.animal_id,
                animal_tag: s.animal_tag,
                animal_species: s.animal_species,
                operator_id: s.operator_id,
                status: if s.status == "paused" {
                    SessionStatus::Paused
                } else {
                    SessionStatus::Active
                },
            })
            .collect())
    }

    pub async fn post_event(&self, payload: &EventPayload) -> Result<SingleEventResponse, CloudError> {
        let url = format!("{}/events", self.base_url);
        self.with_retry(|| {
            let url = url.clone();
            let payload = payload.clone();
            async move { self.authed_post(&url, &payload).await }
        })
        .await
    }

    pub async fn post_events_batch(&self, payloads: &[EventPayload]) -> Result<Vec<BatchResultItem>, CloudError> {
        let url = format!("{}/events/batch", self.base_url);
        #[derive(Serialize)]
        struct Body<'a> {
            events: &'a [EventPayload],
        }
        let resp: BatchResponse = self
            .with_retry(|| {
                let url = url.clone();
                async move { self.authed_post(&url, &Body { events: payloads }).await }
            })
            .await?;
        Ok(resp.results)
    }

    pub async fn post_device_status(
        &self,
        device_id: &str,
        status: &str,
        heartbeat_count: i64,
        event_count: i64,
    ) -> Result<(), CloudError> {
        #[derive(Serialize, Clone)]
        struct Body {
            #[serde(rename = "deviceId")]
            device_id: String,
            status: String,
            #[serde(rename = "heartbeatCount")]
            heartbeat_count: i64,
            #[serde(rename = "eventCount")]
            event_count: i64,
        }
        let url = format!("{}/devices/status", self.base_url);
        let body = Body {
            device_id: device_id.to_owned(),
            status: status.to_owned(),
            heartbeat_count,
            event_count,
        };
        let _: serde_json::Value = self
            .with_retry(|| {
                let url = url.clone();
                let body = body.clone();
                async move { self.authed_post(&url, &body).await }
            })
            .await?;
        Ok(())
    }

    async fn authed_get<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, CloudError> {
        let mut req = self.http.get(url);
        if let Some(id) = self.edge_id() {
            req = req.header("X-Edge-Id", id.to_string());
        }
        let resp = req.send().await.map_err(|e| CloudError::Transport(e.to_string()))?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            debug!("edge id rejected, re-registering before single retry");
            self.register(env!("CARGO_PKG_VERSION")).await?;
            let mut retry = self.http.get(url);
            if let Some(id) = self.edge_id() {
                retry = retry.header("X-Edge-Id", id.to_string());
            }
            let retry_resp = retry.send().await.map_err(|e| CloudError::Transport(e.to_string()))?;
            return parse_response(retry_resp).await;
        }

        parse_response(resp).await
    }

    async fn authed_post<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, CloudError> {
        let mut req = self.http.post(url).json(body);
        if let Some(id) = self.edge_id() {
            req = req.header("X-Edge-Id", id.to_string());
        }
        let resp = req.send().await.map_err(|e| CloudError::Transport(e.to_string()))?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            debug!("edge id rejected, re-registering before single retry");
            self.register(env!("CARGO_PKG_VERSION")).await?;
            let mut retry = self.http.post(url).json(body);
            if let Some(id) = self.edge_id() {
                retry = retry.header("X-Edge-Id", id.to_string());
            }
            let retry_resp = retry.send().await.map_err(|e| CloudError::Transport(e.to_string()))?;
            return parse_response(retry_resp).await;
        }

        parse_response(resp).await
    }

    /// Retry an async operation with exponential backoff:
    /// `delay_n = min(initialDelay * multiplier^n, maxDelay)`.
    async fn with_retry<F, Fut, T>(&self, mut op: F) -> Result<T, CloudError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, CloudError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => {
                    self.note_success();
                    return Ok(v);
                }
                Err(e @ CloudError::InvalidEdgeId(_)) => {
                    self.note_failure();
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    self.note_failure();
                    if attempt > self.max_retries {
                        return Err(CloudError::Unreachable(e.to_string()));
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying cloud call");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.saturating_pow(attempt.saturating_sub(1));
        let scaled = self.retry_delay.saturating_mul(multiplier.max(1));
        scaled.min(self.max_retry_delay)
    }
}

async fn parse_response<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T, CloudError> {
    let status = resp.status();
    if status == StatusCode::BAD_REQUEST {
        let body = resp.text().await.unwrap_or_default();
        if body.contains("Invalid edgeId format") {
            return Err(CloudError::InvalidEdgeId(body));
        }
        return Err(CloudError::UnexpectedStatus { status: status.as_u16(), body });
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(CloudError::UnexpectedStatus { status: status.as_u16(), body });
    }
    resp.json::<T>().await.map_err(|e| CloudError::Transport(e.to_string()))
}
