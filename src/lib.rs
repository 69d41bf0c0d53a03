//! Edge weighing-scale gateway: TCP scale ingestion, local durable storage,
//! and cloud HTTP synchronization.
//!
//! Module layout mirrors `services/receiver` and `services/forwarder`
//! elsewhere in this stack: a thin `main.rs` wires together one struct per
//! concern, each concern owning its own store handle, error type, and
//! `tracing` spans.

pub mod batch_manager;
pub mod bus;
pub mod cloud;
pub mod config;
pub mod device_registry;
pub mod event_processor;
pub mod session_cache;
pub mod store;
pub mod sync_service;
pub mod tcp_server;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

/// Sliding-window size for in-memory duplicate weighing-packet suppression.
const DEDUP_WINDOW: Duration = Duration::from_secs(5);

use batch_manager::BatchManager;
use bus::Bus;
use cloud::CloudClient;
use config::GatewayConfig;
use device_registry::DeviceRegistry;
use event_processor::EventProcessor;
use session_cache::SessionCache;
use store::Store;
use sync_service::SyncService;
use tcp_server::TcpServer;

/// Every long-lived component, constructed in dependency order and torn down
/// in reverse, matching `services/forwarder/src/main.rs`'s service-container
/// shape.
pub struct ServiceContainer {
    pub config: GatewayConfig,
    pub store: Arc<Mutex<Store>>,
    pub bus: Bus,
    pub registry: Arc<DeviceRegistry>,
    pub sessions: Arc<tokio::sync::Mutex<SessionCache>>,
    pub batches: Arc<BatchManager>,
    pub cloud: Arc<CloudClient>,
    pub processor: Arc<EventProcessor>,
    pub sync: Arc<SyncService>,
    pub tcp: Arc<TcpServer>,
    pub shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),
    #[error("cloud client error: {0}")]
    Cloud(#[from] cloud::CloudError),
}

impl ServiceContainer {
    pub async fn build(config: GatewayConfig) -> Result<Self, StartupError> {
        if let Some(parent) = config.db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let store = Arc::new(Mutex::new(Store::open(&config.db_path)?));
        let bus = Bus::new();

        let registry = Arc::new(DeviceRegistry::new(
            Arc::clone(&store),
            bus.clone(),
            config.site_id.clone(),
            config.activity_idle,
            config.heartbeat_timeout,
        ));
        registry.load_on_startup()?;

        let sessions = Arc::new(tokio::sync::Mutex::new(SessionCache::new(
            Arc::clone(&store),
            config.session_cache_expiry,
        )));

        let batches = Arc::new(BatchManager::new(Arc::clone(&store), bus.clone()));
        batches.adopt_open_batches_on_startup()?;

        let cloud = Arc::new(CloudClient::new(&config, Arc::clone(&store))?);
        if !cloud.is_registered() {
            match cloud.register(env!("CARGO_PKG_VERSION")).await {
                Ok(resp) => info!(edge_id = %resp.edge_id, "registered with cloud at startup"),
                Err(e) => warn!(error = %e, "startup registration failed, will retry on first authenticated call"),
            }
        }

        let processor = Arc::new(EventProcessor::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&batches),
            Arc::clone(&sessions),
            Arc::clone(&cloud),
            DEDUP_WINDOW,
        ));

        let sync = SyncService::new(
            Arc::clone(&store),
            Arc::clone(&cloud),
            Arc::clone(&processor),
            Arc::clone(&batches),
            Arc::clone(&registry),
            config.cloud_batch_size,
            config.batch_interval,
            config.site_id.clone(),
        );

        let tcp = TcpServer::new(Arc::clone(&registry), Arc::clone(&processor));
        registry.set_socket_closer(Arc::clone(&tcp) as Arc<dyn device_registry::SocketCloser>);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            store,
            bus,
            registry,
            sessions,
            batches,
            cloud,
            processor,
            sync,
            tcp,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Run every background task until a shutdown signal is observed. The
    /// store is dropped last, after every emitter has drained, matching the
    /// ordering guarantee in the concurrency model.
    pub async fn run(self) -> std::io::Result<()> {
        let Self {
            config,
            store,
            bus,
            registry,
            sessions,
            batches: _batches,
            cloud,
            processor: _processor,
            sync,
            tcp,
            shutdown_tx,
            shutdown_rx,
        } = self;

        let monitor_registry = Arc::clone(&registry);
        let monitor_shutdown = shutdown_rx.clone();
        let monitor_interval = config.heartbeat_timeout / 4;
        let monitor_handle = tokio::spawn(async move {
            run_device_monitor(monitor_registry, monitor_interval, monitor_shutdown).await;
        });

        let poller_handle = tokio::spawn(session_cache::run_poller(
            Arc::clone(&sessions),
            Arc::clone(&registry),
            Arc::clone(&cloud),
            config.session_poll_interval,
            shutdown_rx.clone(),
        ));

        let sweeper_handle = tokio::spawn(session_cache::run_expiry_sweeper(
            sessions,
            Duration::from_secs(60),
            shutdown_rx.clone(),
        ));

        let sync_handle = tokio::spawn(Arc::clone(&sync).run(bus, shutdown_rx.clone()));

        let tcp_result = Arc::clone(&tcp)
            .run(&config.tcp_host, config.tcp_port, shutdown_rx.clone())
            .await;

        let _ = shutdown_tx.send(true);
        let _ = monitor_handle.await;
        let _ = poller_handle.await;
        let _ = sweeper_handle.await;
        let _ = sync_handle.await;

        info!("all tasks drained, closing store");
        drop(store);
        tcp_result
    }
}

async fn run_device_monitor(
    registry: Arc<DeviceRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = registry.monitor_tick() {
                    tracing::warn!(error = %e, "device monitor tick failed");
                }
            }
        }
    }
}
