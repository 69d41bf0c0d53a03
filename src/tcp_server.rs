//! TCP front-end: accepts scale connections, owns socket lifetime, funnels
//! bytes into the per-connection parser, and writes short acks.
//!
//! Grounded on `services/receiver/src/local_proxy.rs`'s bind/accept-loop/
//! watch-shutdown idiom and `crates/timer-core/src/workers/client_connector.rs`'s
//! per-connection read-loop-with-callbacks shape.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use edge_protocol::{ParseOutcome, Packet, ScaleBuffer, ACK_REPLY};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device_registry::{DeviceRegistry, SocketCloser};
use crate::event_processor::EventProcessor;

const READ_CHUNK: usize = 4096;

/// Running totals, read concurrently by other tasks (e.g. a future admin
/// surface), grounded on `services/receiver/src/cache.rs::StreamCounts`'s
/// atomics-backed counters.
#[derive(Debug, Default)]
pub struct FrontEndStats {
    connections_total: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct FrontEndStatsSnapshot {
    pub connections_total: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl FrontEndStats {
    pub fn snapshot(&self) -> FrontEndStatsSnapshot {
        FrontEndStatsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Per-socket outbound write channel, keyed by socket ID, so `send`/`close`/
/// `broadcast` can reach an arbitrary live connection from any task.
struct SocketHandle {
    tx: mpsc::UnboundedSender<SocketCommand>,
}

enum SocketCommand {
    Write(Vec<u8>),
    Close,
}

pub struct TcpServer {
    registry: Arc<DeviceRegistry>,
    processor: Arc<EventProcessor>,
    stats: Arc<FrontEndStats>,
    sockets: Mutex<HashMap<String, SocketHandle>>,
}

impl TcpServer {
    pub fn new(registry: Arc<DeviceRegistry>, processor: Arc<EventProcessor>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            processor,
            stats: Arc::new(FrontEndStats::default()),
            sockets: Mutex::new(HashMap::new()),
        })
    }

    pub fn stats(&self) -> FrontEndStatsSnapshot {
        self.stats.snapshot()
    }

    /// `send` returns whether the socket was still live to accept the write.
    pub fn send(&self, socket_id: &str, bytes: Vec<u8>) -> bool {
        let sockets = self.sockets.lock().unwrap();
        match sockets.get(socket_id) {
            Some(handle) => handle.tx.send(SocketCommand::Write(bytes)).is_ok(),
            None => false,
        }
    }

    pub fn close(&self, socket_id: &str, reason: &str) {
        debug!(socket_id, reason, "closing socket");
        if let Some(handle) = self.sockets.lock().unwrap().get(socket_id) {
            let _ = handle.tx.send(SocketCommand::Close);
        }
    }

    pub fn broadcast(&self, bytes: &[u8]) {
        let sockets = self.sockets.lock().unwrap();
        for handle in sockets.values() {
            let _ = handle.tx.send(SocketCommand::Write(bytes.to_vec()));
        }
    }

    /// A `drain` request is accepted but has no behavioral contract beyond logging.
    pub fn drain(&self, socket_id: &str) {
        debug!(socket_id, "drain requested (no-op)");
    }

    pub async fn run(
        self: Arc<Self>,
        host: &str,
        port: u16,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind((host, port)).await?;
        info!(host, port, "scale TCP front-end listening");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("tcp front-end shutting down, closing live sockets");
                        let ids: Vec<String> = self.sockets.lock().unwrap().keys().cloned().collect();
                        for id in ids {
                            self.close(&id, "server shutdown");
                        }
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            let server = Arc::clone(&self);
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                server.serve_connection(stream, peer, shutdown).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept error"),
                    }
                }
            }
        }
        Ok(())
    }

    async fn serve_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let socket_id = Uuid::new_v4().to_string();
        let source_ip = peer.ip().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<SocketCommand>();
        self.sockets.lock().unwrap().insert(socket_id.clone(), SocketHandle { tx });

        info!(socket_id, %peer, "connection opened");

        let mut buffer = ScaleBuffer::new();
        let mut read_buf = vec![0u8; READ_CHUNK];
        let mut close_reason = "peer closed";

        'outer: loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        close_reason = "server shutdown";
                        break 'outer;
                    }
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(SocketCommand::Write(bytes)) => {
                            if stream.write_all(&bytes).await.is_err() {
                                close_reason = "write error";
                                break 'outer;
                            }
                            self.stats.bytes_out.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                        }
                        Some(SocketCommand::Close) => {
                            close_reason = "closed by request";
                            break 'outer;
                        }
                        None => {
                            close_reason = "handle dropped";
                            break 'outer;
                        }
                    }
                }
                read = stream.read(&mut read_buf) => {
                    match read {
                        Ok(0) => {
                            close_reason = "peer closed";
                            break 'outer;
                        }
                        Ok(n) => {
                            self.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                            let outcomes = buffer.feed(&read_buf[..n]);
                            for outcome in outcomes {
                                self.handle_outcome(&socket_id, &source_ip, outcome, &mut stream).await;
                            }
                        }
                        Err(e) => {
                            warn!(socket_id, error = %e, "read error");
                            close_reason = "read error";
                            break 'outer;
                        }
                    }
                }
            }
        }

        self.sockets.lock().unwrap().remove(&socket_id);
        if let Err(e) = self.registry.disconnect_device(&socket_id, close_reason) {
            warn!(socket_id, error = %e, "failed to persist disconnect");
        }
        info!(socket_id, reason = close_reason, "connection closed");
    }

    async fn handle_outcome(
        &self,
        socket_id: &str,
        source_ip: &str,
        outcome: ParseOutcome,
        stream: &mut TcpStream,
    ) {
        match outcome {
            ParseOutcome::Packet(Packet::Registration { scale_number }) => {
                match self.registry.register_device(socket_id, &scale_number, source_ip) {
                    Ok(snapshot) => info!(device_id = %snapshot.id, scale_number, "scale registered"),
                    Err(e) => warn!(error = %e, "device registration failed"),
                }
            }
            ParseOutcome::Packet(Packet::Heartbeat) => {
                if let Err(e) = self.registry.on_heartbeat(socket_id) {
                    warn!(socket_id, error = %e, "heartbeat handling failed");
                }
            }
            ParseOutcome::Packet(Packet::AckRequest) => {
                let _ = stream.write_all(ACK_REPLY).await;
                self.stats.bytes_out.fetch_add(ACK_REPLY.len() as u64, Ordering::Relaxed);
            }
            ParseOutcome::Packet(Packet::Weighing(record)) => {
                let Some(device_id) = self.registry.snapshot_id_for_socket(socket_id) else {
                    warn!(socket_id, "weighing packet from unregistered socket, dropped");
                    return;
                };
                let small_unit_is_grams = self
                    .registry
                    .snapshot(&device_id)
                    .map(|s| s.small_unit_is_grams)
                    .unwrap_or(false);

                match self
                    .processor
                    .process(&device_id, Some(source_ip), small_unit_is_grams, record)
                    .await
                {
                    Ok(Some(_)) => {
                        if let Err(e) = self.registry.on_event(socket_id) {
                            warn!(socket_id, error = %e, "event bookkeeping failed");
                        }
                    }
                    Ok(None) => debug!(socket_id, "duplicate weighing packet discarded"),
                    Err(e) => warn!(socket_id, error = %e, "event processing failed"),
                }
                let _ = stream.write_all(ACK_REPLY).await;
                self.stats.bytes_out.fetch_add(ACK_REPLY.len() as u64, Ordering::Relaxed);
            }
            ParseOutcome::Error(e) => {
                warn!(socket_id, error = %e, "scale line parse error, connection kept open");
            }
            ParseOutcome::BufferTruncated { discarded_bytes } => {
                warn!(socket_id, discarded_bytes, "per-connection buffer overflowed, truncated");
            }
        }
    }
}

impl SocketCloser for TcpServer {
    fn close(&self, socket_id: &str, reason: &str) {
        TcpServer::close(self, socket_id, reason);
    }
}
