//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐   JSON text frames   ┌──────────────────────────────┐
//!             ├────────────────────► │ CollabHub (tokio Mutex)      │
//! Client B ──┘                      │  ├── RoomManager ── Rooms    │
//!      ▲                            │  ├── OtEngine ── Documents   │
//!      │   per-connection writer    │  └── PersistenceWriter ──────┼──► Persistence
//!      └─── task drains ChannelHandle◄── Dispatch (after unlock)    │
//!                                   └──────────────────────────────┘
//! ```
//!
//! Each connection gets a [`ChannelHandle`]; the hub only ever queues frames
//! on it, and a writer task owns the socket sink.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::error::{codes, ValidationError};
use crate::hub::{CollabHub, Connection, HubStats};
use crate::protocol::ServerMessage;
use crate::room::{ChannelHandle, ConnectionHandle};
use crate::storage::{Persistence, PersistenceWriter};

/// Transport statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub frames_sent: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<Mutex<CollabHub>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server without persistence.
    pub fn new(config: ServerConfig) -> Self {
        let hub = CollabHub::new(&config, None);
        Self {
            config,
            hub: Arc::new(Mutex::new(hub)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create a server that persists to `store`. Must be called inside a tokio runtime.
    pub fn with_persistence(config: ServerConfig, store: Arc<dyn Persistence>) -> Self {
        let writer = PersistenceWriter::spawn(store);
        let hub = CollabHub::new(&config, Some(writer));
        Self {
            config,
            hub: Arc::new(Mutex::new(hub)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> Arc<Mutex<CollabHub>> {
        Arc::clone(&self.hub)
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub async fn hub_stats(&self) -> HubStats {
        self.hub.lock().await.stats()
    }

    /// Bind `config.bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        CollabHub::start_sweeper(&self.hub, self.config.sweep_interval).await;

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = Arc::clone(&self.hub);
            let stats = Arc::clone(&self.stats);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Stop the sweep, snapshot documents and drain persistence.
    pub async fn shutdown(&self) {
        self.hub.lock().await.shutdown().await;
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<Mutex<CollabHub>>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (handle, mut outgoing) = ChannelHandle::new();
        let conn = Connection::new(Arc::new(handle));
        log::info!("WebSocket connection {} established from {addr}", conn.id);

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let sent_stats = Arc::clone(&stats);
        let write_task = tokio::spawn(async move {
            while let Some(frame) = outgoing.recv().await {
                if let Err(e) = ws_sender.send(Message::text(frame.to_string())).await {
                    log::debug!("Socket write failed: {e}");
                    break;
                }
                sent_stats.write().await.frames_sent += 1;
            }
            let _ = ws_sender.close().await;
        });

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += text.len() as u64;
                    }
                    let dispatch = {
                        let mut hub = hub.lock().await;
                        hub.handle_frame(&conn, text.as_str())
                    };
                    dispatch.deliver(conn.handle.as_ref());
                }
                Ok(Message::Binary(_)) => {
                    let err = ValidationError::malformed("binary frames are not supported");
                    let frame = ServerMessage::error(codes::VALIDATION_ERROR, err.to_string(), None, None);
                    if let Ok(text) = frame.encode() {
                        conn.handle.send(Arc::from(text));
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("WebSocket error on connection {}: {e}", conn.id);
                    break;
                }
            }
        }

        let departure = hub.lock().await.disconnect(conn.id);
        departure.deliver(conn.handle.as_ref());
        drop(conn);
        write_task.abort();

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("WebSocket connection from {addr} closed");
        Ok(())
    }
}
