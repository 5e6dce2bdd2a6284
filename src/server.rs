//! WebSocket connection gateway.
//!
//! ```text
//! Client ── ws upgrade (auth gate, ?room= routing) ── Gateway
//!                                                       │
//!                                              RoomRegistry.get_or_create
//!                                                       │
//!                                           Room.handle_message / broadcast
//! ```
//!
//! The gateway is deliberately thin: it authenticates the upgrade, binds the
//! connection to exactly one room (from the `room` query parameter, or from
//! the first valid message when the parameter is absent), then pumps frames
//! between the socket and the room. All collaboration semantics live in the
//! room.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol;
use crate::registry::RoomRegistry;
use crate::room::{Connection, Room};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Shared bearer token required at upgrade time. `None` disables the
    /// auth gate (trusted-network deployments, tests).
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            auth_token: None,
        }
    }
}

/// Gateway-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

/// The WebSocket sync gateway.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, registry: Arc<RoomRegistry>) -> Self {
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Accept loop. Runs until the listener fails; call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync gateway listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let auth_token = self.config.auth_token.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, stats, auth_token).await
                {
                    log::debug!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    /// Handle one WebSocket connection from upgrade to close.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        auth_token: Option<String>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Query parameters surface during the upgrade handshake. A missing
        // or wrong token rejects the connection here, before any room ever
        // sees it.
        let mut room_param: Option<String> = None;
        let mut rejected = false;
        let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let mut token_param: Option<String> = None;
            if let Some(query) = req.uri().query() {
                for pair in query.split('&') {
                    if let Some((key, value)) = pair.split_once('=') {
                        match key {
                            "room" => room_param = Some(value.to_string()),
                            "token" => token_param = Some(value.to_string()),
                            _ => {}
                        }
                    }
                }
            }
            if let Some(expected) = &auth_token {
                if token_param.as_deref() != Some(expected.as_str()) {
                    rejected = true;
                    let mut resp = ErrorResponse::new(Some("unauthorized".to_string()));
                    *resp.status_mut() = StatusCode::UNAUTHORIZED;
                    return Err(resp);
                }
            }
            Ok(response)
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                if rejected {
                    log::info!("rejected unauthenticated connection from {addr}");
                    let mut s = stats.write().await;
                    s.rejected_connections += 1;
                    return Ok(());
                }
                return Err(e.into());
            }
        };
        log::info!("websocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Writer task: the room queues frames, this task owns the sink.
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let conn = Connection::new(tx.clone());
        let conn_id = conn.id();
        let mut pending = Some(conn);
        let mut room: Option<Arc<Room>> = None;

        // Room known at upgrade time: bind immediately so the bootstrap
        // sync goes out before the client says anything.
        if let Some(room_id) = room_param {
            if let Some(c) = pending.take() {
                let r = registry.get_or_create(&room_id).await;
                r.connect(c).await;
                room = Some(r);
            }
        }

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += text.len() as u64;
                    }

                    // Deferred binding: the first valid frame names the room.
                    if room.is_none() {
                        match protocol::decode(text.as_str()) {
                            Ok(wire) => {
                                let r = registry.get_or_create(wire.room_id()).await;
                                if let Some(c) = pending.take() {
                                    r.connect(c).await;
                                }
                                room = Some(r);
                            }
                            Err(e) => {
                                log::debug!("unbound connection {addr} sent invalid frame: {e}");
                                continue;
                            }
                        }
                    }

                    if let Some(r) = &room {
                        r.handle_message(conn_id, text.as_str()).await;
                    }
                }

                Ok(Message::Ping(data)) => {
                    let _ = tx.send(Message::Pong(data));
                }

                Ok(Message::Close(_)) => {
                    log::info!("connection closed from {addr}");
                    break;
                }

                // Binary frames are not part of this text protocol.
                Ok(_) => {}

                Err(e) => {
                    log::debug!("websocket error from {addr}: {e}");
                    break;
                }
            }
        }

        if let Some(r) = &room {
            r.disconnect(conn_id).await;
        }
        drop(tx);
        writer.abort();

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        Ok(())
    }

    /// Gateway statistics snapshot.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}
