//! WebSocket control plane
//!
//! A duplex JSON-over-text session: clients send `start`/`stop`, the engine
//! streams transcripts back. Outbound messages are broadcast to every
//! connected client; a client whose socket fails is removed without touching
//! the pipeline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::protocol::{parse_inbound, InboundCommand, OutboundMessage};

/// Handle for fanning messages out to every connected client.
#[derive(Clone)]
pub struct Broadcaster {
    clients: Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>>,
    next_id: Arc<AtomicU64>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn register(&self, tx: mpsc::UnboundedSender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().insert(id, tx);
        id
    }

    fn remove(&self, id: u64) {
        self.clients.lock().remove(&id);
    }

    /// Send to every client, pruning the ones whose channel is gone.
    pub fn broadcast(&self, message: &OutboundMessage) {
        let payload = message.to_json();
        let mut clients = self.clients.lock();
        clients.retain(|id, tx| {
            if tx.send(payload.clone()).is_ok() {
                true
            } else {
                tracing::info!("Client {} removed (send failed)", id);
                false
            }
        });
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept loop. Runs until the listener errors or the task is cancelled.
pub async fn run(
    engine: Arc<Engine>,
    broadcaster: Broadcaster,
    host: &str,
    port: u16,
) -> Result<()> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| EngineError::Server(format!("failed to bind {}:{}: {}", host, port, e)))?;

    tracing::info!("Control plane listening on ws://{}:{}", host, port);

    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(|e| EngineError::Server(e.to_string()))?;
        tokio::spawn(handle_connection(
            stream,
            addr,
            engine.clone(),
            broadcaster.clone(),
        ));
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<Engine>,
    broadcaster: Broadcaster,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    tracing::info!("Client connected: {}", addr);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Broadcasts and replies both flow through this per-client channel so a
    // slow network peer never blocks the emitter.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let client_id = broadcaster.register(tx.clone());

    let forward_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_tx.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(raw)) => {
                let reply = dispatch(&raw, &engine).await;
                if tx.send(reply.to_json()).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // binary/ping/pong ignored
            Err(e) => {
                tracing::debug!("Client {} read error: {}", addr, e);
                break;
            }
        }
    }

    broadcaster.remove(client_id);
    forward_task.abort();
    tracing::info!("Client removed: {}", addr);
}

async fn dispatch(raw: &str, engine: &Engine) -> OutboundMessage {
    match parse_inbound(raw) {
        InboundCommand::Start(config) => {
            tracing::info!("Received start command");
            match engine.handle_start(config).await {
                Ok(()) => OutboundMessage::status("started"),
                Err(e) => {
                    tracing::error!("Failed to start pipeline: {}", e);
                    OutboundMessage::error(e.to_string())
                }
            }
        }
        InboundCommand::Stop => {
            tracing::info!("Received stop command");
            engine.handle_stop().await;
            OutboundMessage::status("stopped")
        }
        InboundCommand::Unknown(msg_type) => {
            tracing::warn!("Unknown message type: {}", msg_type);
            OutboundMessage::error(format!("Unknown type: {}", msg_type))
        }
        InboundCommand::Invalid => {
            tracing::warn!("Received invalid JSON from client");
            OutboundMessage::error("Invalid JSON")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_all_clients() {
        let broadcaster = Broadcaster::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        broadcaster.register(tx_a);
        broadcaster.register(tx_b);
        assert_eq!(broadcaster.client_count(), 2);

        broadcaster.broadcast(&OutboundMessage::status("started"));
        assert!(rx_a.try_recv().unwrap().contains("started"));
        assert!(rx_b.try_recv().unwrap().contains("started"));
    }

    #[test]
    fn dead_clients_pruned_on_broadcast() {
        let broadcaster = Broadcaster::new();
        let (tx, rx) = mpsc::unbounded_channel();
        broadcaster.register(tx);
        drop(rx);

        broadcaster.broadcast(&OutboundMessage::status("started"));
        assert_eq!(broadcaster.client_count(), 0);
    }

    #[test]
    fn remove_is_idempotent() {
        let broadcaster = Broadcaster::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = broadcaster.register(tx);
        broadcaster.remove(id);
        broadcaster.remove(id);
        assert_eq!(broadcaster.client_count(), 0);
    }
}
