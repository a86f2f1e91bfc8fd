//! Realtime channel seam: per-board publish/subscribe with an
//! observable join state.
//!
//! Two implementations:
//!
//! - [`LoopbackChannel`] — in-process fan-out over a tokio broadcast
//!   channel. Used by tests and by multiple engine instances inside a
//!   single process.
//! - [`WebSocketChannel`] — a relay client. A writer task drains an
//!   mpsc queue into the socket; a reader task decodes frames into the
//!   subscriber fan-out. The join state flips on connect and close.
//!
//! Senders are responsible for tagging messages with their identity;
//! the broadcast transport filters self-echo on the receive side.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use crate::wire::{ChannelError, WireMessage};

/// A named per-board publish/subscribe channel.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Whether the channel is currently joined; sends while not joined
    /// fail with [`ChannelError::NotJoined`].
    fn is_joined(&self) -> bool;

    /// Publish a message to every subscriber.
    async fn send(&self, msg: &WireMessage) -> Result<(), ChannelError>;

    /// Subscribe to inbound messages (including the caller's own —
    /// self-echo filtering is the receiver's job).
    fn subscribe(&self) -> broadcast::Receiver<Arc<WireMessage>>;
}

/// In-process channel: every subscriber in the process sees every send.
pub struct LoopbackChannel {
    sender: broadcast::Sender<Arc<WireMessage>>,
    joined: AtomicBool,
}

impl LoopbackChannel {
    /// Create a loopback channel with the given buffer capacity,
    /// initially joined.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            joined: AtomicBool::new(true),
        }
    }

    /// Flip the join state (tests use this to simulate disconnection).
    pub fn set_joined(&self, joined: bool) {
        self.joined.store(joined, Ordering::SeqCst);
    }
}

#[async_trait]
impl RealtimeChannel for LoopbackChannel {
    fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    async fn send(&self, msg: &WireMessage) -> Result<(), ChannelError> {
        if !self.is_joined() {
            return Err(ChannelError::NotJoined);
        }
        // No subscribers is not an error — the message simply fans out
        // to nobody.
        let _ = self.sender.send(Arc::new(msg.clone()));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<WireMessage>> {
        self.sender.subscribe()
    }
}

/// WebSocket relay channel for a single board.
pub struct WebSocketChannel {
    server_url: String,
    board_id: Uuid,
    joined: Arc<AtomicBool>,
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    inbound: broadcast::Sender<Arc<WireMessage>>,
}

impl WebSocketChannel {
    pub fn new(server_url: impl Into<String>, board_id: Uuid) -> Self {
        let (inbound, _) = broadcast::channel(256);
        Self {
            server_url: server_url.into(),
            board_id,
            joined: Arc::new(AtomicBool::new(false)),
            outgoing: Mutex::new(None),
            inbound,
        }
    }

    pub fn board_id(&self) -> Uuid {
        self.board_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Connect to the relay and spawn the writer/reader tasks.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let url = format!("{}/{}", self.server_url, self.board_id);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|_| ChannelError::ConnectionClosed)?;

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing queue to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        *self.outgoing.lock().await = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        self.joined.store(true, Ordering::SeqCst);

        // Reader task: decode frames into the subscriber fan-out.
        let inbound = self.inbound.clone();
        let joined = self.joined.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match WireMessage::decode(&bytes) {
                            Ok(msg) => {
                                let _ = inbound.send(Arc::new(msg));
                            }
                            Err(e) => {
                                log::debug!("Dropping undecodable frame: {e}");
                            }
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            joined.store(false, Ordering::SeqCst);
        });

        Ok(())
    }
}

#[async_trait]
impl RealtimeChannel for WebSocketChannel {
    fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    async fn send(&self, msg: &WireMessage) -> Result<(), ChannelError> {
        if !self.is_joined() {
            return Err(ChannelError::NotJoined);
        }
        let encoded = msg.encode()?;
        let guard = self.outgoing.lock().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ChannelError::ConnectionClosed),
            None => Err(ChannelError::NotJoined),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<WireMessage>> {
        self.inbound.subscribe()
    }
}
