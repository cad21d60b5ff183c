//! WebSocket transport: one board channel over a connection to the relay.
//!
//! A writer task drains an mpsc queue into the socket; a reader task
//! decodes frames, drops our own, and fans the resulting `ChannelEvent`s
//! out to every live `Subscription`.  When the socket dies the transport
//! reports itself disconnected and `open` dials again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::channel::{ChannelEvent, Subscription, Transport, TransportError};
use crate::protocol::{PeerInfo, SyncMessage};

type Subscribers = Arc<StdMutex<Vec<mpsc::UnboundedSender<ChannelEvent>>>>;

pub struct WsTransport {
    url: String,
    board_id: Uuid,
    peer_id: Uuid,
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
}

impl WsTransport {
    /// Not yet connected; call `open`.
    pub fn new(url: impl Into<String>, board_id: Uuid, peer_id: Uuid) -> Self {
        Self {
            url: url.into(),
            board_id,
            peer_id,
            outgoing: Mutex::new(None),
            subscribers: Arc::new(StdMutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn connect(
        url: impl Into<String>,
        board_id: Uuid,
        peer_id: Uuid,
    ) -> Result<Self, TransportError> {
        let transport = Self::new(url, board_id, peer_id);
        transport.open().await?;
        Ok(transport)
    }

    pub fn board_id(&self) -> Uuid {
        self.board_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Heartbeat; the relay answers with a pong.
    pub async fn ping(&self) -> Result<(), TransportError> {
        self.send_frame(SyncMessage::ping(self.peer_id).encode()?).await
    }

    /// Close the socket.  Subscriptions stay alive but go quiet.
    pub async fn close(&self) {
        // Dropping the sender ends the writer task, which closes the sink.
        self.outgoing.lock().await.take();
        self.connected.store(false, Ordering::Release);
    }

    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::Offline);
        }
        let outgoing = self.outgoing.lock().await;
        let tx = outgoing.as_ref().ok_or(TransportError::Offline)?;
        tx.send(frame).await.map_err(|_| {
            self.connected.store(false, Ordering::Release);
            TransportError::Offline
        })
    }

    async fn send(&self, event: &ChannelEvent) -> Result<(), TransportError> {
        let msg = event.to_message(self.board_id, self.peer_id)?;
        self.send_frame(msg.encode()?).await
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let mut outgoing = self.outgoing.lock().await;
        if self.connected.load(Ordering::Acquire) && outgoing.is_some() {
            return Ok(());
        }

        let url = format!("{}/{}", self.url, self.board_id);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let connected = self.connected.clone();
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    connected.store(false, Ordering::Release);
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode, drop our own frames, fan out
        let subscribers = self.subscribers.clone();
        let connected = self.connected.clone();
        let peer_id = self.peer_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let event = match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) if sync_msg.peer_id == peer_id => continue,
                            Ok(sync_msg) => ChannelEvent::from_message(sync_msg),
                            Err(e) => Err(e),
                        };
                        match event {
                            Ok(Some(event)) => fan_out(&subscribers, event),
                            Ok(None) => {}
                            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            connected.store(false, Ordering::Release);
            log::info!("Disconnected from relay");
        });

        *outgoing = Some(out_tx);
        self.connected.store(true, Ordering::Release);
        log::info!("Connected to {url}");
        Ok(())
    }

    async fn broadcast(&self, event: &ChannelEvent) -> Result<(), TransportError> {
        self.send(event).await
    }

    async fn subscribe(&self) -> Result<Subscription, TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::Offline);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| TransportError::Io("subscriber list poisoned".into()))?
            .push(tx);
        Ok(Subscription::socket(rx))
    }

    async fn track(&self, peer: &PeerInfo) -> Result<(), TransportError> {
        self.send(&ChannelEvent::PeerJoined(peer.clone())).await
    }

    async fn untrack(&self, peer_id: Uuid) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        self.send(&ChannelEvent::PeerLeft(peer_id)).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Deliver to every live subscriber, forgetting the dropped ones.
fn fan_out(subscribers: &Subscribers, event: ChannelEvent) {
    if let Ok(mut subs) = subscribers.lock() {
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
