//! Transport abstraction: one full-duplex text-message channel.
//!
//! The production implementation rides a websocket; [`InProcessTransport`]
//! backs tests and local tooling with a scriptable in-memory channel.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{default_error, NimbusResult};
use crate::logger::Logger;

/// Events surfaced by a transport to its owner.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message(String),
}

pub type TransportEventSender = async_channel::Sender<TransportEvent>;

/// A connect/disconnect/send surface over one message connection. Incoming
/// traffic and connection state changes are pushed through the event sender
/// handed to [`MessageTransport::connect`].
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn connect(&self, url: &Url, events: TransportEventSender) -> NimbusResult<()>;
    async fn disconnect(&self);
    async fn send(&self, text: String) -> NimbusResult<()>;
}

type TcpWebSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WebSocketSink = futures_util::stream::SplitSink<TcpWebSocket, Message>;

/// Production websocket transport over `tokio-tungstenite`.
pub struct WebSocketTransport {
    sink: AsyncMutex<Option<WebSocketSink>>,
    reader: AsyncMutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self {
            sink: AsyncMutex::new(None),
            reader: AsyncMutex::new(None),
            logger: Logger::new("nimbusdb/websocket"),
        }
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageTransport for WebSocketTransport {
    async fn connect(&self, url: &Url, events: TransportEventSender) -> NimbusResult<()> {
        {
            let guard = self.sink.lock().await;
            if guard.is_some() {
                return Ok(());
            }
        }

        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| default_error(format!("failed to connect websocket: {err}")))?;
        let (sink, mut reader) = stream.split();

        {
            let mut guard = self.sink.lock().await;
            *guard = Some(sink);
        }

        let reader_events = events.clone();
        let reader_logger = self.logger.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(payload)) => {
                        if reader_events
                            .send(TransportEvent::Message(payload))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(Message::Binary(payload)) => match String::from_utf8(payload) {
                        Ok(text) => {
                            if reader_events
                                .send(TransportEvent::Message(text))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(_) => {
                            reader_logger
                                .warn("received non-UTF8 binary frame; dropping".to_string());
                        }
                    },
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                    Ok(Message::Close(_)) | Err(_) => break,
                }
            }
            let _ = reader_events.send(TransportEvent::Disconnected).await;
        });

        {
            let mut guard = self.reader.lock().await;
            if let Some(existing) = guard.replace(reader_task) {
                existing.abort();
            }
        }

        events
            .send(TransportEvent::Connected)
            .await
            .map_err(|_| default_error("transport owner went away during connect"))
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(err) = sink.close().await {
                self.logger
                    .debug(format!("websocket close reported: {err}"));
            }
        }
    }

    async fn send(&self, text: String) -> NimbusResult<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| default_error("websocket sink unavailable"))?;
        sink.send(Message::Text(text))
            .await
            .map_err(|err| default_error(format!("failed to send frame: {err}")))
    }
}

/// Scriptable in-memory transport. Frames written by the SDK are captured
/// for inspection; a held controller injects server frames and connection
/// state changes. Grounded in the same role the in-memory datastore plays
/// for the HTTP paths of the wider toolkit.
#[derive(Default)]
pub struct InProcessTransport {
    state: Arc<InProcessState>,
    /// When set, `connect` fails outright this many times before accepting.
    pub refuse_connects: std::sync::atomic::AtomicU32,
}

#[derive(Default)]
struct InProcessState {
    sent: std::sync::Mutex<Vec<String>>,
    events: std::sync::Mutex<Option<TransportEventSender>>,
    connects: std::sync::atomic::AtomicU32,
}

impl InProcessTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All frames the SDK has written, oldest first.
    pub fn sent_frames(&self) -> Vec<String> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn clear_sent_frames(&self) {
        self.state.sent.lock().unwrap().clear();
    }

    pub fn connect_count(&self) -> u32 {
        self.state.connects.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Injects a server frame into the SDK as if it arrived on the wire.
    pub async fn push_message(&self, text: impl Into<String>) {
        self.emit(TransportEvent::Message(text.into())).await;
    }

    /// Simulates the transport dropping out from under the SDK.
    pub async fn drop_connection(&self) {
        self.emit(TransportEvent::Disconnected).await;
    }

    async fn emit(&self, event: TransportEvent) {
        let sender = self.state.events.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }
}

#[async_trait]
impl MessageTransport for InProcessTransport {
    async fn connect(&self, _url: &Url, events: TransportEventSender) -> NimbusResult<()> {
        use std::sync::atomic::Ordering;
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let refusals = self.refuse_connects.load(Ordering::SeqCst);
        if refusals > 0 {
            self.refuse_connects.store(refusals - 1, Ordering::SeqCst);
            return Err(default_error("connection refused"));
        }
        *self.state.events.lock().unwrap() = Some(events.clone());
        events
            .send(TransportEvent::Connected)
            .await
            .map_err(|_| default_error("transport owner went away during connect"))
    }

    async fn disconnect(&self) {
        self.state.events.lock().unwrap().take();
    }

    async fn send(&self, text: String) -> NimbusResult<()> {
        self.state.sent.lock().unwrap().push(text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_process_transport_captures_frames_and_events() {
        let transport = InProcessTransport::new();
        let (tx, rx) = async_channel::unbounded();
        let url = Url::parse("ws://localhost").unwrap();

        transport.connect(&url, tx).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), TransportEvent::Connected);

        transport.send("frame-1".into()).await.unwrap();
        assert_eq!(transport.sent_frames(), vec!["frame-1"]);

        transport.push_message("from-server").await;
        assert_eq!(
            rx.recv().await.unwrap(),
            TransportEvent::Message("from-server".into())
        );

        transport.drop_connection().await;
        assert_eq!(rx.recv().await.unwrap(), TransportEvent::Disconnected);
    }

    #[tokio::test]
    async fn refused_connects_count_down() {
        let transport = InProcessTransport::new();
        transport
            .refuse_connects
            .store(1, std::sync::atomic::Ordering::SeqCst);
        let (tx, _rx) = async_channel::unbounded();
        let url = Url::parse("ws://localhost").unwrap();

        assert!(transport.connect(&url, tx.clone()).await.is_err());
        assert!(transport.connect(&url, tx).await.is_ok());
        assert_eq!(transport.connect_count(), 2);
    }
}
