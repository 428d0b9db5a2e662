//! Network handler: owns one transport connection on behalf of the session.
//!
//! Responsible for the connect-timeout, the post-disconnect settle delay,
//! and reconnect backoff. The session drives it from its own event loop and
//! hears back through `SessionEvent`s.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::NimbusErrorCode;
use crate::logger::Logger;
use crate::remote::session::SessionEvent;
use crate::remote::transport::{MessageTransport, TransportEvent, TransportEventSender};
use crate::util::backoff::Backoff;

/// Ceiling for connect attempts and always-timing-out requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// Grace period after a transport drop before the session reacts, letting
/// the socket settle.
const DISCONNECT_SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkState {
    Disconnected,
    Connecting,
    Connected,
}

pub(crate) struct NetworkHandler {
    transport: Arc<dyn MessageTransport>,
    url: Url,
    session_tx: async_channel::Sender<SessionEvent>,
    events_tx: TransportEventSender,
    state: NetworkState,
    connect_timer: Option<JoinHandle<()>>,
    backoff: Backoff,
    intentional_close: bool,
    terminated: CancellationToken,
    logger: Logger,
}

impl NetworkHandler {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        url: Url,
        session_tx: async_channel::Sender<SessionEvent>,
    ) -> Self {
        let (events_tx, events_rx) = async_channel::unbounded::<TransportEvent>();
        let terminated = CancellationToken::new();

        let forward_cancel = terminated.clone();
        let forward_tx = session_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forward_cancel.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Ok(event) => {
                            if forward_tx.send(SessionEvent::Transport(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        Self {
            transport,
            url,
            session_tx,
            events_tx,
            state: NetworkState::Disconnected,
            connect_timer: None,
            backoff: Backoff::default(),
            intentional_close: false,
            terminated,
            logger: Logger::new("nimbusdb/network"),
        }
    }

    /// Starts a connect attempt (after the current backoff delay) and arms
    /// the connect timer.
    pub fn go_online(&mut self) {
        if self.terminated.is_cancelled() || self.state != NetworkState::Disconnected {
            return;
        }
        self.state = NetworkState::Connecting;
        self.intentional_close = false;
        self.arm_connect_timer();

        let delay = Duration::from_millis(self.backoff.next_delay_millis());
        let transport = self.transport.clone();
        let url = self.url.clone();
        let events = self.events_tx.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(err) = transport.connect(&url, events.clone()).await {
                logger.warn(format!("connect attempt failed: {err}"));
                let _ = events.send(TransportEvent::Disconnected).await;
            }
        });
    }

    pub fn go_offline(&mut self) {
        self.intentional_close = true;
        self.cancel_connect_timer();
        self.state = NetworkState::Disconnected;
        let transport = self.transport.clone();
        tokio::spawn(async move {
            transport.disconnect().await;
        });
    }

    /// Tears the transport down and immediately reports the disconnect to
    /// the session with the given error, bypassing the settle delay.
    pub fn restart(&mut self, after_error: NimbusErrorCode) {
        self.go_offline();
        let session_tx = self.session_tx.clone();
        tokio::spawn(async move {
            let _ = session_tx
                .send(SessionEvent::SocketDisconnected(Some(after_error)))
                .await;
        });
    }

    pub async fn write(&self, text: String) -> crate::error::NimbusResult<()> {
        self.transport.send(text).await
    }

    pub fn on_transport_connected(&mut self) {
        self.cancel_connect_timer();
        self.state = NetworkState::Connected;
        self.backoff.reset();
    }

    /// Handles a transport-level drop. Unintentional drops schedule the
    /// session notification after the settle delay; intentional ones are
    /// swallowed.
    pub fn on_transport_disconnected(&mut self) {
        self.cancel_connect_timer();
        self.state = NetworkState::Disconnected;
        let was_intentional = std::mem::take(&mut self.intentional_close);
        if was_intentional || self.terminated.is_cancelled() {
            return;
        }
        let session_tx = self.session_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_SETTLE_DELAY).await;
            let _ = session_tx.send(SessionEvent::SocketDisconnected(None)).await;
        });
    }

    pub fn destroy(&mut self) {
        self.terminated.cancel();
        self.go_offline();
    }

    fn arm_connect_timer(&mut self) {
        self.cancel_connect_timer();
        let session_tx = self.session_tx.clone();
        self.connect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(DEFAULT_TIMEOUT).await;
            let _ = session_tx.send(SessionEvent::ConnectTimedOut).await;
        }));
    }

    fn cancel_connect_timer(&mut self) {
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
    }
}
