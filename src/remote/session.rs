//! Session manager: the single event loop owning the request queue, the
//! pending-request table, active subscriptions, heartbeat, and the replay
//! logic that carries all of them across transport drops.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use tokio::task::JoinHandle;
use url::Url;

use crate::error::{
    connection_terminated, default_error, permission_denied, timeout as timeout_error,
    NimbusError, NimbusErrorCode, NimbusResult,
};
use crate::local::CacheHandle;
use crate::logger::Logger;
use crate::model::Document;
use crate::protocol::{
    parse_server_frame, serialize_client_frame, ClientFrame, ServerMessage, SubscriptionBatch,
};
use crate::query::Query;
use crate::remote::connection::{NetworkHandler, DEFAULT_TIMEOUT};
use crate::remote::request::{insert_prioritized, Completion, QueuedRequest};
use crate::remote::subscription::{CollectionUpdate, HandlerState, SubscriptionHandler};
use crate::remote::transport::{MessageTransport, TransportEvent};
use crate::util::ids::{generate_event_id, generate_id};
use crate::util::subscribe::SubscriptionCallback;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Logical connection state of the session, distinct from the physical
/// transport state owned by the network handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub(crate) enum SessionEvent {
    Post {
        frame: ClientFrame,
        completion: Option<Completion>,
        prioritize: bool,
    },
    Subscribe {
        query: Query,
        listener_id: u64,
        callback: SubscriptionCallback<CollectionUpdate>,
    },
    Unsubscribe {
        listener_id: u64,
    },
    Fetch {
        query: Query,
        reply: oneshot::Sender<NimbusResult<Vec<Document>>>,
    },
    Transport(TransportEvent),
    SocketDisconnected(Option<NimbusErrorCode>),
    ConnectTimedOut,
    RequestTimedOut(u64),
    HeartbeatFired,
    CacheLoaded {
        subscription_id: String,
        documents: Vec<Document>,
    },
    SetTimeout(Option<Duration>),
    GoOffline,
    GoOnline,
    Destroy,
}

pub(crate) struct SessionConfig {
    pub url: Url,
    pub transport: Arc<dyn MessageTransport>,
    pub cache: Option<CacheHandle>,
    pub timeout: Option<Duration>,
}

/// Cheap cloneable handle posting into the session loop.
#[derive(Clone)]
pub struct SessionHandle {
    sender: async_channel::Sender<SessionEvent>,
}

impl SessionHandle {
    pub(crate) fn spawn(config: SessionConfig) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        let network = NetworkHandler::new(config.transport, config.url, sender.clone());
        let session = Session {
            state: ConnectionState::Disconnected,
            connection_id: None,
            auth_token: None,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            subscriptions: HashMap::new(),
            subscription_order: Vec::new(),
            hash_index: HashMap::new(),
            listener_index: HashMap::new(),
            fetches: HashMap::new(),
            heartbeat: None,
            network,
            cache: config.cache,
            timeout: config.timeout,
            events_tx: sender.clone(),
            next_internal_id: 0,
            next_enqueue_seq: 0,
            logger: Logger::new("nimbusdb/session"),
        };
        tokio::spawn(run(session, receiver));
        Self { sender }
    }

    pub(crate) async fn request(&self, frame: ClientFrame, prioritize: bool) -> NimbusResult<()> {
        let (completion, response) = oneshot::channel();
        self.post_event(SessionEvent::Post {
            frame,
            completion: Some(completion),
            prioritize,
        })
        .await?;
        response
            .await
            .unwrap_or_else(|_| Err(default_error("session stopped")))
    }

    pub(crate) async fn subscribe(
        &self,
        query: Query,
        listener_id: u64,
        callback: SubscriptionCallback<CollectionUpdate>,
    ) -> NimbusResult<()> {
        self.post_event(SessionEvent::Subscribe {
            query,
            listener_id,
            callback,
        })
        .await
    }

    pub(crate) async fn unsubscribe(&self, listener_id: u64) -> NimbusResult<()> {
        self.post_event(SessionEvent::Unsubscribe { listener_id }).await
    }

    pub(crate) fn unsubscribe_detached(&self, listener_id: u64) {
        let _ = self
            .sender
            .try_send(SessionEvent::Unsubscribe { listener_id });
    }

    pub(crate) async fn fetch(&self, query: Query) -> NimbusResult<Vec<Document>> {
        let (reply, response) = oneshot::channel();
        self.post_event(SessionEvent::Fetch { query, reply }).await?;
        response
            .await
            .unwrap_or_else(|_| Err(default_error("session stopped")))
    }

    pub(crate) async fn set_timeout(&self, timeout: Option<Duration>) -> NimbusResult<()> {
        self.post_event(SessionEvent::SetTimeout(timeout)).await
    }

    pub(crate) async fn go_offline(&self) -> NimbusResult<()> {
        self.post_event(SessionEvent::GoOffline).await
    }

    pub(crate) async fn go_online(&self) -> NimbusResult<()> {
        self.post_event(SessionEvent::GoOnline).await
    }

    pub(crate) async fn destroy(&self) -> NimbusResult<()> {
        self.post_event(SessionEvent::Destroy).await
    }

    async fn post_event(&self, event: SessionEvent) -> NimbusResult<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| default_error("session stopped"))
    }
}

struct Session {
    state: ConnectionState,
    connection_id: Option<String>,
    auth_token: Option<String>,
    queue: VecDeque<QueuedRequest>,
    pending: HashMap<String, QueuedRequest>,
    subscriptions: HashMap<String, SubscriptionHandler>,
    /// Subscription ids in registration order, driving resubscribe order.
    subscription_order: Vec<String>,
    hash_index: HashMap<String, String>,
    listener_index: HashMap<u64, String>,
    fetches: HashMap<String, oneshot::Sender<NimbusResult<Vec<Document>>>>,
    heartbeat: Option<JoinHandle<()>>,
    network: NetworkHandler,
    cache: Option<CacheHandle>,
    timeout: Option<Duration>,
    events_tx: async_channel::Sender<SessionEvent>,
    next_internal_id: u64,
    next_enqueue_seq: u64,
    logger: Logger,
}

async fn run(mut session: Session, receiver: async_channel::Receiver<SessionEvent>) {
    session.network.go_online();
    session.state = ConnectionState::Connecting;
    while let Ok(event) = receiver.recv().await {
        if session.handle_event(event).await {
            break;
        }
    }
}

impl Session {
    /// Returns true once the session is destroyed and the loop must stop.
    async fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Post {
                frame,
                completion,
                prioritize,
            } => {
                self.post(frame, completion, prioritize).await;
            }
            SessionEvent::Subscribe {
                query,
                listener_id,
                callback,
            } => {
                self.handle_subscribe(query, listener_id, callback).await;
            }
            SessionEvent::Unsubscribe { listener_id } => {
                self.handle_unsubscribe(listener_id).await;
            }
            SessionEvent::Fetch { query, reply } => {
                self.handle_fetch(query, reply).await;
            }
            SessionEvent::Transport(TransportEvent::Connected) => {
                self.network.on_transport_connected();
                self.socket_did_connect().await;
            }
            SessionEvent::Transport(TransportEvent::Disconnected) => {
                self.network.on_transport_disconnected();
            }
            SessionEvent::Transport(TransportEvent::Message(text)) => {
                self.handle_incoming(text).await;
            }
            SessionEvent::SocketDisconnected(error) => {
                self.socket_did_disconnect(error).await;
            }
            SessionEvent::ConnectTimedOut => {
                self.logger.warn("connect attempt timed out; restarting transport");
                self.network.restart(NimbusErrorCode::Timeout);
            }
            SessionEvent::RequestTimedOut(internal_id) => {
                self.handle_request_timeout(internal_id).await;
            }
            SessionEvent::HeartbeatFired => {
                self.post(ClientFrame::Nop, None, false).await;
            }
            SessionEvent::CacheLoaded {
                subscription_id,
                documents,
            } => {
                if let Some(handler) = self.subscriptions.get_mut(&subscription_id) {
                    handler.receive_cached(documents);
                }
            }
            SessionEvent::SetTimeout(timeout) => {
                self.timeout = timeout;
            }
            SessionEvent::GoOffline => {
                // Announce the disconnect while the transport still works.
                if self.state == ConnectionState::Connected {
                    self.post(ClientFrame::Disconnect, None, false).await;
                }
                self.cancel_heartbeat();
                self.network.go_offline();
                self.state = ConnectionState::Disconnected;
            }
            SessionEvent::GoOnline => {
                if self.state == ConnectionState::Disconnected {
                    self.network.go_online();
                    self.state = ConnectionState::Connecting;
                }
            }
            SessionEvent::Destroy => {
                self.shutdown();
                return true;
            }
        }
        false
    }

    // --- queueing -------------------------------------------------------

    async fn post(
        &mut self,
        frame: ClientFrame,
        completion: Option<Completion>,
        prioritize: bool,
    ) {
        let internal_id = self.next_internal_id;
        self.next_internal_id += 1;
        let enqueue_seq = self.next_enqueue_seq;
        self.next_enqueue_seq += 1;

        let mut request = QueuedRequest {
            internal_id,
            frame,
            completion,
            fixed_event_id: None,
            timeout: None,
            timeout_handle: None,
            enqueue_seq,
        };

        let timeout = if !request.expects_response() {
            None
        } else if let Some(user_timeout) = self.timeout {
            Some(user_timeout)
        } else if request.always_times_out() {
            Some(DEFAULT_TIMEOUT)
        } else {
            None
        };
        if let Some(timeout) = timeout {
            request.timeout = Some(timeout);
            request.timeout_handle = Some(self.arm_request_timer(internal_id, timeout));
        }

        if prioritize {
            insert_prioritized(&mut self.queue, request);
        } else {
            self.queue.push_back(request);
        }
        self.flush_queue().await;
    }

    fn arm_request_timer(&self, internal_id: u64, timeout: Duration) -> JoinHandle<()> {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events_tx
                .send(SessionEvent::RequestTimedOut(internal_id))
                .await;
        })
    }

    fn enqueue_ack(&mut self, event_id: &str) {
        let enqueue_seq = self.next_enqueue_seq;
        self.next_enqueue_seq += 1;
        let internal_id = self.next_internal_id;
        self.next_internal_id += 1;
        self.queue.push_back(QueuedRequest {
            internal_id,
            frame: ClientFrame::Ack,
            completion: None,
            fixed_event_id: Some(event_id.to_owned()),
            timeout: None,
            timeout_handle: None,
            enqueue_seq,
        });
    }

    /// Drains the queue while connected: each request gets a fresh event-id,
    /// moves to the pending table and is written out. The heartbeat timer is
    /// rescheduled afterwards.
    async fn flush_queue(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        while let Some(mut request) = self.queue.pop_front() {
            let event_id = request
                .fixed_event_id
                .clone()
                .unwrap_or_else(generate_event_id);
            let text = match serialize_client_frame(&request.frame, &event_id) {
                Ok(text) => text,
                Err(err) => {
                    request.complete(Err(err));
                    continue;
                }
            };
            if let Err(err) = self.network.write(text).await {
                self.logger
                    .warn(format!("transport write failed; holding queue: {err}"));
                self.queue.push_front(request);
                break;
            }
            if request.expects_response() {
                self.pending.insert(event_id, request);
            }
        }
        self.reset_heartbeat();
    }

    // --- connection lifecycle ------------------------------------------

    async fn socket_did_connect(&mut self) {
        let connect_frame = match self.connection_id.clone() {
            Some(connection_id) => ClientFrame::Reconnect { connection_id },
            None => {
                let connection_id = generate_id();
                self.connection_id = Some(connection_id.clone());
                // A fresh logical session needs its auth replayed right
                // after the connect request.
                if let Some(token) = self.auth_token.clone() {
                    if !self.has_queued_auth(&token) {
                        self.post(ClientFrame::Auth { token }, None, true).await;
                    }
                }
                ClientFrame::Connect { connection_id }
            }
        };
        self.post(connect_frame, None, true).await;
        self.state = ConnectionState::Connected;
        self.flush_queue().await;
    }

    fn has_queued_auth(&self, token: &str) -> bool {
        let matches_token = |frame: &ClientFrame| {
            matches!(frame, ClientFrame::Auth { token: queued } if queued == token)
        };
        self.queue.iter().any(|request| matches_token(&request.frame))
            || self
                .pending
                .values()
                .any(|request| matches_token(&request.frame))
    }

    /// The disconnect protocol: invalidate queued timers, drop requests
    /// bound to the dead connection, resubscribe actives when the logical
    /// session died, replay unacknowledged requests ahead of the preserved
    /// tail, then reconnect.
    async fn socket_did_disconnect(&mut self, error: Option<NimbusErrorCode>) {
        self.state = ConnectionState::Disconnected;
        self.cancel_heartbeat();

        for request in self.queue.iter_mut() {
            request.cancel_timeout();
        }

        let mut tail: VecDeque<QueuedRequest> = VecDeque::new();
        while let Some(mut request) = self.queue.pop_front() {
            if request.bound_to_connection() {
                request.complete(Err(connection_terminated(
                    "request discarded with its connection",
                )));
            } else {
                tail.push_back(request);
            }
        }

        let session_died = matches!(
            error,
            Some(NimbusErrorCode::ConnectionTerminated) | Some(NimbusErrorCode::Timeout)
        );

        let mut replay: VecDeque<QueuedRequest> = VecDeque::new();
        if session_died {
            self.connection_id = None;
            let order = self.subscription_order.clone();
            for subscription_id in order {
                if self.subscription_in_flight(&subscription_id, &tail) {
                    continue;
                }
                let Some(handler) = self.subscriptions.get_mut(&subscription_id) else {
                    continue;
                };
                if handler.state == HandlerState::Unsubscribing {
                    continue;
                }
                handler.state = HandlerState::Registering;
                let query = handler.query.clone();
                let internal_id = self.next_internal_id;
                self.next_internal_id += 1;
                let enqueue_seq = self.next_enqueue_seq;
                self.next_enqueue_seq += 1;
                replay.push_back(QueuedRequest {
                    internal_id,
                    frame: ClientFrame::Subscribe {
                        subscription_id,
                        query,
                    },
                    completion: None,
                    fixed_event_id: None,
                    timeout: None,
                    timeout_handle: None,
                    enqueue_seq,
                });
            }
        }

        let mut unacknowledged: Vec<QueuedRequest> = self
            .pending
            .drain()
            .map(|(_, request)| request)
            .filter(|request| !request.bound_to_connection())
            .collect();
        unacknowledged.sort_by_key(|request| request.enqueue_seq);
        replay.extend(unacknowledged);
        replay.extend(tail);
        self.queue = replay;

        self.network.go_online();
        self.state = ConnectionState::Connecting;
    }

    fn subscription_in_flight(&self, subscription_id: &str, tail: &VecDeque<QueuedRequest>) -> bool {
        let matches_sub = |frame: &ClientFrame| {
            matches!(frame, ClientFrame::Subscribe { subscription_id: queued, .. }
                if queued == subscription_id)
        };
        tail.iter().any(|request| matches_sub(&request.frame))
            || self
                .pending
                .values()
                .any(|request| matches_sub(&request.frame))
    }

    // --- inbound traffic ------------------------------------------------

    async fn handle_incoming(&mut self, text: String) {
        self.reset_heartbeat();
        let messages = match parse_server_frame(&text) {
            Ok(messages) => messages,
            Err(err) => {
                self.logger
                    .warn(format!("dropping unparseable server frame: {err}"));
                return;
            }
        };
        for message in messages {
            self.dispatch(message).await;
        }
    }

    async fn dispatch(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Ack { event_id } => {
                if let Some(mut request) = self.pending.remove(&event_id) {
                    self.on_request_acknowledged(&request.frame);
                    request.complete(Ok(()));
                } else {
                    self.logger
                        .debug(format!("ack for unknown event '{event_id}'"));
                }
            }
            ServerMessage::Error {
                event_id: Some(event_id),
                code,
                message,
            } => {
                if let Some(mut request) = self.pending.remove(&event_id) {
                    let error = NimbusError::new(
                        code,
                        message.unwrap_or_else(|| {
                            format!("server rejected '{}' request", request.frame.tag())
                        }),
                    );
                    self.on_request_failed(&request.frame, &error).await;
                    request.complete(Err(error));
                    // A rejected connect/reconnect with this code means the
                    // logical session is gone; start a fresh one.
                    if code == NimbusErrorCode::ConnectionTerminated {
                        self.network.restart(NimbusErrorCode::ConnectionTerminated);
                    }
                } else {
                    self.logger
                        .debug(format!("error for unknown event '{event_id}'"));
                }
            }
            ServerMessage::Error {
                event_id: None,
                code: NimbusErrorCode::ConnectionTerminated,
                ..
            } => {
                self.logger.info("server terminated the logical session");
                self.network.restart(NimbusErrorCode::ConnectionTerminated);
            }
            ServerMessage::Error {
                event_id: None,
                code,
                message,
            } => {
                self.logger.warn(format!(
                    "uncorrelated server error {}: {}",
                    code.wire_str(),
                    message.unwrap_or_default()
                ));
            }
            ServerMessage::Subscription(batch) => {
                self.handle_subscription_batch(batch).await;
            }
            ServerMessage::SubscriptionCancel {
                subscription_id, ..
            } => {
                if let Some(handler) = self.remove_subscription(&subscription_id) {
                    handler.deliver_error(&permission_denied(
                        "subscription cancelled by the server",
                    ));
                }
            }
            ServerMessage::FetchResponse {
                fetch_id,
                documents,
                ..
            } => {
                let pending_key = self.pending.iter().find_map(|(event_id, request)| {
                    matches!(&request.frame, ClientFrame::Fetch { fetch_id: queued, .. }
                        if *queued == fetch_id)
                    .then(|| event_id.clone())
                });
                if let Some(event_id) = pending_key {
                    if let Some(mut request) = self.pending.remove(&event_id) {
                        request.complete(Ok(()));
                    }
                }
                if let Some(reply) = self.fetches.remove(&fetch_id) {
                    let _ = reply.send(Ok(documents));
                }
            }
        }
    }

    fn on_request_acknowledged(&mut self, frame: &ClientFrame) {
        match frame {
            ClientFrame::Subscribe {
                subscription_id, ..
            } => {
                if let Some(handler) = self.subscriptions.get_mut(subscription_id) {
                    if handler.state == HandlerState::Registering {
                        handler.state = HandlerState::Subscribed;
                    }
                }
            }
            ClientFrame::Unsubscribe { subscription_id } => {
                self.remove_subscription(subscription_id);
            }
            ClientFrame::Auth { token } => {
                self.auth_token = Some(token.clone());
            }
            ClientFrame::Deauth => {
                self.auth_token = None;
            }
            _ => {}
        }
    }

    async fn on_request_failed(&mut self, frame: &ClientFrame, error: &NimbusError) {
        match frame {
            ClientFrame::Subscribe {
                subscription_id, ..
            } => {
                if let Some(handler) = self.remove_subscription(subscription_id) {
                    handler.deliver_error(error);
                }
            }
            ClientFrame::Fetch { fetch_id, .. } => {
                if let Some(reply) = self.fetches.remove(fetch_id) {
                    let _ = reply.send(Err(error.clone()));
                }
            }
            ClientFrame::Auth { token } => {
                if self.auth_token.as_deref() == Some(token.as_str()) {
                    self.auth_token = None;
                }
            }
            _ => {}
        }
    }

    async fn handle_subscription_batch(&mut self, batch: SubscriptionBatch) {
        // Every server-sent subscription event is acknowledged, known
        // handler or not.
        for event_id in batch.event_ids.clone() {
            self.enqueue_ack(&event_id);
        }
        self.flush_queue().await;

        if let Some(handler) = self.subscriptions.get_mut(&batch.subscription_id) {
            if let Some(documents) = handler.receive_batch(&batch) {
                if let Some(cache) = &self.cache {
                    cache.save_detached(
                        handler.hash.clone(),
                        documents,
                        self.auth_token.clone(),
                    );
                }
            }
        } else {
            self.logger.debug(format!(
                "dropping batch for unknown subscription '{}'",
                batch.subscription_id
            ));
        }
    }

    // --- subscriptions --------------------------------------------------

    async fn handle_subscribe(
        &mut self,
        query: Query,
        listener_id: u64,
        callback: SubscriptionCallback<CollectionUpdate>,
    ) {
        if let Err(err) = query.validate() {
            callback(Err(err));
            return;
        }

        let hash = query.subscription_hash();
        if let Some(subscription_id) = self.hash_index.get(&hash).cloned() {
            if let Some(handler) = self.subscriptions.get_mut(&subscription_id) {
                // A handler already tearing down cannot take new listeners;
                // fall through and register a fresh one under the hash.
                if handler.state != HandlerState::Unsubscribing {
                    handler.add_listener(listener_id, callback);
                    self.listener_index.insert(listener_id, subscription_id);
                    return;
                }
            }
        }

        let subscription_id = generate_id();
        let mut handler = SubscriptionHandler::new(subscription_id.clone(), query.clone());
        handler.add_listener(listener_id, callback);
        self.subscriptions.insert(subscription_id.clone(), handler);
        self.subscription_order.push(subscription_id.clone());
        self.hash_index.insert(hash.clone(), subscription_id.clone());
        self.listener_index
            .insert(listener_id, subscription_id.clone());

        if let Some(cache) = &self.cache {
            let cache = cache.clone();
            let events_tx = self.events_tx.clone();
            let secret = self.auth_token.clone();
            let cached_subscription = subscription_id.clone();
            tokio::spawn(async move {
                if let Ok(Some(documents)) = cache.load(hash, secret).await {
                    let _ = events_tx
                        .send(SessionEvent::CacheLoaded {
                            subscription_id: cached_subscription,
                            documents,
                        })
                        .await;
                }
            });
        }

        self.post(
            ClientFrame::Subscribe {
                subscription_id,
                query,
            },
            None,
            false,
        )
        .await;
    }

    async fn handle_unsubscribe(&mut self, listener_id: u64) {
        let Some(subscription_id) = self.listener_index.remove(&listener_id) else {
            return;
        };
        let Some(handler) = self.subscriptions.get_mut(&subscription_id) else {
            return;
        };
        if !handler.remove_listener(listener_id) {
            return;
        }

        // Still queued and never sent: cancel locally with no wire traffic.
        let queued_position = self.queue.iter().position(|request| {
            matches!(&request.frame, ClientFrame::Subscribe { subscription_id: queued, .. }
                if *queued == subscription_id)
        });
        if let Some(position) = queued_position {
            if let Some(mut request) = self.queue.remove(position) {
                request.cancel_timeout();
            }
            self.remove_subscription(&subscription_id);
            return;
        }

        handler.state = HandlerState::Unsubscribing;
        self.post(
            ClientFrame::Unsubscribe { subscription_id },
            None,
            false,
        )
        .await;
    }

    fn remove_subscription(&mut self, subscription_id: &str) -> Option<SubscriptionHandler> {
        let handler = self.subscriptions.remove(subscription_id)?;
        self.subscription_order
            .retain(|existing| existing != subscription_id);
        self.hash_index.retain(|_, mapped| mapped != subscription_id);
        self.listener_index
            .retain(|_, mapped| mapped != subscription_id);
        Some(handler)
    }

    // --- fetches --------------------------------------------------------

    async fn handle_fetch(
        &mut self,
        query: Query,
        reply: oneshot::Sender<NimbusResult<Vec<Document>>>,
    ) {
        if let Err(err) = query.validate() {
            let _ = reply.send(Err(err));
            return;
        }
        let fetch_id = generate_id();
        self.fetches.insert(fetch_id.clone(), reply);
        self.post(ClientFrame::Fetch { fetch_id, query }, None, false)
            .await;
    }

    // --- timers ---------------------------------------------------------

    async fn handle_request_timeout(&mut self, internal_id: u64) {
        let error = timeout_error("request timed out");

        let queued_position = self
            .queue
            .iter()
            .position(|request| request.internal_id == internal_id);
        let request = if let Some(position) = queued_position {
            self.queue.remove(position)
        } else {
            self.pending
                .iter()
                .find_map(|(event_id, request)| {
                    (request.internal_id == internal_id).then(|| event_id.clone())
                })
                .and_then(|event_id| self.pending.remove(&event_id))
        };

        let Some(mut request) = request else {
            return;
        };
        let was_connection_request = request.always_times_out();
        self.on_request_failed(&request.frame, &error).await;
        request.complete(Err(error));

        if was_connection_request {
            self.network.restart(NimbusErrorCode::Timeout);
        }
    }

    fn reset_heartbeat(&mut self) {
        self.cancel_heartbeat();
        let events_tx = self.events_tx.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            let _ = events_tx.send(SessionEvent::HeartbeatFired).await;
        }));
    }

    fn cancel_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }

    // --- teardown -------------------------------------------------------

    fn shutdown(&mut self) {
        self.cancel_heartbeat();
        let shutdown_error = default_error("database handle destroyed");
        for (_, mut request) in self.pending.drain() {
            request.complete(Err(shutdown_error.clone()));
        }
        while let Some(mut request) = self.queue.pop_front() {
            request.complete(Err(shutdown_error.clone()));
        }
        for (_, reply) in self.fetches.drain() {
            let _ = reply.send(Err(shutdown_error.clone()));
        }
        self.network.destroy();
        self.state = ConnectionState::Disconnected;
    }
}
