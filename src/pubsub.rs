//! Subscriber-mode client with a refcounted subscription registry.
//!
//! The registry is the source of truth for which channels and patterns this
//! client wants: wire traffic follows it. The first callback registered for a
//! name sends `subscribe`, removing the last one sends `unsubscribe`, and a
//! reconnect replays the whole registry onto the fresh connection so
//! subscriptions survive connection loss transparently.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use glob_match::glob_match;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::Config;
use crate::connection::frame::Frame;
use crate::connection::monitor::MonitorConfig;
use crate::connection::pipeline::{Connection, ConnectionEvent, PushMessage};
use crate::connection::transport::{TcpConnector, TransportConnector};
use crate::error::RelinkConnectionError;
use crate::event::{ClientEvent, Listener};
use crate::manager::{ConnectionManager, State};

/// Handler invoked for every delivered message. Identity (`Arc::ptr_eq`) is
/// what selective unsubscription matches on.
pub type MessageCallback = Arc<dyn Fn(&PubsubMessage) + Send + Sync>;

/// One delivered pub/sub message.
#[derive(Debug, Clone)]
pub struct PubsubMessage {
    pub channel: String,
    /// The matching pattern, for messages delivered via a pattern
    /// subscription.
    pub pattern: Option<String>,
    pub content: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SubKind {
    Channel,
    Pattern,
}

impl SubKind {
    fn subscribe_command(self) -> &'static str {
        match self {
            SubKind::Channel => "subscribe",
            SubKind::Pattern => "psubscribe",
        }
    }

    fn unsubscribe_command(self) -> &'static str {
        match self {
            SubKind::Channel => "unsubscribe",
            SubKind::Pattern => "punsubscribe",
        }
    }
}

type AckSender = oneshot::Sender<Result<(), RelinkConnectionError>>;

/// Future resolving when the server acknowledges a subscription change (or
/// immediately, when no wire traffic was needed).
pub struct Ack {
    rx: oneshot::Receiver<Result<(), RelinkConnectionError>>,
}

impl Ack {
    fn ready(result: Result<(), RelinkConnectionError>) -> Ack {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Ack { rx }
    }
}

impl Future for Ack {
    type Output = Result<(), RelinkConnectionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RelinkConnectionError::ConnectionLost)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Default)]
struct Registry {
    channels: HashMap<String, Vec<MessageCallback>>,
    patterns: HashMap<String, Vec<MessageCallback>>,
    pending_subscribe: HashMap<(SubKind, String), Vec<AckSender>>,
    pending_unsubscribe: HashMap<(SubKind, String), Vec<AckSender>>,
}

impl Registry {
    fn callbacks(&mut self, kind: SubKind) -> &mut HashMap<String, Vec<MessageCallback>> {
        match kind {
            SubKind::Channel => &mut self.channels,
            SubKind::Pattern => &mut self.patterns,
        }
    }
}

#[derive(Clone)]
pub struct PubsubClient {
    inner: Arc<PubsubInner>,
}

struct PubsubInner {
    manager: ConnectionManager,
    registry: Mutex<Registry>,
    password: Arc<Mutex<Option<String>>>,
}

impl PubsubClient {
    pub fn new(config: Config) -> PubsubClient {
        PubsubClient::with_connector(config, Arc::new(TcpConnector))
    }

    pub fn with_connector(config: Config, connector: Arc<dyn TransportConnector>) -> PubsubClient {
        let password = Arc::new(Mutex::new(config.password.clone()));
        let monitor_config = MonitorConfig {
            activity_timeout: config.activity_timeout,
            response_timeout: config.response_timeout,
        };

        let factory = {
            let connector = connector.clone();
            let password = password.clone();
            let host = config.host.clone();
            let port = config.port;
            move || {
                let connector = connector.clone();
                let password = password.clone();
                let host = host.clone();
                let monitor_config = monitor_config.clone();
                async move {
                    let (transport, events) = connector.connect(&host, port).await?;
                    let conn = Connection::new(transport, events, monitor_config, true);
                    conn.ready().await?;

                    let secret = password.lock().unwrap().clone();
                    if let Some(secret) = secret {
                        let auth = conn
                            .send(vec![Bytes::from_static(b"auth"), Bytes::from(secret)])
                            .await;
                        if let Err(e) = auth {
                            warn!("subscriber auth failed: {}", e);
                            conn.close();
                            return Err(RelinkConnectionError::Setup(format!(
                                "auth rejected: {}",
                                e
                            )));
                        }
                    }

                    Ok(conn)
                }
            }
        };

        let manager = ConnectionManager::new(
            Arc::new(factory),
            config.reconnect_timeout,
            config.max_reconnect_attempts,
        );

        let client = PubsubClient {
            inner: Arc::new(PubsubInner {
                manager,
                registry: Mutex::new(Registry::default()),
                password,
            }),
        };

        let hook = Arc::downgrade(&client.inner);
        client.inner.manager.on(Arc::new(move |event| {
            if let Some(inner) = hook.upgrade() {
                match event {
                    ClientEvent::Connected => on_connected(&inner),
                    ClientEvent::Disconnected => flush_unsubscribes(&inner),
                    ClientEvent::Failed => reject_pending(&inner),
                    _ => {}
                }
            }
        }));

        client
    }

    pub async fn connect(&self) -> Result<(), RelinkConnectionError> {
        self.inner.manager.connect();
        self.inner.manager.wait_ready().await
    }

    pub fn reconnect(&self) {
        self.inner.manager.reconnect();
    }

    pub fn state(&self) -> State {
        self.inner.manager.state()
    }

    pub fn on(&self, listener: Listener<ClientEvent>) {
        self.inner.manager.on(listener);
    }

    /// Registers a callback for a channel. Resolves once the server has
    /// acknowledged the subscription; immediately when the channel was
    /// already subscribed.
    pub fn subscribe(&self, channel: &str, callback: MessageCallback) -> Ack {
        self.register(SubKind::Channel, channel, callback)
    }

    /// Registers a callback for a glob-style pattern.
    pub fn psubscribe(&self, pattern: &str, callback: MessageCallback) -> Ack {
        self.register(SubKind::Pattern, pattern, callback)
    }

    /// Drops every callback for a channel and unsubscribes on the wire.
    pub fn unsubscribe(&self, channel: &str) -> Ack {
        self.unregister(SubKind::Channel, channel, None)
    }

    /// Removes one callback by identity. Only when it was the last one does
    /// the channel leave the wire.
    pub fn unsubscribe_callback(&self, channel: &str, callback: &MessageCallback) -> Ack {
        self.unregister(SubKind::Channel, channel, Some(callback))
    }

    pub fn punsubscribe(&self, pattern: &str) -> Ack {
        self.unregister(SubKind::Pattern, pattern, None)
    }

    pub fn punsubscribe_callback(&self, pattern: &str, callback: &MessageCallback) -> Ack {
        self.unregister(SubKind::Pattern, pattern, Some(callback))
    }

    /// Subscribes and exposes deliveries as a stream instead of a callback.
    /// The subscription lives until `unsubscribe` is called for the channel.
    pub fn subscribe_stream(&self, channel: &str) -> (Ack, UnboundedReceiverStream<PubsubMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: MessageCallback = Arc::new(move |message: &PubsubMessage| {
            let _ = tx.send(message.clone());
        });
        let ack = self.subscribe(channel, callback);
        (ack, UnboundedReceiverStream::new(rx))
    }

    fn register(&self, kind: SubKind, name: &str, callback: MessageCallback) -> Ack {
        let mut registry = self.inner.registry.lock().unwrap();
        if self.inner.manager.state() == State::Failed {
            return Ack::ready(Err(RelinkConnectionError::ClientFailed));
        }

        let entry = registry.callbacks(kind).entry(name.to_string()).or_default();
        let known = !entry.is_empty();
        if !entry.iter().any(|cb| Arc::ptr_eq(cb, &callback)) {
            entry.push(callback);
        }
        if known {
            // Already subscribed at the wire level, nothing to wait for.
            return Ack::ready(Ok(()));
        }

        let (tx, rx) = oneshot::channel();
        registry
            .pending_subscribe
            .entry((kind, name.to_string()))
            .or_default()
            .push(tx);

        if self.inner.manager.state() == State::Connected {
            if let Some(conn) = self.inner.manager.connection() {
                send_subscription(&conn, kind.subscribe_command(), name);
            }
        }
        // Otherwise the registry replay on the next Connected sends it.

        Ack { rx }
    }

    fn unregister(&self, kind: SubKind, name: &str, callback: Option<&MessageCallback>) -> Ack {
        let mut registry = self.inner.registry.lock().unwrap();

        let emptied = {
            let map = registry.callbacks(kind);
            match map.get_mut(name) {
                None => return Ack::ready(Ok(())),
                Some(entry) => {
                    match callback {
                        Some(target) => entry.retain(|cb| !Arc::ptr_eq(cb, target)),
                        None => entry.clear(),
                    }
                    if entry.is_empty() {
                        map.remove(name);
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if !emptied {
            return Ack::ready(Ok(()));
        }

        // Orphan any subscribe ack still pending for this name; the
        // subscription is gone before it was ever confirmed.
        if let Some(acks) = registry.pending_subscribe.remove(&(kind, name.to_string())) {
            for tx in acks {
                let _ = tx.send(Ok(()));
            }
        }

        if self.inner.manager.state() == State::Connected {
            if let Some(conn) = self.inner.manager.connection() {
                let (tx, rx) = oneshot::channel();
                registry
                    .pending_unsubscribe
                    .entry((kind, name.to_string()))
                    .or_default()
                    .push(tx);
                send_subscription(&conn, kind.unsubscribe_command(), name);
                return Ack { rx };
            }
        }

        // Not on the wire right now, so there is nothing to tear down.
        Ack::ready(Ok(()))
    }
}

fn send_subscription(conn: &Connection, command: &str, name: &str) {
    debug!("{} {}", command, name);
    conn.send_forget(&[Bytes::from(command.to_string()), Bytes::from(name.to_string())]);
}

/// Replays the registry onto the fresh connection and wires up push routing.
fn on_connected(inner: &Arc<PubsubInner>) {
    let conn = match inner.manager.connection() {
        Some(conn) => conn,
        None => return,
    };

    let hook = Arc::downgrade(inner);
    conn.on(Arc::new(move |event| {
        if let ConnectionEvent::Push(push) = event {
            if let Some(inner) = hook.upgrade() {
                handle_push(&inner, push);
            }
        }
    }));

    let (channels, patterns) = {
        let registry = inner.registry.lock().unwrap();
        let channels: Vec<String> = registry.channels.keys().cloned().collect();
        let patterns: Vec<String> = registry.patterns.keys().cloned().collect();
        (channels, patterns)
    };

    if !channels.is_empty() || !patterns.is_empty() {
        debug!(
            "resubscribing {} channels, {} patterns",
            channels.len(),
            patterns.len()
        );
    }
    for channel in channels {
        send_subscription(&conn, SubKind::Channel.subscribe_command(), &channel);
    }
    for pattern in patterns {
        send_subscription(&conn, SubKind::Pattern.subscribe_command(), &pattern);
    }
}

/// Resolves unsubscribe acks left hanging by a dropped connection. The
/// subscription died with the session, so the teardown is already complete;
/// the reconnect replay only resends what is still registered.
fn flush_unsubscribes(inner: &Arc<PubsubInner>) {
    let pending: Vec<AckSender> = {
        let mut registry = inner.registry.lock().unwrap();
        registry
            .pending_unsubscribe
            .drain()
            .flat_map(|(_, acks)| acks)
            .collect()
    };
    for tx in pending {
        let _ = tx.send(Ok(()));
    }
}

fn reject_pending(inner: &Arc<PubsubInner>) {
    let mut registry = inner.registry.lock().unwrap();
    for (_, acks) in registry.pending_subscribe.drain() {
        for tx in acks {
            let _ = tx.send(Err(RelinkConnectionError::ClientFailed));
        }
    }
    for (_, acks) in registry.pending_unsubscribe.drain() {
        for tx in acks {
            let _ = tx.send(Ok(()));
        }
    }
}

fn handle_push(inner: &Arc<PubsubInner>, push: &PushMessage) {
    match push.kind.as_str() {
        "message" => {
            let (channel, content) = match (
                push.args.first().and_then(frame_string),
                push.args.get(1).and_then(frame_bytes),
            ) {
                (Some(c), Some(p)) => (c, p),
                _ => return,
            };
            let callbacks = {
                let registry = inner.registry.lock().unwrap();
                registry.channels.get(&channel).cloned().unwrap_or_default()
            };
            let message = PubsubMessage {
                channel,
                pattern: None,
                content,
            };
            for callback in callbacks {
                callback(&message);
            }
        }
        "pmessage" => {
            let (pattern, channel, content) = match (
                push.args.first().and_then(frame_string),
                push.args.get(1).and_then(frame_string),
                push.args.get(2).and_then(frame_bytes),
            ) {
                (Some(pat), Some(c), Some(p)) => (pat, c, p),
                _ => return,
            };
            let callbacks = {
                let registry = inner.registry.lock().unwrap();
                match registry.patterns.get(&pattern) {
                    Some(callbacks) => callbacks.clone(),
                    // The delivering pattern is not registered verbatim;
                    // fall back to matching registered patterns ourselves.
                    None => registry
                        .patterns
                        .iter()
                        .filter(|(candidate, _)| glob_match(candidate, &channel))
                        .flat_map(|(_, callbacks)| callbacks.iter().cloned())
                        .collect(),
                }
            };
            let message = PubsubMessage {
                channel,
                pattern: Some(pattern),
                content,
            };
            for callback in callbacks {
                callback(&message);
            }
        }
        "subscribe" | "psubscribe" => {
            resolve_acks(inner, push, false);
        }
        "unsubscribe" | "punsubscribe" => {
            resolve_acks(inner, push, true);
        }
        _ => {}
    }
}

fn resolve_acks(inner: &Arc<PubsubInner>, push: &PushMessage, unsubscribe: bool) {
    let name = match push.args.first().and_then(frame_string) {
        Some(name) => name,
        None => return,
    };
    let kind = if push.kind.starts_with('p') {
        SubKind::Pattern
    } else {
        SubKind::Channel
    };

    let acks = {
        let mut registry = inner.registry.lock().unwrap();
        let pending = if unsubscribe {
            &mut registry.pending_unsubscribe
        } else {
            &mut registry.pending_subscribe
        };
        pending.remove(&(kind, name)).unwrap_or_default()
    };
    for tx in acks {
        let _ = tx.send(Ok(()));
    }
}

fn frame_string(frame: &Frame) -> Option<String> {
    match frame {
        Frame::Simple(s) => Some(s.clone()),
        Frame::Bulk(data) => str::from_utf8(data).ok().map(str::to_string),
        _ => None,
    }
}

fn frame_bytes(frame: &Frame) -> Option<Bytes> {
    match frame {
        Frame::Simple(s) => Some(Bytes::from(s.clone())),
        Frame::Bulk(data) => Some(data.clone()),
        _ => None,
    }
}
