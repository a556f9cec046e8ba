//! One live transport session supporting pipelined requests.
//!
//! Every `send` appends a pending-reply entry to a FIFO queue and writes the
//! encoded command; every decoded reply resolves the entry at the head. The
//! two always move in lockstep: a reply with no pending entry means the
//! stream is desynchronized, which is unrecoverable for this connection
//! instance.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::str;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use log::{debug, error, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use crate::connection::frame::{self, Frame};
use crate::connection::monitor::{InactivityMonitor, MonitorConfig};
use crate::connection::reader::FrameReader;
use crate::connection::transport::{Transport, TransportEvent};
use crate::error::RelinkConnectionError;
use crate::event::{EventEmitter, Listener};

/// Push-type frames that bypass the pending-reply queue on subscriber
/// connections.
const PUSH_KINDS: [&str; 6] = [
    "message",
    "pmessage",
    "subscribe",
    "unsubscribe",
    "psubscribe",
    "punsubscribe",
];

/// Notifications emitted by a connection over its lifetime.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The transport completed its handshake; the connection is usable.
    Connected,
    /// Closed after having been ready: an established session was lost.
    Disconnected,
    /// Closed before ever becoming ready.
    ConnectFailed,
    /// A reply arrived with no pending command. The connection closes itself
    /// immediately after emitting this.
    OutOfSync,
    /// A pub/sub frame (message delivery or subscription acknowledgment).
    Push(PushMessage),
}

#[derive(Debug, Clone)]
pub struct PushMessage {
    pub kind: String,
    pub args: Vec<Frame>,
}

type ReplySender = oneshot::Sender<Result<Frame, RelinkConnectionError>>;

/// Future for one command's reply. Resolves with the decoded frame, or an
/// error if the server rejected the command or the connection was lost.
pub struct Reply {
    rx: oneshot::Receiver<Result<Frame, RelinkConnectionError>>,
}

impl Reply {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Frame, RelinkConnectionError>>) -> Reply {
        Reply { rx }
    }
}

impl Future for Reply {
    type Output = Result<Frame, RelinkConnectionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RelinkConnectionError::ConnectionLost)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Cheaply cloneable handle to one pipelined connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Mutex<ConnInner>>,
    emitter: Arc<EventEmitter<ConnectionEvent>>,
}

struct ConnInner {
    transport: Box<dyn Transport>,
    pending: VecDeque<ReplySender>,
    reader: FrameReader,
    monitor: Option<InactivityMonitor>,
    monitor_config: MonitorConfig,
    pubsub_mode: bool,
    ready: bool,
    closed: bool,
    ready_waiters: Vec<oneshot::Sender<Result<(), RelinkConnectionError>>>,
}

enum Routed {
    Done,
    Push(PushMessage),
    OutOfSync,
}

impl Connection {
    /// Wraps a transport and starts the driver task consuming its events.
    /// `pubsub_mode` routes push-type frames past the pending queue.
    pub fn new(
        transport: Box<dyn Transport>,
        events: UnboundedReceiver<TransportEvent>,
        monitor_config: MonitorConfig,
        pubsub_mode: bool,
    ) -> Connection {
        let conn = Connection {
            inner: Arc::new(Mutex::new(ConnInner {
                transport,
                pending: VecDeque::new(),
                reader: FrameReader::new(),
                monitor: None,
                monitor_config,
                pubsub_mode,
                ready: false,
                closed: false,
                ready_waiters: Vec::new(),
            })),
            emitter: Arc::new(EventEmitter::new()),
        };

        let driver = conn.clone();
        let mut events = events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                driver.handle_transport_event(event);
            }
        });

        conn
    }

    pub fn on(&self, listener: Listener<ConnectionEvent>) {
        self.emitter.on(listener);
    }

    /// Sends a command, appending a pending-reply entry. Entries resolve in
    /// exactly the order their commands were sent.
    pub fn send(&self, args: Vec<Bytes>) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.send_prepared(tx, args);
        Reply::new(rx)
    }

    /// Sends a command resolving an already-created pending entry. Used by
    /// the command queue so replayed commands keep their original futures.
    pub(crate) fn send_prepared(&self, tx: ReplySender, args: Vec<Bytes>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            drop(inner);
            let _ = tx.send(Err(RelinkConnectionError::ConnectionLost));
            return;
        }
        let data = frame::encode_command(&args);
        inner.pending.push_back(tx);
        inner.transport.send(data);
    }

    /// Writes a command without registering a pending reply. Only correct for
    /// subscriber-mode commands whose acknowledgments arrive as push frames.
    pub(crate) fn send_forget(&self, args: &[Bytes]) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        let data = frame::encode_command(args);
        inner.transport.send(data);
    }

    pub(crate) fn send_keepalive(&self) {
        let pubsub_mode = self.inner.lock().unwrap().pubsub_mode;
        let args = vec![Bytes::from_static(b"ping")];
        if pubsub_mode {
            // In subscriber mode the pong comes back outside the
            // request/reply pairing and is ignored by the router.
            self.send_forget(&args);
        } else {
            // The reply consumes its queue slot; nobody is waiting on it.
            let _ = self.send(args);
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.transport.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Resolves once the transport reports connected, or fails if it closes
    /// first.
    pub fn ready(&self) -> impl Future<Output = Result<(), RelinkConnectionError>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.ready {
                let _ = tx.send(Ok(()));
            } else if inner.closed {
                let _ = tx.send(Err(RelinkConnectionError::ConnectionLost));
            } else {
                inner.ready_waiters.push(tx);
            }
        }
        async move {
            rx.await
                .unwrap_or(Err(RelinkConnectionError::ConnectionLost))
        }
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.handle_connected(),
            TransportEvent::Received(data) => self.handle_received(data),
            TransportEvent::Closed => self.handle_closed(),
        }
    }

    fn handle_connected(&self) {
        let waiters;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.ready || inner.closed {
                return;
            }
            inner.ready = true;
            inner.monitor = InactivityMonitor::start(inner.monitor_config.clone(), self.clone());
            waiters = std::mem::take(&mut inner.ready_waiters);
        }
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        self.emitter.emit(&ConnectionEvent::Connected);
    }

    fn handle_received(&self, data: Bytes) {
        let mut pushes = Vec::new();
        let mut desync = false;
        let mut malformed = false;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            if let Some(monitor) = &inner.monitor {
                monitor.touch();
            }
            inner.reader.feed(&data);
            loop {
                match inner.reader.next() {
                    Ok(Some(frame)) => match inner.route_frame(frame) {
                        Routed::Done => {}
                        Routed::Push(push) => pushes.push(push),
                        Routed::OutOfSync => {
                            desync = true;
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        error!("failed to decode reply: {}", e);
                        malformed = true;
                        break;
                    }
                }
            }
        }

        for push in pushes {
            self.emitter.emit(&ConnectionEvent::Push(push));
        }
        if desync {
            warn!("reply received with no pending command, closing connection");
            self.emitter.emit(&ConnectionEvent::OutOfSync);
            self.close();
        } else if malformed {
            self.close();
        }
    }

    fn handle_closed(&self) {
        let pending;
        let waiters;
        let was_ready;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            if let Some(monitor) = inner.monitor.take() {
                monitor.stop();
            }
            pending = std::mem::take(&mut inner.pending);
            waiters = std::mem::take(&mut inner.ready_waiters);
            was_ready = inner.ready;
        }

        if !pending.is_empty() {
            debug!("rejecting {} in-flight commands", pending.len());
        }
        for tx in pending {
            let _ = tx.send(Err(RelinkConnectionError::ConnectionLost));
        }
        for tx in waiters {
            let _ = tx.send(Err(RelinkConnectionError::ConnectionLost));
        }

        if was_ready {
            self.emitter.emit(&ConnectionEvent::Disconnected);
        } else {
            self.emitter.emit(&ConnectionEvent::ConnectFailed);
        }
    }
}

impl ConnInner {
    fn route_frame(&mut self, frame: Frame) -> Routed {
        if self.pubsub_mode {
            if let Some(push) = as_push(&frame) {
                return Routed::Push(push);
            }
        }

        if let Some(tx) = self.pending.pop_front() {
            let result = match frame {
                Frame::Error(msg) => Err(RelinkConnectionError::Command(msg)),
                frame => Ok(frame),
            };
            let _ = tx.send(result);
            Routed::Done
        } else if self.pubsub_mode && is_pong(&frame) {
            // Keepalive reply on a subscriber connection; nothing pends on it.
            Routed::Done
        } else {
            Routed::OutOfSync
        }
    }
}

fn frame_text(frame: &Frame) -> Option<&str> {
    match frame {
        Frame::Simple(s) => Some(s.as_str()),
        Frame::Bulk(data) => str::from_utf8(data).ok(),
        _ => None,
    }
}

fn as_push(frame: &Frame) -> Option<PushMessage> {
    if let Frame::Array(parts) = frame {
        let kind = frame_text(parts.first()?)?;
        if PUSH_KINDS.contains(&kind) {
            return Some(PushMessage {
                kind: kind.to_string(),
                args: parts[1..].to_vec(),
            });
        }
    }
    None
}

fn is_pong(frame: &Frame) -> bool {
    match frame {
        Frame::Simple(s) => s.eq_ignore_ascii_case("pong"),
        Frame::Array(parts) => parts
            .first()
            .and_then(frame_text)
            .map(|kind| kind.eq_ignore_ascii_case("pong"))
            .unwrap_or(false),
        _ => false,
    }
}
