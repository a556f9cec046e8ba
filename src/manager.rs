//! Reconnecting supervisor for a replaceable connection resource.
//!
//! The manager owns zero or one [`Connection`] and runs the
//! connect/backoff/retry state machine around an injected factory. It never
//! builds connections itself; the command and pub/sub clients supply
//! factories that perform transport connect plus protocol setup, so a setup
//! failure retries exactly like a transport failure.
//!
//! State transitions:
//!
//! ```text
//! Initial -> Connecting        first connect request
//! Connecting -> Connected      factory success
//! Connecting -> Disconnected   factory failure (delayed retry)
//! Connected -> Disconnected    live connection closed (immediate retry)
//! Disconnected -> Connecting   automatic or manual retry
//! Disconnected -> Failed       attempt budget exhausted
//! Failed -> Connecting         manual recovery via reconnect()
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::pipeline::{Connection, ConnectionEvent};
use crate::error::RelinkConnectionError;
use crate::event::{ClientEvent, EventEmitter, Listener};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Produces ready-to-use connections. A rejected future is retried subject
/// to the attempt budget.
pub trait ConnectionFactory: Send + Sync + 'static {
    fn connect(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Connection, RelinkConnectionError>> + Send>>;
}

impl<F, Fut> ConnectionFactory for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Connection, RelinkConnectionError>> + Send + 'static,
{
    fn connect(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Connection, RelinkConnectionError>> + Send>> {
        Box::pin((self)())
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Mutex<ManagerInner>>,
    emitter: Arc<EventEmitter<ClientEvent>>,
    factory: Arc<dyn ConnectionFactory>,
    state_tx: Arc<watch::Sender<State>>,
    reconnect_timeout: Duration,
    max_attempts: u32,
}

struct ManagerInner {
    state: State,
    connection: Option<Connection>,
    /// Identity of the active connection; close notifications carrying a
    /// stale serial are ignored.
    conn_serial: u64,
    /// Identity of the in-flight connect attempt. `reconnect()` while
    /// `Connecting` bumps it, so the original result is recognized as stale.
    attempt_serial: u64,
    /// Whether a factory call for the current serial is still running.
    attempt_pending: bool,
    /// Consecutive failed attempts; reset on reaching `Connected`.
    attempt: u32,
    timer_serial: u64,
    retry_timer: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        reconnect_timeout: Duration,
        max_attempts: u32,
    ) -> ConnectionManager {
        let (state_tx, _state_rx) = watch::channel(State::Initial);
        ConnectionManager {
            inner: Arc::new(Mutex::new(ManagerInner {
                state: State::Initial,
                connection: None,
                conn_serial: 0,
                attempt_serial: 0,
                attempt_pending: false,
                attempt: 0,
                timer_serial: 0,
                retry_timer: None,
            })),
            emitter: Arc::new(EventEmitter::new()),
            factory,
            state_tx: Arc::new(state_tx),
            reconnect_timeout,
            max_attempts,
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// The current live connection. Only meaningful while `state()` is
    /// `Connected`; a `None` or stale handle at other times is expected.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.lock().unwrap().connection.clone()
    }

    pub fn on(&self, listener: Listener<ClientEvent>) {
        self.emitter.on(listener);
    }

    /// Starts connecting if never connected before. No-op in every other
    /// state.
    pub fn connect(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Initial {
            self.enter_connecting(&mut inner);
        }
    }

    /// Forces a fresh connection, whatever the current state:
    /// cancels an in-flight attempt, closes a live connection, or bypasses a
    /// pending backoff timer.
    pub fn reconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Initial => self.enter_connecting(&mut inner),
            State::Connecting => {
                // Invalidate the in-flight attempt. Its eventual result is
                // discarded and the attempt restarted (see attempt_finished).
                debug!("cancelling in-flight connect attempt");
                inner.attempt_serial += 1;
                inner.attempt_pending = false;
            }
            State::Connected => {
                // Closing surfaces as Connected -> Disconnected, which
                // retries immediately.
                if let Some(conn) = inner.connection.clone() {
                    drop(inner);
                    conn.close();
                }
            }
            State::Disconnected | State::Failed => self.enter_connecting(&mut inner),
        }
    }

    /// Resolves when the manager reaches `Connected`; fails once it reaches
    /// `Failed`.
    pub async fn wait_ready(&self) -> Result<(), RelinkConnectionError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                State::Connected => return Ok(()),
                State::Failed => return Err(RelinkConnectionError::ClientFailed),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(RelinkConnectionError::ConnectionLost);
            }
        }
    }

    fn set_state(&self, inner: &mut ManagerInner, state: State) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn enter_connecting(&self, inner: &mut MutexGuard<'_, ManagerInner>) {
        if let Some(timer) = inner.retry_timer.take() {
            timer.abort();
        }
        inner.timer_serial += 1;
        self.set_state(inner, State::Connecting);
        inner.attempt_serial += 1;
        inner.attempt_pending = true;
        self.spawn_attempt(inner.attempt_serial);
    }

    fn spawn_attempt(&self, serial: u64) {
        let manager = self.clone();
        let factory = self.factory.clone();
        tokio::spawn(async move {
            let result = factory.connect().await;
            manager.attempt_finished(serial, result);
        });
    }

    fn attempt_finished(&self, serial: u64, result: Result<Connection, RelinkConnectionError>) {
        let mut inner = self.inner.lock().unwrap();

        if serial != inner.attempt_serial {
            // This attempt was cancelled while in flight. Close a
            // too-late connection and, if nothing else has restarted the
            // machine, begin a fresh attempt.
            let restart = inner.state == State::Connecting && !inner.attempt_pending;
            if restart {
                inner.attempt_serial += 1;
                inner.attempt_pending = true;
                self.spawn_attempt(inner.attempt_serial);
            }
            drop(inner);
            if let Ok(conn) = result {
                debug!("discarding connection from cancelled attempt");
                conn.close();
            }
            return;
        }

        inner.attempt_pending = false;
        match result {
            Ok(conn) => {
                inner.conn_serial += 1;
                let conn_serial = inner.conn_serial;
                inner.connection = Some(conn.clone());
                self.set_state(&mut inner, State::Connected);
                let reconnected = inner.attempt > 0;
                inner.attempt = 0;
                drop(inner);

                let manager = self.clone();
                conn.on(Arc::new(move |event| {
                    if matches!(
                        event,
                        ConnectionEvent::Disconnected | ConnectionEvent::ConnectFailed
                    ) {
                        manager.connection_closed(conn_serial);
                    }
                }));

                self.emitter.emit(&ClientEvent::Connected);
                if reconnected {
                    self.emitter.emit(&ClientEvent::Reconnected);
                }

                // The connection may have died between factory success and
                // listener registration; connection_closed is idempotent.
                if conn.is_closed() {
                    self.connection_closed(conn_serial);
                }
            }
            Err(e) => {
                debug!("connect attempt failed: {}", e);
                self.set_state(&mut inner, State::Disconnected);
                inner.connection = None;
                drop(inner);
                self.after_disconnect(State::Connecting);
            }
        }
    }

    /// Close notification from a connection; ignored unless it is still the
    /// active one.
    fn connection_closed(&self, conn_serial: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Connected || inner.conn_serial != conn_serial {
            return;
        }
        self.set_state(&mut inner, State::Disconnected);
        inner.connection = None;
        drop(inner);
        self.after_disconnect(State::Connected);
    }

    /// Retry bookkeeping after entering `Disconnected`. `origin` is the state
    /// the transition came from: a lost session retries immediately, a failed
    /// attempt backs off first.
    ///
    /// Every emission hands control to listeners that may call `connect()` or
    /// `reconnect()` and move the state machine themselves, so the state is
    /// re-checked after each one and the retry abandoned if it changed.
    fn after_disconnect(&self, origin: State) {
        if origin == State::Connected {
            self.emitter.emit(&ClientEvent::Disconnected);
        }

        let attempt;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Disconnected {
                return;
            }
            if inner.attempt >= self.max_attempts {
                self.set_state(&mut inner, State::Failed);
                drop(inner);
                warn!("giving up after {} failed attempts", self.max_attempts);
                self.emitter.emit(&ClientEvent::Failed);
                return;
            }
            inner.attempt += 1;
            attempt = inner.attempt;
        }
        self.emitter.emit(&ClientEvent::ReconnectFailed(attempt));

        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Disconnected {
            return;
        }
        if origin == State::Connected {
            // A lost session retries right away; only a failed attempt
            // backs off.
            self.enter_connecting(&mut inner);
        } else {
            inner.timer_serial += 1;
            let serial = inner.timer_serial;
            let delay = self.reconnect_timeout;
            debug!("retrying connection in {:?}", delay);
            let manager = self.clone();
            inner.retry_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                manager.retry_fired(serial);
            }));
        }
    }

    fn retry_fired(&self, serial: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.timer_serial == serial && inner.state == State::Disconnected {
            self.enter_connecting(&mut inner);
        }
    }
}
