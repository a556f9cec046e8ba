//! Command client: protocol setup plus ordered command queueing atop the
//! lifecycle manager.
//!
//! Commands may be issued at any time. While no usable connection exists they
//! are buffered and replayed in issue order the moment setup completes, so
//! ordering across a reconnect is indistinguishable from ordering on one
//! unbroken connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::oneshot;

use crate::config::Config;
use crate::connection::frame::Frame;
use crate::connection::monitor::MonitorConfig;
use crate::connection::pipeline::{Connection, Reply};
use crate::connection::transport::{TcpConnector, TransportConnector};
use crate::error::{RelinkClientError, RelinkConnectionError};
use crate::event::{ClientEvent, Listener};
use crate::manager::{ConnectionManager, State};

/// Connects and waits until the client is usable. Convenience for the common
/// case; construct a [`Client`] directly to connect lazily.
pub async fn connect(uri: &str) -> Result<Client, RelinkClientError> {
    let config = Config::from_uri(uri)?;
    let client = Client::new(config);
    client.connect().await?;
    Ok(client)
}

/// Lifecycle state as reported by the client. Mirrors the manager's state,
/// with the factory's auth/select phase surfaced as `SettingUp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Initial,
    Connecting,
    SettingUp,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    manager: ConnectionManager,
    /// Commands buffered while no connection is usable.
    queue: Mutex<VecDeque<QueuedCommand>>,
    /// Setup values reused by every reconnect. `select`/`auth` update them so
    /// recovery replays the latest.
    setup: Arc<Mutex<SetupConfig>>,
    setting_up: Arc<AtomicBool>,
}

struct QueuedCommand {
    tx: oneshot::Sender<Result<Frame, RelinkConnectionError>>,
    args: Vec<Bytes>,
}

struct SetupConfig {
    password: Option<String>,
    db: u32,
}

impl Client {
    pub fn new(config: Config) -> Client {
        Client::with_connector(config, Arc::new(TcpConnector))
    }

    /// Builds a client over an injected transport connector. The production
    /// path uses [`TcpConnector`]; tests supply in-memory transports.
    pub fn with_connector(config: Config, connector: Arc<dyn TransportConnector>) -> Client {
        let setup = Arc::new(Mutex::new(SetupConfig {
            password: config.password.clone(),
            db: config.db,
        }));
        let setting_up = Arc::new(AtomicBool::new(false));
        let monitor_config = MonitorConfig {
            activity_timeout: config.activity_timeout,
            response_timeout: config.response_timeout,
        };

        let factory = {
            let connector = connector.clone();
            let setup = setup.clone();
            let setting_up = setting_up.clone();
            let host = config.host.clone();
            let port = config.port;
            move || {
                let connector = connector.clone();
                let setup = setup.clone();
                let setting_up = setting_up.clone();
                let host = host.clone();
                let monitor_config = monitor_config.clone();
                async move {
                    let (transport, events) = connector.connect(&host, port).await?;
                    let conn = Connection::new(transport, events, monitor_config, false);
                    conn.ready().await?;

                    setting_up.store(true, Ordering::SeqCst);
                    let result = setup_connection(&conn, &setup).await;
                    setting_up.store(false, Ordering::SeqCst);

                    match result {
                        Ok(()) => Ok(conn),
                        Err(e) => {
                            warn!("connection setup failed: {}", e);
                            // The manager never saw this connection, so the
                            // close stays silent and the factory error drives
                            // the normal failure/backoff path.
                            conn.close();
                            Err(e)
                        }
                    }
                }
            }
        };

        let manager = ConnectionManager::new(
            Arc::new(factory),
            config.reconnect_timeout,
            config.max_reconnect_attempts,
        );

        let client = Client {
            inner: Arc::new(ClientInner {
                manager,
                queue: Mutex::new(VecDeque::new()),
                setup,
                setting_up,
            }),
        };

        let hook = Arc::downgrade(&client.inner);
        client.inner.manager.on(Arc::new(move |event| {
            if let Some(inner) = hook.upgrade() {
                match event {
                    ClientEvent::Connected => drain_queue(&inner),
                    ClientEvent::Failed => reject_queue(&inner),
                    _ => {}
                }
            }
        }));

        client
    }

    /// Connects (first time) and resolves once the client is usable, or
    /// fails once the attempt budget is exhausted.
    pub async fn connect(&self) -> Result<(), RelinkConnectionError> {
        self.inner.manager.connect();
        self.inner.manager.wait_ready().await
    }

    /// Forces a fresh connection; also the manual recovery call after
    /// `Failed`.
    pub fn reconnect(&self) {
        self.inner.manager.reconnect();
    }

    pub fn state(&self) -> ClientState {
        match self.inner.manager.state() {
            State::Connecting if self.inner.setting_up.load(Ordering::SeqCst) => {
                ClientState::SettingUp
            }
            State::Initial => ClientState::Initial,
            State::Connecting => ClientState::Connecting,
            State::Connected => ClientState::Connected,
            State::Disconnected => ClientState::Disconnected,
            State::Failed => ClientState::Failed,
        }
    }

    pub fn on(&self, listener: Listener<ClientEvent>) {
        self.inner.manager.on(listener);
    }

    /// Issues a command. Always returns a future: rejected immediately in
    /// `Failed`, sent directly when usable, queued otherwise.
    pub fn issue(&self, command: &str, args: &[Bytes]) -> Reply {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Bytes::from(command.to_string()));
        full.extend_from_slice(args);
        self.issue_args(full)
    }

    fn issue_args(&self, args: Vec<Bytes>) -> Reply {
        let (tx, rx) = oneshot::channel();

        // The queue lock is the ordering point: while it is held by a drain,
        // direct sends wait, so replayed commands stay ahead of new ones.
        let mut queue = self.inner.queue.lock().unwrap();
        match self.inner.manager.state() {
            State::Failed => {
                drop(queue);
                let _ = tx.send(Err(RelinkConnectionError::ClientFailed));
            }
            State::Connected if queue.is_empty() => match self.inner.manager.connection() {
                Some(conn) => conn.send_prepared(tx, args),
                None => {
                    let _ = tx.send(Err(RelinkConnectionError::ConnectionLost));
                }
            },
            _ => queue.push_back(QueuedCommand { tx, args }),
        }

        Reply::new(rx)
    }

    /// Selects a database, and stores the index so reconnects redo setup
    /// against the same database.
    pub async fn select(&self, db: u32) -> Result<(), RelinkConnectionError> {
        self.inner.setup.lock().unwrap().db = db;
        let args = [Bytes::from(db.to_string())];
        expect_ok(self.issue("select", &args).await?)
    }

    /// Re-authenticates, and stores the password for future reconnects.
    pub async fn auth(&self, password: &str) -> Result<(), RelinkConnectionError> {
        self.inner.setup.lock().unwrap().password = Some(password.to_string());
        let args = [Bytes::from(password.to_string())];
        expect_ok(self.issue("auth", &args).await?)
    }

    pub async fn ping(&self, msg: Option<String>) -> Result<Bytes, RelinkConnectionError> {
        let args: Vec<Bytes> = msg.map(Bytes::from).into_iter().collect();
        let response = self.issue("ping", &args).await?;
        debug!("ping response: {:?}", response);
        match response {
            Frame::Simple(v) => Ok(v.into()),
            Frame::Bulk(v) => Ok(v),
            frame => Err(RelinkConnectionError::Command(frame.to_string())),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, RelinkConnectionError> {
        let args = [Bytes::from(key.to_string())];
        match self.issue("get", &args).await? {
            Frame::Simple(v) => Ok(Some(v.into())),
            Frame::Bulk(v) => Ok(Some(v)),
            Frame::Null => Ok(None),
            frame => Err(RelinkConnectionError::Command(frame.to_string())),
        }
    }

    pub async fn set(&self, key: &str, value: Bytes) -> Result<(), RelinkConnectionError> {
        let args = [Bytes::from(key.to_string()), value];
        expect_ok(self.issue("set", &args).await?)
    }

    pub async fn del(&self, key: &str) -> Result<u64, RelinkConnectionError> {
        let args = [Bytes::from(key.to_string())];
        match self.issue("del", &args).await? {
            Frame::Integer(n) => Ok(n),
            frame => Err(RelinkConnectionError::Command(frame.to_string())),
        }
    }

    pub async fn publish(&self, channel: &str, message: Bytes) -> Result<u64, RelinkConnectionError> {
        let args = [Bytes::from(channel.to_string()), message];
        match self.issue("publish", &args).await? {
            Frame::Integer(receivers) => Ok(receivers),
            frame => Err(RelinkConnectionError::Command(frame.to_string())),
        }
    }
}

fn expect_ok(frame: Frame) -> Result<(), RelinkConnectionError> {
    match frame {
        Frame::Simple(response) if response == "OK" => Ok(()),
        frame => Err(RelinkConnectionError::Command(frame.to_string())),
    }
}

/// Auth then select, each skipped when not configured. Either failure makes
/// the whole connect attempt fail.
async fn setup_connection(
    conn: &Connection,
    setup: &Mutex<SetupConfig>,
) -> Result<(), RelinkConnectionError> {
    let (password, db) = {
        let setup = setup.lock().unwrap();
        (setup.password.clone(), setup.db)
    };

    if let Some(password) = password {
        conn.send(vec![Bytes::from_static(b"auth"), Bytes::from(password)])
            .await
            .map_err(|e| RelinkConnectionError::Setup(format!("auth rejected: {}", e)))?;
    }

    if db != 0 {
        conn.send(vec![
            Bytes::from_static(b"select"),
            Bytes::from(db.to_string()),
        ])
        .await
        .map_err(|e| RelinkConnectionError::Setup(format!("select rejected: {}", e)))?;
    }

    Ok(())
}

/// Replays buffered commands onto the fresh connection in issue order. Runs
/// inside the `Connected` emission; the queue lock holds off concurrent
/// direct sends until the drain completes.
fn drain_queue(inner: &Arc<ClientInner>) {
    let mut queue = inner.queue.lock().unwrap();
    if queue.is_empty() {
        return;
    }
    let conn = match inner.manager.connection() {
        Some(conn) => conn,
        None => return,
    };
    debug!("draining {} queued commands", queue.len());
    while let Some(cmd) = queue.pop_front() {
        conn.send_prepared(cmd.tx, cmd.args);
    }
}

fn reject_queue(inner: &Arc<ClientInner>) {
    let mut queue = inner.queue.lock().unwrap();
    if !queue.is_empty() {
        debug!("rejecting {} queued commands", queue.len());
    }
    while let Some(cmd) = queue.pop_front() {
        let _ = cmd.tx.send(Err(RelinkConnectionError::ClientFailed));
    }
}
