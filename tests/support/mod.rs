//! In-memory transport doubles for driving clients without a server.
//!
//! `MockConnector` implements the transport factory contract; every connect
//! call hands the test a `MockSession` through a channel. The session decodes
//! commands the client writes and lets the test script replies, the
//! handshake, and the close.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use relink::connection::frame::Frame;
use relink::connection::reader::FrameReader;
use relink::connection::transport::{Transport, TransportConnector, TransportEvent};

pub struct MockTransport {
    commands: UnboundedSender<String>,
    events: UnboundedSender<TransportEvent>,
    reader: FrameReader,
}

impl Transport for MockTransport {
    fn send(&mut self, data: Bytes) {
        self.reader.feed(&data);
        while let Ok(Some(frame)) = self.reader.next() {
            let _ = self.commands.send(render_command(&frame));
        }
    }

    fn close(&mut self) {
        let _ = self.events.send(TransportEvent::Closed);
    }
}

/// Test-side handle to one mock connection.
pub struct MockSession {
    events: UnboundedSender<TransportEvent>,
    commands: UnboundedReceiver<String>,
}

impl MockSession {
    /// Completes the handshake; the client sees the connection become ready.
    pub fn connected(&self) {
        let _ = self.events.send(TransportEvent::Connected);
    }

    /// Drops the connection from the server side.
    pub fn kill(&self) {
        let _ = self.events.send(TransportEvent::Closed);
    }

    /// Delivers raw bytes as inbound traffic.
    pub fn reply_raw(&self, data: &[u8]) {
        let _ = self
            .events
            .send(TransportEvent::Received(Bytes::copy_from_slice(data)));
    }

    pub fn reply_ok(&self) {
        self.reply_raw(b"+OK\r\n");
    }

    pub fn reply_simple(&self, value: &str) {
        self.reply_raw(format!("+{}\r\n", value).as_bytes());
    }

    pub fn reply_error(&self, message: &str) {
        self.reply_raw(format!("-{}\r\n", message).as_bytes());
    }

    pub fn reply_integer(&self, value: u64) {
        self.reply_raw(format!(":{}\r\n", value).as_bytes());
    }

    pub fn reply_bulk(&self, value: &str) {
        self.reply_raw(format!("${}\r\n{}\r\n", value.len(), value).as_bytes());
    }

    /// Delivers an array of bulk strings, the shape of every push frame.
    pub fn reply_array(&self, parts: &[&str]) {
        let mut data = BytesMut::new();
        data.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
        for part in parts {
            data.extend_from_slice(format!("${}\r\n{}\r\n", part.len(), part).as_bytes());
        }
        self.reply_raw(&data);
    }

    /// The next command the client wrote, rendered as space-joined text.
    pub async fn next_command(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.commands.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("transport dropped without a command")
    }

    /// Asserts no command has been written so far.
    pub fn assert_no_command(&mut self) {
        match self.commands.try_recv() {
            Err(_) => {}
            Ok(cmd) => panic!("unexpected command: {}", cmd),
        }
    }
}

/// Transport factory producing mock sessions. Configured failures are
/// consumed first; each successful connect emits a session to the test.
pub struct MockConnector {
    sessions: UnboundedSender<MockSession>,
    fail_times: AtomicU32,
    calls: AtomicU32,
}

impl MockConnector {
    pub fn new() -> (Arc<MockConnector>, UnboundedReceiver<MockSession>) {
        MockConnector::with_failures(0)
    }

    /// The first `fail_times` connect calls are refused at the socket level.
    pub fn with_failures(fail_times: u32) -> (Arc<MockConnector>, UnboundedReceiver<MockSession>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            sessions: tx,
            fail_times: AtomicU32::new(fail_times),
            calls: AtomicU32::new(0),
        });
        (connector, rx)
    }

    /// Total connect calls observed.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TransportConnector for MockConnector {
    fn connect(
        &self,
        _host: &str,
        _port: u16,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<
                    Output = io::Result<(Box<dyn Transport>, UnboundedReceiver<TransportEvent>)>,
                > + Send,
        >,
    > {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut remaining = self.fail_times.load(Ordering::SeqCst);
        while remaining > 0 {
            match self.fail_times.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Box::pin(async {
                        Err(io::Error::new(
                            io::ErrorKind::ConnectionRefused,
                            "mock connection refused",
                        ))
                    });
                }
                Err(actual) => remaining = actual,
            }
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let transport = MockTransport {
            commands: command_tx,
            events: event_tx.clone(),
            reader: FrameReader::new(),
        };
        let session = MockSession {
            events: event_tx,
            commands: command_rx,
        };
        let _ = self.sessions.send(session);

        Box::pin(async move { Ok((Box::new(transport) as Box<dyn Transport>, event_rx)) })
    }
}

/// Pulls the next session produced by the connector.
pub async fn next_session(sessions: &mut UnboundedReceiver<MockSession>) -> MockSession {
    tokio::time::timeout(Duration::from_secs(5), sessions.recv())
        .await
        .expect("timed out waiting for a connect attempt")
        .expect("connector dropped")
}

/// Polls a condition, yielding between checks. Panics if it never holds.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition never reached: {}", what);
}

fn render_command(frame: &Frame) -> String {
    match frame {
        Frame::Array(parts) => parts
            .iter()
            .map(render_part)
            .collect::<Vec<_>>()
            .join(" "),
        other => render_part(other),
    }
}

fn render_part(frame: &Frame) -> String {
    match frame {
        Frame::Simple(s) => s.clone(),
        Frame::Bulk(data) => String::from_utf8_lossy(data).into_owned(),
        Frame::Integer(n) => n.to_string(),
        Frame::Error(msg) => format!("-{}", msg),
        Frame::Null => "(nil)".to_string(),
        Frame::Array(parts) => parts
            .iter()
            .map(render_part)
            .collect::<Vec<_>>()
            .join(" "),
    }
}
