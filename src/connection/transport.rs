//! Byte-stream transport boundary.
//!
//! The pipelined connection is written against the small [`Transport`]
//! contract rather than a socket: something that can accept outgoing bytes,
//! be closed, and delivers [`TransportEvent`]s through a channel. The TCP
//! implementation lives here; tests drive the same contract with an in-memory
//! transport.

use std::future::Future;
use std::io;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::consts::READ_BUFFER_SIZE;

/// Notifications a transport delivers, in order, through its event channel.
#[derive(Debug)]
pub enum TransportEvent {
    /// The underlying stream is established and writable.
    Connected,
    /// A chunk of bytes arrived.
    Received(Bytes),
    /// The stream is gone. Always the final event.
    Closed,
}

/// One live byte stream. Sends are fire-and-forget; delivery failures surface
/// as a `Closed` event rather than an error return.
pub trait Transport: Send {
    fn send(&mut self, data: Bytes);
    fn close(&mut self);
}

/// Factory for transports, injected into clients so tests can supply mock
/// connections. Resolution failures (DNS, refused connections) are reported
/// through the returned future, never by panicking.
pub trait TransportConnector: Send + Sync {
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Pin<
        Box<
            dyn Future<Output = io::Result<(Box<dyn Transport>, UnboundedReceiver<TransportEvent>)>>
                + Send,
        >,
    >;
}

/// The production connector: plain TCP.
pub struct TcpConnector;

impl TransportConnector for TcpConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Pin<
        Box<
            dyn Future<Output = io::Result<(Box<dyn Transport>, UnboundedReceiver<TransportEvent>)>>
                + Send,
        >,
    > {
        let addr = format!("{}:{}", host, port);
        Box::pin(async move {
            let stream = TcpStream::connect(&addr).await?;
            debug!("tcp transport connected to {}", addr);
            Ok(TcpTransport::start(stream))
        })
    }
}

enum WriteOp {
    Data(Bytes),
    Shutdown,
}

pub struct TcpTransport {
    writer: UnboundedSender<WriteOp>,
    events: UnboundedSender<TransportEvent>,
    reader: JoinHandle<()>,
}

impl TcpTransport {
    /// Splits the stream into a writer task fed by a channel and a reader
    /// task that forwards chunks as events. The `Connected` event is queued
    /// before either task runs so consumers always observe it first.
    pub fn start(stream: TcpStream) -> (Box<dyn Transport>, UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel();
        let (mut read_half, mut write_half) = stream.into_split();

        let _ = event_tx.send(TransportEvent::Connected);

        tokio::spawn(async move {
            while let Some(op) = write_rx.recv().await {
                match op {
                    WriteOp::Data(data) => {
                        if write_half.write_all(&data).await.is_err() {
                            break;
                        }
                        if write_half.flush().await.is_err() {
                            break;
                        }
                    }
                    WriteOp::Shutdown => {
                        let _ = write_half.shutdown().await;
                        break;
                    }
                }
            }
        });

        let events = event_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
            loop {
                match read_half.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if events.send(TransportEvent::Received(buf.split().freeze())).is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = events.send(TransportEvent::Closed);
        });

        let transport = TcpTransport {
            writer: write_tx,
            events: event_tx,
            reader,
        };
        (Box::new(transport), event_rx)
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: Bytes) {
        let _ = self.writer.send(WriteOp::Data(data));
    }

    /// Forced close: stop both halves and report `Closed` immediately rather
    /// than waiting for the peer to hang up.
    fn close(&mut self) {
        let _ = self.writer.send(WriteOp::Shutdown);
        self.reader.abort();
        let _ = self.events.send(TransportEvent::Closed);
    }
}
