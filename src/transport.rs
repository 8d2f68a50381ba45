//! Transport seam between the connection manager and the wire.
//!
//! The manager drives a pair of [`SocketSink`]/[`SocketStream`] trait objects
//! produced by a [`Connect`] impl. Production code uses [`NetConnector`] over
//! `tokio-tungstenite`; tests substitute scripted in-memory sockets so the
//! whole reconnect/heartbeat state machine runs under a paused clock.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code used for intentional local disconnects.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Lifecycle event delivered by a [`SocketStream`].
#[non_exhaustive]
#[derive(Debug)]
pub enum SocketEvent {
    /// Text payload delivered by the server
    Message(String),
    /// Transport-level error; the transport always follows one with a close
    Error(tokio_tungstenite::tungstenite::Error),
    /// The connection closed, with the close code when one was received
    Closed(Option<u16>),
}

/// Write half of a connected socket.
#[async_trait]
pub trait SocketSink: Send {
    /// Transmit one text frame.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Close the connection with the given close code.
    async fn close(&mut self, code: u16) -> Result<()>;
}

/// Read half of a connected socket.
///
/// Returns `None` once the underlying stream is exhausted, which the manager
/// treats as a close without a code.
#[async_trait]
pub trait SocketStream: Send {
    async fn next_event(&mut self) -> Option<SocketEvent>;
}

/// Factory for connected sockets. One dial per call; a returned error means
/// the socket never opened.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<(Box<dyn SocketSink>, Box<dyn SocketStream>)>;
}

/// Production connector over `tokio-tungstenite`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct NetConnector;

#[async_trait]
impl Connect for NetConnector {
    async fn connect(&self, url: &str) -> Result<(Box<dyn SocketSink>, Box<dyn SocketStream>)> {
        let (ws_stream, _response) = connect_async(url).await?;
        let (write, read) = ws_stream.split();

        Ok((
            Box::new(NetSink { write }),
            Box::new(NetStream { read }),
        ))
    }
}

struct NetSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SocketSink for NetSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16) -> Result<()> {
        self.write
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: Utf8Bytes::from_static(""),
            })))
            .await?;
        self.write.close().await?;
        Ok(())
    }
}

struct NetStream {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl SocketStream for NetStream {
    async fn next_event(&mut self) -> Option<SocketEvent> {
        loop {
            return Some(match self.read.next().await? {
                Ok(Message::Text(text)) => SocketEvent::Message(text.as_str().to_owned()),
                Ok(Message::Close(frame)) => {
                    SocketEvent::Closed(frame.map(|f| u16::from(f.code)))
                }
                Ok(_) => {
                    // Binary frames are outside the push contract; protocol
                    // ping/pong is answered at the tungstenite layer.
                    continue;
                }
                Err(e) => SocketEvent::Error(e),
            });
        }
    }
}
