//! # Socket Abstraction
//!
//! The session loop talks to the page through [`Socket`]: text frames in,
//! text frames out, and a close handshake. The WebSocket served by the
//! listener implements it, and so does the channel pair in
//! [`testing`](crate::testing).
//!
//! ## Philosophy
//!
//! - **Text only**: The socket knows nothing about CRRCAN. It moves strings.
//! - **Shared**: Receiving and sending take `&self`, so one send may be in
//!   flight while the loop waits for the next frame.

use axum::extract::ws::CloseFrame;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use futures_util::SinkExt;
use futures_util::StreamExt;
use futures_util::stream::SplitSink;
use futures_util::stream::SplitStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;

/// What the page sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    /// The page closed the socket, or the connection is gone.
    Closed { code: Option<u16>, reason: String },
}

/// A text message socket to one page.
#[async_trait::async_trait]
pub trait Socket: Send + Sync + 'static {
    /// Waits for the next text frame. Returns `Closed` once, at the end.
    async fn recv(&self) -> Result<Incoming>;

    async fn send(&self, text: String) -> Result<()>;

    /// Starts the close handshake. Closing twice is not an error.
    async fn close(&self, code: u16, reason: &str) -> Result<()>;
}

/// An upgraded axum WebSocket.
pub struct WsSocket {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
}

impl WsSocket {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self { sink: Mutex::new(sink), stream: Mutex::new(stream) }
    }
}

#[async_trait::async_trait]
impl Socket for WsSocket {
    async fn recv(&self) -> Result<Incoming> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Incoming::Text(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    return Ok(match frame {
                        Some(f) => Incoming::Closed { code: Some(f.code), reason: f.reason.to_string() },
                        None => Incoming::Closed { code: None, reason: String::new() },
                    });
                }
                Some(Ok(Message::Binary(bytes))) => {
                    debug!(len = bytes.len(), "ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(Error::Io(e.to_string())),
                None => return Ok(Incoming::Closed { code: None, reason: String::new() }),
            }
        }
    }

    async fn send(&self, text: String) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::Io(e.to_string()))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame { code, reason: reason.to_string().into() };
        let mut sink = self.sink.lock().await;
        // The page may already be gone.
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
        Ok(())
    }
}
