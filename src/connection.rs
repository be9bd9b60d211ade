//! Message-framed duplex connection
//!
//! Wraps an upgraded WebSocket stream so the rest of the relay only deals
//! in JSON messages. A `Connection` is owned whole during the handshake and
//! split into a `ConnectionReader` / `ConnectionWriter` pair once a session
//! is created. Closing the writer also wakes the reader, so both halves of
//! a session observe the same closure.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::ConnectionError;

type FrameSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// Upper bound on sending a close frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A single upgraded client connection
pub struct Connection {
    peer: String,
    sink: FrameSink,
    stream: FrameStream,
}

impl Connection {
    /// Wrap an upgraded WebSocket stream
    pub fn new<S>(ws: WebSocketStream<S>, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        Self {
            peer: peer.into(),
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Remote address, for logging
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Receive the next data frame and decode it as `T`
    ///
    /// Control frames are skipped. A close frame or end of stream yields
    /// `ConnectionError::Closed`.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, ConnectionError> {
        next_json(&mut self.stream).await
    }

    /// Send a close frame (best effort) and drop the connection
    pub async fn close(mut self) {
        debug!("Closing connection from {}", self.peer);
        close_sink(&mut self.sink).await;
    }

    /// Split into independently owned halves
    ///
    /// Every `send` on the writer is bounded by `write_timeout`.
    pub fn split(self, write_timeout: Duration) -> (ConnectionReader, ConnectionWriter) {
        let (closed_tx, closed_rx) = watch::channel(false);
        let reader = ConnectionReader {
            peer: self.peer.clone(),
            stream: self.stream,
            closed: closed_rx,
        };
        let writer = ConnectionWriter {
            peer: self.peer,
            sink: self.sink,
            closed: closed_tx,
            write_timeout,
        };
        (reader, writer)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

/// Inbound half of a split connection
pub struct ConnectionReader {
    peer: String,
    stream: FrameStream,
    closed: watch::Receiver<bool>,
}

impl ConnectionReader {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Receive the next data frame, or `Closed` once the writer has closed
    /// the connection (or been dropped).
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, ConnectionError> {
        if *self.closed.borrow() {
            return Err(ConnectionError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.closed.changed() => Err(ConnectionError::Closed),
            result = next_json(&mut self.stream) => result,
        }
    }
}

/// Outbound half of a split connection
pub struct ConnectionWriter {
    peer: String,
    sink: FrameSink,
    closed: watch::Sender<bool>,
    write_timeout: Duration,
}

impl ConnectionWriter {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Serialize `msg` and write it as one text frame within the write deadline
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), ConnectionError> {
        let json = serde_json::to_string(msg).map_err(ConnectionError::Encode)?;
        match time::timeout(self.write_timeout, self.sink.send(Message::Text(json.into()))).await {
            Ok(result) => result.map_err(ConnectionError::Write),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    /// Close the connection for both halves
    ///
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed.send_replace(true) {
            return;
        }
        debug!("Closing connection to {}", self.peer);
        close_sink(&mut self.sink).await;
    }
}

async fn next_json<T: DeserializeOwned>(stream: &mut FrameStream) -> Result<T, ConnectionError> {
    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))
            | None => return Err(ConnectionError::Closed),
            Some(Err(e)) => return Err(ConnectionError::Read(e)),
        };

        match frame {
            Message::Text(text) => {
                return serde_json::from_str(&text).map_err(ConnectionError::Decode);
            }
            Message::Binary(data) => {
                return serde_json::from_slice(&data).map_err(ConnectionError::Decode);
            }
            Message::Close(_) => return Err(ConnectionError::Closed),
            // Pong replies are queued by tungstenite itself
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        }
    }
}

async fn close_sink(sink: &mut FrameSink) {
    let _ = time::timeout(CLOSE_TIMEOUT, sink.close()).await;
}
