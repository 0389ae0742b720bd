//! Duplex message transports
//!
//! A connection exchanges whole JSON messages. Over TCP each message is one
//! line; the in-memory transport carries strings over tokio channels.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One side of a duplex message connection
#[async_trait]
pub trait Transport: Send {
    /// Next inbound message; `None` once the peer has closed its side.
    ///
    /// Must be cancel safe: it is raced against outbound traffic.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    async fn send(&mut self, message: &str) -> Result<(), TransportError>;

    /// Close the outbound side; further sends fail
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Newline-delimited messages over a TCP stream
pub struct TcpTransport {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    closed: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                other => return Ok(other),
            }
        }
    }

    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.writer.write_all(message.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.writer.shutdown().await?;
        }
        Ok(())
    }
}

/// In-memory transport over tokio channels
pub struct ChannelTransport {
    inbound: mpsc::Receiver<String>,
    outbound: Option<mpsc::Sender<String>>,
}

impl ChannelTransport {
    /// Two connected ends
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(buffer);
        let (b_tx, b_rx) = mpsc::channel(buffer);
        (
            Self {
                inbound: a_rx,
                outbound: Some(b_tx),
            },
            Self {
                inbound: b_rx,
                outbound: Some(a_tx),
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.inbound.recv().await)
    }

    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::Closed)?;
        outbound
            .send(message.to_string())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_channel_pair_round_trip() {
        let (mut client, mut server) = ChannelTransport::pair(4);

        client.send("hello").await.unwrap();
        assert_eq!(server.recv().await.unwrap().as_deref(), Some("hello"));

        server.close().await.unwrap();
        assert!(server.send("late").await.is_err());
        assert_eq!(client.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tcp_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut transport = TcpTransport::new(TcpStream::connect(addr).await.unwrap());
            transport.send(r#"{"prompt":"hi"}"#).await.unwrap();
            let reply = transport.recv().await.unwrap();
            transport.close().await.unwrap();
            reply
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut server = TcpTransport::new(stream);
        assert_eq!(
            server.recv().await.unwrap().as_deref(),
            Some(r#"{"prompt":"hi"}"#)
        );
        server.send("ok").await.unwrap();
        server.close().await.unwrap();

        assert_eq!(client.await.unwrap().as_deref(), Some("ok"));
        assert_eq!(server.recv().await.unwrap(), None);
    }
}
