//! Transport substrate adapters.
//!
//! The engine is transport-agnostic: handshake and session logic consume
//! [`FrameStream`] and never see sockets. [`TcpTransport`] is the thin
//! TCP adapter shipped with the engine; [`MemoryTransport`] is an
//! in-process loopback for tests and embedding.

use crate::error::{Error, Result};
use crate::wire::{Frame, WireCodec};
use crate::DEFAULT_PORT;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// One bidirectional, ordered frame stream.
#[async_trait::async_trait]
pub trait FrameStream: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// The next frame from the peer. Errors when the stream is closed.
    async fn receive(&mut self) -> Result<Frame>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens frame streams toward a configured peer.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn open_stream(&self) -> Result<Box<dyn FrameStream>>;
}

/// Transport adapter configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub address: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory loopback
// ---------------------------------------------------------------------------

/// In-process frame stream over bounded channels. [`MemoryTransport::pair`]
/// returns the two connected ends.
pub struct MemoryTransport {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::channel(64);
        let (b_tx, b_rx) = mpsc::channel(64);
        (
            MemoryTransport { tx: a_tx, rx: b_rx },
            MemoryTransport { tx: b_tx, rx: a_rx },
        )
    }
}

#[async_trait::async_trait]
impl FrameStream for MemoryTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::Transport("peer closed".to_string()))
    }

    async fn receive(&mut self) -> Result<Frame> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::Transport("stream closed".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TCP adapter
// ---------------------------------------------------------------------------

/// A TCP connection framed with the wire codec.
pub struct TcpFrameStream {
    framed: Framed<TcpStream, WireCodec>,
}

impl TcpFrameStream {
    pub fn new(stream: TcpStream) -> Self {
        Self { framed: Framed::new(stream, WireCodec::new()) }
    }
}

#[async_trait::async_trait]
impl FrameStream for TcpFrameStream {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.framed.send(frame).await
    }

    async fn receive(&mut self) -> Result<Frame> {
        match self.framed.next().await {
            Some(result) => result,
            None => Err(Error::Transport("connection closed".to_string())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.framed.close().await
    }
}

/// Client-side TCP transport.
pub struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Accept one inbound connection on `listener` as a frame stream.
    pub async fn accept(listener: &TcpListener) -> Result<(TcpFrameStream, std::net::SocketAddr)> {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((TcpFrameStream::new(stream), addr))
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn open_stream(&self) -> Result<Box<dyn FrameStream>> {
        let addr = format!("{}:{}", self.config.address, self.config.port);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {addr}")))??;
        stream.set_nodelay(true)?;
        tracing::debug!(%addr, "transport stream opened");
        Ok(Box::new(TcpFrameStream::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FrameType;

    #[tokio::test]
    async fn test_memory_pair_round_trip() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.send(Frame::new(FrameType::Control, vec![1, 2, 3])).await.unwrap();
        let frame = b.receive().await.unwrap();
        assert_eq!(frame.payload, vec![1, 2, 3]);

        b.send(Frame::new(FrameType::Control, vec![4])).await.unwrap();
        assert_eq!(a.receive().await.unwrap().payload, vec![4]);
    }

    #[tokio::test]
    async fn test_memory_closed_end_errors() {
        let (mut a, b) = MemoryTransport::pair();
        drop(b);
        assert!(a.send(Frame::new(FrameType::Control, vec![])).await.is_err());
        assert!(a.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_frame_stream_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = TcpTransport::accept(&listener).await.unwrap();
            let frame = stream.receive().await.unwrap();
            stream.send(frame).await.unwrap();
        });

        let transport = TcpTransport::new(TransportConfig {
            address: addr.ip().to_string(),
            port: addr.port(),
            ..Default::default()
        });
        let mut stream = transport.open_stream().await.unwrap();
        let sent = Frame::new(FrameType::Handshake, b"hello".to_vec());
        stream.send(sent.clone()).await.unwrap();
        let echoed = stream.receive().await.unwrap();
        assert_eq!(echoed, sent);
        server.await.unwrap();
    }
}
