//! Transport layer for chat connections.
//!
//! The wire has no framing: each write is expected to arrive as one read,
//! so a "frame" here is whatever a single read returns. Bytes the handshake
//! read past its last packet can be pushed back with
//! [`FrameTransport::unread`] and are returned by the next read.

mod tcp;

pub use tcp::{rendezvous, resolve, PeerAddress};

use std::collections::VecDeque;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::chat::error::ChatError;

/// Upper bound on a single read.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Trait for bidirectional async frame transport.
#[async_trait]
pub trait FrameTransport: Send {
    /// Write one frame.
    async fn send_frame(&mut self, data: &[u8]) -> Result<(), ChatError>;

    /// Read one frame; `None` once the peer has closed the stream.
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, ChatError>;

    /// Return a frame to be read again before anything new.
    fn unread(&mut self, data: Vec<u8>);

    /// Close the connection.
    async fn close(&mut self) -> Result<(), ChatError>;

    /// Local and peer socket addresses, when the stream has them.
    fn endpoints(&self) -> Option<(SocketAddr, SocketAddr)>;
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of a connection.
pub struct FrameReader {
    inner: BoxedReader,
    pending: VecDeque<Vec<u8>>,
    buf: Vec<u8>,
}

impl FrameReader {
    fn new(inner: BoxedReader) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
            buf: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    /// Read one frame, preferring unread data.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ChatError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }
        let n = self.inner.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[..n].to_vec()))
    }

    /// Push a frame back to the front of the queue.
    pub fn unread(&mut self, data: Vec<u8>) {
        self.pending.push_front(data);
    }
}

/// Write half of a connection.
pub struct FrameWriter {
    inner: BoxedWriter,
}

impl FrameWriter {
    /// Write one frame and flush it.
    pub async fn write_frame(&mut self, data: &[u8]) -> Result<(), ChatError> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write direction; the peer reads end-of-stream.
    pub async fn shutdown(&mut self) -> Result<(), ChatError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// A byte stream to the peer, split into halves.
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
    endpoints: Option<(SocketAddr, SocketAddr)>,
}

impl Connection {
    /// Wrap any duplex byte stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(Box::new(read_half)),
            writer: FrameWriter { inner: Box::new(write_half) },
            endpoints: None,
        }
    }

    /// Record the socket addresses the stream runs between.
    pub fn with_endpoints(mut self, local: SocketAddr, peer: SocketAddr) -> Self {
        self.endpoints = Some((local, peer));
        self
    }

    /// Wrap a connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let endpoints = stream.local_addr().ok().zip(stream.peer_addr().ok());
        let connection = Self::new(stream);
        match endpoints {
            Some((local, peer)) => connection.with_endpoints(local, peer),
            None => connection,
        }
    }

    /// Separate the halves so reading and writing can proceed independently.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

#[async_trait]
impl FrameTransport for Connection {
    async fn send_frame(&mut self, data: &[u8]) -> Result<(), ChatError> {
        self.writer.write_frame(data).await
    }

    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, ChatError> {
        self.reader.read_frame().await
    }

    fn unread(&mut self, data: Vec<u8>) {
        self.reader.unread(data);
    }

    async fn close(&mut self) -> Result<(), ChatError> {
        self.writer.shutdown().await
    }

    fn endpoints(&self) -> Option<(SocketAddr, SocketAddr)> {
        self.endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = Connection::new(a);
        let mut right = Connection::new(b);

        left.send_frame(b"hello").await.unwrap();
        assert_eq!(right.recv_frame().await.unwrap().unwrap(), b"hello");

        right.send_frame(b"back").await.unwrap();
        assert_eq!(left.recv_frame().await.unwrap().unwrap(), b"back");
        assert!(left.endpoints().is_none());
    }

    #[tokio::test]
    async fn test_unread_comes_first() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = Connection::new(a);
        let mut right = Connection::new(b);

        left.send_frame(b"fresh").await.unwrap();
        right.unread(b"old".to_vec());

        assert_eq!(right.recv_frame().await.unwrap().unwrap(), b"old");
        assert_eq!(right.recv_frame().await.unwrap().unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_close_is_end_of_stream() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = Connection::new(a);
        let mut right = Connection::new(b);

        left.close().await.unwrap();
        assert!(right.recv_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_split_halves() {
        let (a, b) = tokio::io::duplex(1024);
        let (mut reader, mut writer) = Connection::new(a).into_split();
        let mut right = Connection::new(b);

        writer.write_frame(b"ping").await.unwrap();
        assert_eq!(right.recv_frame().await.unwrap().unwrap(), b"ping");

        right.send_frame(b"pong").await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"pong");
    }
}
