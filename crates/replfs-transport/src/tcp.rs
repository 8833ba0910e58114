//! TCP transport implementation

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameHeader, Opcode, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Per-frame read timeout in milliseconds; 0 waits forever.
    pub read_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            read_timeout_ms: 30_000,
            nodelay: true,
        }
    }
}

/// TCP transport; creates connections.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Establishes a TCP connection to the specified address.
    pub async fn connect(&self, addr: &str) -> Result<TcpConnection> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })??;
        tracing::debug!(addr = addr, "TCP connected");
        self.wrap(stream)
    }

    /// Binds to the specified address.
    pub async fn listen(&self, addr: &str) -> Result<TcpListener> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// Accepts an incoming TCP connection from the listener.
    pub async fn accept(&self, listener: &TcpListener) -> Result<TcpConnection> {
        let (stream, _) = listener.accept().await?;
        self.wrap(stream)
    }

    /// Wraps an already accepted stream.
    pub fn wrap(&self, stream: TcpStream) -> Result<TcpConnection> {
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        TcpConnection::from_stream(stream, self.config.read_timeout_ms)
    }
}

/// A single TCP connection with independent read and write halves.
pub struct TcpConnection {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
    peer_addr: String,
    read_timeout_ms: u64,
}

impl TcpConnection {
    pub(crate) fn from_stream(stream: TcpStream, read_timeout_ms: u64) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read, write) = stream.into_split();
        Ok(Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer_addr,
            read_timeout_ms,
        })
    }

    /// Sends a frame over the TCP connection.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        let mut write = self.write.lock().await;
        write.write_all(&encoded).await?;
        write.flush().await?;
        Ok(())
    }

    /// Receives a frame, honouring the configured read timeout.
    pub async fn recv_frame(&self) -> Result<Frame> {
        if self.read_timeout_ms == 0 {
            return self.read_frame().await;
        }
        tokio::time::timeout(Duration::from_millis(self.read_timeout_ms), self.read_frame())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: format!("read from {}", self.peer_addr),
                timeout_ms: self.read_timeout_ms,
            })?
    }

    async fn read_frame(&self) -> Result<Frame> {
        let mut read = self.read.lock().await;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        match read.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        }
        let header = FrameHeader::decode(&header_buf)?;
        if header.payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: header.payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        let mut payload = vec![0u8; header.payload_length as usize];
        if !payload.is_empty() {
            read.read_exact(&mut payload).await?;
        }
        let frame = Frame { header, payload };
        frame.validate()?;
        Ok(frame)
    }

    /// Serializes `message` and sends it as one frame.
    pub async fn send_message<T: Serialize>(
        &self,
        opcode: Opcode,
        request_id: u64,
        message: &T,
    ) -> Result<()> {
        let frame = Frame::from_message(opcode, request_id, message)?;
        self.send_frame(&frame).await
    }

    /// Receives one frame, checks its opcode and decodes the payload.
    pub async fn recv_message<T: DeserializeOwned>(&self, expected: Opcode) -> Result<T> {
        let frame = self.recv_frame().await?;
        if frame.opcode() != expected {
            return Err(TransportError::UnexpectedOpcode {
                expected,
                got: frame.opcode(),
            });
        }
        frame.decode_payload()
    }

    /// Shuts down the write half so the peer observes end of stream.
    pub async fn shutdown(&self) -> Result<()> {
        let mut write = self.write.lock().await;
        write.shutdown().await?;
        Ok(())
    }

    /// Returns the remote peer address of this TCP connection as a string.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}
