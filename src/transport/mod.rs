// Framed duplex transports: TLS 1.3 over TCP, WebSocket, plain TCP

pub mod tcp;
pub mod tls;
pub mod ws;

use async_trait::async_trait;
use thiserror::Error;

/// Longest accepted LF-terminated line.
pub const MAX_LINE: usize = 16 * 1024;

/// Timeout for a TLS or WebSocket handshake on accept.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnClosed,
    #[error("tls error: {0}")]
    Tls(String),
    #[error("bad block size")]
    BadBlockSize,
    #[error("line exceeds {MAX_LINE} bytes")]
    LineTooLong,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read half of a framed transport. Lines are LF-terminated and bounded at
/// [`MAX_LINE`]; block reads are exact.
#[async_trait]
pub trait TransportRead: Send {
    async fn get_line(&mut self) -> Result<String, TransportError>;
    async fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError>;
}

/// Write half of a framed transport.
#[async_trait]
pub trait TransportWrite: Send {
    async fn put_line(&mut self, line: &str) -> Result<(), TransportError>;
    async fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// A connected duplex transport, splittable into independently owned
/// read and write halves for concurrent read/write loops.
pub struct Transport {
    pub read: Box<dyn TransportRead>,
    pub write: Box<dyn TransportWrite>,
}

impl Transport {
    pub fn new(read: Box<dyn TransportRead>, write: Box<dyn TransportWrite>) -> Self {
        Self { read, write }
    }

    pub fn into_split(self) -> (Box<dyn TransportRead>, Box<dyn TransportWrite>) {
        (self.read, self.write)
    }

    pub async fn get_line(&mut self) -> Result<String, TransportError> {
        self.read.get_line().await
    }

    pub async fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        self.read.get_bytes(n).await
    }

    pub async fn put_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.write.put_line(line).await
    }

    pub async fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.write.put_bytes(bytes).await
    }

    pub async fn close(&mut self) {
        self.write.close().await;
    }
}
