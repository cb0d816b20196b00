// Line/block framing over any byte stream; plain-TCP transport

use crate::transport::{Transport, TransportError, TransportRead, TransportWrite, MAX_LINE};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Buffered, bounded line reader over a raw byte stream.
pub struct StreamRead<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin + Send> StreamRead<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> TransportRead for StreamRead<R> {
    async fn get_line(&mut self) -> Result<String, TransportError> {
        let mut buf = Vec::new();
        let n = (&mut self.reader)
            .take((MAX_LINE + 1) as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Err(TransportError::ConnClosed);
        }
        if buf.last() != Some(&b'\n') {
            if buf.len() > MAX_LINE {
                return Err(TransportError::LineTooLong);
            }
            return Err(TransportError::ConnClosed);
        }
        buf.pop();
        String::from_utf8(buf).map_err(|_| TransportError::BadBlockSize)
    }

    async fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::ConnClosed
            } else {
                TransportError::Io(e)
            }
        })?;
        Ok(buf)
    }
}

pub struct StreamWrite<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> StreamWrite<W> {
    pub fn new(inner: W) -> Self {
        Self { writer: inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> TransportWrite for StreamWrite<W> {
    async fn put_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Wraps an accepted or connected TCP stream without TLS (the agent's
/// local wire, and test mode).
pub fn from_tcp_stream(stream: TcpStream) -> Transport {
    let (r, w) = stream.into_split();
    Transport::new(
        Box::new(StreamRead::new(r)),
        Box::new(StreamWrite::new(w)),
    )
}

pub async fn connect_tcp(host: &str, port: u16) -> Result<Transport, TransportError> {
    let stream = TcpStream::connect((host, port)).await?;
    Ok(from_tcp_stream(stream))
}
