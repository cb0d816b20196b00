// WebSocket transport over binary frames

use crate::smp::address::SmpServer;
use crate::transport::{Transport, TransportError, TransportRead, TransportWrite, HANDSHAKE_TIMEOUT, MAX_LINE};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

/// Read half: binary frames are concatenated into a byte buffer that the
/// line/block framing consumes, so the same wire grammar runs over
/// WebSocket and raw streams.
pub struct WsRead<S> {
    stream: SplitStream<WebSocketStream<S>>,
    buf: Vec<u8>,
}

impl<S> WsRead<S> {
    fn take_front(&mut self, n: usize) -> Vec<u8> {
        let rest = self.buf.split_off(n);
        std::mem::replace(&mut self.buf, rest)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> WsRead<S> {
    async fn fill(&mut self) -> Result<(), TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.buf.extend_from_slice(&data);
                    return Ok(());
                }
                Some(Ok(Message::Text(data))) => {
                    self.buf.extend_from_slice(data.as_bytes());
                    return Ok(());
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnClosed),
                Some(Ok(_)) => continue, // ping/pong control frames
                Some(Err(e)) => {
                    return Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        e,
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> TransportRead for WsRead<S> {
    async fn get_line(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                if pos > MAX_LINE {
                    return Err(TransportError::LineTooLong);
                }
                let mut line = self.take_front(pos + 1);
                line.pop();
                return String::from_utf8(line).map_err(|_| TransportError::BadBlockSize);
            }
            if self.buf.len() > MAX_LINE {
                return Err(TransportError::LineTooLong);
            }
            self.fill().await?;
        }
    }

    async fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        while self.buf.len() < n {
            self.fill().await?;
        }
        Ok(self.take_front(n))
    }
}

pub struct WsWrite<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> TransportWrite for WsWrite<S> {
    async fn put_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');
        self.sink
            .send(Message::Binary(frame))
            .await
            .map_err(|_| TransportError::ConnClosed)
    }

    async fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(bytes.to_vec()))
            .await
            .map_err(|_| TransportError::ConnClosed)
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
    }
}

fn wrap<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(ws: WebSocketStream<S>) -> Transport {
    let (sink, stream) = ws.split();
    Transport::new(
        Box::new(WsRead {
            stream,
            buf: Vec::new(),
        }),
        Box::new(WsWrite { sink }),
    )
}

/// Accepts a WebSocket handshake on an already-accepted TCP stream.
pub async fn accept(stream: TcpStream) -> Result<Transport, TransportError> {
    let ws = timeout(HANDSHAKE_TIMEOUT, accept_async(stream))
        .await
        .map_err(|_| TransportError::Tls("websocket handshake timeout".to_string()))?
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(wrap(ws))
}

/// Connects a `ws://` client to a server's WebSocket listener.
pub async fn connect(server: &SmpServer) -> Result<Transport, TransportError> {
    let url = format!("ws://{}:{}", server.host, server.port_or_default());
    let (ws, _): (WebSocketStream<MaybeTlsStream<TcpStream>>, _) = connect_async(&url)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(wrap(ws))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ws_line_and_block() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream).await.unwrap()
        });

        let server = SmpServer::new("127.0.0.1", Some(addr.port()), None);
        let mut client = connect(&server).await.unwrap();
        let mut peer = server_task.await.unwrap();

        client.put_line("SUB").await.unwrap();
        client.put_bytes(b"12345\n").await.unwrap();
        assert_eq!(peer.get_line().await.unwrap(), "SUB");
        assert_eq!(peer.get_bytes(6).await.unwrap(), b"12345\n");

        // lines may span frame boundaries
        peer.put_bytes(b"OK").await.unwrap();
        peer.put_bytes(b"\n").await.unwrap();
        assert_eq!(client.get_line().await.unwrap(), "OK");
    }
}
