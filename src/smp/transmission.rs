// Signed transmission framing: the line-structured unit of the SMP wire

use crate::crypto::{b64_decode, b64_encode, SignKeyPair};
use crate::smp::command::{BrokerMsg, ClientCmd};
use crate::smp::error::{AgentError, ErrorCode, ERR_BAD_ENCODING};
use crate::transport::{TransportError, TransportRead, TransportWrite};

/// Correlation ids are at most this many raw bytes.
pub const MAX_CORR_ID_LEN: usize = 24;

/// Raw queue ids are exactly this many bytes.
pub const QUEUE_ID_LEN: usize = 24;

/// Largest message body the broker accepts.
pub const MAX_BODY: usize = 16 * 1024;

/// A parsed client transmission as the broker sees it: signature (empty
/// when unsigned), correlation id, queue id, command, plus the exact bytes
/// the signature covers.
#[derive(Debug)]
pub struct ClientTransmission {
    pub signature: Vec<u8>,
    pub corr_id: Vec<u8>,
    pub queue_id: Vec<u8>,
    pub command: ClientCmd,
    pub signed_bytes: Vec<u8>,
}

/// A broker transmission as the agent's server client sees it.
#[derive(Debug)]
pub struct BrokerTransmission {
    pub corr_id: Vec<u8>,
    pub queue_id: Vec<u8>,
    pub msg: BrokerMsg,
}

fn signable(corr_line: &str, queue_line: &str, cmd_line: &str, body: Option<&[u8]>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(
        corr_line.len() + queue_line.len() + cmd_line.len() + body.map_or(0, |b| b.len()) + 4,
    );
    bytes.extend_from_slice(corr_line.as_bytes());
    bytes.push(b'\n');
    bytes.extend_from_slice(queue_line.as_bytes());
    bytes.push(b'\n');
    bytes.extend_from_slice(cmd_line.as_bytes());
    bytes.push(b'\n');
    if let Some(body) = body {
        bytes.extend_from_slice(body);
        bytes.push(b'\n');
    }
    bytes
}

async fn read_body(
    r: &mut dyn TransportRead,
    len: usize,
) -> Result<Vec<u8>, TransportError> {
    let mut block = r.get_bytes(len + 1).await?;
    if block.pop() != Some(b'\n') {
        return Err(TransportError::BadBlockSize);
    }
    Ok(block)
}

/// Reads one client transmission off the wire. The outer error is fatal to
/// the transport; the inner error is a per-transmission failure to be
/// answered with `ERR <code>` echoing the (possibly empty) correlation id.
pub async fn read_client_transmission(
    r: &mut dyn TransportRead,
) -> Result<Result<ClientTransmission, (Vec<u8>, ErrorCode)>, TransportError> {
    let sig_line = r.get_line().await?;
    let corr_line = r.get_line().await?;
    let queue_line = r.get_line().await?;
    let cmd_line = r.get_line().await?;

    let corr_id = b64_decode(&corr_line).unwrap_or_default();
    let fail = |code| Ok(Err((corr_id.clone(), code)));

    let signature = if sig_line.is_empty() {
        Vec::new()
    } else {
        match b64_decode(&sig_line) {
            Ok(sig) => sig,
            Err(_) => return fail(ErrorCode::Block),
        }
    };
    if !corr_line.is_empty() && b64_decode(&corr_line).is_err() {
        return fail(ErrorCode::Block);
    }
    if corr_id.len() > MAX_CORR_ID_LEN {
        return fail(ErrorCode::Block);
    }
    let queue_id = if queue_line.is_empty() {
        Vec::new()
    } else {
        match b64_decode(&queue_line) {
            Ok(id) => id,
            Err(_) => return fail(ErrorCode::Block),
        }
    };

    let body = match ClientCmd::expected_body_len(&cmd_line) {
        Ok(Some(len)) if len > MAX_BODY => return fail(ErrorCode::CmdSyntax),
        Ok(Some(len)) => Some(read_body(r, len).await?),
        Ok(None) => None,
        Err(code) => return fail(code),
    };

    let signed_bytes = signable(&corr_line, &queue_line, &cmd_line, body.as_deref());
    match ClientCmd::parse(&cmd_line, body) {
        Ok(command) => Ok(Ok(ClientTransmission {
            signature,
            corr_id,
            queue_id,
            command,
            signed_bytes,
        })),
        Err(code) => fail(code),
    }
}

/// Writes a client transmission, signing the three lines and body with
/// `key` when given.
pub async fn write_client_transmission(
    w: &mut dyn TransportWrite,
    key: Option<&SignKeyPair>,
    corr_id: &[u8],
    queue_id: &[u8],
    command: &ClientCmd,
) -> Result<(), TransportError> {
    let corr_line = if corr_id.is_empty() {
        String::new()
    } else {
        b64_encode(corr_id)
    };
    let queue_line = if queue_id.is_empty() {
        String::new()
    } else {
        b64_encode(queue_id)
    };
    let (cmd_line, body) = command.serialize();

    let sig_line = match key {
        Some(key) => {
            let signed = signable(&corr_line, &queue_line, &cmd_line, body);
            b64_encode(&key.sign(&signed))
        }
        None => String::new(),
    };

    w.put_line(&sig_line).await?;
    w.put_line(&corr_line).await?;
    w.put_line(&queue_line).await?;
    w.put_line(&cmd_line).await?;
    if let Some(body) = body {
        w.put_bytes(body).await?;
        w.put_bytes(b"\n").await?;
    }
    Ok(())
}

/// Writes a broker transmission (always unsigned).
pub async fn write_broker_transmission(
    w: &mut dyn TransportWrite,
    corr_id: &[u8],
    queue_id: &[u8],
    msg: &BrokerMsg,
) -> Result<(), TransportError> {
    let corr_line = if corr_id.is_empty() {
        String::new()
    } else {
        b64_encode(corr_id)
    };
    let queue_line = if queue_id.is_empty() {
        String::new()
    } else {
        b64_encode(queue_id)
    };
    let (cmd_line, body) = msg.serialize();

    w.put_line("").await?;
    w.put_line(&corr_line).await?;
    w.put_line(&queue_line).await?;
    w.put_line(&cmd_line).await?;
    if let Some(body) = body {
        w.put_bytes(body).await?;
        w.put_bytes(b"\n").await?;
    }
    Ok(())
}

/// Reads a broker transmission on the agent side.
pub async fn read_broker_transmission(
    r: &mut dyn TransportRead,
) -> Result<Result<BrokerTransmission, AgentError>, TransportError> {
    let _sig_line = r.get_line().await?;
    let corr_line = r.get_line().await?;
    let queue_line = r.get_line().await?;
    let cmd_line = r.get_line().await?;

    let corr_id = match b64_decode(&corr_line) {
        Ok(id) => id,
        Err(_) if corr_line.is_empty() => Vec::new(),
        Err(_) => return Ok(Err(AgentError::Syntax(ERR_BAD_ENCODING))),
    };
    let queue_id = match b64_decode(&queue_line) {
        Ok(id) => id,
        Err(_) if queue_line.is_empty() => Vec::new(),
        Err(_) => return Ok(Err(AgentError::Syntax(ERR_BAD_ENCODING))),
    };

    let body = match BrokerMsg::expected_body_len(&cmd_line) {
        Ok(Some(len)) if len > MAX_BODY => {
            return Ok(Err(AgentError::Size));
        }
        Ok(Some(len)) => Some(read_body(r, len).await?),
        Ok(None) => None,
        Err(e) => return Ok(Err(e)),
    };

    match BrokerMsg::parse(&cmd_line, body) {
        Ok(msg) => Ok(Ok(BrokerTransmission {
            corr_id,
            queue_id,
            msg,
        })),
        Err(e) => Ok(Err(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{random_id, SignKeyPair};
    use crate::transport::tcp::from_tcp_stream;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (crate::transport::Transport, crate::transport::Transport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        (from_tcp_stream(server), from_tcp_stream(client.await.unwrap()))
    }

    #[tokio::test]
    async fn test_signed_round_trip() {
        let (mut server, mut client) = pair().await;
        let key = SignKeyPair::generate();
        let corr = random_id(16);
        let queue = random_id(QUEUE_ID_LEN);

        write_client_transmission(
            client.write.as_mut(),
            Some(&key),
            &corr,
            &queue,
            &ClientCmd::Send(b"hello".to_vec()),
        )
        .await
        .unwrap();

        let t = read_client_transmission(server.read.as_mut())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.corr_id, corr);
        assert_eq!(t.queue_id, queue);
        assert_eq!(t.command, ClientCmd::Send(b"hello".to_vec()));
        assert!(key
            .verify_key()
            .verify(&t.signed_bytes, &t.signature)
            .is_ok());
    }

    #[tokio::test]
    async fn test_unsigned_new_round_trip() {
        let (mut server, mut client) = pair().await;
        let verify = SignKeyPair::generate().verify_key();
        write_client_transmission(
            client.write.as_mut(),
            None,
            &random_id(16),
            &[],
            &ClientCmd::New(verify.clone()),
        )
        .await
        .unwrap();

        let t = read_client_transmission(server.read.as_mut())
            .await
            .unwrap()
            .unwrap();
        assert!(t.signature.is_empty());
        assert!(t.queue_id.is_empty());
        assert_eq!(t.command, ClientCmd::New(verify));
    }

    #[tokio::test]
    async fn test_broker_round_trip() {
        let (mut server, mut client) = pair().await;
        let corr = random_id(16);
        let queue = random_id(QUEUE_ID_LEN);
        write_broker_transmission(
            server.write.as_mut(),
            &corr,
            &queue,
            &BrokerMsg::Msg {
                msg_id: 3,
                timestamp: 1_700_000_000_000,
                body: b"payload".to_vec(),
            },
        )
        .await
        .unwrap();

        let t = read_broker_transmission(client.read.as_mut())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.corr_id, corr);
        assert_eq!(t.queue_id, queue);
        assert!(matches!(t.msg, BrokerMsg::Msg { msg_id: 3, .. }));
    }

    #[tokio::test]
    async fn test_bad_command_is_not_fatal() {
        let (mut server, mut client) = pair().await;
        client.put_line("").await.unwrap();
        client.put_line(&b64_encode(&random_id(8))).await.unwrap();
        client.put_line("").await.unwrap();
        client.put_line("FROB nonsense").await.unwrap();

        let result = read_client_transmission(server.read.as_mut())
            .await
            .unwrap();
        let (corr, code) = result.unwrap_err();
        assert!(!corr.is_empty());
        assert_eq!(code, ErrorCode::CmdSyntax);

        // the stream stays usable for the next transmission
        write_client_transmission(client.write.as_mut(), None, &[], &[], &ClientCmd::Ping)
            .await
            .unwrap();
        let t = read_client_transmission(server.read.as_mut())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.command, ClientCmd::Ping);
    }

    #[test]
    fn test_signable_covers_body() {
        let with = signable("c", "q", "SEND 2", Some(b"ab"));
        let without = signable("c", "q", "SEND 2", None);
        assert_ne!(with, without);
    }
}
