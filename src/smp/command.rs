// SMP command grammar: client commands and broker responses

use crate::crypto::{b64_decode, b64_encode, VerifyKey};
use crate::smp::error::{AgentError, ErrorCode, ERR_BAD_COMMAND};

/// Commands a recipient or sender submits to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCmd {
    /// Create a queue; the argument is the recipient's verification key.
    New(VerifyKey),
    /// Subscribe the session to the queue.
    Sub,
    /// Set the sender's verification key, securing the queue.
    Key(VerifyKey),
    /// Delete the delivered head message.
    Ack,
    /// Disable the queue for senders.
    Off,
    /// Delete the queue.
    Del,
    /// Enqueue a message body.
    Send(Vec<u8>),
    /// Keepalive.
    Ping,
}

impl ClientCmd {
    /// True for commands that operate on a recipient id and must be signed
    /// by the queue's recipient key.
    pub fn is_recipient_cmd(&self) -> bool {
        matches!(
            self,
            ClientCmd::Sub | ClientCmd::Key(_) | ClientCmd::Ack | ClientCmd::Off | ClientCmd::Del
        )
    }

    pub fn serialize(&self) -> (String, Option<&[u8]>) {
        match self {
            ClientCmd::New(key) => (format!("NEW {}", key.encode()), None),
            ClientCmd::Sub => ("SUB".to_string(), None),
            ClientCmd::Key(key) => (format!("KEY {}", key.encode()), None),
            ClientCmd::Ack => ("ACK".to_string(), None),
            ClientCmd::Off => ("OFF".to_string(), None),
            ClientCmd::Del => ("DEL".to_string(), None),
            ClientCmd::Send(body) => (format!("SEND {}", body.len()), Some(body)),
            ClientCmd::Ping => ("PING".to_string(), None),
        }
    }

    /// Body length announced by a command line, before the body is read.
    pub fn expected_body_len(line: &str) -> Result<Option<usize>, ErrorCode> {
        match line.split_once(' ') {
            Some(("SEND", n)) => n
                .parse::<usize>()
                .map(Some)
                .map_err(|_| ErrorCode::CmdSyntax),
            _ => Ok(None),
        }
    }

    pub fn parse(line: &str, body: Option<Vec<u8>>) -> Result<Self, ErrorCode> {
        let mut parts = line.splitn(2, ' ');
        let head = parts.next().unwrap_or_default();
        let arg = parts.next();
        match (head, arg, body) {
            ("NEW", Some(key), None) => Ok(ClientCmd::New(
                VerifyKey::decode(key).map_err(|_| ErrorCode::CmdSyntax)?,
            )),
            ("SUB", None, None) => Ok(ClientCmd::Sub),
            ("KEY", Some(key), None) => Ok(ClientCmd::Key(
                VerifyKey::decode(key).map_err(|_| ErrorCode::CmdSyntax)?,
            )),
            ("ACK", None, None) => Ok(ClientCmd::Ack),
            ("OFF", None, None) => Ok(ClientCmd::Off),
            ("DEL", None, None) => Ok(ClientCmd::Del),
            ("SEND", Some(n), Some(body)) => {
                let len: usize = n.parse().map_err(|_| ErrorCode::CmdSyntax)?;
                if len != body.len() {
                    return Err(ErrorCode::CmdSyntax);
                }
                Ok(ClientCmd::Send(body))
            }
            ("PING", None, None) => Ok(ClientCmd::Ping),
            _ => Err(ErrorCode::CmdSyntax),
        }
    }
}

/// Responses and pushes the broker sends to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerMsg {
    /// Queue created: recipient id and sender id.
    Ids {
        recipient_id: Vec<u8>,
        sender_id: Vec<u8>,
    },
    /// A delivered message.
    Msg {
        msg_id: u64,
        timestamp: u64,
        body: Vec<u8>,
    },
    /// The session lost its subscription to another subscriber.
    End,
    Ok,
    Err(ErrorCode),
    Pong,
}

impl BrokerMsg {
    pub fn serialize(&self) -> (String, Option<&[u8]>) {
        match self {
            BrokerMsg::Ids {
                recipient_id,
                sender_id,
            } => (
                format!("IDS {} {}", b64_encode(recipient_id), b64_encode(sender_id)),
                None,
            ),
            BrokerMsg::Msg {
                msg_id,
                timestamp,
                body,
            } => (format!("MSG {msg_id} {timestamp} {}", body.len()), Some(body)),
            BrokerMsg::End => ("END".to_string(), None),
            BrokerMsg::Ok => ("OK".to_string(), None),
            BrokerMsg::Err(code) => (format!("ERR {}", code.serialize()), None),
            BrokerMsg::Pong => ("PONG".to_string(), None),
        }
    }

    pub fn expected_body_len(line: &str) -> Result<Option<usize>, AgentError> {
        let mut parts = line.split(' ');
        if parts.next() != Some("MSG") {
            return Ok(None);
        }
        let n = parts
            .nth(2)
            .ok_or(AgentError::Syntax(ERR_BAD_COMMAND))?;
        n.parse::<usize>()
            .map(Some)
            .map_err(|_| AgentError::Syntax(ERR_BAD_COMMAND))
    }

    pub fn parse(line: &str, body: Option<Vec<u8>>) -> Result<Self, AgentError> {
        let bad = || AgentError::Syntax(ERR_BAD_COMMAND);
        let mut parts = line.splitn(2, ' ');
        let head = parts.next().unwrap_or_default();
        let rest = parts.next();
        match (head, rest, body) {
            ("IDS", Some(ids), None) => {
                let (rid, sid) = ids.split_once(' ').ok_or_else(bad)?;
                Ok(BrokerMsg::Ids {
                    recipient_id: b64_decode(rid).map_err(|_| bad())?,
                    sender_id: b64_decode(sid).map_err(|_| bad())?,
                })
            }
            ("MSG", Some(args), Some(body)) => {
                let fields: Vec<&str> = args.split(' ').collect();
                if fields.len() != 3 {
                    return Err(bad());
                }
                let msg_id = fields[0].parse().map_err(|_| bad())?;
                let timestamp = fields[1].parse().map_err(|_| bad())?;
                let len: usize = fields[2].parse().map_err(|_| bad())?;
                if len != body.len() {
                    return Err(bad());
                }
                Ok(BrokerMsg::Msg {
                    msg_id,
                    timestamp,
                    body,
                })
            }
            ("END", None, None) => Ok(BrokerMsg::End),
            ("OK", None, None) => Ok(BrokerMsg::Ok),
            ("ERR", Some(code), None) => {
                Ok(BrokerMsg::Err(ErrorCode::parse(code).ok_or_else(bad)?))
            }
            ("PONG", None, None) => Ok(BrokerMsg::Pong),
            _ => Err(bad()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{random_id, SignKeyPair};

    fn round_trip_client(cmd: ClientCmd) {
        let (line, body) = cmd.serialize();
        let body = body.map(|b| b.to_vec());
        assert_eq!(ClientCmd::parse(&line, body).unwrap(), cmd);
    }

    #[test]
    fn test_client_cmd_round_trip() {
        let key = SignKeyPair::generate().verify_key();
        round_trip_client(ClientCmd::New(key.clone()));
        round_trip_client(ClientCmd::Sub);
        round_trip_client(ClientCmd::Key(key));
        round_trip_client(ClientCmd::Ack);
        round_trip_client(ClientCmd::Off);
        round_trip_client(ClientCmd::Del);
        round_trip_client(ClientCmd::Send(b"hello".to_vec()));
        round_trip_client(ClientCmd::Ping);
    }

    #[test]
    fn test_broker_msg_round_trip() {
        let msgs = [
            BrokerMsg::Ids {
                recipient_id: random_id(24),
                sender_id: random_id(24),
            },
            BrokerMsg::Msg {
                msg_id: 7,
                timestamp: 1_700_000_000_000,
                body: b"payload".to_vec(),
            },
            BrokerMsg::End,
            BrokerMsg::Ok,
            BrokerMsg::Err(ErrorCode::Auth),
            BrokerMsg::Err(ErrorCode::CmdSyntax),
            BrokerMsg::Pong,
        ];
        for msg in msgs {
            let (line, body) = msg.serialize();
            let body = body.map(|b| b.to_vec());
            assert_eq!(BrokerMsg::parse(&line, body).unwrap(), msg);
        }
    }

    #[test]
    fn test_send_length_mismatch_rejected() {
        assert_eq!(
            ClientCmd::parse("SEND 10", Some(b"short".to_vec())),
            Err(ErrorCode::CmdSyntax)
        );
    }

    #[test]
    fn test_expected_body_len() {
        assert_eq!(ClientCmd::expected_body_len("SEND 12").unwrap(), Some(12));
        assert_eq!(ClientCmd::expected_body_len("SUB").unwrap(), None);
        assert!(ClientCmd::expected_body_len("SEND x").is_err());
        assert_eq!(
            BrokerMsg::expected_body_len("MSG 1 123 5").unwrap(),
            Some(5)
        );
        assert_eq!(BrokerMsg::expected_body_len("OK").unwrap(), None);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ClientCmd::parse("FETCH", None).is_err());
        assert!(ClientCmd::parse("NEW not-base64!!", None).is_err());
        assert!(BrokerMsg::parse("MSG 1 2", None).is_err());
    }
}
