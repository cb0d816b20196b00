// Agent message envelopes carried inside SMP message bodies

use crate::crypto::{b64_decode, b64_encode, sha256, VerifyKey};
use crate::smp::address::SmpQueueInfo;
use crate::smp::error::{AgentError, ERR_BAD_MESSAGE};

/// Largest body a local client may hand the agent; the envelope and the
/// sealed-box framing must still fit in the broker's 16 KiB body cap.
pub const MAX_AGENT_BODY: usize = 15 * 1024 + 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Ack,
    NoAck,
}

/// Handshake and data payloads inside a hash-chained agent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentPayload {
    /// The sender's verification key and requested ack behaviour.
    Hello {
        verify_key: VerifyKey,
        ack_mode: AckMode,
    },
    /// The reverse-direction queue the peer should attach as sender.
    Reply(SmpQueueInfo),
    /// An application message.
    Msg(Vec<u8>),
}

/// A sequenced agent message: strictly monotonic id, sender clock, and the
/// SHA-256 of the previously sent serialized message (empty for the first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMessage {
    pub agent_msg_id: u64,
    pub agent_ts: u64,
    pub prev_hash: Vec<u8>,
    pub payload: AgentPayload,
}

/// What travels inside a SEND body, before sealing: either the one-time
/// sender confirmation or a sequenced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEnvelope {
    Confirmation { sender_key: VerifyKey },
    Message(AgentMessage),
}

impl AgentEnvelope {
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            AgentEnvelope::Confirmation { sender_key } => {
                format!("KEY {}\n", sender_key.encode()).into_bytes()
            }
            AgentEnvelope::Message(msg) => {
                let prev = if msg.prev_hash.is_empty() {
                    "-".to_string()
                } else {
                    b64_encode(&msg.prev_hash)
                };
                let mut out =
                    format!("{} {} {}\n", msg.agent_msg_id, msg.agent_ts, prev).into_bytes();
                match &msg.payload {
                    AgentPayload::Hello {
                        verify_key,
                        ack_mode,
                    } => {
                        let mode = match ack_mode {
                            AckMode::Ack => "ACK",
                            AckMode::NoAck => "NO_ACK",
                        };
                        out.extend_from_slice(
                            format!("HELLO {} {mode}\n", verify_key.encode()).as_bytes(),
                        );
                    }
                    AgentPayload::Reply(info) => {
                        out.extend_from_slice(format!("REPLY {}\n", info.serialize()).as_bytes());
                    }
                    AgentPayload::Msg(body) => {
                        out.extend_from_slice(format!("MSG {}\n", body.len()).as_bytes());
                        out.extend_from_slice(body);
                        out.push(b'\n');
                    }
                }
                out
            }
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, AgentError> {
        let bad = || AgentError::Syntax(ERR_BAD_MESSAGE);
        let text_end = bytes.len();
        let first_nl = bytes.iter().position(|&b| b == b'\n').ok_or_else(bad)?;
        let first = std::str::from_utf8(&bytes[..first_nl]).map_err(|_| bad())?;

        if let Some(key) = first.strip_prefix("KEY ") {
            if first_nl + 1 != text_end {
                return Err(bad());
            }
            return Ok(AgentEnvelope::Confirmation {
                sender_key: VerifyKey::decode(key).map_err(|_| bad())?,
            });
        }

        let fields: Vec<&str> = first.split(' ').collect();
        if fields.len() != 3 {
            return Err(bad());
        }
        let agent_msg_id: u64 = fields[0].parse().map_err(|_| bad())?;
        let agent_ts: u64 = fields[1].parse().map_err(|_| bad())?;
        let prev_hash = if fields[2] == "-" {
            Vec::new()
        } else {
            b64_decode(fields[2]).map_err(|_| bad())?
        };

        let rest = &bytes[first_nl + 1..];
        let second_nl = rest.iter().position(|&b| b == b'\n').ok_or_else(bad)?;
        let second = std::str::from_utf8(&rest[..second_nl]).map_err(|_| bad())?;
        let tail = &rest[second_nl + 1..];

        let payload = if let Some(args) = second.strip_prefix("HELLO ") {
            if !tail.is_empty() {
                return Err(bad());
            }
            let (key, mode) = args.split_once(' ').ok_or_else(bad)?;
            let ack_mode = match mode {
                "ACK" => AckMode::Ack,
                "NO_ACK" => AckMode::NoAck,
                _ => return Err(bad()),
            };
            AgentPayload::Hello {
                verify_key: VerifyKey::decode(key).map_err(|_| bad())?,
                ack_mode,
            }
        } else if let Some(info) = second.strip_prefix("REPLY ") {
            if !tail.is_empty() {
                return Err(bad());
            }
            AgentPayload::Reply(SmpQueueInfo::parse(info).map_err(|_| bad())?)
        } else if let Some(n) = second.strip_prefix("MSG ") {
            let len: usize = n.parse().map_err(|_| bad())?;
            if tail.len() != len + 1 || tail[len] != b'\n' {
                return Err(bad());
            }
            AgentPayload::Msg(tail[..len].to_vec())
        } else {
            return Err(bad());
        };

        Ok(AgentEnvelope::Message(AgentMessage {
            agent_msg_id,
            agent_ts,
            prev_hash,
            payload,
        }))
    }
}

/// The hash-chain link for a serialized agent message.
pub fn chain_hash(serialized: &[u8]) -> Vec<u8> {
    sha256(serialized).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{random_id, EncKeyPair, SignKeyPair};
    use crate::smp::address::SmpServer;

    fn round_trip(env: AgentEnvelope) {
        let bytes = env.serialize();
        assert_eq!(AgentEnvelope::parse(&bytes).unwrap(), env);
    }

    #[test]
    fn test_confirmation_round_trip() {
        round_trip(AgentEnvelope::Confirmation {
            sender_key: SignKeyPair::generate().verify_key(),
        });
    }

    #[test]
    fn test_hello_round_trip() {
        round_trip(AgentEnvelope::Message(AgentMessage {
            agent_msg_id: 1,
            agent_ts: 1_700_000_000_000,
            prev_hash: Vec::new(),
            payload: AgentPayload::Hello {
                verify_key: SignKeyPair::generate().verify_key(),
                ack_mode: AckMode::Ack,
            },
        }));
    }

    #[test]
    fn test_reply_round_trip() {
        round_trip(AgentEnvelope::Message(AgentMessage {
            agent_msg_id: 2,
            agent_ts: 5,
            prev_hash: chain_hash(b"previous"),
            payload: AgentPayload::Reply(SmpQueueInfo {
                server: SmpServer::parse("localhost:5223").unwrap(),
                sender_id: random_id(24),
                encryption_key: EncKeyPair::generate().public(),
            }),
        }));
    }

    #[test]
    fn test_msg_round_trip() {
        round_trip(AgentEnvelope::Message(AgentMessage {
            agent_msg_id: 3,
            agent_ts: 6,
            prev_hash: chain_hash(b"previous"),
            payload: AgentPayload::Msg(b"the payload\nwith a newline".to_vec()),
        }));
    }

    #[test]
    fn test_chain_property() {
        let first = AgentEnvelope::Message(AgentMessage {
            agent_msg_id: 1,
            agent_ts: 1,
            prev_hash: Vec::new(),
            payload: AgentPayload::Msg(b"one".to_vec()),
        });
        let second = AgentEnvelope::Message(AgentMessage {
            agent_msg_id: 2,
            agent_ts: 2,
            prev_hash: chain_hash(&first.serialize()),
            payload: AgentPayload::Msg(b"two".to_vec()),
        });
        match AgentEnvelope::parse(&second.serialize()).unwrap() {
            AgentEnvelope::Message(m) => {
                assert_eq!(m.prev_hash, chain_hash(&first.serialize()))
            }
            _ => panic!("expected message"),
        }
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(AgentEnvelope::parse(b"").is_err());
        assert!(AgentEnvelope::parse(b"1 2\nMSG 1\nx\n").is_err());
        assert!(AgentEnvelope::parse(b"1 2 -\nMSG 5\nab\n").is_err());
        assert!(AgentEnvelope::parse(b"1 2 -\nWHAT 5\n").is_err());
    }
}
