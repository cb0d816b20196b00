// Server addresses and out-of-band queue invitations

use crate::crypto::{b64_decode, b64_encode, EncryptKey, KeyHash};
use crate::smp::error::{AgentError, ERR_BAD_INVITATION, ERR_BAD_SERVER};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SMP_PORT: u16 = 5223;

/// An SMP server endpoint, optionally pinned to a certificate digest.
///
/// Canonical textual form is `host[:port][#key_hash]`; the URI form
/// `smp://key_hash@host[:port]` is accepted on parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SmpServer {
    pub host: String,
    pub port: Option<u16>,
    pub key_hash: Option<KeyHash>,
}

impl SmpServer {
    pub fn new(host: impl Into<String>, port: Option<u16>, key_hash: Option<KeyHash>) -> Self {
        Self {
            host: host.into(),
            port,
            key_hash,
        }
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SMP_PORT)
    }

    pub fn serialize(&self) -> String {
        let mut s = self.host.clone();
        if let Some(port) = self.port {
            s.push(':');
            s.push_str(&port.to_string());
        }
        if let Some(hash) = &self.key_hash {
            s.push('#');
            s.push_str(&hash.encode());
        }
        s
    }

    pub fn parse(s: &str) -> Result<Self, AgentError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AgentError::Syntax(ERR_BAD_SERVER));
        }
        if let Some(rest) = s.strip_prefix("smp://") {
            return Self::parse_uri(rest);
        }
        let (host_port, key_hash) = match s.split_once('#') {
            Some((hp, h)) if !h.is_empty() => (
                hp,
                Some(KeyHash::decode(h).map_err(|_| AgentError::Syntax(ERR_BAD_SERVER))?),
            ),
            Some((hp, _)) => (hp, None),
            None => (s, None),
        };
        let (host, port) = split_host_port(host_port)?;
        Ok(Self {
            host,
            port,
            key_hash,
        })
    }

    // smp://key_hash@host[:port], empty key_hash meaning untrusted
    fn parse_uri(rest: &str) -> Result<Self, AgentError> {
        let (hash_part, host_port) = rest
            .split_once('@')
            .ok_or(AgentError::Syntax(ERR_BAD_SERVER))?;
        let key_hash = if hash_part.is_empty() {
            None
        } else {
            Some(KeyHash::decode(hash_part).map_err(|_| AgentError::Syntax(ERR_BAD_SERVER))?)
        };
        let (host, port) = split_host_port(host_port)?;
        Ok(Self {
            host,
            port,
            key_hash,
        })
    }
}

fn split_host_port(s: &str) -> Result<(String, Option<u16>), AgentError> {
    match s.split_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(AgentError::Syntax(ERR_BAD_SERVER));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| AgentError::Syntax(ERR_BAD_SERVER))?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((s.to_string(), None)),
    }
}

impl std::fmt::Display for SmpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl TryFrom<String> for SmpServer {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).map_err(|e| format!("bad server address: {e}"))
    }
}

impl From<SmpServer> for String {
    fn from(s: SmpServer) -> String {
        s.serialize()
    }
}

/// The credentials a joining party needs to reach a queue as sender,
/// shared out-of-band: `smp::<server>::<sender_id>::<encryption_key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpQueueInfo {
    pub server: SmpServer,
    pub sender_id: Vec<u8>,
    pub encryption_key: EncryptKey,
}

impl SmpQueueInfo {
    pub fn serialize(&self) -> String {
        format!(
            "smp::{}::{}::{}",
            self.server.serialize(),
            b64_encode(&self.sender_id),
            self.encryption_key.encode()
        )
    }

    pub fn parse(s: &str) -> Result<Self, AgentError> {
        let parts: Vec<&str> = s.split("::").collect();
        if parts.len() != 4 || parts[0] != "smp" {
            return Err(AgentError::Syntax(ERR_BAD_INVITATION));
        }
        let server =
            SmpServer::parse(parts[1]).map_err(|_| AgentError::Syntax(ERR_BAD_INVITATION))?;
        let sender_id =
            b64_decode(parts[2]).map_err(|_| AgentError::Syntax(ERR_BAD_INVITATION))?;
        if sender_id.is_empty() {
            return Err(AgentError::Syntax(ERR_BAD_INVITATION));
        }
        let encryption_key =
            EncryptKey::decode(parts[3]).map_err(|_| AgentError::Syntax(ERR_BAD_INVITATION))?;
        Ok(Self {
            server,
            sender_id,
            encryption_key,
        })
    }
}

impl std::fmt::Display for SmpQueueInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{random_id, EncKeyPair};

    #[test]
    fn test_server_round_trip() {
        let cases = [
            "localhost",
            "localhost:5223",
            "smp.example.com:443",
        ];
        for case in cases {
            let server = SmpServer::parse(case).unwrap();
            assert_eq!(server.serialize(), case);
        }
    }

    #[test]
    fn test_server_with_key_hash() {
        let hash = KeyHash(crate::crypto::sha256(b"cert"));
        let server = SmpServer::new("host", Some(5223), Some(hash));
        let parsed = SmpServer::parse(&server.serialize()).unwrap();
        assert_eq!(parsed, server);
    }

    #[test]
    fn test_server_uri_form() {
        let hash = KeyHash(crate::crypto::sha256(b"cert"));
        let uri = format!("smp://{}@host:5223", hash.encode());
        let parsed = SmpServer::parse(&uri).unwrap();
        assert_eq!(parsed.host, "host");
        assert_eq!(parsed.port, Some(5223));
        assert_eq!(parsed.key_hash, Some(hash));
        // untrusted (empty hash) form
        let parsed = SmpServer::parse("smp://@host").unwrap();
        assert_eq!(parsed.key_hash, None);
    }

    #[test]
    fn test_bad_servers_rejected() {
        for bad in ["", ":5223", "host:notaport", "smp://host"] {
            assert!(SmpServer::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_queue_info_round_trip() {
        let info = SmpQueueInfo {
            server: SmpServer::parse("localhost:5223").unwrap(),
            sender_id: random_id(24),
            encryption_key: EncKeyPair::generate().public(),
        };
        let parsed = SmpQueueInfo::parse(&info.serialize()).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_bad_invitation_rejected() {
        assert!(SmpQueueInfo::parse("smp::host").is_err());
        assert!(SmpQueueInfo::parse("xmp::host::aaa::bbb").is_err());
    }
}
