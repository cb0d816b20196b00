// Agent wire grammar: commands from local clients, events back to them

use crate::smp::address::{SmpQueueInfo, SmpServer};
use crate::smp::error::{AgentError, ERR_BAD_COMMAND};
use crate::transport::{TransportError, TransportRead, TransportWrite};

/// Whether a JOIN provisions a reverse queue, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMode {
    Off,
    On,
    Via(SmpServer),
}

/// Commands a local client submits to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCmd {
    /// Create a connection: provision a receive queue on the server and
    /// hand back an invitation.
    New(SmpServer),
    /// Accept an invitation.
    Join(SmpQueueInfo, ReplyMode),
    /// Resubscribe the connection's receive queue.
    Sub,
    /// Send a message to the peer.
    Send(Vec<u8>),
    /// Acknowledge a delivered message.
    Ack(u64),
}

/// Verification outcome attached to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgStatus {
    Ok,
    /// The hash chain did not link to the previous message.
    BadHash,
    /// Agent message ids jumped; the listed range was never received.
    Skipped { from: u64, to: u64 },
}

impl MsgStatus {
    fn serialize(&self) -> String {
        match self {
            MsgStatus::Ok => "OK".to_string(),
            MsgStatus::BadHash => "HASH".to_string(),
            MsgStatus::Skipped { from, to } => format!("SKIP={from}-{to}"),
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(MsgStatus::Ok),
            "HASH" => Some(MsgStatus::BadHash),
            _ => {
                let range = s.strip_prefix("SKIP=")?;
                let (from, to) = range.split_once('-')?;
                Some(MsgStatus::Skipped {
                    from: from.parse().ok()?,
                    to: to.parse().ok()?,
                })
            }
        }
    }
}

/// Events the agent sends to local clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// The invitation for the peer, produced by NEW.
    Inv(SmpQueueInfo),
    /// The connection reached the active state.
    Con,
    /// A message from the peer.
    Msg {
        agent_msg_id: u64,
        broker_ts: u64,
        agent_ts: u64,
        status: MsgStatus,
        body: Vec<u8>,
    },
    Ok,
    Err(AgentError),
}

impl AgentCmd {
    pub fn serialize(&self) -> (String, Option<&[u8]>) {
        match self {
            AgentCmd::New(server) => (format!("NEW {}", server.serialize()), None),
            AgentCmd::Join(info, ReplyMode::On) => (format!("JOIN {}", info.serialize()), None),
            AgentCmd::Join(info, ReplyMode::Off) => {
                (format!("JOIN {} NO_REPLY", info.serialize()), None)
            }
            AgentCmd::Join(info, ReplyMode::Via(server)) => (
                format!("JOIN {} {}", info.serialize(), server.serialize()),
                None,
            ),
            AgentCmd::Sub => ("SUB".to_string(), None),
            AgentCmd::Send(body) => (format!("SEND {}", body.len()), Some(body)),
            AgentCmd::Ack(id) => (format!("ACK {id}"), None),
        }
    }

    pub fn expected_body_len(line: &str) -> Result<Option<usize>, AgentError> {
        match line.split_once(' ') {
            Some(("SEND", n)) => n
                .parse::<usize>()
                .map(Some)
                .map_err(|_| AgentError::Syntax(ERR_BAD_COMMAND)),
            _ => Ok(None),
        }
    }

    pub fn parse(line: &str, body: Option<Vec<u8>>) -> Result<Self, AgentError> {
        let bad = || AgentError::Syntax(ERR_BAD_COMMAND);
        let mut parts = line.splitn(2, ' ');
        let head = parts.next().unwrap_or_default();
        let rest = parts.next();
        match (head, rest, body) {
            ("NEW", Some(server), None) => Ok(AgentCmd::New(SmpServer::parse(server)?)),
            ("JOIN", Some(args), None) => {
                let (info, mode) = match args.split_once(' ') {
                    None => (SmpQueueInfo::parse(args)?, ReplyMode::On),
                    Some((info, "NO_REPLY")) => (SmpQueueInfo::parse(info)?, ReplyMode::Off),
                    Some((info, server)) => (
                        SmpQueueInfo::parse(info)?,
                        ReplyMode::Via(SmpServer::parse(server)?),
                    ),
                };
                Ok(AgentCmd::Join(info, mode))
            }
            ("SUB", None, None) => Ok(AgentCmd::Sub),
            ("SEND", Some(n), Some(body)) => {
                let len: usize = n.parse().map_err(|_| bad())?;
                if len != body.len() {
                    return Err(bad());
                }
                Ok(AgentCmd::Send(body))
            }
            ("ACK", Some(id), None) => Ok(AgentCmd::Ack(id.parse().map_err(|_| bad())?)),
            _ => Err(bad()),
        }
    }
}

impl AgentEvent {
    pub fn serialize(&self) -> (String, Option<&[u8]>) {
        match self {
            AgentEvent::Inv(info) => (format!("INV {}", info.serialize()), None),
            AgentEvent::Con => ("CON".to_string(), None),
            AgentEvent::Msg {
                agent_msg_id,
                broker_ts,
                agent_ts,
                status,
                body,
            } => (
                format!(
                    "MSG {agent_msg_id} {broker_ts} {agent_ts} {} {}",
                    status.serialize(),
                    body.len()
                ),
                Some(body),
            ),
            AgentEvent::Ok => ("OK".to_string(), None),
            AgentEvent::Err(e) => (format!("ERR {}", e.serialize()), None),
        }
    }

    pub fn expected_body_len(line: &str) -> Result<Option<usize>, AgentError> {
        let mut parts = line.split(' ');
        if parts.next() != Some("MSG") {
            return Ok(None);
        }
        let n = parts.nth(4).ok_or(AgentError::Syntax(ERR_BAD_COMMAND))?;
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
            ("INV", Some(info), None) => Ok(AgentEvent::Inv(SmpQueueInfo::parse(info)?)),
            ("CON", None, None) => Ok(AgentEvent::Con),
            ("MSG", Some(args), Some(body)) => {
                let fields: Vec<&str> = args.split(' ').collect();
                if fields.len() != 5 {
                    return Err(bad());
                }
                let len: usize = fields[4].parse().map_err(|_| bad())?;
                if len != body.len() {
                    return Err(bad());
                }
                Ok(AgentEvent::Msg {
                    agent_msg_id: fields[0].parse().map_err(|_| bad())?,
                    broker_ts: fields[1].parse().map_err(|_| bad())?,
                    agent_ts: fields[2].parse().map_err(|_| bad())?,
                    status: MsgStatus::parse(fields[3]).ok_or_else(bad)?,
                    body,
                })
            }
            ("OK", None, None) => Ok(AgentEvent::Ok),
            ("ERR", Some(e), None) => Ok(AgentEvent::Err(AgentError::parse(e).ok_or_else(bad)?)),
            _ => Err(bad()),
        }
    }
}

/// Reads one transmission off the agent's local wire: correlation id,
/// connection alias, command, optional body. The inner error echoes the
/// correlation id for the `ERR` reply.
pub async fn read_agent_transmission(
    r: &mut dyn TransportRead,
) -> Result<Result<(String, String, AgentCmd), (String, AgentError)>, TransportError> {
    let corr_id = r.get_line().await?;
    let alias = r.get_line().await?;
    let cmd_line = r.get_line().await?;

    let body = match AgentCmd::expected_body_len(&cmd_line) {
        Ok(Some(len)) if len > crate::agent::envelope::MAX_AGENT_BODY => {
            return Ok(Err((corr_id, AgentError::Size)))
        }
        Ok(Some(len)) => {
            let mut block = r.get_bytes(len + 1).await?;
            if block.pop() != Some(b'\n') {
                return Err(TransportError::BadBlockSize);
            }
            Some(block)
        }
        Ok(None) => None,
        Err(e) => return Ok(Err((corr_id, e))),
    };

    match AgentCmd::parse(&cmd_line, body) {
        Ok(cmd) => Ok(Ok((corr_id, alias, cmd))),
        Err(e) => Ok(Err((corr_id, e))),
    }
}

pub async fn write_agent_transmission(
    w: &mut dyn TransportWrite,
    corr_id: &str,
    alias: &str,
    cmd: &AgentCmd,
) -> Result<(), TransportError> {
    let (line, body) = cmd.serialize();
    w.put_line(corr_id).await?;
    w.put_line(alias).await?;
    w.put_line(&line).await?;
    if let Some(body) = body {
        w.put_bytes(body).await?;
        w.put_bytes(b"\n").await?;
    }
    Ok(())
}

pub async fn write_agent_event(
    w: &mut dyn TransportWrite,
    corr_id: &str,
    alias: &str,
    event: &AgentEvent,
) -> Result<(), TransportError> {
    let (line, body) = event.serialize();
    w.put_line(corr_id).await?;
    w.put_line(alias).await?;
    w.put_line(&line).await?;
    if let Some(body) = body {
        w.put_bytes(body).await?;
        w.put_bytes(b"\n").await?;
    }
    Ok(())
}

/// Reads one agent event on the client side of the local wire.
pub async fn read_agent_event(
    r: &mut dyn TransportRead,
) -> Result<Result<(String, String, AgentEvent), AgentError>, TransportError> {
    let corr_id = r.get_line().await?;
    let alias = r.get_line().await?;
    let line = r.get_line().await?;

    let body = match AgentEvent::expected_body_len(&line) {
        Ok(Some(len)) => {
            let mut block = r.get_bytes(len + 1).await?;
            if block.pop() != Some(b'\n') {
                return Err(TransportError::BadBlockSize);
            }
            Some(block)
        }
        Ok(None) => None,
        Err(e) => return Ok(Err(e)),
    };

    match AgentEvent::parse(&line, body) {
        Ok(event) => Ok(Ok((corr_id, alias, event))),
        Err(e) => Ok(Err(e)),
    }
}
