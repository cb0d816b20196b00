// Protocol error taxonomy for broker and agent wires

use thiserror::Error;

/// Syntax failure reasons carried inside `SYNTAX(code)` errors.
pub const ERR_BAD_ENCODING: u32 = 10;
pub const ERR_BAD_COMMAND: u32 = 11;
pub const ERR_BAD_INVITATION: u32 = 12;
pub const ERR_NO_CONN_ALIAS: u32 = 13;
pub const ERR_BAD_MESSAGE: u32 = 14;
pub const ERR_BAD_SERVER: u32 = 15;

/// Errors the broker surfaces to clients as `ERR <code>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// Transmission block could not be read or framed.
    Block,
    /// Command failed to parse.
    CmdSyntax,
    /// Command is valid but not allowed in the queue's current state.
    CmdProhibited,
    /// Command requires a signature and none was given.
    CmdNoAuth,
    /// Command must not be signed but was.
    CmdHasAuth,
    /// Command requires a queue id and none was given.
    CmdNoQueue,
    /// Signature or key verification failed.
    Auth,
    /// Message buffer is full.
    Quota,
    /// No message to operate on.
    NoMsg,
    /// Storage or internal failure.
    Internal,
}

impl ErrorCode {
    pub fn serialize(&self) -> &'static str {
        match self {
            ErrorCode::Block => "BLOCK",
            ErrorCode::CmdSyntax => "CMD SYNTAX",
            ErrorCode::CmdProhibited => "CMD PROHIBITED",
            ErrorCode::CmdNoAuth => "CMD NO_AUTH",
            ErrorCode::CmdHasAuth => "CMD HAS_AUTH",
            ErrorCode::CmdNoQueue => "CMD NO_QUEUE",
            ErrorCode::Auth => "AUTH",
            ErrorCode::Quota => "QUOTA",
            ErrorCode::NoMsg => "NO_MSG",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "BLOCK" => ErrorCode::Block,
            "CMD SYNTAX" => ErrorCode::CmdSyntax,
            "CMD PROHIBITED" => ErrorCode::CmdProhibited,
            "CMD NO_AUTH" => ErrorCode::CmdNoAuth,
            "CMD HAS_AUTH" => ErrorCode::CmdHasAuth,
            "CMD NO_QUEUE" => ErrorCode::CmdNoQueue,
            "AUTH" => ErrorCode::Auth,
            "QUOTA" => ErrorCode::Quota,
            "NO_MSG" => ErrorCode::NoMsg,
            "INTERNAL" => ErrorCode::Internal,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.serialize())
    }
}

/// Errors the agent surfaces to its local clients as `ERR <err>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("UNKNOWN")]
    Unknown,
    #[error("PROHIBITED")]
    Prohibited,
    #[error("SYNTAX {0}")]
    Syntax(u32),
    #[error("BROKER {0}")]
    Broker(BrokerFailure),
    #[error("SMP {0}")]
    Smp(ErrorCode),
    #[error("SIZE")]
    Size,
    #[error("STORE {0}")]
    Store(String),
    #[error("INTERNAL")]
    Internal,
}

/// Reasons the agent's server client gives up on a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerFailure {
    /// The transport is down or the server did not answer in time.
    TcpConnection,
    /// The server answered with something the client cannot pair.
    Unexpected,
}

impl std::fmt::Display for BrokerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BrokerFailure::TcpConnection => "tcp_connection",
            BrokerFailure::Unexpected => "unexpected",
        })
    }
}

impl AgentError {
    pub fn serialize(&self) -> String {
        self.to_string()
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(2, ' ');
        let head = parts.next()?;
        let rest = parts.next();
        Some(match (head, rest) {
            ("UNKNOWN", None) => AgentError::Unknown,
            ("PROHIBITED", None) => AgentError::Prohibited,
            ("SYNTAX", Some(code)) => AgentError::Syntax(code.parse().ok()?),
            ("BROKER", Some("tcp_connection")) => AgentError::Broker(BrokerFailure::TcpConnection),
            ("BROKER", Some("unexpected")) => AgentError::Broker(BrokerFailure::Unexpected),
            ("SMP", Some(code)) => AgentError::Smp(ErrorCode::parse(code)?),
            ("SIZE", None) => AgentError::Size,
            ("STORE", Some(reason)) => AgentError::Store(reason.to_string()),
            ("INTERNAL", None) => AgentError::Internal,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        let codes = [
            ErrorCode::Block,
            ErrorCode::CmdSyntax,
            ErrorCode::CmdProhibited,
            ErrorCode::CmdNoAuth,
            ErrorCode::CmdHasAuth,
            ErrorCode::CmdNoQueue,
            ErrorCode::Auth,
            ErrorCode::Quota,
            ErrorCode::NoMsg,
            ErrorCode::Internal,
        ];
        for code in codes {
            assert_eq!(ErrorCode::parse(code.serialize()), Some(code));
        }
    }

    #[test]
    fn test_agent_error_round_trip() {
        let errors = [
            AgentError::Unknown,
            AgentError::Prohibited,
            AgentError::Syntax(ERR_BAD_COMMAND),
            AgentError::Broker(BrokerFailure::TcpConnection),
            AgentError::Smp(ErrorCode::Auth),
            AgentError::Size,
            AgentError::Store("busy".to_string()),
            AgentError::Internal,
        ];
        for err in errors {
            assert_eq!(AgentError::parse(&err.serialize()), Some(err));
        }
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert_eq!(ErrorCode::parse("NOPE"), None);
        assert_eq!(AgentError::parse("SYNTAX abc"), None);
    }
}
