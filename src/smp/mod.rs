// SMP wire protocol: commands, transmissions, addresses, errors

pub mod address;
pub mod command;
pub mod error;
pub mod transmission;

pub use address::{SmpQueueInfo, SmpServer};
pub use command::{BrokerMsg, ClientCmd};
pub use error::{AgentError, BrokerFailure, ErrorCode};
pub use transmission::{
    read_broker_transmission, read_client_transmission, write_broker_transmission,
    write_client_transmission, BrokerTransmission, ClientTransmission, MAX_BODY, QUEUE_ID_LEN,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, the broker's timestamp unit.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
