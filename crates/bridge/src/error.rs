//! Connection-level errors surfaced to the caller of `connect`

use crate::connection::ConnectionState;
use crate::gateway::GatewayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Bridge registration was rejected or the controller was unreachable
    #[error("Bridge registration failed: {0}")]
    Registration(#[from] GatewayError),

    #[error("Cannot connect while {0}")]
    AlreadyConnected(ConnectionState),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
