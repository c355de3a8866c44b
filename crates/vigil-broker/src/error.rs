//! Broker-side error type.

use crate::protocol::RpcError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("transport not connected")]
    NotConnected,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
