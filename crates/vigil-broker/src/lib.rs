//! vigil-broker: the JSON-RPC 2.0 line-protocol surface of the vigil
//! platform.
//!
//! Server role: expose the tool registry and adapter execution to an agent
//! runtime over stdio. Client role: drive an external process speaking the
//! same protocol.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use client::BrokerClient;
pub use error::BrokerError;
pub use protocol::{RpcError, RpcMessage, RpcRequest, RpcResponse};
pub use server::serve;
pub use session::{BrokerSession, OverflowPolicy, SessionConfig, SessionState};
pub use transport::StdioTransport;
