//! Broker client: drive a subprocess speaking the broker line protocol.
//!
//! This is the client-to-process role: the broker (or any host) spawns an
//! external tool server, performs the `initialize` handshake, and calls
//! its tools and resources over stdin/stdout.

use crate::error::BrokerError;
use crate::protocol::{
    methods, RequestId, RpcMessage, RpcNotification, RpcRequest, PROTOCOL_VERSION,
};
use crate::transport::StdioTransport;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

pub struct BrokerClient {
    transport: StdioTransport,
    next_id: i64,
    initialized: bool,
}

impl BrokerClient {
    /// Spawn the peer process and complete the handshake.
    pub async fn connect(
        command: impl AsRef<str>,
        args: &[impl AsRef<str>],
    ) -> Result<Self, BrokerError> {
        let transport = StdioTransport::spawn(command, args, &HashMap::new()).await?;
        let mut client = Self {
            transport,
            next_id: 0,
            initialized: false,
        };
        client.initialize().await?;
        Ok(client)
    }

    async fn initialize(&mut self) -> Result<(), BrokerError> {
        let result = self
            .request(
                methods::INITIALIZE,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "vigil-broker-client",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        debug!(server = ?result.get("serverInfo"), "handshake complete");

        self.transport
            .send(&RpcMessage::Notification(RpcNotification::new(
                methods::INITIALIZED,
            )))
            .await?;
        self.initialized = true;
        Ok(())
    }

    /// List the peer's tools.
    pub async fn list_tools(&mut self) -> Result<Vec<Value>, BrokerError> {
        let result = self.request(methods::TOOLS_LIST, json!({})).await?;
        Ok(result
            .get("tools")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Invoke a tool and return the decoded scan response payload.
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
    ) -> Result<Value, BrokerError> {
        let result = self
            .request(
                methods::TOOLS_CALL,
                json!({ "name": name, "arguments": arguments }),
            )
            .await?;
        let text = result
            .pointer("/content/0/text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrokerError::Protocol("missing content text".into()))?;
        Ok(serde_json::from_str(text)?)
    }

    /// List the peer's resources.
    pub async fn list_resources(&mut self) -> Result<Vec<Value>, BrokerError> {
        let result = self.request(methods::RESOURCES_LIST, json!({})).await?;
        Ok(result
            .get("resources")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Read a resource by uri and decode its JSON text payload.
    pub async fn read_resource(&mut self, uri: &str) -> Result<Value, BrokerError> {
        let result = self
            .request(methods::RESOURCES_READ, json!({ "uri": uri }))
            .await?;
        let text = result
            .pointer("/contents/0/text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrokerError::Protocol("missing resource text".into()))?;
        Ok(serde_json::from_str(text)?)
    }

    pub async fn close(&mut self) -> Result<(), BrokerError> {
        self.transport.close().await
    }

    /// Send one request and wait for its matching response, skipping any
    /// interleaved notifications.
    async fn request(&mut self, method: &str, params: Value) -> Result<Value, BrokerError> {
        self.next_id += 1;
        let id = RequestId::Number(self.next_id);
        let request = RpcRequest::new(id.clone(), method).with_params(params);
        self.transport.send(&RpcMessage::Request(request)).await?;

        loop {
            match self.transport.receive().await? {
                RpcMessage::Response(response) if response.id == id => {
                    return response.into_result().map_err(BrokerError::Rpc);
                }
                RpcMessage::Response(other) => {
                    debug!(id = %other.id, "skipping response for another request");
                }
                RpcMessage::Notification(notification) => {
                    debug!(method = %notification.method, "notification from peer");
                }
                RpcMessage::Request(_) => {
                    return Err(BrokerError::Protocol(
                        "peer sent a request on the client channel".into(),
                    ));
                }
            }
        }
    }
}
