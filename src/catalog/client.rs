use std::time::Duration;

use serde_json::{json, Value};

use super::{
    CatalogError, CatalogGateway, ClientInfo, METHOD_INITIALIZE, METHOD_INVOKE_CAPABILITY,
    METHOD_LIST_CAPABILITIES,
};
use crate::worker::transport::RpcTransport;
use crate::worker::WorkerLaunch;

/// Catalog gateway backed by a worker process speaking JSON-RPC on stdio.
pub struct StdioCatalogClient {
    transport: RpcTransport,
}

impl StdioCatalogClient {
    pub fn new(transport: RpcTransport) -> Self {
        Self { transport }
    }

    pub fn start(launch: WorkerLaunch, response_timeout: Duration) -> Result<Self, CatalogError> {
        let mut transport = RpcTransport::new(launch, response_timeout);
        transport.start()?;
        Ok(Self { transport })
    }

    pub fn transport(&self) -> &RpcTransport {
        &self.transport
    }

    pub fn close(&mut self) {
        self.transport.close();
    }
}

impl CatalogGateway for StdioCatalogClient {
    fn initialize(
        &mut self,
        protocol_version: &str,
        capabilities: Value,
        client_info: &ClientInfo,
    ) -> Result<Value, CatalogError> {
        let params = json!({
            "protocolVersion": protocol_version,
            "capabilities": capabilities,
            "clientInfo": client_info,
        });
        Ok(self.transport.request(METHOD_INITIALIZE, params)?)
    }

    fn list_capabilities(&mut self) -> Result<Value, CatalogError> {
        Ok(self.transport.request(METHOD_LIST_CAPABILITIES, json!({}))?)
    }

    fn invoke_capability(&mut self, name: &str, arguments: Value) -> Result<Value, CatalogError> {
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        let params = json!({"name": name, "arguments": arguments});
        Ok(self.transport.request(METHOD_INVOKE_CAPABILITY, params)?)
    }
}
