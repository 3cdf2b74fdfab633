//! Centralized configuration for Tally.
//!
//! Constants live on `RpcConfig`; runtime choices made on the command line are
//! carried by `ServerOptions` and `ClientOptions`.

use crate::messages::ProtocolVersion;
use std::time::Duration;

/// Wire and networking constants.
pub struct RpcConfig;

impl RpcConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 5400;
    /// Fixed replica port list used for fallback binding and multi-replica clients.
    pub const REPLICA_PORTS: [u16; 5] = [5400, 5401, 5402, 5403, 5404];
    pub const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1MB
    pub const MAX_CONNECTIONS: usize = 256;
    pub const FAREWELL_MESSAGE: &'static str = "Goodbye";
    pub const DEFAULT_NAME: &'static str = "default";
}

/// Options for starting a counter server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Server identity used in log lines.
    pub name: String,
    /// Host to bind to.
    pub host: String,
    /// Ordered candidate ports; the first one that binds wins.
    pub candidate_ports: Vec<u16>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            name: RpcConfig::DEFAULT_NAME.to_string(),
            host: RpcConfig::DEFAULT_HOST.to_string(),
            candidate_ports: vec![RpcConfig::DEFAULT_PORT],
        }
    }
}

impl ServerOptions {
    /// Use the fixed replica port list as fallback candidates.
    pub fn with_replica_fallback(mut self) -> Self {
        self.candidate_ports = RpcConfig::REPLICA_PORTS.to_vec();
        self
    }
}

/// Options for a client that fans out to one or more replicas.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Client identity sent with every request.
    pub name: String,
    /// Target addresses, `host:port`.
    pub targets: Vec<String>,
    /// Per-target dial timeout.
    pub dial_timeout: Duration,
    /// Per-call timeout once connected.
    pub call_timeout: Duration,
    /// Wire amount width.
    pub protocol: ProtocolVersion,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            name: RpcConfig::DEFAULT_NAME.to_string(),
            targets: vec![format!(
                "{}:{}",
                RpcConfig::DEFAULT_HOST,
                RpcConfig::DEFAULT_PORT
            )],
            dial_timeout: RpcConfig::DIAL_TIMEOUT,
            call_timeout: RpcConfig::CALL_TIMEOUT,
            protocol: ProtocolVersion::default(),
        }
    }
}

impl ClientOptions {
    /// Target every port of the fixed replica list on `host`.
    pub fn with_replicas(mut self, host: &str) -> Self {
        self.targets = RpcConfig::REPLICA_PORTS
            .iter()
            .map(|port| format!("{}:{}", host, port))
            .collect();
        self
    }
}
