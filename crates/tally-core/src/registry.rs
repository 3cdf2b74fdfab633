//! Client-side set of replica connections, indexed by address.
//!
//! Each entry owns its transport and typed client together. Readiness is read
//! from the socket every time it is asked for; nothing reconnects on its own.
//! `rejoin` redials the addresses that are missing or no longer ready.

use crate::client::{ConnectivityState, RpcClient};
use crate::config::{ClientOptions, RpcConfig};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// One dialed replica.
#[derive(Debug)]
pub struct ConnectionEntry {
    address: String,
    client: RpcClient,
}

impl ConnectionEntry {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Live readiness of the underlying connection.
    pub fn readiness(&self) -> ConnectivityState {
        self.client.state()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == ConnectivityState::Ready
    }
}

/// Connections to every replica that answered its dial.
#[derive(Debug)]
pub struct ConnectionRegistry {
    entries: RwLock<BTreeMap<String, Arc<ConnectionEntry>>>,
    call_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            call_timeout: RpcConfig::CALL_TIMEOUT,
        }
    }

    /// Replace the per-call timeout given to new connections.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Dial every address, each with its own `dial_timeout`.
    ///
    /// Addresses that fail to dial are logged and left out.
    pub async fn join<S: AsRef<str>>(addresses: &[S], dial_timeout: Duration) -> Self {
        let registry = Self::new();
        registry.rejoin(addresses, dial_timeout).await;
        registry
    }

    /// Dial the targets of `options` with its dial and call timeouts.
    pub async fn join_with(options: &ClientOptions) -> Self {
        let registry = Self::new().with_call_timeout(options.call_timeout);
        registry.rejoin(&options.targets, options.dial_timeout).await;
        registry
    }

    /// Dial every address that has no ready entry yet.
    ///
    /// Ready entries are kept as they are. Dials run concurrently and do not
    /// share a deadline. Returns the number of new connections.
    pub async fn rejoin<S: AsRef<str>>(&self, addresses: &[S], dial_timeout: Duration) -> usize {
        let mut pending: Vec<String> = Vec::new();
        {
            let entries = self.entries.read().await;
            for address in addresses {
                let address = address.as_ref();
                let ready = entries.get(address).is_some_and(|entry| entry.is_ready());
                if !ready && !pending.iter().any(|a| a == address) {
                    pending.push(address.to_string());
                }
            }
        }

        let call_timeout = self.call_timeout;
        let dials = pending.into_iter().map(|address| async move {
            let result = RpcClient::connect(&address, dial_timeout).await;
            (address, result)
        });
        let results = join_all(dials).await;

        let mut joined = 0;
        let mut entries = self.entries.write().await;
        for (address, result) in results {
            match result {
                Ok(client) => {
                    info!("Connected to {}: {}", address, client.state());
                    let entry = Arc::new(ConnectionEntry {
                        address: address.clone(),
                        client: client.with_call_timeout(call_timeout),
                    });
                    entries.insert(address, entry);
                    joined += 1;
                }
                Err(e) => {
                    warn!("Failed to dial {}: {}", address, e);
                }
            }
        }
        joined
    }

    /// Whether `entry` is ready right now.
    pub fn is_ready(entry: &ConnectionEntry) -> bool {
        entry.is_ready()
    }

    /// Current entries in address order.
    pub async fn snapshot(&self) -> Vec<Arc<ConnectionEntry>> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn get(&self, address: &str) -> Option<Arc<ConnectionEntry>> {
        self.entries.read().await.get(address).cloned()
    }

    pub async fn addresses(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Live readiness for each of `configured`; `None` for addresses never joined.
    pub async fn readiness_report<S: AsRef<str>>(
        &self,
        configured: &[S],
    ) -> Vec<(String, Option<ConnectivityState>)> {
        let entries = self.entries.read().await;
        configured
            .iter()
            .map(|address| {
                let address = address.as_ref();
                let state = entries.get(address).map(|entry| entry.readiness());
                (address.to_string(), state)
            })
            .collect()
    }

    /// Close every connection.
    pub async fn close(&self) {
        for entry in self.snapshot().await {
            entry.client.close().await;
        }
    }
}
