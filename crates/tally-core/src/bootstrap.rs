//! Server bootstrap: claim a port, then serve one counter on it.

use crate::config::ServerOptions;
use crate::server::{BoundListener, ServerHandle};
use crate::service::CounterService;
use crate::Result;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// A bound listener paired with the single counter service it will serve.
pub struct CounterServer {
    listener: BoundListener,
    service: Arc<CounterService>,
}

impl CounterServer {
    /// Bind the first free candidate port from `options` and create the service.
    ///
    /// No service is created if every candidate fails.
    pub async fn bind(options: &ServerOptions) -> Result<Self> {
        info!(
            "Server {}: attempting to create listener on {} (candidates {:?})",
            options.name, options.host, options.candidate_ports
        );
        let listener = BoundListener::bind(&options.host, &options.candidate_ports).await?;
        let service = Arc::new(CounterService::new(options.name.clone()));
        info!("Server {}: listening at {}", options.name, listener.local_addr());

        Ok(Self { listener, service })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn service(&self) -> Arc<CounterService> {
        self.service.clone()
    }

    /// Serve until `shutdown` resolves and return the final counter value.
    pub async fn serve<F>(self, shutdown: F) -> i64
    where
        F: Future<Output = ()> + Send,
    {
        let service = self.service;
        self.listener.serve(service.clone(), shutdown).await;
        let value = service.value();
        info!("Server {}: stopped with value {}", service.name(), value);
        value
    }

    /// Serve in the background.
    pub fn spawn(self) -> (ServerHandle, Arc<CounterService>) {
        let handle = self.listener.spawn(self.service.clone());
        (handle, self.service)
    }
}
