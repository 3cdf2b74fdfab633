//! The counter service: increments and the greeting stream.

use crate::config::RpcConfig;
use crate::counter::CounterState;
use crate::messages::{
    methods, FarewellMessage, GreetingMessage, IncrementAck, IncrementRequest, ProtocolVersion,
};
use crate::server::{ItemStream, RpcDispatch};
use crate::{Result, TallyError};
use futures::{future, Stream, TryStreamExt};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// RPC handler owning one counter.
///
/// Every replica runs exactly one of these; replicas never talk to each other.
#[derive(Debug)]
pub struct CounterService {
    name: String,
    counter: CounterState,
    greetings_received: AtomicU64,
}

impl CounterService {
    /// Create a service whose counter starts at zero.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counter: CounterState::new(),
            greetings_received: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply an increment and return the value observed under the lock.
    pub fn increment(&self, request: &IncrementRequest) -> Result<IncrementAck> {
        let new_value = self.counter.add(request.amount)?;
        debug!(
            "Server {}: {} added {}, value is now {}",
            self.name, request.client_name, request.amount, new_value
        );
        Ok(IncrementAck { new_value })
    }

    /// Current counter value.
    pub fn value(&self) -> i64 {
        self.counter.get()
    }

    /// Number of greeting messages received over all streams.
    pub fn greetings_received(&self) -> u64 {
        self.greetings_received.load(Ordering::SeqCst)
    }

    /// Drain a greeting stream and answer with a single farewell.
    ///
    /// A stream that ends with an error yields that error and no farewell.
    pub async fn greet<S>(&self, messages: S) -> Result<FarewellMessage>
    where
        S: Stream<Item = Result<GreetingMessage>> + Send,
    {
        let mut messages = std::pin::pin!(messages);
        while let Some(greeting) = messages.try_next().await? {
            info!(
                "Server {}: received message from {}: {}",
                self.name, greeting.client_name, greeting.message
            );
            self.greetings_received.fetch_add(1, Ordering::SeqCst);
        }

        Ok(FarewellMessage {
            message: RpcConfig::FAREWELL_MESSAGE.to_string(),
        })
    }
}

fn parse_params<T: DeserializeOwned>(params: serde_json::Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| TallyError::InvalidParams {
        message: e.to_string(),
    })
}

#[async_trait::async_trait]
impl RpcDispatch for CounterService {
    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        if let Some(version) = ProtocolVersion::for_method(method) {
            let request: IncrementRequest = parse_params(params)?;
            version.check_amount(request.amount)?;
            let ack = self.increment(&request)?;
            return Ok(serde_json::to_value(ack)?);
        }

        match method {
            methods::PING => Ok(serde_json::json!("pong")),
            _ => Err(TallyError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }

    async fn dispatch_stream(&self, method: &str, items: ItemStream) -> Result<serde_json::Value> {
        match method {
            methods::GREET => {
                let greetings = items
                    .and_then(|value| future::ready(parse_params::<GreetingMessage>(value)));
                let farewell = self.greet(greetings).await?;
                Ok(serde_json::to_value(farewell)?)
            }
            _ => Err(TallyError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }
}
