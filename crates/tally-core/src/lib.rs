//! Tally Core - a shared counter served over length-prefixed JSON-RPC.
//!
//! Each server replica owns one counter that any number of clients can
//! increment concurrently, plus a client-streaming greeting exchange. Clients
//! can join several replicas at once and fan every request out to the ones
//! that are ready. Replicas are never synchronized with each other.
//!
//! # Example
//!
//! ```rust,ignore
//! use tally_core::{ClientOptions, CounterServer, Dispatcher, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> tally_core::Result<()> {
//!     let server = CounterServer::bind(&ServerOptions::default()).await?;
//!     let (handle, _service) = server.spawn();
//!
//!     let options = ClientOptions {
//!         targets: vec![handle.addr().to_string()],
//!         ..ClientOptions::default()
//!     };
//!     let dispatcher = Dispatcher::connect(options).await;
//!     let report = dispatcher.dispatch_increment(5).await;
//!     println!("{:?}", report.lines());
//!
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod counter;
pub mod dispatch;
pub mod error;
pub mod messages;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;

pub use bootstrap::CounterServer;
pub use client::{ConnectivityState, RpcClient};
pub use config::{ClientOptions, RpcConfig, ServerOptions};
pub use counter::CounterState;
pub use dispatch::{
    classify, Command, DispatchOutcome, DispatchReport, Dispatcher, GreetOutcome, GreetReport,
    Input, GREETING_SCRIPT,
};
pub use error::{Result, TallyError};
pub use messages::{
    FarewellMessage, GreetingMessage, IncrementAck, IncrementRequest, ProtocolVersion,
};
pub use registry::{ConnectionEntry, ConnectionRegistry};
pub use server::{BoundListener, RpcDispatch, ServerHandle};
pub use service::CounterService;
