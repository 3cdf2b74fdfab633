//! Tally server - one counter replica.
//!
//! Binds the first free candidate port, prints it for supervisors and tests to
//! read, then serves until Ctrl-C.

use anyhow::Result;
use clap::Parser;
use tally_core::CounterServer;
use tally_rpc::{init_logging, ServerArgs};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    init_logging(args.debug);

    let options = args.options();
    info!("Server {}: starting", options.name);

    let server = CounterServer::bind(&options).await?;
    let addr = server.local_addr();

    // Read by process supervisors and the integration tests
    println!("RPC_PORT={}", addr.port());

    info!("Server {}: running on {}", options.name, addr);

    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received, exiting");
        })
        .await;

    Ok(())
}
