//! Tally client - increments every configured replica from the console.

use anyhow::Result;
use clap::Parser;
use tally_core::Dispatcher;
use tally_rpc::{init_logging, ClientArgs};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ClientArgs::parse();
    init_logging(args.debug);

    println!("--- CLIENT APP ---");

    let options = args.options();
    info!(
        "Client {}: joining {:?} (protocol {})",
        options.name, options.targets, options.protocol
    );

    let dispatcher = Dispatcher::connect(options).await;
    if dispatcher.registry().is_empty().await {
        info!("Client {}: no server answered; type `rejoin` to retry", dispatcher.options().name);
    }

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let result = dispatcher.run(stdin, tokio::io::stdout()).await;

    dispatcher.registry().close().await;
    result?;
    Ok(())
}
