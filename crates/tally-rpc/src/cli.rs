//! Argument definitions and logging setup for the binaries.

use clap::Parser;
use std::time::Duration;
use tally_core::{ClientOptions, ProtocolVersion, RpcConfig, ServerOptions};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tally-server")]
#[command(about = "Serve a shared counter that clients can increment")]
pub struct ServerArgs {
    /// Server name used in log lines
    #[arg(short, long, default_value = RpcConfig::DEFAULT_NAME)]
    pub name: String,

    /// Host to bind to
    #[arg(long, default_value = RpcConfig::DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on; repeat to give ordered fallbacks (0 = auto-assign)
    #[arg(short, long = "port", default_values_t = [RpcConfig::DEFAULT_PORT])]
    pub ports: Vec<u16>,

    /// Also fall back through the fixed replica ports 5400-5404
    #[arg(long)]
    pub fallback_ports: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl ServerArgs {
    pub fn options(&self) -> ServerOptions {
        let mut candidate_ports = self.ports.clone();
        if self.fallback_ports {
            for port in RpcConfig::REPLICA_PORTS {
                if !candidate_ports.contains(&port) {
                    candidate_ports.push(port);
                }
            }
        }

        ServerOptions {
            name: self.name.clone(),
            host: self.host.clone(),
            candidate_ports,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "tally-client")]
#[command(about = "Increment one or more counter replicas from the console")]
pub struct ClientArgs {
    /// Client name sent with every request
    #[arg(short, long, default_value = RpcConfig::DEFAULT_NAME)]
    pub name: String,

    /// Server to join, as host:port or a bare port; repeat for several replicas
    #[arg(short, long = "server")]
    pub servers: Vec<String>,

    /// Join every fixed replica port 5400-5404 on the default host
    #[arg(long)]
    pub replicas: bool,

    /// Per-server dial timeout in milliseconds
    #[arg(long, default_value_t = RpcConfig::DIAL_TIMEOUT.as_millis() as u64)]
    pub dial_timeout_ms: u64,

    /// Amount width on the wire (v1 = 32-bit, v2 = 64-bit)
    #[arg(long, default_value = "v1", value_parser = parse_protocol)]
    pub protocol: ProtocolVersion,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl ClientArgs {
    pub fn options(&self) -> ClientOptions {
        let mut options = ClientOptions {
            name: self.name.clone(),
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            protocol: self.protocol,
            ..ClientOptions::default()
        };

        if self.replicas {
            options = options.with_replicas(RpcConfig::DEFAULT_HOST);
        }
        if !self.servers.is_empty() {
            let explicit: Vec<String> = self.servers.iter().map(|s| normalize_target(s)).collect();
            if self.replicas {
                options.targets.extend(explicit);
            } else {
                options.targets = explicit;
            }
        }
        options
    }
}

fn parse_protocol(s: &str) -> Result<ProtocolVersion, String> {
    ProtocolVersion::from_str(s).ok_or_else(|| format!("unknown protocol version: {}", s))
}

/// Expand a bare port (`5400`) or `:5400` to an address on the default host.
fn normalize_target(target: &str) -> String {
    let target = target.trim();
    if target.parse::<u16>().is_ok() {
        format!("{}:{}", RpcConfig::DEFAULT_HOST, target)
    } else if let Some(port) = target.strip_prefix(':') {
        format!("{}:{}", RpcConfig::DEFAULT_HOST, port)
    } else {
        target.to_string()
    }
}

/// Install the global log subscriber. Logs go to stderr so stdout carries
/// only operator output.
pub fn init_logging(debug: bool) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
