//! Dstore storage daemon.
//!
//! Usage:
//!   dstore [OPTIONS] <FOLDER>
//!
//! On start the folder is emptied, the daemon listens on its port (which
//! is its node identity) and joins the Controller.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use dfs_dstore::{Dstore, DstoreConfig};
use dfs_proto::defaults::{
    DEFAULT_CONTROLLER_PORT, DEFAULT_DSTORE_PORT, DEFAULT_MAX_FILE_SIZE, DEFAULT_NODE_HOST,
    DEFAULT_TIMEOUT_MS,
};
use tracing::{error, info};

/// Replicated file store storage node
#[derive(Parser, Debug)]
#[command(name = "dstore", version, about = "Replicated file store storage node")]
struct Args {
    /// Folder holding this node's files; emptied on start
    #[arg(value_name = "FOLDER")]
    folder: PathBuf,

    /// Listen address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Listen port, also this node's identity
    #[arg(short = 'p', long, default_value_t = DEFAULT_DSTORE_PORT)]
    port: u16,

    /// Controller host
    #[arg(long, default_value = DEFAULT_NODE_HOST)]
    controller_host: String,

    /// Controller port
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONTROLLER_PORT)]
    controller_port: u16,

    /// Host other Dstores listen on
    #[arg(long, default_value = DEFAULT_NODE_HOST)]
    peer_host: String,

    /// Payload and peer request timeout in milliseconds
    #[arg(short = 't', long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Largest file accepted, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FILE_SIZE)]
    max_file_size: u64,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn parse_host(name: &str, value: &str) -> IpAddr {
    match value.parse() {
        Ok(host) => host,
        Err(_) => {
            error!("invalid {} {}", name, value);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("dstore v{} starting", env!("CARGO_PKG_VERSION"));

    let bind_addr: IpAddr = args
        .bind_addr
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let controller_host = parse_host("controller host", &args.controller_host);
    let peer_host = parse_host("peer host", &args.peer_host);

    let config = DstoreConfig {
        listen_addr: SocketAddr::new(bind_addr, args.port),
        controller_addr: SocketAddr::new(controller_host, args.controller_port),
        peer_host,
        timeout: Duration::from_millis(args.timeout_ms),
        max_file_size: args.max_file_size,
        folder: args.folder,
    };
    let dstore = Dstore::new(config);

    tokio::select! {
        result = dstore.run() => {
            if let Err(e) = result {
                error!("dstore error: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
            dstore.shutdown();
        }
    }

    info!("dstore stopped");
}
