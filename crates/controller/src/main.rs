//! Controller: placement and replication coordinator.
//!
//! Registers Dstores, chooses replica sets on the hash ring, tracks quorum
//! acknowledgements for stores and removes, and rebalances the ring when
//! nodes join or fail.
//!
//! Usage:
//!   controller [OPTIONS]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use dfs_controller::{Controller, ControllerConfig};
use dfs_proto::defaults::{
    DEFAULT_CONTROLLER_PORT, DEFAULT_MAX_FILE_SIZE, DEFAULT_NODE_HOST, DEFAULT_REBALANCE_ATTEMPTS,
    DEFAULT_REBALANCE_PERIOD_MS, DEFAULT_REPLICATION, DEFAULT_TIMEOUT_MS, DEFAULT_VNODE_COUNT,
};
use tracing::{error, info};

/// Replicated file store Controller
#[derive(Parser, Debug)]
#[command(name = "controller", version, about = "Replicated file store controller")]
struct Args {
    /// Listen address for client and Dstore connections
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Listen port
    #[arg(short = 'p', long, default_value_t = DEFAULT_CONTROLLER_PORT)]
    port: u16,

    /// Replication factor
    #[arg(short = 'r', long, default_value_t = DEFAULT_REPLICATION)]
    replication: usize,

    /// Quorum and request timeout in milliseconds
    #[arg(short = 't', long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Interval between scheduled rebalance rounds in milliseconds
    #[arg(long, default_value_t = DEFAULT_REBALANCE_PERIOD_MS)]
    rebalance_period_ms: u64,

    /// Number of virtual nodes on the hash ring
    #[arg(long, default_value_t = DEFAULT_VNODE_COUNT)]
    vnodes: usize,

    /// Largest file accepted by STORE, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FILE_SIZE)]
    max_file_size: u64,

    /// Host the Dstores listen on
    #[arg(long, default_value = DEFAULT_NODE_HOST)]
    dstore_host: String,

    /// Rounds tried per rebalance before waiting for the next tick
    #[arg(long, default_value_t = DEFAULT_REBALANCE_ATTEMPTS)]
    rebalance_attempts: u32,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
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

    info!("controller v{} starting", env!("CARGO_PKG_VERSION"));

    let bind_addr: IpAddr = args
        .bind_addr
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let dstore_host: IpAddr = match args.dstore_host.parse() {
        Ok(host) => host,
        Err(_) => {
            error!("invalid dstore host {}", args.dstore_host);
            std::process::exit(1);
        }
    };
    if args.replication == 0 {
        error!("replication factor must be at least 1");
        std::process::exit(1);
    }

    let config = ControllerConfig {
        listen_addr: SocketAddr::new(bind_addr, args.port),
        replication: args.replication,
        timeout: Duration::from_millis(args.timeout_ms),
        rebalance_period: Duration::from_millis(args.rebalance_period_ms),
        vnode_count: args.vnodes,
        max_file_size: args.max_file_size,
        dstore_host,
        rebalance_attempts: args.rebalance_attempts,
    };

    info!(
        "replication {}, {} vnodes, timeout {:?}, rebalance every {:?}",
        config.replication, config.vnode_count, config.timeout, config.rebalance_period
    );

    let controller = Controller::new(config);

    tokio::select! {
        result = controller.run() => {
            if let Err(e) = result {
                error!("controller error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
            controller.shutdown();
        }
    }

    info!("controller stopped");
}
