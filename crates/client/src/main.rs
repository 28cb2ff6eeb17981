//! File store CLI (dfs).
//!
//! # Usage
//!
//! ```text
//! dfs [OPTIONS] <COMMAND>
//!
//! Commands:
//!   list    List stored files
//!   store   Store a local file
//!   load    Fetch a file
//!   remove  Remove a file
//!
//! Options:
//!   -a, --address <ADDRESS>  Controller address [default: 127.0.0.1]
//!   -p, --port <PORT>        Controller port [default: 12345]
//!   -h, --help               Print help
//!   -V, --version            Print version
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dfs_client::{Client, ClientConfig};
use dfs_proto::defaults::{DEFAULT_CONTROLLER_PORT, DEFAULT_NODE_HOST, DEFAULT_TIMEOUT_MS};
use dfs_proto::DfsResult;
use tracing_subscriber::EnvFilter;

/// Replicated file store client.
#[derive(Parser)]
#[command(name = "dfs", version, about = "Replicated file store client")]
struct Cli {
    /// Controller address
    #[arg(short = 'a', long, default_value = DEFAULT_NODE_HOST)]
    address: String,

    /// Controller port
    #[arg(short = 'p', long, default_value_t = DEFAULT_CONTROLLER_PORT)]
    port: u16,

    /// Reply timeout in milliseconds; keep it above the Controller's
    #[arg(short = 't', long, default_value_t = DEFAULT_TIMEOUT_MS * 2)]
    timeout_ms: u64,

    /// Enable verbose/debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored files
    List,
    /// Store a local file under its file name
    Store {
        path: PathBuf,
        /// Store under this name instead
        #[arg(short = 'n', long)]
        name: Option<String>,
    },
    /// Fetch a file
    Load {
        name: String,
        /// Directory to write the file into
        #[arg(short = 'o', long, default_value = ".")]
        out: PathBuf,
    },
    /// Remove a file
    Remove { name: String },
}

async fn run(cli: Cli) -> DfsResult<()> {
    let host: IpAddr = cli.address.parse().map_err(|_| {
        eprintln!("Invalid address {}", cli.address);
        dfs_proto::DfsError::NetworkError
    })?;
    let config = ClientConfig {
        controller_addr: SocketAddr::new(host, cli.port),
        dstore_host: host,
        timeout: Duration::from_millis(cli.timeout_ms),
    };
    let mut client = Client::connect(config).await?;

    match cli.command {
        Commands::List => {
            for name in client.list().await? {
                println!("{}", name);
            }
        }
        Commands::Store { path, name } => {
            let name = match name.or_else(|| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            }) {
                Some(name) => name,
                None => {
                    eprintln!("Cannot derive a file name from {}", path.display());
                    return Err(dfs_proto::DfsError::Protocol);
                }
            };
            let data = tokio::fs::read(&path).await.map_err(|e| {
                eprintln!("Failed to read {}: {}", path.display(), e);
                dfs_proto::DfsError::from(e)
            })?;
            let nodes = client.store(&name, &data).await?;
            let nodes: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
            println!("{} stored on {}", name, nodes.join(" "));
        }
        Commands::Load { name, out } => {
            let data = client.load(&name).await?;
            let target = out.join(&name);
            tokio::fs::write(&target, &data).await.map_err(|e| {
                eprintln!("Failed to write {}: {}", target.display(), e);
                dfs_proto::DfsError::from(e)
            })?;
            println!("{} ({} bytes) written to {}", name, data.len(), target.display());
        }
        Commands::Remove { name } => {
            client.remove(&name).await?;
            println!("{} removed", name);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
