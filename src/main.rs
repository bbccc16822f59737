use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use shardnet::{Keypair, Node, NodeConfig, NodeId, NodeType, Unl, parse_shard_id};

const KEY_FILE: &str = "node.key";

#[derive(Parser, Debug)]
#[command(name = "shardnet")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// Directory for shards, the node key and bandwidth usage.
    #[arg(short, long, default_value = "shardnet-data")]
    data_dir: PathBuf,

    /// Shard store limit in bytes; 0 means unlimited.
    #[arg(long, default_value = "0")]
    storage_limit: u64,

    /// TCP port for inbound transfers; 0 picks one.
    #[arg(long, default_value = "0")]
    passive_port: u16,

    /// Skip reachability probing and use this node type.
    #[arg(long, value_parser = parse_node_type)]
    node_type: Option<NodeType>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node until interrupted.
    Run {
        /// Crawl the overlay every this many seconds.
        #[arg(long)]
        crawl_interval: Option<u64>,
    },
    /// Store a value in the DHT.
    Put { key: String, value: String },
    /// Look a value up in the DHT.
    Get { key: String },
    /// Print this node's id.
    Showid,
    /// Print this node's UNL.
    Showunl,
    /// Print this node's reachability class.
    Showtype,
    DirectMessage { node_id: String, token: String, message: String },
    RelayMessage { node_id: String, token: String, message: String },
    /// Copy a file into the shard store and print its id.
    HostFile { path: PathBuf },
    /// Send a stored shard to the node behind `unl`.
    Upload { unl: String, shard: String },
    /// Fetch a shard from the node behind `unl`.
    Download { unl: String, shard: String },
    /// Print the fields of a UNL.
    DeconstructUnl { unl: String },
    Version,
}

fn parse_node_type(s: &str) -> std::result::Result<NodeType, String> {
    match s {
        "passive" => Ok(NodeType::Passive),
        "simultaneous" => Ok(NodeType::Simultaneous),
        "active" => Ok(NodeType::Active),
        other => Err(format!("unknown node type {other}")),
    }
}

fn parse_node_id(s: &str) -> Result<NodeId> {
    NodeId::from_hex(s).context("node id must be 40 hex characters")
}

/// Reuse the node key in `dir`, creating one on first start.
fn load_or_create_keypair(dir: &Path) -> Result<Keypair> {
    let path = dir.join(KEY_FILE);
    if path.exists() {
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let bytes: [u8; 32] = hex::decode(text.trim())
            .context("node key is not hex")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("node key must be 32 bytes"))?;
        return Keypair::from_secret_key_bytes(&bytes).map_err(|e| anyhow::anyhow!("invalid node key: {e}"));
    }
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let keypair = Keypair::generate();
    std::fs::write(&path, hex::encode(keypair.secret_key_bytes()))
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "generated node key");
    Ok(keypair)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match &args.command {
        Command::Version => {
            println!("shardnet {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::DeconstructUnl { unl } => {
            let unl = Unl::decode(unl).context("invalid unl")?;
            println!("{}", unl.describe()?);
            return Ok(());
        }
        _ => {}
    }

    let mut config = NodeConfig::default()
        .with_bind(args.bind)
        .with_bootstrap(args.bootstrap.clone())
        .with_storage_dir(args.data_dir.clone())
        .with_storage_limit(args.storage_limit)
        .with_passive_port(args.passive_port);
    if let Some(node_type) = args.node_type {
        config = config.with_node_type(node_type);
    }
    if let Command::Run {
        crawl_interval: Some(secs),
    } = args.command
    {
        config.monitor.interval = Some(Duration::from_secs(secs));
    }

    let keypair = load_or_create_keypair(&args.data_dir)?;
    let node = Node::start_with_keypair(config, keypair).await?;
    let outcome = execute(&node, args.command).await;
    node.shutdown().await;
    outcome
}

async fn execute(node: &Node, command: Command) -> Result<()> {
    match command {
        Command::Run { .. } => {
            info!(id = %node.id().to_hex(), unl = %node.unl().encode(), "node running");
            let mut status = time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("received shutdown signal, exiting gracefully");
                        break;
                    }
                    _ = status.tick() => {
                        let stats = node.dht().stats().await;
                        info!(?stats, transfers = node.transfers().transfers().await.len(), "status");
                    }
                }
            }
        }
        Command::Put { key, value } => {
            node.put(&key, value.into_bytes()).await?;
            println!("stored {key}");
        }
        Command::Get { key } => match node.get(&key).await? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => bail!("no value for {key}"),
        },
        Command::Showid => println!("{}", node.id().to_hex()),
        Command::Showunl => println!("{}", node.unl().encode()),
        Command::Showtype => {
            let reachability = node.reachability();
            println!(
                "{:?} (nat {:?}, forwarding {:?})",
                reachability.node_type, reachability.nat_type, reachability.forwarding
            );
        }
        Command::DirectMessage {
            node_id,
            token,
            message,
        } => {
            node.direct_message(parse_node_id(&node_id)?, &token, message.as_bytes())
                .await
                .context("direct message failed")?;
            println!("delivered");
        }
        Command::RelayMessage {
            node_id,
            token,
            message,
        } => {
            node.relay_message(parse_node_id(&node_id)?, &token, message.as_bytes())
                .await?;
            println!("queued");
        }
        Command::HostFile { path } => {
            let id = node
                .host_file(&path)
                .await
                .with_context(|| format!("hosting {}", path.display()))?;
            println!("{id}");
        }
        Command::Upload { unl, shard } => {
            let remote = Unl::decode(&unl).context("invalid unl")?;
            let report = node.upload(&remote, parse_shard_id(&shard)?).await?;
            println!("uploaded {} bytes in {:?}", report.bytes, report.elapsed());
        }
        Command::Download { unl, shard } => {
            let remote = Unl::decode(&unl).context("invalid unl")?;
            let report = node.download(&remote, parse_shard_id(&shard)?).await?;
            println!("downloaded {} bytes in {:?}", report.bytes, report.elapsed());
        }
        Command::Version | Command::DeconstructUnl { .. } => {
            warn!("handled before startup");
        }
    }
    Ok(())
}
