//! Node command implementation
//!
//! This module implements the `weave node` command for starting federation
//! nodes and connecting them to peers.

use anyhow::{Context, Result};
use clap::Args;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::info;
use weave_adapters::{HttpServer, ServerConfig};
use weave_federation::{Node, NodeConfig};

/// Arguments for the node command
#[derive(Args, Debug, Default)]
pub struct NodeArgs {
    /// JSON file with a full node configuration
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Address to bind
    #[arg(long)]
    pub host: Option<IpAddr>,
    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Peer address to connect to (repeatable)
    #[arg(short = 'P', long = "peer")]
    pub peers: Vec<String>,
    /// Peers that must be connected before consensus runs
    /// (defaults to the number of --peer addresses)
    #[arg(long)]
    pub min_peers: Option<usize>,
    /// Local database path
    #[arg(long)]
    pub db: Option<String>,
    /// Node name
    #[arg(short, long)]
    pub name: Option<String>,
    /// Port for the HTTP query API
    #[arg(long)]
    pub http_port: Option<u16>,
    /// Hex-encoded secret key
    #[arg(long, env = "WEAVE_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,
}

/// Execute the node command
pub async fn execute_node_command(args: NodeArgs) -> Result<()> {
    let config = build_config(args)?;

    println!("🌐 Starting Weave federation node...");
    match &config.db_path {
        Some(db) => println!("📁 Database: {}", db),
        None => println!("📁 Database: in-memory"),
    }
    println!("🔌 Listen: {}", config.listen_addr);
    for peer in &config.initial_peers {
        println!("🤝 Initial peer: {}", peer);
    }
    println!();

    let node = Node::new(config.clone()).context("Failed to create Weave node")?;
    println!("🔑 Node id: {}", node.node_id());

    let local_addr = node.start().await.context("Failed to start Weave node")?;
    println!("📡 Node listening on: {}", local_addr);

    if let Some(http_addr) = config.http_addr {
        let server = HttpServer::new(ServerConfig { addr: http_addr }, node.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("HTTP API stopped: {:#}", e);
            }
        });
        println!("🔎 HTTP API on: http://{}", http_addr);
    }

    println!("✅ Node started successfully!");
    println!();
    print_node_status(&node).await;

    println!("🔄 Node running... Press Ctrl+C to shutdown");
    wait_for_shutdown().await;

    println!("\n🛑 Shutting down node...");
    node.shutdown().await;
    print_node_status(&node).await;

    println!("✅ Node shutdown complete");
    Ok(())
}

/// Merge the optional config file with command line overrides.
pub fn build_config(args: NodeArgs) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => NodeConfig::default(),
    };

    if args.host.is_some() || args.port.is_some() {
        let host = args.host.unwrap_or(config.listen_addr.ip());
        let port = args.port.unwrap_or(config.listen_addr.port());
        config.listen_addr = SocketAddr::new(host, port);
    }
    for peer in &args.peers {
        config.initial_peers.push(parse_peer_address(peer)?);
    }
    if args.min_peers.is_some() {
        config.min_peers = args.min_peers;
    }
    if let Some(db) = args.db {
        validate_db_path(&db)?;
        config.db_path = Some(db);
    }
    if let Some(name) = args.name {
        config.name = name;
    } else if args.config.is_none() {
        config.name = format!("weave-node-{}", config.listen_addr.port());
    }
    if let Some(http_port) = args.http_port {
        config.http_addr = Some(SocketAddr::new(config.listen_addr.ip(), http_port));
    }
    if args.secret_key.is_some() {
        config.secret_key = args.secret_key;
    }

    info!("Node configuration: {:?}", RedactedConfig(&config));
    Ok(config)
}

struct RedactedConfig<'a>(&'a NodeConfig);

impl std::fmt::Debug for RedactedConfig<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("listen_addr", &self.0.listen_addr)
            .field("http_addr", &self.0.http_addr)
            .field("db_path", &self.0.db_path)
            .field("name", &self.0.name)
            .field("initial_peers", &self.0.initial_peers)
            .field("min_peers", &self.0.min_peers)
            .field("gossip", &self.0.gossip)
            .field("store", &self.0.store)
            .finish_non_exhaustive()
    }
}

/// Load a node configuration from a JSON file
pub fn load_config(path: &Path) -> Result<NodeConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Invalid config file: {}", path.display()))
}

/// Print current node status
async fn print_node_status(node: &Node) {
    let stats = node.stats().await;
    println!("📈 Node Status:");
    println!("   Connected peers: {}", stats.peers);
    println!("   DAG events: {}", stats.dag.total_events);
    println!("   DAG tips: {}", stats.dag.tip_count);
    println!("   Node count: {}", stats.dag.node_count);
    match stats.dag.last_decided_round {
        Some(round) => println!("   Last decided round: {}", round),
        None => println!("   Last decided round: none"),
    }
    println!("   Ordered events: {}", stats.dag.ordered_events);
    println!();
}

/// Wait for shutdown signal (Ctrl+C)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Validate database path
pub fn validate_db_path(db_path: &str) -> Result<()> {
    let path = Path::new(db_path);
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create database directory: {}", path.display()))?;

    // Check write permissions by trying to create a test file
    let test_file = path.join(".weave_write_test");
    match std::fs::write(&test_file, b"test") {
        Ok(_) => {
            let _ = std::fs::remove_file(&test_file);
            Ok(())
        }
        Err(e) => {
            anyhow::bail!("Cannot write to database path {}: {}", db_path, e);
        }
    }
}

/// Parse peer address with helpful error messages
pub fn parse_peer_address(peer_str: &str) -> Result<SocketAddr> {
    peer_str.parse().with_context(|| {
        format!(
            "Invalid peer address '{}'. Expected format: IP:PORT (e.g., 127.0.0.1:9001)",
            peer_str
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_db_path() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test_db").to_string_lossy().to_string();

        // Should succeed for valid path
        assert!(validate_db_path(&db_path).is_ok());
    }

    #[test]
    fn test_parse_peer_address() {
        // Valid addresses
        assert!(parse_peer_address("127.0.0.1:9000").is_ok());
        assert!(parse_peer_address("192.168.1.1:8080").is_ok());

        // Invalid addresses
        assert!(parse_peer_address("invalid").is_err());
        assert!(parse_peer_address("127.0.0.1").is_err());
        assert!(parse_peer_address("127.0.0.1:99999").is_err());
    }

    #[test]
    fn test_flags_build_config() {
        let args = NodeArgs {
            port: Some(9100),
            peers: vec!["127.0.0.1:9101".to_string()],
            http_port: Some(8100),
            ..Default::default()
        };
        let config = build_config(args).unwrap();

        let addr = |s: &str| s.parse::<SocketAddr>().unwrap();
        assert_eq!(config.listen_addr, addr("127.0.0.1:9100"));
        assert_eq!(config.initial_peers, vec![addr("127.0.0.1:9101")]);
        assert_eq!(config.http_addr, Some(addr("127.0.0.1:8100")));
        assert_eq!(config.name, "weave-node-9100");
        assert!(config.db_path.is_none());
        assert_eq!(config.min_peers, None);

        let args = NodeArgs {
            min_peers: Some(3),
            ..Default::default()
        };
        assert_eq!(build_config(args).unwrap().min_peers, Some(3));
    }

    #[test]
    fn test_flags_override_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{"name": "from-file", "listen_addr": "127.0.0.1:9200", "gossip": {"event_interval_ms": 25}}"#,
        )
        .unwrap();

        let args = NodeArgs {
            config: Some(path.clone()),
            port: Some(9300),
            ..Default::default()
        };
        let config = build_config(args).unwrap();
        assert_eq!(config.name, "from-file");
        assert_eq!(config.listen_addr.port(), 9300);
        assert_eq!(config.gossip.event_interval_ms, 25);

        std::fs::write(&path, "not json").unwrap();
        assert!(load_config(&path).is_err());
    }
}
