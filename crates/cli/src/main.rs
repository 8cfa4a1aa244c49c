use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
use commands::{
    execute_keygen_command, execute_node_command, execute_simulate_command, KeygenArgs, NodeArgs,
    SimulateArgs,
};

#[derive(Parser)]
#[command(name = "weave")]
#[command(about = "Weave - leaderless transaction ordering over a gossiped hashgraph")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a Weave node
    Node(NodeArgs),
    /// Generate a node key pair
    Keygen(KeygenArgs),
    /// Run an in-process multi-node simulation
    Simulate(SimulateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Node(args) => execute_node_command(args).await,
        Commands::Keygen(args) => execute_keygen_command(args),
        Commands::Simulate(args) => execute_simulate_command(args),
    }
}
