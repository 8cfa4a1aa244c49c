//! Simulation command
//!
//! Runs several in-process replicas over a seeded gossip schedule and checks
//! that they all agree on the consensus order.

use anyhow::{bail, Result};
use clap::Args;
use weave_federation::{Simulation, SimulationConfig, SimulationReport};

/// Arguments for the simulate command
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of nodes
    #[arg(short, long, default_value = "4")]
    pub nodes: usize,
    /// Rounds every node must extract before stopping
    #[arg(short, long, default_value = "5")]
    pub rounds: u64,
    /// Seed for keys and gossip schedule
    #[arg(short, long, default_value = "0")]
    pub seed: u64,
    /// Upper bound on gossip steps
    #[arg(long, default_value = "10000")]
    pub max_steps: usize,
    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Execute the simulate command
pub fn execute_simulate_command(args: SimulateArgs) -> Result<()> {
    if args.nodes < 2 {
        bail!("A simulation needs at least two nodes");
    }
    let report = run(&args)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&args, &report);
    }

    if !report.agreement {
        bail!("Replicas disagree on the consensus order");
    }
    Ok(())
}

fn run(args: &SimulateArgs) -> Result<SimulationReport> {
    let mut simulation = Simulation::new(SimulationConfig {
        nodes: args.nodes,
        rounds: args.rounds,
        seed: args.seed,
        max_steps: args.max_steps,
    })?;
    simulation.run()
}

fn print_report(args: &SimulateArgs, report: &SimulationReport) {
    println!(
        "🧪 Simulated {} nodes for {} gossip steps (seed {})",
        args.nodes, report.steps, args.seed
    );
    for (i, ((events, decided), ordered)) in report
        .events
        .iter()
        .zip(&report.decided_rounds)
        .zip(&report.ordered)
        .enumerate()
    {
        let decided = decided.map_or_else(|| "none".to_string(), |r| r.to_string());
        println!(
            "   node {}: {} events, last decided round {}, {} ordered",
            i, events, decided, ordered
        );
    }
    if report.agreement {
        println!("✅ All replicas agree on the consensus order");
    } else {
        println!("❌ Replicas disagree on the consensus order");
    }
}
