//! Deterministic in-process simulation
//!
//! Runs several hashgraph replicas against a seeded random gossip schedule.
//! At every step a random node syncs everything it knows to another random
//! node, which then records the exchange as a new event. Keys, schedule and
//! timestamps all derive from the seed, so a run is fully reproducible.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};
use weave_protocol::{Event, EventHash, Identity};

use crate::hashgraph::Hashgraph;
use crate::registry::PeerSnapshot;
use crate::storage::StoreConfig;

/// Parameters of a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub nodes: usize,
    /// Stop once every replica has extracted this many rounds
    pub rounds: u64,
    pub seed: u64,
    /// Give up after this many gossip steps
    pub max_steps: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: 4,
            rounds: 5,
            seed: 0,
            max_steps: 10_000,
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub steps: usize,
    /// Events per replica
    pub events: Vec<usize>,
    /// Last extracted round per replica
    pub decided_rounds: Vec<Option<u64>>,
    /// Length of each replica's consensus order
    pub ordered: Vec<usize>,
    /// Every replica's order is a prefix of the longest one
    pub agreement: bool,
}

struct Replica {
    identity: Identity,
    graph: Hashgraph,
}

/// A set of replicas driven by a seeded gossip schedule.
pub struct Simulation {
    config: SimulationConfig,
    replicas: Vec<Replica>,
    peers: PeerSnapshot,
    rng: StdRng,
    epoch: DateTime<Utc>,
    steps: usize,
}

impl Simulation {
    /// Create the replicas and give each one a root event.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let epoch = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .context("Invalid simulation epoch")?;

        let mut replicas: Vec<Replica> = (0..config.nodes.max(1))
            .map(|_| Replica {
                identity: Identity::from_secret(rng.gen()),
                graph: Hashgraph::new(StoreConfig::default()),
            })
            .collect();
        let peers = PeerSnapshot::from_members(replicas.iter().map(|r| r.identity.node_id()));

        for (i, replica) in replicas.iter_mut().enumerate() {
            let root = Event::new(
                &replica.identity,
                None,
                None,
                vec![format!("n{}-root", i).into_bytes()],
                epoch,
            )?;
            replica.graph.insert(root).context("Failed to insert root")?;
            replica.graph.recompute(&peers);
        }

        Ok(Self {
            config,
            replicas,
            peers,
            rng,
            epoch,
            steps: 0,
        })
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn graph(&self, replica: usize) -> Option<&Hashgraph> {
        self.replicas.get(replica).map(|r| &r.graph)
    }

    pub fn peers(&self) -> &PeerSnapshot {
        &self.peers
    }

    /// One gossip exchange. Returns the hash of the event it created.
    pub fn step(&mut self) -> Result<Option<EventHash>> {
        let n = self.replicas.len();
        if n < 2 {
            return Ok(None);
        }
        let from = self.rng.gen_range(0..n);
        let to = (from + self.rng.gen_range(1..n)) % n;
        self.steps += 1;

        // Acceptance order is topological, so the receiver never buffers.
        let missing: Vec<Event> = {
            let receiver = self.replicas[to].graph.store();
            self.replicas[from]
                .graph
                .store()
                .events()
                .filter(|e| !receiver.contains(&e.hash))
                .cloned()
                .collect()
        };
        let other_parent = self.replicas[from]
            .graph
            .store()
            .latest_by_creator(self.replicas[from].identity.node_id())
            .map(|e| e.hash);

        let timestamp = self.epoch + Duration::milliseconds(self.steps as i64);
        let receiver = &mut self.replicas[to];
        for event in missing {
            receiver.graph.insert(event).context("Failed to sync event")?;
        }
        let self_parent = receiver
            .graph
            .store()
            .latest_by_creator(receiver.identity.node_id())
            .map(|e| e.hash);
        let event = Event::new(
            &receiver.identity,
            self_parent,
            other_parent,
            vec![format!("n{}-{}", to, self.steps).into_bytes()],
            timestamp,
        )?;
        let hash = event.hash;
        receiver.graph.insert(event).context("Failed to insert new event")?;
        let update = receiver.graph.recompute(&self.peers);
        debug!(
            "Step {}: {} -> {}, {} newly ordered",
            self.steps,
            from,
            to,
            update.ordered.len()
        );
        Ok(Some(hash))
    }

    /// Step until every replica has extracted the configured number of
    /// rounds or the step budget runs out.
    pub fn run(&mut self) -> Result<SimulationReport> {
        let target = self.config.rounds.saturating_sub(1);
        while self.steps < self.config.max_steps && !self.reached(target) {
            if self.step()?.is_none() {
                break;
            }
        }
        let report = self.report();
        info!(
            "Simulation finished after {} steps, agreement: {}",
            report.steps, report.agreement
        );
        Ok(report)
    }

    fn reached(&self, target: u64) -> bool {
        self.replicas
            .iter()
            .all(|r| r.graph.last_decided_round().is_some_and(|round| round >= target))
    }

    /// Whether every replica's consensus order is a prefix of the longest.
    pub fn agreement(&self) -> bool {
        let orders: Vec<Vec<EventHash>> = self
            .replicas
            .iter()
            .map(|r| r.graph.ordered_hashes())
            .collect();
        let Some(longest) = orders.iter().max_by_key(|order| order.len()) else {
            return true;
        };
        orders.iter().all(|order| longest.starts_with(order))
    }

    pub fn report(&self) -> SimulationReport {
        SimulationReport {
            steps: self.steps,
            events: self.replicas.iter().map(|r| r.graph.store().len()).collect(),
            decided_rounds: self
                .replicas
                .iter()
                .map(|r| r.graph.last_decided_round())
                .collect(),
            ordered: self
                .replicas
                .iter()
                .map(|r| r.graph.store().ordered().len())
                .collect(),
            agreement: self.agreement(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_reaches_agreement() {
        let mut simulation = Simulation::new(SimulationConfig {
            nodes: 4,
            rounds: 3,
            seed: 7,
            max_steps: 2_000,
        })
        .unwrap();
        let report = simulation.run().unwrap();

        assert!(report.agreement);
        assert!(report.decided_rounds.iter().all(|r| r.is_some_and(|r| r >= 2)));
        assert!(report.ordered.iter().all(|&n| n > 0));
    }

    #[test]
    fn test_same_seed_same_run() {
        let config = SimulationConfig {
            nodes: 3,
            rounds: 2,
            seed: 42,
            max_steps: 200,
        };
        let mut a = Simulation::new(config.clone()).unwrap();
        let mut b = Simulation::new(config).unwrap();
        for _ in 0..50 {
            assert_eq!(a.step().unwrap(), b.step().unwrap());
        }
        assert_eq!(
            a.graph(0).unwrap().ordered_hashes(),
            b.graph(0).unwrap().ordered_hashes()
        );
    }

    #[test]
    fn test_single_node_does_not_step() {
        let mut simulation = Simulation::new(SimulationConfig {
            nodes: 1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(simulation.step().unwrap(), None);
        assert_eq!(simulation.replica_count(), 1);
    }
}
