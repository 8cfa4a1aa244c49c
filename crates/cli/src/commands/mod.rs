//! CLI command modules

pub mod keygen;
pub mod node;
pub mod simulate;

pub use keygen::{execute_keygen_command, KeygenArgs};
pub use node::{execute_node_command, NodeArgs};
pub use simulate::{execute_simulate_command, SimulateArgs};
