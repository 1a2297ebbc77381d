pub mod agent;
pub mod fault;
pub mod invariants;
pub mod ops;
pub mod sim;

pub use fault::{FaultConfig, FaultyStore};
pub use sim::Sim;
