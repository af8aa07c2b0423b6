//! Proving side of the node: per-category proving rounds and the scheduler
//! that drives them from chain challenge windows.

pub mod aggregator;
pub mod scheduler;

pub use aggregator::{ProofAggregator, RoundOutcome};
pub use scheduler::{ChallengeScheduler, WindowOutcome};
