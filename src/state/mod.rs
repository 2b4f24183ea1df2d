//! State Module
//!
//! Peer liveness tracking and master election.

mod membership;
mod election;

pub use membership::MembershipDirectory;
pub use election::{choose_winner, ElectionCoordinator, RoundResult};
