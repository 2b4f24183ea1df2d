//! Registry Module
//!
//! The replicated aggregates, their lock discipline and snapshot
//! persistence.

mod model;
mod store;
pub mod snapshot;

pub use model::{
    ClusterNode, ClusterView, PeerId, PendingRequests, Rejection, Role, ServerElement, ServersData,
    StateSnapshot, UserRequest,
};
pub use snapshot::SnapshotStore;
pub use store::{ReplicatedState, StateChange};
