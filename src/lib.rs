pub mod network;
pub mod protocol;
pub mod quorum;
pub mod ring;
pub mod store;
pub mod types;

// Re-export only what's needed by external users
pub use protocol::{MembershipProvider, OpLog, OpOutcome, ReplicaNode, Transport};
pub use ring::Ring;
pub use types::{Address, MessagePayload, QuorumError, ReplicaRole, RoutingError, WireMessage};
