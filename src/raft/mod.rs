//! Raft command pipeline using OpenRaft
//!
//! All ranges of a store share one Raft group; each log entry names the
//! range its command belongs to.

mod command;
mod network;
mod node;
mod proposer;
mod storage;
mod types;

pub use command::{Command, CommandId, CommandResponse, ConfChange, ConfChangeType, RaftCommand, WriteBatch};
pub use network::{serve_connection, RaftNetworkFactoryImpl};
pub use node::{RaftNode, RaftNodeError};
pub use proposer::{CommandApplier, LocalProposer, Proposer};
pub use storage::EngineRaftStorage;
pub use types::*;
