//! Core consensus layer.

pub mod config;
pub mod log;
pub mod membership;
pub mod message;
pub mod progress;
pub mod raft_core;
pub mod raft_node;
pub mod raft_server;
pub mod snapshot;
pub mod watch;

pub use config::RaftConfig;
pub use log::{Entry, EntryKind, LogStore};
pub use membership::{Membership, Server, ServerRole};
pub use raft_core::{RaftCore, Role};
pub use raft_server::{RaftHandle, RaftServer};
pub use watch::{WatchEvent, Watcher};
