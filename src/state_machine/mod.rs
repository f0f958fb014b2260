//! State machine layer.
//!
//! - `KeyValueStore`: simple key-value store
//! - `TestStateMachine`: records commands for testing

pub mod kv;
pub mod traits;

pub use traits::{AppliedCommands, ApplyResult, Snapshotable, StateMachine, TestStateMachine};
