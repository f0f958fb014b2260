//! Storage layer for Raft persistent state.
//!
//! - `MemoryStorage`: fast, in-memory storage for testing
//! - `DiskStorage`: durable metadata rotation + preallocated log segments
//!   written through the asynchronous disk writer

pub mod disk;
#[cfg(target_os = "linux")]
pub mod kaio;
pub mod memory;
pub mod metadata;
pub mod segment;
pub mod traits;
pub mod writer;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;
pub use traits::{InitialState, Storage, StorageError};
pub use writer::Capabilities;
