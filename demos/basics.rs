//! Minimal embedding example: a single-node cluster over disk storage
//! driving the sample key-value state machine.
//!
//! Run with: cargo run --example basics

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use quorum::core::raft_core::RaftCore;
use quorum::core::{Role, WatchEvent};
use quorum::state_machine::kv::{KeyValueStore, SharedKvStore};
use quorum::storage::DiskStorage;
use quorum::transport::memory::create_cluster;
use quorum::{RaftConfig, RaftServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let data_dir = tempfile::TempDir::new()?;
    let config = RaftConfig::default().with_election_timeout(Duration::from_millis(300));

    let kv: SharedKvStore = Arc::new(Mutex::new(KeyValueStore::new()));
    let storage = DiskStorage::open(data_dir.path(), 8 * 1024 * 1024)?;
    let core = RaftCore::new(1, config, Box::new(storage), Box::new(kv.clone()))?;

    let (mut transports, mut inbound) = create_cluster(&[1]);
    let (server, rpc) = RaftServer::new(core, transports.remove(&1).unwrap());
    server.bootstrap("127.0.0.1:7101".into()).await?;
    tokio::spawn(inbound.remove(&1).unwrap().serve(rpc));
    let handle = server.start();

    handle
        .register_watcher(Box::new(|event: &WatchEvent| {
            println!("watch: {:?}", event);
        }))
        .await?;

    // Wait for the node to elect itself.
    loop {
        if handle.status().await?.role == Role::Leader {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    handle.submit(Bytes::from_static(b"SET language rust")).await?;
    handle.submit(Bytes::from_static(b"SET consensus raft")).await?;

    println!("language = {:?}", kv.lock().get("language"));
    println!("consensus = {:?}", kv.lock().get("consensus"));

    let status = handle.status().await?;
    println!(
        "term={} commit={} applied={} last={}",
        status.term, status.commit_index, status.last_applied, status.last_log_index
    );

    handle.shutdown().await;
    Ok(())
}
