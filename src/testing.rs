//! Testing utilities for cluster integration tests.
//!
//! Provides [`TestCluster`] for spinning up in-process clusters over the
//! in-memory transport, with memory-backed storage and a recording state
//! machine per node.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep, Instant};

use crate::core::config::RaftConfig;
use crate::core::log::Entry;
use crate::core::membership::{Membership, Server, ServerRole};
use crate::core::raft_core::RaftCore;
use crate::core::raft_server::{RaftHandle, RaftServer, Status};
use crate::core::Role;
use crate::error::RaftError;
use crate::state_machine::{AppliedCommands, TestStateMachine};
use crate::storage::{MemoryStorage, Storage};
use crate::transport::memory::create_cluster_with_timeout;

/// A single node in a test cluster.
pub struct TestNode {
    pub id: u64,
    pub handle: RaftHandle,
    /// Commands this node's state machine has applied, in order.
    pub applied: AppliedCommands,
}

/// An in-process cluster of Raft nodes.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// A 3-node cluster with a shared initial configuration.
    pub async fn new() -> Self {
        Self::with_nodes(3).await
    }

    /// `count` voters sharing the initial configuration.
    pub async fn with_nodes(count: usize) -> Self {
        Self::build(count, 0, None).await
    }

    /// `seeded` voters plus `blank` empty nodes waiting to be added via
    /// membership changes.
    pub async fn with_blank_nodes(seeded: usize, blank: usize) -> Self {
        Self::build(seeded, blank, None).await
    }

    /// Fast timers suitable for tests.
    pub fn test_config() -> RaftConfig {
        RaftConfig::default()
            .with_election_timeout(Duration::from_millis(150))
            .with_heartbeat_interval(Duration::from_millis(30))
    }

    async fn build(seeded: usize, blank: usize, config: Option<RaftConfig>) -> Self {
        let config = config.unwrap_or_else(Self::test_config);
        let ids: Vec<u64> = (1..=(seeded + blank) as u64).collect();
        let (mut transports, mut inbound) =
            create_cluster_with_timeout(&ids, Some(Duration::from_millis(100)));

        let mut membership = Membership::new();
        for id in 1..=seeded as u64 {
            membership
                .add(Server { id, address: format!("node-{id}"), role: ServerRole::Voter })
                .expect("unique test ids");
        }

        let mut nodes = Vec::new();
        for id in ids {
            let mut storage = MemoryStorage::new();
            if id <= seeded as u64 {
                storage
                    .append(&[Entry::configuration(0, 1, membership.encode())])
                    .await
                    .expect("seeding memory storage");
            }
            let applied = AppliedCommands::default();
            let fsm = TestStateMachine::new_shared(applied.clone());
            let core = RaftCore::new(id, config.clone(), Box::new(storage), Box::new(fsm))
                .expect("core construction");
            let transport = transports.remove(&id).expect("transport for node");
            let (server, rpc) = RaftServer::new(core, transport);
            tokio::spawn(inbound.remove(&id).expect("inbound for node").serve(rpc));
            let handle = server.start();
            nodes.push(TestNode { id, handle, applied });
        }
        TestCluster { nodes }
    }

    pub fn node(&self, id: u64) -> &TestNode {
        self.nodes.iter().find(|n| n.id == id).expect("node exists")
    }

    pub async fn statuses(&self) -> Vec<Status> {
        let mut statuses = Vec::new();
        for node in &self.nodes {
            if let Ok(status) = node.handle.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Wait until one node leads and every node agrees on it. Returns the
    /// leader id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        loop {
            let statuses = self.statuses().await;
            let leaders: Vec<u64> =
                statuses.iter().filter(|s| s.role == Role::Leader).map(|s| s.id).collect();
            if leaders.len() == 1 {
                let leader = leaders[0];
                // Blank nodes awaiting an add-server know nothing yet.
                let members =
                    statuses.iter().filter(|s| !s.membership.is_empty());
                if members.clone().count() > 0
                    && members.into_iter().all(|s| s.leader_hint == Some(leader))
                {
                    return leader;
                }
            }
            assert!(Instant::now() < deadline, "no leader within {:?}", timeout);
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until the leader has committed everything it holds (e.g. its
    /// post-election barrier), so membership changes are accepted.
    pub async fn wait_until_quiescent(&self, leader: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(status) = self.node(leader).handle.status().await {
                if status.commit_index == status.last_log_index
                    && status.last_applied == status.commit_index
                {
                    return;
                }
            }
            assert!(Instant::now() < deadline, "leader never went quiescent");
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until every node has applied at least `index`.
    pub async fn wait_for_applied(&self, index: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let statuses = self.statuses().await;
            if statuses.len() == self.nodes.len()
                && statuses.iter().all(|s| s.last_applied >= index)
            {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "applied index {} not reached within {:?}",
                index,
                timeout
            );
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Submit a command through the current leader, retrying across
    /// leadership changes.
    pub async fn submit(&self, payload: &[u8], timeout: Duration) -> Result<Bytes, RaftError> {
        let deadline = Instant::now() + timeout;
        loop {
            let leader = self.wait_for_leader(deadline - Instant::now()).await;
            match self.node(leader).handle.submit(Bytes::copy_from_slice(payload)).await {
                Err(RaftError::NotLeader { .. }) | Err(RaftError::NoLeader) => {
                    assert!(Instant::now() < deadline, "submit kept missing the leader");
                    sleep(Duration::from_millis(20)).await;
                }
                other => return other,
            }
        }
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.handle.shutdown().await;
        }
    }
}
