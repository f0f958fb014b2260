//! Cluster membership: the ordered set of servers and their roles.
//!
//! A membership change is a regular log entry carrying the encoded server
//! set. It takes effect at append time on every server and is rolled back
//! if the entry is later truncated.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::storage::StorageError;

/// Role of a server within a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRole {
    /// Counts towards quorum and can become leader.
    Voter,
    /// Receives replication but does not vote.
    NonVoter,
    /// Idle target for a later promotion.
    Spare,
}

/// One server in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Unique, nonzero server id.
    pub id: u64,
    /// Transport address, opaque to the core.
    pub address: String,
    pub role: ServerRole,
}

/// An ordered set of servers. Ids are unique within a configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    servers: Vec<Server>,
}

impl Membership {
    /// An empty configuration (pre-bootstrap).
    pub fn new() -> Self {
        Membership { servers: Vec::new() }
    }

    /// Initial single-voter configuration used by `bootstrap`.
    pub fn bootstrap(id: u64, address: String) -> Self {
        Membership {
            servers: vec![Server { id, address, role: ServerRole::Voter }],
        }
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.get(id).is_some()
    }

    pub fn is_voter(&self, id: u64) -> bool {
        matches!(self.get(id), Some(s) if s.role == ServerRole::Voter)
    }

    /// Iterator over the voting servers.
    pub fn voters(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter().filter(|s| s.role == ServerRole::Voter)
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    /// Majority of voters.
    pub fn quorum(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Ids of every server except `self_id` (replication targets).
    pub fn peer_ids(&self, self_id: u64) -> Vec<u64> {
        self.servers.iter().map(|s| s.id).filter(|&id| id != self_id).collect()
    }

    /// Add a server. Fails on a zero or duplicate id.
    pub fn add(&mut self, server: Server) -> Result<(), RaftError> {
        if server.id == 0 {
            return Err(RaftError::InvalidChange("server id must be nonzero".into()));
        }
        if self.contains(server.id) {
            return Err(RaftError::InvalidChange(format!(
                "server {} already in configuration",
                server.id
            )));
        }
        self.servers.push(server);
        Ok(())
    }

    /// Promote a non-voter or spare to voter.
    pub fn promote(&mut self, id: u64) -> Result<(), RaftError> {
        let server = self
            .servers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| RaftError::InvalidChange(format!("server {} not in configuration", id)))?;
        if server.role == ServerRole::Voter {
            return Err(RaftError::InvalidChange(format!("server {} is already a voter", id)));
        }
        server.role = ServerRole::Voter;
        Ok(())
    }

    /// Remove a server.
    pub fn remove(&mut self, id: u64) -> Result<(), RaftError> {
        let pos = self
            .servers
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| RaftError::InvalidChange(format!("server {} not in configuration", id)))?;
        self.servers.remove(pos);
        Ok(())
    }

    /// Encode for a configuration log entry.
    pub fn encode(&self) -> Bytes {
        // Serialization of plain structs cannot fail.
        Bytes::from(serde_json::to_vec(self).expect("membership encoding"))
    }

    /// Decode from a configuration log entry payload.
    pub fn decode(data: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(data)
            .map_err(|e| StorageError::Corrupt(format!("invalid configuration entry: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_voters() -> Membership {
        let mut m = Membership::bootstrap(1, "a".into());
        m.add(Server { id: 2, address: "b".into(), role: ServerRole::Voter }).unwrap();
        m.add(Server { id: 3, address: "c".into(), role: ServerRole::Voter }).unwrap();
        m
    }

    #[test]
    fn quorum_counts_only_voters() {
        let mut m = three_voters();
        assert_eq!(m.quorum(), 2);
        m.add(Server { id: 4, address: "d".into(), role: ServerRole::NonVoter }).unwrap();
        assert_eq!(m.voter_count(), 3);
        assert_eq!(m.quorum(), 2);
        m.promote(4).unwrap();
        assert_eq!(m.quorum(), 3);
    }

    #[test]
    fn add_rejects_duplicate_and_zero_ids() {
        let mut m = three_voters();
        assert!(m.add(Server { id: 2, address: "x".into(), role: ServerRole::Spare }).is_err());
        assert!(m.add(Server { id: 0, address: "x".into(), role: ServerRole::Spare }).is_err());
    }

    #[test]
    fn promote_requires_existing_non_voter() {
        let mut m = three_voters();
        assert!(m.promote(9).is_err());
        assert!(m.promote(1).is_err()); // already a voter
    }

    #[test]
    fn remove_drops_server() {
        let mut m = three_voters();
        m.remove(2).unwrap();
        assert!(!m.contains(2));
        assert_eq!(m.voter_count(), 2);
        assert!(m.remove(2).is_err());
    }

    #[test]
    fn encode_decode_round_trip() {
        let m = three_voters();
        let decoded = Membership::decode(&m.encode()).unwrap();
        assert_eq!(decoded, m);
    }
}
