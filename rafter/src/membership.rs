//! Cluster membership: servers, roles and the configuration codec.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::error::StorageError;
use crate::quorum;
use crate::NodeId;

/// The role a server plays in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// A full consensus participant: votes in elections and receives the log.
    Voter,
    /// Receives the log but does not vote. Standbys are promotion candidates kept warm.
    Standby,
    /// A registered member which neither votes nor receives the log.
    Spare,
}

impl Role {
    fn to_byte(self) -> u8 {
        match self {
            Role::Voter => 1,
            Role::Standby => 2,
            Role::Spare => 3,
        }
    }

    fn from_byte(b: u8) -> Option<Role> {
        match b {
            1 => Some(Role::Voter),
            2 => Some(Role::Standby),
            3 => Some(Role::Spare),
            _ => None,
        }
    }
}

/// A single server of the cluster configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// The server's unique, nonzero ID.
    pub id: NodeId,
    /// The network address of the server, opaque to this crate.
    pub address: String,
    /// The server's role.
    pub role: Role,
}

/// The membership configuration of the cluster.
///
/// An ordered list of servers. Only voters count towards a quorum; standbys receive the log
/// without voting; spares receive nothing. Configurations supersede each other by log index, and
/// a configuration takes effect as soon as it is appended to the log, even before it commits.
/// Membership changes touch a single server at a time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// All members of the Raft cluster, in insertion order.
    pub servers: Vec<Server>,
}

/// Version tag of the configuration byte encoding.
const ENCODING_VERSION: u8 = 1;

/// Upper bound accepted for an encoded server address.
const MAX_ADDRESS_LEN: u32 = 1 << 16;

impl Configuration {
    /// Create a new initial config containing only the given node as a voter.
    pub fn new_initial(id: NodeId, address: impl Into<String>) -> Self {
        Configuration {
            servers: vec![Server {
                id,
                address: address.into(),
                role: Role::Voter,
            }],
        }
    }

    /// Check if the given NodeId exists in this membership config.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.servers.iter().any(|s| &s.id == id)
    }

    /// Get the server bearing the given ID.
    pub fn get(&self, id: &NodeId) -> Option<&Server> {
        self.servers.iter().find(|s| &s.id == id)
    }

    /// Check if the given node is a voter of this config.
    pub fn is_voter(&self, id: &NodeId) -> bool {
        matches!(self.get(id), Some(s) if s.role == Role::Voter)
    }

    /// The IDs of all voters.
    pub fn voter_ids(&self) -> BTreeSet<NodeId> {
        self.servers.iter().filter(|s| s.role == Role::Voter).map(|s| s.id).collect()
    }

    /// The IDs of all servers which receive the log: voters and standbys, never spares.
    pub fn replication_targets(&self) -> BTreeSet<NodeId> {
        self.servers.iter().filter(|s| s.role != Role::Spare).map(|s| s.id).collect()
    }

    /// The number of votes needed to win an election or commit an entry.
    pub fn quorum(&self) -> usize {
        quorum::majority_of(self.voter_ids().len())
    }

    /// A copy of this config with the given server appended.
    pub fn with_server_added(&self, server: Server) -> Self {
        let mut servers = self.servers.clone();
        servers.push(server);
        Configuration { servers }
    }

    /// A copy of this config with the given server removed.
    pub fn with_server_removed(&self, id: NodeId) -> Self {
        let servers = self.servers.iter().filter(|s| s.id != id).cloned().collect();
        Configuration { servers }
    }

    /// A copy of this config with the given server's role replaced.
    pub fn with_role(&self, id: NodeId, role: Role) -> Self {
        let servers = self
            .servers
            .iter()
            .map(|s| {
                let mut s = s.clone();
                if s.id == id {
                    s.role = role;
                }
                s
            })
            .collect();
        Configuration { servers }
    }

    /// Encode this configuration into its stable byte representation.
    ///
    /// Layout, little-endian: a version byte, the server count as a u64, then per server the
    /// u64 ID, a role byte, the address length as a u32 and the address bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9 + self.servers.len() * 32);
        buf.push(ENCODING_VERSION);
        buf.extend_from_slice(&(self.servers.len() as u64).to_le_bytes());
        for server in &self.servers {
            buf.extend_from_slice(&server.id.to_le_bytes());
            buf.push(server.role.to_byte());
            buf.extend_from_slice(&(server.address.len() as u32).to_le_bytes());
            buf.extend_from_slice(server.address.as_bytes());
        }
        buf
    }

    /// Decode a configuration from its byte representation.
    pub fn decode(buf: &[u8]) -> Result<Self, StorageError> {
        let mut cur = Cursor { buf, pos: 0 };
        let version = cur.u8()?;
        if version != ENCODING_VERSION {
            return Err(StorageError::Malformed(format!("unknown configuration encoding version {}", version)));
        }
        let n = cur.u64()?;
        if n > (buf.len() as u64) {
            return Err(StorageError::Corrupt(format!("implausible configuration server count {}", n)));
        }
        let mut servers = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let id = cur.u64()?;
            if id == 0 {
                return Err(StorageError::Corrupt("configuration contains a zero server id".into()));
            }
            let role = Role::from_byte(cur.u8()?)
                .ok_or_else(|| StorageError::Corrupt("configuration contains an unknown role".into()))?;
            let len = cur.u32()?;
            if len > MAX_ADDRESS_LEN {
                return Err(StorageError::Corrupt(format!("implausible server address length {}", len)));
            }
            let raw = cur.bytes(len as usize)?;
            let address = String::from_utf8(raw.to_vec())
                .map_err(|_| StorageError::Corrupt("server address is not valid utf-8".into()))?;
            servers.push(Server { id, address, role });
        }
        let config = Configuration { servers };
        if !config.ids_unique() {
            return Err(StorageError::Corrupt("configuration contains duplicate server ids".into()));
        }
        Ok(config)
    }

    fn ids_unique(&self) -> bool {
        let ids: BTreeSet<NodeId> = self.servers.iter().map(|s| s.id).collect();
        ids.len() == self.servers.len()
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8], StorageError> {
        if self.pos + n > self.buf.len() {
            return Err(StorageError::Corrupt("configuration bytes truncated".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, StorageError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, StorageError> {
        let raw = self.bytes(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> Result<u64, StorageError> {
        let raw = self.bytes(8)?;
        let mut fixed = [0u8; 8];
        fixed.copy_from_slice(raw);
        Ok(u64::from_le_bytes(fixed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_voters_one_spare() -> Configuration {
        Configuration {
            servers: vec![
                Server { id: 1, address: "10.0.0.1:7000".into(), role: Role::Voter },
                Server { id: 2, address: "10.0.0.2:7000".into(), role: Role::Voter },
                Server { id: 3, address: "10.0.0.3:7000".into(), role: Role::Voter },
                Server { id: 4, address: "10.0.0.4:7000".into(), role: Role::Spare },
            ],
        }
    }

    #[test]
    fn test_initial_config_is_a_single_voter() {
        let config = Configuration::new_initial(1, "10.0.0.1:7000");
        assert!(config.is_voter(&1));
        assert_eq!(config.quorum(), 1);
        assert_eq!(config.replication_targets().len(), 1);
    }

    #[test]
    fn test_quorum_counts_voters_only() {
        let config = three_voters_one_spare();
        assert_eq!(config.quorum(), 2);
        assert_eq!(config.voter_ids().len(), 3);

        let config = config.with_role(4, Role::Voter);
        assert_eq!(config.quorum(), 3);
    }

    #[test]
    fn test_replication_targets_exclude_spares() {
        let config = three_voters_one_spare().with_role(3, Role::Standby);
        let targets = config.replication_targets();
        assert!(targets.contains(&3));
        assert!(!targets.contains(&4));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let config = three_voters_one_spare();
        let decoded = Configuration::decode(&config.encode()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut buf = three_voters_one_spare().encode();
        buf[0] = 9;
        assert!(matches!(Configuration::decode(&buf), Err(StorageError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let buf = three_voters_one_spare().encode();
        assert!(matches!(Configuration::decode(&buf[..buf.len() - 3]), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn test_decode_rejects_duplicate_ids() {
        let mut config = three_voters_one_spare();
        config.servers[3].id = 1;
        assert!(matches!(Configuration::decode(&config.encode()), Err(StorageError::Corrupt(_))));
    }
}
