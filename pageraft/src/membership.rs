//! Cluster membership configuration.

use std::fmt;

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::error::RaftError;
use crate::NodeId;

/// Wire-format version understood by [`Membership::decode`].
const ENCODING_VERSION: u8 = 1;

/// What a server contributes to the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Role {
    /// Replicates the log, does not participate in quorum.
    Standby,
    /// Replicates the log and participates in quorum.
    Voter,
    /// Does not replicate the log or participate in quorum.
    Spare,
}

impl Role {
    fn to_wire(self) -> u8 {
        match self {
            Role::Standby => 0,
            Role::Voter => 1,
            Role::Spare => 2,
        }
    }

    fn from_wire(code: u8) -> Result<Role, RaftError> {
        match code {
            0 => Ok(Role::Standby),
            1 => Ok(Role::Voter),
            2 => Ok(Role::Spare),
            _ => Err(RaftError::Malformed),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Standby => "standby",
            Role::Voter => "voter",
            Role::Spare => "spare",
        };
        write!(f, "{}", s)
    }
}

/// One server in a configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerInfo {
    pub id: NodeId,
    pub address: String,
    pub role: Role,
}

/// An ordered set of servers with their roles.
///
/// A committed configuration and at most one uncommitted configuration
/// coexist on every server; the indices of both are tracked by the core,
/// this type only holds the server list itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Membership {
    servers: Vec<ServerInfo>,
}

impl Membership {
    pub fn new() -> Self {
        Membership { servers: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn servers(&self) -> &[ServerInfo] {
        &self.servers
    }

    /// Add a server. The id must be positive and both id and address must
    /// be unused.
    pub fn add(&mut self, id: NodeId, address: &str, role: Role) -> Result<(), RaftError> {
        if id == 0 {
            return Err(RaftError::BadId);
        }
        if self.get(id).is_some() {
            return Err(RaftError::DuplicateId);
        }
        if self.servers.iter().any(|s| s.address == address) {
            return Err(RaftError::DuplicateAddress);
        }
        self.servers.push(ServerInfo { id, address: address.to_string(), role });
        Ok(())
    }

    /// Remove the server with the given id.
    pub fn remove(&mut self, id: NodeId) -> Result<(), RaftError> {
        let i = self.index_of(id).ok_or(RaftError::BadId)?;
        self.servers.remove(i);
        Ok(())
    }

    /// Change the role of the server with the given id.
    pub fn assign(&mut self, id: NodeId, role: Role) -> Result<(), RaftError> {
        let i = self.index_of(id).ok_or(RaftError::BadId)?;
        self.servers[i].role = role;
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> Option<&ServerInfo> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Position of the server in the list.
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.servers.iter().position(|s| s.id == id)
    }

    /// Position of the server counting voters only.
    pub fn index_of_voter(&self, id: NodeId) -> Option<usize> {
        self.servers.iter().filter(|s| s.role == Role::Voter).position(|s| s.id == id)
    }

    pub fn voter_count(&self) -> usize {
        self.servers.iter().filter(|s| s.role == Role::Voter).count()
    }

    pub fn voters(&self) -> impl Iterator<Item = &ServerInfo> {
        self.servers.iter().filter(|s| s.role == Role::Voter)
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.get(id).map(|s| s.role == Role::Voter).unwrap_or(false)
    }

    /// Smallest number of voters that forms a majority.
    pub fn quorum(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Encode to the canonical byte layout:
    ///
    /// ```text
    /// [version:u8][n_servers:u64le][{ id:u64le, address nul-terminated, role:u8 }...]
    /// ```
    ///
    /// padded with zero bytes to an 8-byte boundary.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(ENCODING_VERSION);
        buf.put_u64_le(self.servers.len() as u64);
        for server in &self.servers {
            buf.put_u64_le(server.id);
            buf.put_slice(server.address.as_bytes());
            buf.put_u8(0);
            buf.put_u8(server.role.to_wire());
        }
        while buf.len() % 8 != 0 {
            buf.put_u8(0);
        }
        buf.freeze()
    }

    /// Decode a buffer produced by [`Membership::encode`].
    ///
    /// Fails with `malformed` on an unknown version, a truncated buffer,
    /// an address without a terminating NUL, invalid UTF-8, an unknown
    /// role, or a duplicated server id.
    pub fn decode(mut buf: &[u8]) -> Result<Membership, RaftError> {
        if buf.remaining() < 1 + 8 {
            return Err(RaftError::Malformed);
        }
        let version = buf.get_u8();
        if version != ENCODING_VERSION {
            return Err(RaftError::Malformed);
        }
        let n = buf.get_u64_le();

        let mut membership = Membership::new();
        for _ in 0..n {
            if buf.remaining() < 8 {
                return Err(RaftError::Malformed);
            }
            let id = buf.get_u64_le();

            let nul = buf.iter().position(|&b| b == 0).ok_or(RaftError::Malformed)?;
            let address = std::str::from_utf8(&buf[..nul]).map_err(|_| RaftError::Malformed)?.to_string();
            buf.advance(nul + 1);

            if buf.remaining() < 1 {
                return Err(RaftError::Malformed);
            }
            let role = Role::from_wire(buf.get_u8())?;

            membership.add(id, &address, role).map_err(|_| RaftError::Malformed)?;
        }
        Ok(membership)
    }

    pub fn summary(&self) -> String {
        let servers: Vec<String> =
            self.servers.iter().map(|s| format!("{}:{}@{}", s.id, s.role, s.address)).collect();
        format!("[{}]", servers.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> Membership {
        let mut m = Membership::new();
        m.add(1, "192.168.1.1:666", Role::Voter).unwrap();
        m.add(2, "192.168.1.2:666", Role::Voter).unwrap();
        m.add(3, "192.168.1.3:666", Role::Standby).unwrap();
        m.add(4, "192.168.1.4:666", Role::Spare).unwrap();
        m
    }

    #[test]
    fn add_rejects_duplicate_id() {
        let mut m = sample();
        assert_eq!(m.add(1, "10.0.0.1:1", Role::Voter), Err(RaftError::DuplicateId));
    }

    #[test]
    fn add_rejects_duplicate_address() {
        let mut m = sample();
        assert_eq!(m.add(9, "192.168.1.1:666", Role::Voter), Err(RaftError::DuplicateAddress));
    }

    #[test]
    fn add_rejects_zero_id() {
        let mut m = Membership::new();
        assert_eq!(m.add(0, "x", Role::Voter), Err(RaftError::BadId));
    }

    #[test]
    fn remove_unknown_id_fails() {
        let mut m = sample();
        assert_eq!(m.remove(42), Err(RaftError::BadId));
        m.remove(3).unwrap();
        assert_eq!(m.len(), 3);
        assert!(m.get(3).is_none());
    }

    #[test]
    fn voter_accounting() {
        let m = sample();
        assert_eq!(m.voter_count(), 2);
        assert_eq!(m.quorum(), 2);
        assert_eq!(m.index_of_voter(2), Some(1));
        assert_eq!(m.index_of_voter(3), None);
        assert!(m.is_voter(1));
        assert!(!m.is_voter(4));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let m = sample();
        let buf = m.encode();
        assert_eq!(buf.len() % 8, 0);
        let decoded = Membership::decode(&buf).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let m = sample();
        let mut buf = m.encode().to_vec();
        buf[0] = 99;
        assert_eq!(Membership::decode(&buf), Err(RaftError::Malformed));
    }

    #[test]
    fn decode_rejects_truncated_address() {
        // One server whose address never terminates.
        let mut buf = BytesMut::new();
        buf.put_u8(ENCODING_VERSION);
        buf.put_u64_le(1);
        buf.put_u64_le(7);
        buf.put_slice(b"addr-without-nul");
        assert_eq!(Membership::decode(&buf), Err(RaftError::Malformed));
    }

    #[test]
    fn decode_rejects_bad_role() {
        let mut buf = BytesMut::new();
        buf.put_u8(ENCODING_VERSION);
        buf.put_u64_le(1);
        buf.put_u64_le(7);
        buf.put_slice(b"a\0");
        buf.put_u8(9);
        assert_eq!(Membership::decode(&buf), Err(RaftError::Malformed));
    }

    #[test]
    fn decode_rejects_duplicated_ids() {
        let mut buf = BytesMut::new();
        buf.put_u8(ENCODING_VERSION);
        buf.put_u64_le(2);
        for address in [&b"a\0"[..], &b"b\0"[..]] {
            buf.put_u64_le(7);
            buf.put_slice(address);
            buf.put_u8(1);
        }
        assert_eq!(Membership::decode(&buf), Err(RaftError::Malformed));
    }
}
