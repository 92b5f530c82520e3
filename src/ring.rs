//! Token ring model shared by the routing client, the observation layer and
//! the daemon. Key ownership follows the classic consistent-hash layout: a
//! member owns the segment starting at each of its tokens, and replicas are
//! the next distinct members walking the ring clockwise.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;

use crate::error::{CuttleError, Result};
use crate::wire::Value;

pub type Token = u64;

/// Stable 64-bit token for a partition key: the first 8 bytes of the
/// SHA-256 of the key bytes. Stable across processes and platforms, which
/// matters because the client and every node must agree on placement.
pub fn token_of(key_bytes: &[u8]) -> Token {
    let digest = Sha256::digest(key_bytes);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

/// Token for a composite partition key (the bincode encoding of its values).
pub fn partition_token(partition: &[Value]) -> Token {
    let bytes = bincode::serialize(partition).unwrap_or_default();
    token_of(&bytes)
}

/// Half-open wrapping range `[start, end)`. A range with `start == end`
/// covers the whole ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: Token,
    pub end: Token,
}

impl TokenRange {
    pub fn new(start: Token, end: Token) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, token: Token) -> bool {
        if self.start == self.end {
            return true;
        }
        if self.start < self.end {
            self.start <= token && token < self.end
        } else {
            token >= self.start || token < self.end
        }
    }
}

/// Returns true if any of `ranges` contains `token`.
pub fn ranges_contain(ranges: &[TokenRange], token: Token) -> bool {
    ranges.iter().any(|r| r.contains(token))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingMember {
    pub name: String,
    pub native_addr: SocketAddr,
    pub mgmt_addr: SocketAddr,
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ring {
    pub members: Vec<RingMember>,
}

impl Ring {
    pub fn new(members: Vec<RingMember>) -> Self {
        Self { members }
    }

    pub fn member(&self, name: &str) -> Result<&RingMember> {
        self.members
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| CuttleError::NodeNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.iter().any(|m| m.name == name)
    }

    /// A copy of this ring without the named member.
    pub fn without(&self, name: &str) -> Ring {
        Ring {
            members: self
                .members
                .iter()
                .filter(|m| m.name != name)
                .cloned()
                .collect(),
        }
    }

    pub fn with_member(&self, member: RingMember) -> Ring {
        let mut members = self.members.clone();
        members.push(member);
        Ring { members }
    }

    /// All ring tokens, sorted, each paired with its member index.
    fn sorted_entries(&self) -> Vec<(Token, usize)> {
        let mut entries: Vec<(Token, usize)> = self
            .members
            .iter()
            .enumerate()
            .flat_map(|(idx, m)| m.tokens.iter().map(move |t| (*t, idx)))
            .collect();
        entries.sort_unstable();
        entries
    }

    /// Replica members for a token: the owner of the greatest ring token at
    /// or before `token` (wrapping), then the next distinct members walking
    /// clockwise. `rf` is clamped to the member count.
    pub fn replicas_for(&self, token: Token, rf: usize) -> Vec<&RingMember> {
        let entries = self.sorted_entries();
        if entries.is_empty() {
            return Vec::new();
        }
        let rf = rf.min(self.members.len());
        // Greatest entry <= token; wraps to the last entry below the first.
        let start = match entries.binary_search_by(|(t, _)| t.cmp(&token)) {
            Ok(i) => i,
            Err(0) => entries.len() - 1,
            Err(i) => i - 1,
        };
        let mut replicas: Vec<usize> = Vec::with_capacity(rf);
        for step in 0..entries.len() {
            let (_, member_idx) = entries[(start + step) % entries.len()];
            if !replicas.contains(&member_idx) {
                replicas.push(member_idx);
                if replicas.len() == rf {
                    break;
                }
            }
        }
        replicas.into_iter().map(|i| &self.members[i]).collect()
    }

    pub fn is_replica(&self, name: &str, token: Token, rf: usize) -> bool {
        self.replicas_for(token, rf).iter().any(|m| m.name == name)
    }

    /// The ranges for which the named member is among the replicas at the
    /// given replication factor. Each ring segment `[t_i, t_{i+1})` is
    /// replicated on the owner of `t_i` and its distinct successors.
    pub fn replica_ranges(&self, name: &str, rf: usize) -> Vec<TokenRange> {
        let entries = self.sorted_entries();
        if entries.is_empty() {
            return Vec::new();
        }
        if entries.len() == 1 {
            let (t, idx) = entries[0];
            return if self.members[idx].name == name {
                vec![TokenRange::new(t, t)]
            } else {
                Vec::new()
            };
        }
        let mut ranges = Vec::new();
        for i in 0..entries.len() {
            let (start, _) = entries[i];
            let (end, _) = entries[(i + 1) % entries.len()];
            if self.is_replica(name, start, rf) {
                ranges.push(TokenRange::new(start, end));
            }
        }
        ranges
    }

    /// Tokens for a member added to an existing ring: each new token splits
    /// the currently largest segment at its midpoint, which keeps ownership
    /// approximately even without colliding with existing tokens.
    pub fn allocate_midpoint_tokens(&self, count: usize) -> Vec<Token> {
        let mut tokens: Vec<Token> = self.sorted_entries().iter().map(|(t, _)| *t).collect();
        let mut allocated = Vec::with_capacity(count);
        for _ in 0..count {
            if tokens.is_empty() {
                allocated.push(0);
                tokens.push(0);
                continue;
            }
            tokens.sort_unstable();
            // Widest segment, including the wrapping one.
            let mut best = (0usize, 0u64);
            for i in 0..tokens.len() {
                let start = tokens[i];
                let end = tokens[(i + 1) % tokens.len()];
                let width = end.wrapping_sub(start);
                let width = if width == 0 { u64::MAX } else { width };
                if width > best.1 {
                    best = (i, width);
                }
            }
            let midpoint = tokens[best.0].wrapping_add(best.1 / 2);
            allocated.push(midpoint);
            tokens.push(midpoint);
        }
        allocated
    }
}

/// Evenly spaced token assignment for initial provisioning. The full token
/// space is divided into `node_count * num_tokens` slots; slot `k` goes to
/// node `k % node_count`, so single-token rings get contiguous primary
/// ranges and vnode rings get interleaved ones.
pub fn allocate_tokens(node_index: usize, node_count: usize, num_tokens: usize) -> Vec<Token> {
    let total = (node_count * num_tokens) as u64;
    let spacing = if total == 0 { 0 } else { u64::MAX / total };
    (0..num_tokens)
        .map(|v| ((v * node_count + node_index) as u64).wrapping_mul(spacing))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, tokens: Vec<Token>) -> RingMember {
        RingMember {
            name: name.to_string(),
            native_addr: "127.0.0.1:9042".parse().unwrap(),
            mgmt_addr: "127.0.0.1:7199".parse().unwrap(),
            tokens,
        }
    }

    fn four_node_ring() -> Ring {
        Ring::new(
            (0..4)
                .map(|i| member(&format!("node{}", i + 1), allocate_tokens(i, 4, 1)))
                .collect(),
        )
    }

    #[test]
    fn test_token_of_is_stable() {
        assert_eq!(token_of(b"key0000000001"), token_of(b"key0000000001"));
        assert_ne!(token_of(b"key0000000001"), token_of(b"key0000000002"));
    }

    #[test]
    fn test_range_wrapping() {
        let r = TokenRange::new(u64::MAX - 10, 10);
        assert!(r.contains(u64::MAX));
        assert!(r.contains(5));
        assert!(!r.contains(11));
        assert!(!r.contains(u64::MAX - 11));

        let full = TokenRange::new(7, 7);
        assert!(full.contains(0));
        assert!(full.contains(u64::MAX));
    }

    #[test]
    fn test_replicas_are_distinct_successors() {
        let ring = four_node_ring();
        let spacing = u64::MAX / 4;
        // A token just past node2's position is owned by node2, replicated
        // next on node3.
        let replicas = ring.replicas_for(spacing + 1, 2);
        let names: Vec<&str> = replicas.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["node2", "node3"]);
    }

    #[test]
    fn test_rf_clamped_to_member_count() {
        let ring = four_node_ring();
        assert_eq!(ring.replicas_for(0, 10).len(), 4);
    }

    #[test]
    fn test_replica_ranges_cover_rf_share() {
        let ring = four_node_ring();
        // With rf=2 over 4 single-token nodes, each member replicates
        // exactly 2 of the 4 segments.
        for m in &ring.members {
            assert_eq!(ring.replica_ranges(&m.name, 2).len(), 2);
        }
        // Every token is covered by exactly rf members.
        for probe in [0u64, 123456789, u64::MAX / 2, u64::MAX - 3] {
            let holders = ring
                .members
                .iter()
                .filter(|m| ranges_contain(&ring.replica_ranges(&m.name, 2), probe))
                .count();
            assert_eq!(holders, 2, "token {probe} replica count");
        }
    }

    #[test]
    fn test_midpoint_allocation_avoids_collisions() {
        let ring = four_node_ring();
        let new_tokens = ring.allocate_midpoint_tokens(4);
        assert_eq!(new_tokens.len(), 4);
        let existing: Vec<Token> = ring
            .members
            .iter()
            .flat_map(|m| m.tokens.iter().copied())
            .collect();
        for t in &new_tokens {
            assert!(!existing.contains(t));
        }
    }

    #[test]
    fn test_without_member() {
        let ring = four_node_ring();
        let smaller = ring.without("node4");
        assert_eq!(smaller.members.len(), 3);
        assert!(!smaller.contains("node4"));
        assert!(ring.contains("node4"));
    }
}
