// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core types shared by all protocol engines.

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;

/// Unique identifier for a node within a shard.
pub type NodeId = u64;

/// Identifier for a shard.
pub type ShardId = u64;

/// Round number of a running protocol instance (elapsed ticks since start).
pub type Round = u64;

/// Payload committed when no unique value could be extracted.
pub const FALLBACK_VALUE: &[u8] = b"0";

/// SHA-256 digest identifying a request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Hash a byte string.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}..)", hex::encode(&self.0[..4]))
    }
}

/// What kind of payload a request carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    /// No payload.
    Empty,
    /// An opaque value to agree on.
    Value,
    /// A block of transactions.
    Block,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Empty => write!(f, "Empty"),
            PayloadKind::Value => write!(f, "Value"),
            PayloadKind::Block => write!(f, "Block"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic() {
        assert_eq!(Digest::of(b"abc"), Digest::of(b"abc"));
        assert_ne!(Digest::of(b"abc"), Digest::of(b"abd"));
    }

    #[test]
    fn test_digest_display_is_hex() {
        let d = Digest::of(b"abc");
        assert_eq!(d.to_string().len(), 64);
        assert!(d.to_string().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_payload_kind_display() {
        assert_eq!(PayloadKind::Value.to_string(), "Value");
        assert_eq!(PayloadKind::Block.to_string(), "Block");
    }
}
