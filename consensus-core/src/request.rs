// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Requests: the unit of agreement.
//!
//! A request is immutable once built; its digest is computed in the
//! constructor over the identifying fields, so a tampered request can
//! always be detected with [`Request::verify_digest`].

use crate::crypto::{dst, SecretKey, Signature};
use crate::types::{Digest, PayloadKind, ShardId};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub shard_id: ShardId,
    pub kind: PayloadKind,
    pub content: Vec<u8>,
    pub created_at: SystemTime,
    pub digest: Digest,
    /// Proposer's signature over the content, when the protocol needs one.
    pub sig: Option<Signature>,
}

impl Request {
    pub fn new(shard_id: ShardId, kind: PayloadKind, content: Vec<u8>) -> Result<Self> {
        let created_at = SystemTime::now();
        let digest = Self::compute_digest(shard_id, kind, &content, created_at)?;
        Ok(Request {
            shard_id,
            kind,
            content,
            created_at,
            digest,
            sig: None,
        })
    }

    /// Build a request carrying the proposer's signature over the content.
    pub fn signed(
        shard_id: ShardId,
        kind: PayloadKind,
        content: Vec<u8>,
        secret: &SecretKey,
    ) -> Result<Self> {
        let mut request = Self::new(shard_id, kind, content)?;
        request.sig = Some(secret.sign(&request.content, dst::MESSAGE));
        Ok(request)
    }

    fn compute_digest(
        shard_id: ShardId,
        kind: PayloadKind,
        content: &[u8],
        created_at: SystemTime,
    ) -> Result<Digest> {
        let preimage = bincode::serialize(&(shard_id, kind, content, created_at))?;
        Ok(Digest::of(&preimage))
    }

    /// Recompute the digest and compare with the stored one.
    pub fn verify_digest(&self) -> bool {
        Self::compute_digest(self.shard_id, self.kind, &self.content, self.created_at)
            .map(|d| d == self.digest)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_secret_key;
    use crate::crypto::KeyStore;

    #[test]
    fn test_digest_detects_tampering() {
        let mut request = Request::new(0, PayloadKind::Value, b"X".to_vec()).unwrap();
        assert!(request.verify_digest());

        request.content = b"Y".to_vec();
        assert!(!request.verify_digest());
    }

    #[test]
    fn test_signed_request_verifies_against_keystore() {
        let secret = derive_secret_key(42, 0).unwrap();
        let store = KeyStore::from_seed(42, 4).unwrap();
        let request = Request::signed(0, PayloadKind::Value, b"X".to_vec(), &secret).unwrap();

        let sig = request.sig.expect("constructor attaches a signature");
        assert!(store.verify(0, &request.content, dst::MESSAGE, &sig).is_ok());
        assert!(store.verify(1, &request.content, dst::MESSAGE, &sig).is_err());
    }

    #[test]
    fn test_wire_roundtrip_preserves_digest() {
        let request = Request::new(3, PayloadKind::Block, b"block body".to_vec()).unwrap();
        let bytes = bincode::serialize(&request).unwrap();
        let restored: Request = bincode::deserialize(&bytes).unwrap();
        assert_eq!(request, restored);
        assert!(restored.verify_digest());
    }
}
