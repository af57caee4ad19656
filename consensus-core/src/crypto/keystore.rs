// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Node key derivation and the shared public-key table.
//!
//! The simulator has no key distribution protocol: every node derives
//! the whole shard's keys deterministically from the shared seed in the
//! configuration, so any node can verify any signer.

use super::bls::{verify_aggregate, CryptoError, PublicKey, SecretKey, Signature};
use crate::types::NodeId;
use consensus_traits::VerifyError;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Derive the signing key of `node` from the shared seed.
pub fn derive_secret_key(seed: u64, node: NodeId) -> Result<SecretKey, CryptoError> {
    let mut hasher = Sha256::new();
    hasher.update(b"tbb-sim-node-key");
    hasher.update(seed.to_le_bytes());
    hasher.update(node.to_le_bytes());
    let first = hasher.finalize();

    let mut hasher = Sha256::new();
    hasher.update(first);
    hasher.update(b"_widen");
    let second = hasher.finalize();

    let mut wide = [0u8; 64];
    wide[..32].copy_from_slice(&first);
    wide[32..].copy_from_slice(&second);
    SecretKey::from_wide_bytes(&wide)
}

/// Public keys of every node in the shard.
#[derive(Clone, Debug)]
pub struct KeyStore {
    keys: BTreeMap<NodeId, PublicKey>,
}

impl KeyStore {
    /// Build the table for a shard of `n` nodes from the shared seed.
    pub fn from_seed(seed: u64, n: usize) -> Result<Self, CryptoError> {
        let mut keys = BTreeMap::new();
        for id in 0..n as NodeId {
            keys.insert(id, derive_secret_key(seed, id)?.public_key());
        }
        Ok(KeyStore { keys })
    }

    pub fn public_key(&self, node: NodeId) -> Option<&PublicKey> {
        self.keys.get(&node)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify a single node's signature over `message`.
    pub fn verify(
        &self,
        node: NodeId,
        message: &[u8],
        dst: &[u8],
        signature: &Signature,
    ) -> Result<(), VerifyError> {
        let key = self
            .public_key(node)
            .ok_or(VerifyError::UnknownSigner(node))?;
        if key.verify(message, signature, dst) {
            Ok(())
        } else {
            Err(VerifyError::InvalidSignature)
        }
    }

    /// Verify an aggregated signature produced by `signers` over a
    /// common `message`.
    pub fn verify_aggregate(
        &self,
        signers: &[NodeId],
        message: &[u8],
        dst: &[u8],
        signature: &Signature,
    ) -> Result<(), VerifyError> {
        let mut keys = Vec::with_capacity(signers.len());
        for &signer in signers {
            keys.push(
                *self
                    .public_key(signer)
                    .ok_or(VerifyError::UnknownSigner(signer))?,
            );
        }
        if verify_aggregate(&keys, message, dst, signature) {
            Ok(())
        } else {
            Err(VerifyError::InvalidAggregatedSignature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{aggregate_signatures, dst};

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_secret_key(7, 2).unwrap();
        let b = derive_secret_key(7, 2).unwrap();
        assert_eq!(a.public_key(), b.public_key());

        let c = derive_secret_key(7, 3).unwrap();
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn test_keystore_matches_derived_secrets() {
        let store = KeyStore::from_seed(42, 4).unwrap();
        assert_eq!(store.len(), 4);

        let sk = derive_secret_key(42, 1).unwrap();
        let sig = sk.sign(b"payload", dst::MESSAGE);
        assert!(store.verify(1, b"payload", dst::MESSAGE, &sig).is_ok());
        assert_eq!(
            store.verify(2, b"payload", dst::MESSAGE, &sig),
            Err(VerifyError::InvalidSignature)
        );
        assert_eq!(
            store.verify(9, b"payload", dst::MESSAGE, &sig),
            Err(VerifyError::UnknownSigner(9))
        );
    }

    #[test]
    fn test_keystore_aggregate_verification() {
        let store = KeyStore::from_seed(42, 4).unwrap();
        let message = b"quorum value";
        let signers: Vec<NodeId> = vec![0, 2, 3];
        let sigs: Vec<_> = signers
            .iter()
            .map(|&id| derive_secret_key(42, id).unwrap().sign(message, dst::VOTE))
            .collect();
        let agg = aggregate_signatures(&sigs).unwrap();

        assert!(store
            .verify_aggregate(&signers, message, dst::VOTE, &agg)
            .is_ok());
        assert_eq!(
            store.verify_aggregate(&[0, 1, 3], message, dst::VOTE, &agg),
            Err(VerifyError::InvalidAggregatedSignature)
        );
    }
}
