// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Vote bookkeeping and quorum certificates.
//!
//! A [`VoteLedger`] collects one signature per (value, signer) pair and
//! forms at most one [`QuorumCertificate`] per value, the first time
//! the vote count reaches the quorum. The BADS* collection phase reuses
//! the same ledger for its individual signatures.

use crate::crypto::{aggregate_signatures, KeyStore, Signature};
use crate::types::NodeId;
use anyhow::Result;
use consensus_traits::VerifyError;
use std::collections::{BTreeMap, HashMap};

/// Aggregated proof that a quorum signed the same value.
#[derive(Clone, Debug)]
pub struct QuorumCertificate {
    pub value: Vec<u8>,
    /// Signers in ascending node-id order, matching the aggregation order.
    pub signers: Vec<NodeId>,
    pub agg_sig: Signature,
}

impl QuorumCertificate {
    pub fn verify(&self, keys: &KeyStore, dst: &[u8], quorum: usize) -> Result<(), VerifyError> {
        if self.signers.len() < quorum {
            return Err(VerifyError::TooFewVotes {
                votes: self.signers.len(),
                quorum,
            });
        }
        keys.verify_aggregate(&self.signers, &self.value, dst, &self.agg_sig)
    }
}

/// Result of feeding one vote into the ledger.
#[derive(Clone, Debug)]
pub enum VoteOutcome {
    /// The vote was counted; no certificate formed yet (or one already
    /// exists for this value).
    Added { count: usize },
    /// This signer already voted for this value.
    Duplicate,
    /// The vote completed the quorum; returned exactly once per value.
    Certified(QuorumCertificate),
}

#[derive(Debug, Default)]
pub struct VoteLedger {
    votes: HashMap<Vec<u8>, BTreeMap<NodeId, Signature>>,
    certified: HashMap<Vec<u8>, QuorumCertificate>,
}

impl VoteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a (pre-verified) vote. Forms the certificate on the first
    /// crossing of `quorum` for this value.
    pub fn record(
        &mut self,
        value: &[u8],
        voter: NodeId,
        sig: Signature,
        quorum: usize,
    ) -> Result<VoteOutcome> {
        let entry = self.votes.entry(value.to_vec()).or_default();
        if entry.contains_key(&voter) {
            return Ok(VoteOutcome::Duplicate);
        }
        entry.insert(voter, sig);
        let count = entry.len();

        if count >= quorum && !self.certified.contains_key(value) {
            let signers: Vec<NodeId> = entry.keys().copied().collect();
            let sigs: Vec<Signature> = entry.values().copied().collect();
            let agg_sig = aggregate_signatures(&sigs)?;
            let qc = QuorumCertificate {
                value: value.to_vec(),
                signers,
                agg_sig,
            };
            self.certified.insert(value.to_vec(), qc.clone());
            return Ok(VoteOutcome::Certified(qc));
        }
        Ok(VoteOutcome::Added { count })
    }

    pub fn count(&self, value: &[u8]) -> usize {
        self.votes.get(value).map_or(0, BTreeMap::len)
    }

    pub fn has_voted(&self, value: &[u8], voter: NodeId) -> bool {
        self.votes
            .get(value)
            .is_some_and(|v| v.contains_key(&voter))
    }

    pub fn certificate(&self, value: &[u8]) -> Option<&QuorumCertificate> {
        self.certified.get(value)
    }

    pub fn certificates(&self) -> Vec<QuorumCertificate> {
        self.certified.values().cloned().collect()
    }

    pub fn certified_count(&self) -> usize {
        self.certified.len()
    }

    pub fn clear(&mut self) {
        self.votes.clear();
        self.certified.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_secret_key, dst, KeyStore, SecretKey};

    fn secrets(n: u64) -> Vec<SecretKey> {
        (0..n).map(|id| derive_secret_key(42, id).unwrap()).collect()
    }

    #[test]
    fn test_duplicate_votes_are_not_counted() {
        let keys = secrets(4);
        let mut ledger = VoteLedger::new();
        let value = b"X";
        let sig = keys[1].sign(value, dst::VOTE);

        assert!(matches!(
            ledger.record(value, 1, sig, 3).unwrap(),
            VoteOutcome::Added { count: 1 }
        ));
        assert!(matches!(
            ledger.record(value, 1, sig, 3).unwrap(),
            VoteOutcome::Duplicate
        ));
        assert_eq!(ledger.count(value), 1);
    }

    #[test]
    fn test_certificate_forms_exactly_once() {
        let keys = secrets(4);
        let store = KeyStore::from_seed(42, 4).unwrap();
        let mut ledger = VoteLedger::new();
        let value = b"X";

        for id in 0..2u64 {
            let sig = keys[id as usize].sign(value, dst::VOTE);
            assert!(matches!(
                ledger.record(value, id, sig, 3).unwrap(),
                VoteOutcome::Added { .. }
            ));
        }
        assert!(ledger.certificate(value).is_none());

        let sig = keys[2].sign(value, dst::VOTE);
        let outcome = ledger.record(value, 2, sig, 3).unwrap();
        let VoteOutcome::Certified(qc) = outcome else {
            panic!("expected certification at the third vote");
        };
        assert_eq!(qc.signers, vec![0, 1, 2]);
        assert!(qc.verify(&store, dst::VOTE, 3).is_ok());

        // A fourth vote is counted but certifies nothing new.
        let sig = keys[3].sign(value, dst::VOTE);
        assert!(matches!(
            ledger.record(value, 3, sig, 3).unwrap(),
            VoteOutcome::Added { count: 4 }
        ));
        assert_eq!(ledger.certified_count(), 1);
    }

    #[test]
    fn test_values_are_tracked_independently() {
        let keys = secrets(4);
        let mut ledger = VoteLedger::new();

        for (id, value) in [(0u64, b"a".as_slice()), (1, b"b"), (2, b"a")] {
            let sig = keys[id as usize].sign(value, dst::VOTE);
            ledger.record(value, id, sig, 3).unwrap();
        }
        assert_eq!(ledger.count(b"a"), 2);
        assert_eq!(ledger.count(b"b"), 1);
        assert!(ledger.has_voted(b"b", 1));
        assert!(!ledger.has_voted(b"a", 1));
    }

    #[test]
    fn test_certificate_verification_enforces_quorum_size() {
        let keys = secrets(4);
        let store = KeyStore::from_seed(42, 4).unwrap();
        let mut ledger = VoteLedger::new();
        let value = b"X";
        let sig = keys[0].sign(value, dst::VOTE);
        ledger.record(value, 0, sig, 1).unwrap();

        let qc = ledger.certificate(value).unwrap();
        assert!(qc.verify(&store, dst::VOTE, 1).is_ok());
        assert_eq!(
            qc.verify(&store, dst::VOTE, 3),
            Err(VerifyError::TooFewVotes { votes: 1, quorum: 3 })
        );
    }
}
