// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire messages.
//!
//! Every frame on the network is a bincode-encoded [`Envelope`]: a
//! message kind plus the bincode encoding of the kind-specific body.
//! A payload that fails to decode is logged by the dispatcher and
//! dropped without touching protocol state.

use crate::crypto::Signature;
use crate::quorum::QuorumCertificate;
use crate::request::Request;
use crate::types::NodeId;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Kind tag of a wire message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Announce the start time of a protocol instance.
    Init,
    /// Ask a node to shut down.
    Stop,
    /// Hand a value to the leader's proposer queue.
    Inject,
    /// Completion notice for a client.
    Reply,
    /// Ask a node for its current decision.
    Query,
    /// Answer to a Query.
    ReplyQuery,
    /// Leader's proposal entering the protocol.
    Propose,
    /// PBFT pre-prepare.
    PrePrepare,
    /// PBFT prepare.
    Prepare,
    /// PBFT commit.
    Commit,
    /// DS signature chain relay.
    Forward,
    /// BB echo of the leader's proposal.
    Forward1,
    /// BADS* signature chain relay.
    Forward2,
    /// BB vote.
    Vote,
    /// Quorum certificate announcement.
    Qc,
    /// A consensus round finished.
    ConsensusDone,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One wire frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: MessageKind, body: &T) -> Result<Self> {
        Ok(Envelope {
            kind,
            payload: bincode::serialize(body)
                .with_context(|| format!("encoding {kind} payload"))?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.payload)
            .with_context(|| format!("decoding {} payload", self.kind))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("encoding envelope")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("decoding envelope")
    }
}

/// Body of [`MessageKind::Init`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct InitBody {
    pub start_time: SystemTime,
}

/// Body of [`MessageKind::Inject`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InjectBody {
    pub value: Vec<u8>,
}

/// Sender-tagged PBFT phase message (prepare and commit).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseBody {
    pub sender: NodeId,
    pub digest: crate::types::Digest,
}

/// Body of [`MessageKind::Vote`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteBody {
    pub voter: NodeId,
    pub content: Vec<u8>,
    pub sig: Signature,
}

/// Body of [`MessageKind::Qc`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QcBody {
    pub content: Vec<u8>,
    pub signers: Vec<NodeId>,
    pub agg_sig: Signature,
}

impl From<&QuorumCertificate> for QcBody {
    fn from(qc: &QuorumCertificate) -> Self {
        QcBody {
            content: qc.value.clone(),
            signers: qc.signers.clone(),
            agg_sig: qc.agg_sig,
        }
    }
}

/// One signature in a relay chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainLink {
    pub signer: NodeId,
    pub sig: Signature,
}

/// Body of [`MessageKind::Forward`]: a DS signature chain over a value.
///
/// Link 0 must be the leader's signature; each relay appends its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureChain {
    pub content: Vec<u8>,
    pub links: Vec<ChainLink>,
}

impl SignatureChain {
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Compressed first-phase certificate inside a [`BadsChain`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregateSeed {
    pub signers: Vec<NodeId>,
    pub sig: Signature,
}

/// Body of [`MessageKind::Forward2`]: a BADS* relay chain.
///
/// During the collection phase the chain is a single individual link
/// with no seed. Once a quorum of signatures is aggregated, the seed
/// replaces them and counts as one chain position; later relays append
/// individual links after it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BadsChain {
    pub input: Vec<u8>,
    pub agg: Option<AggregateSeed>,
    pub links: Vec<ChainLink>,
}

impl BadsChain {
    /// Chain length: the seed counts as one position.
    pub fn chain_len(&self) -> usize {
        usize::from(self.agg.is_some()) + self.links.len()
    }
}

/// Body of [`MessageKind::Query`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryBody {
    /// Address the reply should be sent to.
    pub reply_to: String,
}

/// Body of [`MessageKind::ReplyQuery`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyQueryBody {
    /// First non-empty decision, if the node has one.
    pub value: Option<Vec<u8>>,
    /// Certificates accumulated so far.
    pub certificates: Vec<QcBody>,
}

/// Body of [`MessageKind::Reply`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyBody {
    pub request: Request,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let body = InjectBody {
            value: b"X".to_vec(),
        };
        let env = Envelope::new(MessageKind::Inject, &body).unwrap();
        let bytes = env.to_bytes().unwrap();

        let restored = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(restored.kind, MessageKind::Inject);
        let decoded: InjectBody = restored.decode().unwrap();
        assert_eq!(decoded.value, b"X");
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let env = Envelope {
            kind: MessageKind::Init,
            payload: vec![0xff, 0x01],
        };
        assert!(env.decode::<InitBody>().is_err());
    }

    #[test]
    fn test_bads_chain_length_counts_seed() {
        let chain = BadsChain {
            input: b"0".to_vec(),
            agg: None,
            links: vec![],
        };
        assert_eq!(chain.chain_len(), 0);

        let sk = crate::crypto::derive_secret_key(1, 0).unwrap();
        let sig = sk.sign(b"0", crate::crypto::dst::MESSAGE);
        let chain = BadsChain {
            input: b"0".to_vec(),
            agg: Some(AggregateSeed {
                signers: vec![0, 1, 2],
                sig,
            }),
            links: vec![ChainLink { signer: 3, sig }],
        };
        assert_eq!(chain.chain_len(), 2);
    }
}
