// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! # Consensus Core
//!
//! Protocol engines for a Byzantine consensus research simulator:
//!
//! - **PBFT**: four-phase leader-based agreement (no view change).
//! - **Dolev-Strong**: signature-chain broadcast, commits at (f+1)Δ.
//! - **1Δ-BB\***: optimistic one-tick voting with a BADS\* fallback.
//! - **TBB**: hybrid running Dolev-Strong and 1Δ-BB\* concurrently.
//!
//! Engines depend only on the seams in `consensus-traits`; the TCP
//! transport lives in the node binary and an in-memory hub in
//! [`testing`].

pub mod bb;
pub mod clock;
pub mod config;
pub mod context;
pub mod crypto;
pub mod ds;
pub mod engine;
pub mod message;
pub mod pbft;
pub mod quorum;
pub mod request;
pub mod tbb;
pub mod testing;
pub mod types;

pub use bb::BbEngine;
pub use clock::RoundClock;
pub use config::SimConfig;
pub use context::EngineContext;
pub use ds::DsEngine;
pub use engine::{Engine, EngineKind};
pub use message::{Envelope, MessageKind};
pub use pbft::PbftEngine;
pub use quorum::{QuorumCertificate, VoteLedger, VoteOutcome};
pub use request::Request;
pub use tbb::TbbEngine;
pub use types::{Digest, NodeId, PayloadKind, Round, ShardId, FALLBACK_VALUE};

/// Crate version, surfaced by the node binary.
pub const SIMULATOR_VERSION: &str = env!("CARGO_PKG_VERSION");
