// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Engine selection and message routing.
//!
//! The engine is chosen at startup and fixed for the run, so the
//! variants are a closed sum type and dispatch is a match, not a
//! registry lookup. Unknown or irrelevant message kinds are dropped
//! with a debug log; payloads that fail to decode are dropped with an
//! error log and no state change.

use crate::context::EngineContext;
use crate::ds::DsEngine;
use crate::message::{Envelope, MessageKind};
use crate::pbft::PbftEngine;
use crate::tbb::TbbEngine;
use log::{debug, error};
use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Which protocol a node runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineKind {
    Pbft,
    Ds,
    Tbb,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Pbft => write!(f, "pbft"),
            EngineKind::Ds => write!(f, "ds"),
            EngineKind::Tbb => write!(f, "tbb"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pbft" => Ok(EngineKind::Pbft),
            "ds" | "dolev-strong" => Ok(EngineKind::Ds),
            "tbb" => Ok(EngineKind::Tbb),
            other => Err(anyhow::anyhow!("unknown engine kind: {other}")),
        }
    }
}

/// A running protocol engine.
#[derive(Clone)]
pub enum Engine {
    Pbft(PbftEngine),
    Ds(DsEngine),
    Tbb(TbbEngine),
}

impl Engine {
    pub fn new(kind: EngineKind, ctx: Arc<EngineContext>) -> Self {
        match kind {
            EngineKind::Pbft => Engine::Pbft(PbftEngine::new(ctx)),
            EngineKind::Ds => {
                let clock = ctx.new_clock();
                Engine::Ds(DsEngine::new(ctx, clock, true))
            }
            EngineKind::Tbb => Engine::Tbb(TbbEngine::new(ctx)),
        }
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            Engine::Pbft(_) => EngineKind::Pbft,
            Engine::Ds(_) => EngineKind::Ds,
            Engine::Tbb(_) => EngineKind::Tbb,
        }
    }

    /// Spawn any background loops the engine needs.
    pub fn start(&self) {
        if let Engine::Pbft(pbft) = self {
            pbft.start();
        }
    }

    /// Route one envelope to the engine's handler for its kind.
    pub async fn dispatch(&self, env: &Envelope) {
        match self {
            Engine::Pbft(pbft) => match env.kind {
                MessageKind::Propose => {
                    if let Some(body) = decode(env) {
                        pbft.on_propose(body).await;
                    }
                }
                MessageKind::PrePrepare => {
                    if let Some(body) = decode(env) {
                        pbft.on_pre_prepare(body).await;
                    }
                }
                MessageKind::Prepare => {
                    if let Some(body) = decode(env) {
                        pbft.on_prepare(body).await;
                    }
                }
                MessageKind::Commit => {
                    if let Some(body) = decode(env) {
                        pbft.on_commit(body).await;
                    }
                }
                kind => debug!("pbft engine ignoring {kind}"),
            },
            Engine::Ds(ds) => match env.kind {
                MessageKind::Init => {
                    if let Some(body) = decode(env) {
                        ds.on_init(body).await;
                    }
                }
                MessageKind::Propose => {
                    if let Some(body) = decode(env) {
                        ds.on_propose(body).await;
                    }
                }
                MessageKind::Forward => {
                    if let Some(body) = decode(env) {
                        ds.on_forward(body).await;
                    }
                }
                MessageKind::Query => {
                    if let Some(body) = decode(env) {
                        ds.on_query(body).await;
                    }
                }
                kind => debug!("ds engine ignoring {kind}"),
            },
            Engine::Tbb(tbb) => match env.kind {
                MessageKind::Init => {
                    if let Some(body) = decode(env) {
                        tbb.on_init(body).await;
                    }
                }
                MessageKind::Propose => {
                    if let Some(body) = decode(env) {
                        tbb.on_propose(body).await;
                    }
                }
                MessageKind::Forward => {
                    if let Some(body) = decode(env) {
                        tbb.on_forward(body).await;
                    }
                }
                MessageKind::Forward1 => {
                    if let Some(body) = decode(env) {
                        tbb.on_forward1(body).await;
                    }
                }
                MessageKind::Forward2 => {
                    if let Some(body) = decode(env) {
                        tbb.on_forward2(body).await;
                    }
                }
                MessageKind::Vote => {
                    if let Some(body) = decode(env) {
                        tbb.on_vote(body).await;
                    }
                }
                MessageKind::Qc => {
                    if let Some(body) = decode(env) {
                        tbb.on_qc(body).await;
                    }
                }
                MessageKind::Query => {
                    if let Some(body) = decode(env) {
                        tbb.on_query(body).await;
                    }
                }
                kind => debug!("tbb engine ignoring {kind}"),
            },
        }
    }
}

fn decode<T: DeserializeOwned>(env: &Envelope) -> Option<T> {
    match env.decode() {
        Ok(body) => Some(body),
        Err(e) => {
            error!("dropping malformed {} payload: {e:#}", env.kind);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_parsing() {
        assert_eq!("pbft".parse::<EngineKind>().unwrap(), EngineKind::Pbft);
        assert_eq!("TBB".parse::<EngineKind>().unwrap(), EngineKind::Tbb);
        assert_eq!(
            "dolev-strong".parse::<EngineKind>().unwrap(),
            EngineKind::Ds
        );
        assert!("raft".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_engine_kind_display_roundtrip() {
        for kind in [EngineKind::Pbft, EngineKind::Ds, EngineKind::Tbb] {
            assert_eq!(kind.to_string().parse::<EngineKind>().unwrap(), kind);
        }
    }
}
