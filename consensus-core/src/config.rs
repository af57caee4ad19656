// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Immutable simulation parameters.
//!
//! A [`SimConfig`] is built once at startup, validated, and shared as
//! `Arc<SimConfig>`. All protocol thresholds are derived on demand so
//! they can never drift from the parameters they come from.

use crate::types::NodeId;
use crate::types::ShardId;
use anyhow::{bail, Result};
use std::time::Duration;

/// Simulation parameters, fixed for the lifetime of a run.
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Shard this configuration describes.
    pub shard_id: ShardId,
    /// Number of nodes in the shard (n).
    pub shard_size: usize,
    /// Node id of the designated leader.
    pub view_node: NodeId,
    /// Assumed fraction of malicious nodes for DS and BB.
    pub malicious_ratio: f64,
    /// Fraction of nodes assumed honest under optimistic conditions.
    pub resilient_ratio: f64,
    /// Length of one protocol round in milliseconds (the tick).
    pub tick_interval_ms: u64,
    /// Lead time between announcing a start time and the start itself.
    pub start_time_wait_ms: u64,
    /// Shared seed all nodes derive their signing keys from.
    pub key_seed: u64,
    /// Peer addresses, indexed by node id.
    pub peers: Vec<String>,
    /// Address of an external query client, if one participates.
    pub client_addr: Option<String>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            shard_id: 0,
            shard_size: 4,
            view_node: 0,
            malicious_ratio: 1.0 / 3.0,
            resilient_ratio: 0.5,
            tick_interval_ms: 100,
            start_time_wait_ms: 500,
            key_seed: 42,
            peers: (0..4).map(|i| format!("127.0.0.1:{}", 28000 + i)).collect(),
            client_addr: None,
        }
    }
}

impl SimConfig {
    /// Length of one round as a `Duration`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Lead time before a newly announced start time takes effect.
    pub fn start_time_wait(&self) -> Duration {
        Duration::from_millis(self.start_time_wait_ms)
    }

    /// Duration of `k` rounds.
    pub fn ticks(&self, k: u64) -> Duration {
        Duration::from_millis(self.tick_interval_ms.saturating_mul(k))
    }

    /// PBFT fault bound: f = (n - 1) / 3.
    pub fn pbft_fault_bound(&self) -> usize {
        (self.shard_size - 1) / 3
    }

    /// Fault bound used by DS and BB: f = floor(n * malicious_ratio).
    pub fn malicious_bound(&self) -> usize {
        (self.shard_size as f64 * self.malicious_ratio) as usize
    }

    /// Votes required to form a quorum certificate: n - f.
    pub fn vote_quorum(&self) -> usize {
        self.shard_size - self.malicious_bound()
    }

    /// Optimistic threshold t1 = ceil(n * resilient_ratio) - 1.
    pub fn t1(&self) -> u64 {
        (self.shard_size as f64 * self.resilient_ratio).ceil() as u64 - 1
    }

    /// Pessimistic threshold t2 = n - 1.
    pub fn t2(&self) -> u64 {
        self.shard_size as u64 - 1
    }

    /// Address of a node in this shard.
    pub fn peer_addr(&self, id: NodeId) -> Option<&str> {
        self.peers.get(id as usize).map(String::as_str)
    }

    pub fn is_leader(&self, id: NodeId) -> bool {
        id == self.view_node
    }

    /// Check the parameters are internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.shard_size == 0 {
            bail!("shard size must be at least 1");
        }
        if self.view_node as usize >= self.shard_size {
            bail!(
                "view node {} is outside the shard of size {}",
                self.view_node,
                self.shard_size
            );
        }
        if !(0.0..1.0).contains(&self.malicious_ratio) {
            bail!("malicious ratio must be in [0, 1)");
        }
        if !(0.0..=1.0).contains(&self.resilient_ratio) || self.resilient_ratio == 0.0 {
            bail!("resilient ratio must be in (0, 1]");
        }
        if self.tick_interval_ms == 0 {
            bail!("tick interval must be positive");
        }
        if self.peers.len() != self.shard_size {
            bail!(
                "expected {} peer addresses, got {}",
                self.shard_size,
                self.peers.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SimConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_thresholds() {
        let config = SimConfig::default();
        assert_eq!(config.pbft_fault_bound(), 1);
        assert_eq!(config.malicious_bound(), 1);
        assert_eq!(config.vote_quorum(), 3);
        assert_eq!(config.t1(), 1);
        assert_eq!(config.t2(), 3);
    }

    #[test]
    fn test_t1_uses_ceiling() {
        let config = SimConfig {
            shard_size: 5,
            peers: (0..5).map(|i| format!("n{i}")).collect(),
            ..SimConfig::default()
        };
        // ceil(5 * 0.5) - 1 = 2, while truncation would give 1.
        assert_eq!(config.t1(), 2);
    }

    #[test]
    fn test_pbft_fault_bound_steps() {
        for (n, f) in [(4, 1), (6, 1), (7, 2), (10, 3), (13, 4)] {
            let config = SimConfig {
                shard_size: n,
                peers: (0..n).map(|i| format!("n{i}")).collect(),
                ..SimConfig::default()
            };
            assert_eq!(config.pbft_fault_bound(), f, "n = {n}");
        }
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let mut config = SimConfig {
            view_node: 9,
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());

        config.view_node = 0;
        config.tick_interval_ms = 0;
        assert!(config.validate().is_err());

        config.tick_interval_ms = 100;
        config.peers.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ticks_scale_with_tick_interval() {
        let config = SimConfig::default();
        assert_eq!(config.ticks(0), Duration::ZERO);
        assert_eq!(config.ticks(7), Duration::from_millis(700));
    }
}
