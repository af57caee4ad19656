// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network transport seam.
//!
//! Protocol engines never touch sockets directly. They hand encoded
//! frames to a [`Transport`] and identify peers by address strings, so
//! the same engine runs over TCP in the simulator binary and over an
//! in-memory hub in tests.

use crate::core::Error;
use async_trait::async_trait;

/// Async byte transport between simulator nodes.
///
/// # Requirements
///
/// Implementations must be:
/// - Thread-safe (Send + Sync)
/// - Best-effort: a failure to reach one peer must not abort delivery
///   to the remaining peers
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a frame to every address in `peers` except `from`.
    ///
    /// Per-peer delivery failures are logged by the implementation and
    /// not surfaced; the returned error covers only failures that make
    /// the whole broadcast impossible.
    async fn broadcast(&self, from: &str, peers: &[String], bytes: Vec<u8>) -> Result<(), Error>;

    /// Send a frame to a single address.
    async fn send(&self, to: &str, bytes: Vec<u8>) -> Result<(), Error>;
}
