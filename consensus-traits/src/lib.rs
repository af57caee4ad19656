// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! # Consensus Traits
//!
//! Capability traits shared across the Byzantine consensus simulator.
//! The protocol engines in `consensus-core` depend only on these seams,
//! so transports and validation policies can be swapped without touching
//! the protocol logic.
//!
//! - **Errors**: [`Error`], [`VerifyError`]
//! - **Network**: [`Transport`]
//! - **Validation**: [`ProposalValidation`], [`SimpleValidation`]

pub mod core;
pub mod network;
pub mod validation;

pub use crate::core::{Error, VerifyError};
pub use network::Transport;
pub use validation::{ProposalValidation, SimpleValidation};

/// Result type alias for consensus operations.
pub type Result<T> = std::result::Result<T, Error>;
