// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core error types for consensus.
//!
//! Protocol engines surface structured failures through [`VerifyError`]
//! and use [`Error`] for everything else at module seams.

/// Error type for consensus operations.
pub type Error = anyhow::Error;

/// Errors possible during signature and quorum verification.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("Signer {0} is unknown")]
    UnknownSigner(u64),

    #[error("The vote count ({votes}) is less than the quorum ({quorum})")]
    TooFewVotes { votes: usize, quorum: usize },

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Aggregated signature is invalid")]
    InvalidAggregatedSignature,

    #[error("Signature chain is malformed: {0}")]
    MalformedChain(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_error_display() {
        let err = VerifyError::TooFewVotes { votes: 2, quorum: 3 };
        assert_eq!(
            err.to_string(),
            "The vote count (2) is less than the quorum (3)"
        );
        assert_eq!(
            VerifyError::UnknownSigner(7).to_string(),
            "Signer 7 is unknown"
        );
    }
}
