// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Application validation hooks for the PBFT engine.
//!
//! The four-phase engine calls into a [`ProposalValidation`] policy at
//! each phase boundary. The policy decides whether the request content
//! is acceptable; the engine owns quorum counting and message flow.

use crate::core::Error;

/// Per-phase validation policy, generic over the request type.
///
/// A rejection at any phase drops the message for this node without
/// affecting bookkeeping already performed for other messages.
pub trait ProposalValidation<R>: Send + Sync {
    /// Called on the leader when a request enters the queue.
    fn validate_propose(&self, request: &R) -> Result<(), Error>;

    /// Called when a pre-prepare for the request arrives.
    fn validate_pre_prepare(&self, request: &R) -> Result<(), Error>;

    /// Called before acting on a prepare quorum.
    fn validate_prepare(&self, request: &R) -> Result<(), Error>;

    /// Called when the commit quorum is reached, before the reply claim.
    fn validate_commit(&self, request: &R) -> Result<(), Error>;
}

/// Policy that accepts every request at every phase.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleValidation;

impl<R> ProposalValidation<R> for SimpleValidation {
    fn validate_propose(&self, _request: &R) -> Result<(), Error> {
        Ok(())
    }

    fn validate_pre_prepare(&self, _request: &R) -> Result<(), Error> {
        Ok(())
    }

    fn validate_prepare(&self, _request: &R) -> Result<(), Error> {
        Ok(())
    }

    fn validate_commit(&self, _request: &R) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_validation_accepts_everything() {
        let policy = SimpleValidation;
        let request = "payload";
        assert!(ProposalValidation::validate_propose(&policy, &request).is_ok());
        assert!(ProposalValidation::validate_pre_prepare(&policy, &request).is_ok());
        assert!(ProposalValidation::validate_prepare(&policy, &request).is_ok());
        assert!(ProposalValidation::validate_commit(&policy, &request).is_ok());
    }
}
