// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-request bookkeeping for the four-phase engine.
//!
//! A slot is created lazily the first time any phase message mentions a
//! digest, so out-of-order prepares and commits are never dropped. The
//! counters and the once-only claims live under one lock: checking the
//! threshold and claiming the resulting action is a single atomic step.

use crate::request::Request;
use crate::types::NodeId;
use std::collections::HashSet;
use std::sync::Mutex;

/// Result of counting one phase message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// This sender was already counted for this phase.
    Duplicate,
    /// Counted; the threshold action is not (or no longer) pending.
    Counted(usize),
    /// Counted, and this message crossed the threshold. Returned once.
    ThresholdReached(usize),
}

#[derive(Debug, Default)]
struct SlotState {
    request: Option<Request>,
    prepared: HashSet<NodeId>,
    committed: HashSet<NodeId>,
    commit_broadcast: bool,
    replied: bool,
}

/// Point-in-time view of a slot, for logging and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub prepares: usize,
    pub commits: usize,
    pub commit_broadcast: bool,
    pub replied: bool,
    pub has_request: bool,
}

#[derive(Debug, Default)]
pub struct RequestSlot {
    state: Mutex<SlotState>,
}

impl RequestSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the request payload if the slot does not have one yet.
    pub fn set_request(&self, request: Request) {
        let mut state = self.state.lock().unwrap();
        if state.request.is_none() {
            state.request = Some(request);
        }
    }

    pub fn request(&self) -> Option<Request> {
        self.state.lock().unwrap().request.clone()
    }

    /// Count a prepare from `sender`; claims the commit broadcast when
    /// the count reaches `threshold`.
    pub fn record_prepare(&self, sender: NodeId, threshold: usize) -> PhaseOutcome {
        let mut state = self.state.lock().unwrap();
        if !state.prepared.insert(sender) {
            return PhaseOutcome::Duplicate;
        }
        let count = state.prepared.len();
        if count >= threshold && !state.commit_broadcast {
            state.commit_broadcast = true;
            PhaseOutcome::ThresholdReached(count)
        } else {
            PhaseOutcome::Counted(count)
        }
    }

    /// Count a commit from `sender`; claims the reply when the count
    /// reaches `threshold`.
    pub fn record_commit(&self, sender: NodeId, threshold: usize) -> PhaseOutcome {
        let mut state = self.state.lock().unwrap();
        if !state.committed.insert(sender) {
            return PhaseOutcome::Duplicate;
        }
        let count = state.committed.len();
        if count >= threshold && !state.replied {
            state.replied = true;
            PhaseOutcome::ThresholdReached(count)
        } else {
            PhaseOutcome::Counted(count)
        }
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        let state = self.state.lock().unwrap();
        SlotSnapshot {
            prepares: state.prepared.len(),
            commits: state.committed.len(),
            commit_broadcast: state.commit_broadcast,
            replied: state.replied,
            has_request: state.request.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_claim_fires_once() {
        let slot = RequestSlot::new();

        assert_eq!(slot.record_prepare(1, 2), PhaseOutcome::Counted(1));
        assert_eq!(slot.record_prepare(2, 2), PhaseOutcome::ThresholdReached(2));
        // Votes past the threshold are counted but never re-claim.
        assert_eq!(slot.record_prepare(3, 2), PhaseOutcome::Counted(3));
    }

    #[test]
    fn test_duplicate_sender_is_ignored() {
        let slot = RequestSlot::new();
        assert_eq!(slot.record_prepare(1, 2), PhaseOutcome::Counted(1));
        assert_eq!(slot.record_prepare(1, 2), PhaseOutcome::Duplicate);
        assert_eq!(slot.snapshot().prepares, 1);
    }

    #[test]
    fn test_prepare_and_commit_are_independent() {
        let slot = RequestSlot::new();
        assert_eq!(slot.record_prepare(1, 1), PhaseOutcome::ThresholdReached(1));
        assert_eq!(slot.record_commit(1, 2), PhaseOutcome::Counted(1));
        assert_eq!(slot.record_commit(2, 2), PhaseOutcome::ThresholdReached(2));

        let snapshot = slot.snapshot();
        assert!(snapshot.commit_broadcast);
        assert!(snapshot.replied);
        assert_eq!(snapshot.commits, 2);
    }

    #[test]
    fn test_late_threshold_still_claims() {
        // Threshold can be reached on a later message than the exact
        // crossing when earlier ones raced; the claim still fires once.
        let slot = RequestSlot::new();
        assert_eq!(slot.record_commit(1, 1), PhaseOutcome::ThresholdReached(1));
        assert_eq!(slot.record_commit(2, 1), PhaseOutcome::Counted(2));
    }
}
