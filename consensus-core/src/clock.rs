// Copyright © TBB Simulator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared round clock.
//!
//! A protocol instance begins at a start time announced in the Init
//! message; round r covers [start + r*tick, start + (r+1)*tick). Timer
//! tasks sleep until the exact deadline instead of polling.
//!
//! The start time only moves forward: an Init carrying an earlier start
//! than the current one is rejected so a delayed replay cannot rewind a
//! running instance.

use crate::types::Round;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

#[derive(Debug)]
pub struct RoundClock {
    tick: Duration,
    start: RwLock<Option<SystemTime>>,
}

impl RoundClock {
    pub fn new(tick: Duration) -> Self {
        RoundClock {
            tick,
            start: RwLock::new(None),
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Move the instance to a new start time.
    ///
    /// Returns false (and leaves the clock untouched) if `at` is
    /// earlier than the current start time. An equal start time is
    /// accepted so co-located engines can share one clock.
    pub fn restart(&self, at: SystemTime) -> bool {
        let mut start = self.start.write().unwrap();
        match *start {
            Some(current) if at < current => false,
            _ => {
                *start = Some(at);
                true
            }
        }
    }

    pub fn started(&self) -> bool {
        self.start.read().unwrap().is_some()
    }

    /// Time since the start, zero before the start (or if not started).
    pub fn elapsed(&self) -> Duration {
        match *self.start.read().unwrap() {
            Some(start) => SystemTime::now()
                .duration_since(start)
                .unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        }
    }

    /// Current round number: floor(elapsed / tick).
    pub fn current_round(&self) -> Round {
        (self.elapsed().as_nanos() / self.tick.as_nanos().max(1)) as Round
    }

    /// Sleep until the beginning of `round`.
    ///
    /// Resolves immediately if the deadline has passed or the clock has
    /// not been started.
    pub async fn wait_for_round(&self, round: Round) {
        let deadline = {
            match *self.start.read().unwrap() {
                Some(start) => start + self.tick * round as u32,
                None => return,
            }
        };
        if let Ok(remaining) = deadline.duration_since(SystemTime::now()) {
            tokio::time::sleep(remaining).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_time_only_moves_forward() {
        let clock = RoundClock::new(Duration::from_millis(50));
        let now = SystemTime::now();

        assert!(clock.restart(now));
        assert!(!clock.restart(now - Duration::from_secs(1)));
        assert!(clock.restart(now), "equal start time is accepted");
        assert!(clock.restart(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_round_math() {
        let clock = RoundClock::new(Duration::from_millis(10));
        assert_eq!(clock.current_round(), 0);
        assert_eq!(clock.elapsed(), Duration::ZERO);

        clock.restart(SystemTime::now() - Duration::from_millis(35));
        let round = clock.current_round();
        assert!((3..=4).contains(&round), "got round {round}");
    }

    #[test]
    fn test_unstarted_clock_is_at_round_zero() {
        let clock = RoundClock::new(Duration::from_millis(10));
        assert!(!clock.started());
        assert_eq!(clock.current_round(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_round_hits_deadline() {
        let clock = RoundClock::new(Duration::from_millis(20));
        clock.restart(SystemTime::now());

        let before = std::time::Instant::now();
        clock.wait_for_round(2).await;
        let waited = before.elapsed();
        assert!(waited >= Duration::from_millis(30), "waited {waited:?}");

        // A past round resolves without sleeping.
        let before = std::time::Instant::now();
        clock.wait_for_round(1).await;
        assert!(before.elapsed() < Duration::from_millis(10));
    }
}
