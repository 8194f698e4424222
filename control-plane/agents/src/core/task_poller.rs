//! Harness for the periodic reconciler work: pollers run on a shared cadence
//! and report whether they found work or an error.

use crate::{core::registry::Registry, errors::SvcError};
use labpool_common::store::definitions::Store;

/// How often a poller fires, in multiples of the reconciler period.
pub type PollPeriods = u32;

/// The state of a poller after a run.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PollerState {
    /// No work left.
    Idle,
    /// There is more work to do on the next run.
    Busy,
}

/// Result of a poll run.
pub type PollResult = Result<PollerState, SvcError>;

/// Shared context handed to every poller.
pub struct PollContext<S: Store> {
    registry: Registry<S>,
}

impl<S: Store> PollContext<S> {
    pub fn from(registry: &Registry<S>) -> Self {
        Self {
            registry: registry.clone(),
        }
    }

    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    pub fn store(&self) -> &S {
        self.registry.store()
    }
}

/// A unit of periodic reconciliation work.
#[async_trait::async_trait]
pub trait TaskPoller<S: Store>: Send + Sync {
    /// Run the poller against the current state.
    async fn poll(&mut self, context: &PollContext<S>) -> PollResult;

    /// Whether the poller wants to run this cycle.
    async fn poll_timer(&mut self, _context: &PollContext<S>) -> bool {
        true
    }

    async fn try_poll(&mut self, context: &PollContext<S>) -> PollResult {
        if self.poll_timer(context).await {
            self.poll(context).await
        } else {
            Ok(PollerState::Idle)
        }
    }
}

/// Counts reconciler cycles and fires every `period` of them.
#[derive(Debug)]
pub struct PollTimer {
    period: PollPeriods,
    counter: PollPeriods,
}

impl PollTimer {
    pub fn from(period: PollPeriods) -> Self {
        Self {
            period: period.max(1),
            counter: 0,
        }
    }

    pub fn poll(&mut self) -> bool {
        self.counter += 1;
        if self.counter >= self.period {
            self.counter = 0;
            true
        } else {
            false
        }
    }
}

/// Squashes a set of results into one: errors win, then `Busy`.
pub fn squash_results(results: Vec<PollResult>) -> PollResult {
    let mut state = PollerState::Idle;
    for result in results {
        match result? {
            PollerState::Busy => state = PollerState::Busy,
            PollerState::Idle => {}
        }
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_timer_fires_every_period() {
        let mut timer = PollTimer::from(3);
        let fired: Vec<bool> = (0 .. 6).map(|_| timer.poll()).collect();
        assert_eq!(fired, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn squash_prefers_errors_then_busy() {
        assert_eq!(
            squash_results(vec![Ok(PollerState::Idle), Ok(PollerState::Busy)]).unwrap(),
            PollerState::Busy
        );
        assert!(squash_results(vec![
            Ok(PollerState::Idle),
            Err(SvcError::Internal {
                details: "boom".to_string()
            }),
        ])
        .is_err());
    }
}
