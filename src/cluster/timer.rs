//! Deterministic deadline timers whose expiries are replicated log events.
//!
//! # Replay Contract
//!
//! An expiry only consumes its timer when the consensus agent reports the
//! timer event durably logged. A timer that fires but cannot be logged has
//! no observable effect: it stays in its wheel slot and the next poll
//! retries it. This is what keeps replay deterministic across leader
//! failover.
//!
//! The acceptance decision travels back as a value ([`ExpiryAction`]); the
//! agent appends-and-advances outside the wheel's iteration, so nothing
//! re-enters wheel state mid-poll.

use std::collections::HashMap;

use crate::codec::events::ClusterTimeUnit;

use super::snapshot::SnapshotTaker;
use super::wheel::DeadlineTimerWheel;

/// Expiry budget per [`TimerService::poll`], bounding work per duty cycle.
pub const POLL_LIMIT: usize = 20;

/// The consensus agent's verdict on one timer expiry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryAction {
    /// The timer event was durably appended to the log; retire the timer.
    Retire,
    /// The append did not land (back-pressure); keep the timer and retry on
    /// the next poll.
    Retry,
}

/// Consumed contract: the consensus side's reaction to a timer expiry.
pub trait ConsensusAgent {
    fn on_timer_event(&mut self, correlation_id: i64) -> ExpiryAction;
}

/// Deadline timer service for the consensus duty cycle.
///
/// Maintains the `correlation id <-> timer id` bijection for live timers;
/// cancelling or retiring a timer removes both directions together.
pub struct TimerService {
    wheel: DeadlineTimerWheel,
    timer_by_correlation: HashMap<i64, i64>,
    correlation_by_timer: HashMap<i64, i64>,
}

impl TimerService {
    pub fn new(
        time_unit: ClusterTimeUnit,
        start_time: i64,
        tick_resolution: i64,
        ticks_per_wheel: usize,
    ) -> Self {
        TimerService {
            wheel: DeadlineTimerWheel::new(time_unit, start_time, tick_resolution, ticks_per_wheel),
            timer_by_correlation: HashMap::new(),
            correlation_by_timer: HashMap::new(),
        }
    }

    /// Number of live timers.
    pub fn timer_count(&self) -> usize {
        self.timer_by_correlation.len()
    }

    /// Schedule a timer for `deadline`, replacing any live timer with the
    /// same correlation id: re-scheduling always lands on the new deadline.
    pub fn schedule_timer(&mut self, correlation_id: i64, deadline: i64) {
        self.cancel_timer(correlation_id);

        let timer_id = self.wheel.schedule_timer(deadline);
        self.timer_by_correlation.insert(correlation_id, timer_id);
        self.correlation_by_timer.insert(timer_id, correlation_id);
    }

    /// Cancel the timer for `correlation_id`. Returns whether one was live.
    pub fn cancel_timer(&mut self, correlation_id: i64) -> bool {
        if let Some(timer_id) = self.timer_by_correlation.remove(&correlation_id) {
            self.wheel.cancel_timer(timer_id);
            self.correlation_by_timer.remove(&timer_id);
            return true;
        }

        false
    }

    /// Advance the wheel to `now`, expiring due timers through `agent`.
    ///
    /// Returns the number of attempted expiries. Each wheel pass gets the
    /// full [`POLL_LIMIT`] budget and the loop ends once the running total
    /// reaches it, so one call may expire more than [`POLL_LIMIT`] timers
    /// when several spokes are due. A rejected expiry ends the poll early;
    /// the wheel keeps the timer and the next poll retries it. When nothing
    /// is scheduled the loop still catches the wheel's tick time up to
    /// `now`.
    pub fn poll(&mut self, now: i64, agent: &mut dyn ConsensusAgent) -> usize {
        let mut expired = 0;
        let mut rejected = false;

        let wheel = &mut self.wheel;
        let timer_by_correlation = &mut self.timer_by_correlation;
        let correlation_by_timer = &mut self.correlation_by_timer;

        loop {
            let mut handler = |_time_unit: ClusterTimeUnit, _now: i64, timer_id: i64| {
                let correlation_id = match correlation_by_timer.get(&timer_id) {
                    Some(&correlation_id) => correlation_id,
                    // Orphaned wheel entry; consume it.
                    None => return true,
                };

                match agent.on_timer_event(correlation_id) {
                    ExpiryAction::Retire => {
                        correlation_by_timer.remove(&timer_id);
                        timer_by_correlation.remove(&correlation_id);
                        true
                    }
                    ExpiryAction::Retry => {
                        rejected = true;
                        false
                    }
                }
            };

            expired += wheel.poll(now, &mut handler, POLL_LIMIT);

            if rejected || expired >= POLL_LIMIT || wheel.current_tick_time() >= now {
                break;
            }
        }

        expired
    }

    /// The wheel's notion of "now".
    pub fn current_tick_time(&self) -> i64 {
        self.wheel.current_tick_time()
    }

    /// Restore wheel time after a jump (snapshot recovery) without firing
    /// historical timers.
    pub fn set_current_tick_time(&mut self, timestamp: i64) {
        self.wheel.set_current_tick_time(timestamp);
    }

    /// Emit every live `(correlation id, deadline)` pair to `taker`.
    pub fn snapshot(&self, taker: &mut dyn SnapshotTaker) {
        for (&correlation_id, &timer_id) in &self.timer_by_correlation {
            taker.snapshot_timer(correlation_id, self.wheel.deadline(timer_id));
        }
    }
}
