//! Hashed wheel of wall-clock deadlines.
//!
//! Deadlines hash onto `ticks_per_wheel` spokes by tick; each spoke holds a
//! small open slot array that grows on demand. A timer id encodes
//! `(spoke index, slot index)`, so cancel and deadline lookup are O(1).
//!
//! `poll` is work-bounded: it scans at most the current spoke per call,
//! expiring up to the caller's limit, and advances the wheel's tick only
//! once the spoke has been fully scanned and the tick's end time has
//! passed. A handler may refuse an expiry, in which case the timer stays
//! in its slot and the same poll position is retried on the next call.

use crate::codec::events::ClusterTimeUnit;

/// Deadline value marking an empty slot.
pub const NULL_DEADLINE: i64 = -1;

/// Slots allocated per spoke up front.
const INITIAL_TICK_ALLOCATION: usize = 16;

pub struct DeadlineTimerWheel {
    time_unit: ClusterTimeUnit,
    start_time: i64,
    tick_resolution: i64,
    resolution_bits: u32,
    tick_mask: i64,
    current_tick: i64,
    poll_index: usize,
    timer_count: usize,
    wheel: Vec<Vec<i64>>,
}

#[inline]
fn timer_id_for_slot(spoke_index: usize, slot_index: usize) -> i64 {
    ((spoke_index as i64) << 32) | slot_index as i64
}

#[inline]
fn spoke_for_timer_id(timer_id: i64) -> usize {
    (timer_id >> 32) as usize
}

#[inline]
fn slot_for_timer_id(timer_id: i64) -> usize {
    (timer_id & 0xFFFF_FFFF) as usize
}

impl DeadlineTimerWheel {
    /// # Panics
    /// Panics unless `tick_resolution` and `ticks_per_wheel` are powers of
    /// two.
    pub fn new(
        time_unit: ClusterTimeUnit,
        start_time: i64,
        tick_resolution: i64,
        ticks_per_wheel: usize,
    ) -> Self {
        assert!(
            tick_resolution > 0 && (tick_resolution as u64).is_power_of_two(),
            "tick resolution must be a power of two"
        );
        assert!(ticks_per_wheel.is_power_of_two(), "ticks per wheel must be a power of two");

        DeadlineTimerWheel {
            time_unit,
            start_time,
            tick_resolution,
            resolution_bits: (tick_resolution as u64).trailing_zeros(),
            tick_mask: ticks_per_wheel as i64 - 1,
            current_tick: 0,
            poll_index: 0,
            timer_count: 0,
            wheel: vec![Vec::with_capacity(INITIAL_TICK_ALLOCATION); ticks_per_wheel],
        }
    }

    #[inline]
    pub fn time_unit(&self) -> ClusterTimeUnit {
        self.time_unit
    }

    #[inline]
    pub fn tick_resolution(&self) -> i64 {
        self.tick_resolution
    }

    #[inline]
    pub fn timer_count(&self) -> usize {
        self.timer_count
    }

    /// End time of the current tick; the wheel's notion of "now".
    #[inline]
    pub fn current_tick_time(&self) -> i64 {
        ((self.current_tick + 1) << self.resolution_bits) + self.start_time
    }

    /// Jump the wheel's time without firing anything in between; timers
    /// already past `now` expire on the next poll.
    pub fn set_current_tick_time(&mut self, now: i64) {
        self.current_tick = ((now - self.start_time) >> self.resolution_bits).max(0);
        self.poll_index = 0;
    }

    /// Schedule a timer for `deadline`, returning its id.
    ///
    /// Deadlines already in the past land on the current tick and expire on
    /// the next poll.
    pub fn schedule_timer(&mut self, deadline: i64) -> i64 {
        let deadline_tick =
            ((deadline - self.start_time) >> self.resolution_bits).max(self.current_tick);
        let spoke_index = (deadline_tick & self.tick_mask) as usize;
        let spoke = &mut self.wheel[spoke_index];

        for (slot_index, slot) in spoke.iter_mut().enumerate() {
            if *slot == NULL_DEADLINE {
                *slot = deadline;
                self.timer_count += 1;
                return timer_id_for_slot(spoke_index, slot_index);
            }
        }

        spoke.push(deadline);
        self.timer_count += 1;
        timer_id_for_slot(spoke_index, spoke.len() - 1)
    }

    /// Cancel a live timer. Returns whether it was still scheduled.
    pub fn cancel_timer(&mut self, timer_id: i64) -> bool {
        let spoke_index = spoke_for_timer_id(timer_id);
        let slot_index = slot_for_timer_id(timer_id);

        if spoke_index < self.wheel.len() && slot_index < self.wheel[spoke_index].len() {
            if self.wheel[spoke_index][slot_index] != NULL_DEADLINE {
                self.wheel[spoke_index][slot_index] = NULL_DEADLINE;
                self.timer_count -= 1;
                return true;
            }
        }

        false
    }

    /// Deadline of a live timer, or [`NULL_DEADLINE`].
    pub fn deadline(&self, timer_id: i64) -> i64 {
        let spoke_index = spoke_for_timer_id(timer_id);
        let slot_index = slot_for_timer_id(timer_id);

        if spoke_index < self.wheel.len() && slot_index < self.wheel[spoke_index].len() {
            return self.wheel[spoke_index][slot_index];
        }

        NULL_DEADLINE
    }

    /// Expire timers due by `now`, at most `expiry_limit` of them.
    ///
    /// The handler receives `(time_unit, now, timer_id)` and returns whether
    /// it consumed the expiry. A refused expiry is left in its slot, the
    /// refusal counts against the expiry budget, and the call returns so the
    /// caller can deal with the cause; the next poll retries the same slot.
    pub fn poll<H>(&mut self, now: i64, handler: &mut H, expiry_limit: usize) -> usize
    where
        H: FnMut(ClusterTimeUnit, i64, i64) -> bool,
    {
        let mut timers_expired = 0;

        if self.timer_count > 0 {
            let spoke_index = (self.current_tick & self.tick_mask) as usize;
            let length = self.wheel[spoke_index].len();

            while self.poll_index < length && timers_expired < expiry_limit {
                let slot_index = self.poll_index;
                let deadline = self.wheel[spoke_index][slot_index];

                if deadline != NULL_DEADLINE && deadline <= now {
                    timers_expired += 1;
                    if !handler(self.time_unit, now, timer_id_for_slot(spoke_index, slot_index)) {
                        return timers_expired;
                    }

                    self.wheel[spoke_index][slot_index] = NULL_DEADLINE;
                    self.timer_count -= 1;
                }

                self.poll_index += 1;
            }
        }

        if timers_expired < expiry_limit && self.current_tick_time() <= now {
            self.current_tick += 1;
            self.poll_index = 0;
        }

        timers_expired
    }
}
