//! Snapshot seam for the timer service.
//!
//! The consensus agent owns snapshot assembly; the timer service only
//! enumerates its live `(correlation id, deadline)` pairs into a taker.
//! Iteration order is unspecified; recovered state depends only on the set
//! of pairs.

use serde::{Deserialize, Serialize};

/// Sink receiving the timer service's live timers during a snapshot.
pub trait SnapshotTaker {
    fn snapshot_timer(&mut self, correlation_id: i64, deadline: i64);
}

/// One live timer as captured in a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshotEntry {
    pub correlation_id: i64,
    pub deadline: i64,
}

/// Collecting taker for snapshot assembly and tests.
impl SnapshotTaker for Vec<TimerSnapshotEntry> {
    fn snapshot_timer(&mut self, correlation_id: i64, deadline: i64) {
        self.push(TimerSnapshotEntry { correlation_id, deadline });
    }
}
