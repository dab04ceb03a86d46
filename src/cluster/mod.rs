//! Leader-side cluster core: event publication onto the replicated log and
//! the deterministic deadline timer service.

pub mod publisher;
pub mod snapshot;
pub mod timer;
pub mod wheel;

pub use publisher::{LogPublisher, SEND_ATTEMPTS};
pub use snapshot::{SnapshotTaker, TimerSnapshotEntry};
pub use timer::{ConsensusAgent, ExpiryAction, TimerService, POLL_LIMIT};
pub use wheel::DeadlineTimerWheel;

use crate::codec::events::CloseReason;

/// A client session admitted to the cluster.
///
/// Carries the identity and response routing the session-open and
/// session-close events record in the log.
#[derive(Clone, Debug)]
pub struct ClusterSession {
    id: i64,
    correlation_id: i64,
    response_stream_id: i32,
    response_channel: String,
    encoded_principal: Vec<u8>,
    close_reason: CloseReason,
}

impl ClusterSession {
    pub fn new(
        id: i64,
        correlation_id: i64,
        response_stream_id: i32,
        response_channel: String,
        encoded_principal: Vec<u8>,
    ) -> Self {
        ClusterSession {
            id,
            correlation_id,
            response_stream_id,
            response_channel,
            encoded_principal,
            close_reason: CloseReason::ClientAction,
        }
    }

    #[inline]
    pub fn id(&self) -> i64 {
        self.id
    }

    #[inline]
    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    #[inline]
    pub fn response_stream_id(&self) -> i32 {
        self.response_stream_id
    }

    #[inline]
    pub fn response_channel(&self) -> &str {
        &self.response_channel
    }

    #[inline]
    pub fn encoded_principal(&self) -> &[u8] {
        &self.encoded_principal
    }

    #[inline]
    pub fn close_reason(&self) -> CloseReason {
        self.close_reason
    }

    pub fn set_close_reason(&mut self, close_reason: CloseReason) {
        self.close_reason = close_reason;
    }
}
