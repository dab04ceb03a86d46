//! Abstraction over the reliable-ordered log publication.
//!
//! The publisher owns exactly one [`Publication`] for writes; the archive
//! records the same stream through its own path. Offers and claims return
//! immediately with either a positive new position or a negative status
//! code. Back-pressure and admin-action codes are benign and retried by the
//! caller; the remaining codes are fatal for the current binding.

pub mod loopback;

use thiserror::Error;

/// The publication is not yet connected to a subscriber.
pub const NOT_CONNECTED: i64 = -1;

/// The offer failed due to back-pressure from subscribers; retry.
pub const BACK_PRESSURED: i64 = -2;

/// The offer failed due to an administration action such as a log
/// rotation; retry.
pub const ADMIN_ACTION: i64 = -3;

/// The publication has been closed and no further offers are possible.
pub const CLOSED: i64 = -4;

/// The offered position would exceed the maximum possible for this
/// publication.
pub const MAX_POSITION_EXCEEDED: i64 = -5;

/// Fatal publication states, raised immediately rather than retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublicationError {
    #[error("publication is not connected")]
    NotConnected,

    #[error("publication is closed")]
    Closed,

    #[error("publication max position exceeded")]
    MaxPositionExceeded,
}

/// Classify a negative offer/claim result.
///
/// Benign codes (`BACK_PRESSURED`, `ADMIN_ACTION`) pass through for the
/// caller's bounded retry loop; fatal codes raise.
pub fn check_result(result: i64) -> Result<(), PublicationError> {
    match result {
        NOT_CONNECTED => Err(PublicationError::NotConnected),
        CLOSED => Err(PublicationError::Closed),
        MAX_POSITION_EXCEEDED => Err(PublicationError::MaxPositionExceeded),
        _ => Ok(()),
    }
}

/// A reusable two-phase handle for zero-intermediate-copy appends.
///
/// Protocol: a successful [`Publication::try_claim`] prepares the claim for
/// exactly the requested length; the writer encodes into [`buffer_mut`] and
/// then either [`Publication::commit`]s or [`Publication::abort`]s the claim
/// before any other call on the same publication.
///
/// [`buffer_mut`]: BufferClaim::buffer_mut
#[derive(Debug, Default)]
pub struct BufferClaim {
    buffer: Vec<u8>,
    claimed: bool,
}

impl BufferClaim {
    pub fn new() -> Self {
        BufferClaim { buffer: Vec::new(), claimed: false }
    }

    /// Prepare the claim for `length` bytes. Called by the publication.
    pub fn prepare(&mut self, length: usize) {
        self.buffer.clear();
        self.buffer.resize(length, 0);
        self.claimed = true;
    }

    /// The claimed range to encode into.
    ///
    /// # Panics
    /// Panics if no claim is outstanding.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        assert!(self.claimed, "no outstanding claim");
        &mut self.buffer
    }

    /// The claimed bytes, for the publication to commit.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed
    }

    /// Release the claim without committing. Called by the publication.
    pub fn release(&mut self) {
        self.claimed = false;
    }
}

/// The reliable-ordered log publication consumed by the publisher.
///
/// Positions are byte offsets from the start of the stream, monotonically
/// non-decreasing, advancing only by frame-aligned units. The max payload
/// length must be stable while a publisher is bound, or pre-computed
/// self-describing log positions would disagree with the record's actual
/// end.
pub trait Publication {
    /// Current log position in bytes.
    fn position(&self) -> i64;

    /// Stable session identifier for this publication.
    fn session_id(&self) -> i32;

    /// Maximum bytes per frame, excluding the frame header.
    fn max_payload_length(&self) -> usize;

    /// Offer a single-buffer record. Returns the new position or a negative
    /// status code.
    fn offer(&mut self, buf: &[u8]) -> i64;

    /// Gather-offer two ranges as one record. Returns the new position or a
    /// negative status code.
    fn offer_gather(&mut self, header: &[u8], payload: &[u8]) -> i64;

    /// Reserve `length` bytes at the current position. On success the claim
    /// is prepared and the prospective new position is returned; the caller
    /// must then commit or abort.
    fn try_claim(&mut self, length: usize, claim: &mut BufferClaim) -> i64;

    /// Commit an outstanding claim's encoded bytes. Returns the new
    /// position.
    fn commit(&mut self, claim: &mut BufferClaim) -> i64;

    /// Abort an outstanding claim, releasing the reservation.
    fn abort(&mut self, claim: &mut BufferClaim);

    /// Register a multi-destination-cast endpoint.
    fn add_destination(&mut self, endpoint_uri: &str);

    /// Unregister a multi-destination-cast endpoint.
    fn remove_destination(&mut self, endpoint_uri: &str);

    /// Release transport resources. Further offers return [`CLOSED`].
    fn close(&mut self);
}
