//! Leader-side encoder appending consensus events to the log publication.
//!
//! # Ordering Contract
//!
//! - The publisher is the sole writer of its publication; appends are
//!   totally ordered by call order.
//! - Events that carry their own log position pre-compute the aligned
//!   on-wire length and add it to the pre-claim position. Because claims
//!   are atomic and single-writer, no other record can land between the
//!   position read and the claim, so the encoded value names the first
//!   byte past the record's final fragment.
//! - Every append attempts at most [`SEND_ATTEMPTS`] offers. Back-pressure
//!   and admin-action codes are retried within that budget; fatal codes
//!   raise immediately. The caller supplies any outer idle strategy.

use crate::codec::events::{
    ClusterAction, ClusterActionRequest, ClusterTimeUnit, ChangeType, MembershipChangeEvent,
    NewLeadershipTermEvent, SessionCloseEvent, SessionMessageHeader, SessionOpenEvent, TimerEvent,
    SESSION_CLUSTER_SESSION_ID_OFFSET, SESSION_HEADER_LENGTH, SESSION_LEADERSHIP_TERM_ID_OFFSET,
    SESSION_TIMESTAMP_OFFSET,
};
use crate::codec::{align, fragmented_length, put_i64, FRAME_ALIGNMENT, HEADER_LENGTH};
use crate::transport::{check_result, BufferClaim, Publication, PublicationError};

use super::ClusterSession;

/// Bounded retry budget per append.
pub const SEND_ATTEMPTS: usize = 3;

/// Stateful encoder bound to one log publication.
///
/// The session-message header is encoded once and only its three block
/// fields are rewritten per append; variable-length events reuse one
/// growable scratch buffer; claimed events reuse one claim handle. None of
/// the append paths allocate in steady state.
pub struct LogPublisher<P: Publication> {
    publication: Option<P>,
    session_header: [u8; SESSION_HEADER_LENGTH],
    expandable: Vec<u8>,
    claim: BufferClaim,
}

impl<P: Publication> Default for LogPublisher<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Publication> LogPublisher<P> {
    pub fn new() -> Self {
        let mut session_header = [0u8; SESSION_HEADER_LENGTH];
        SessionMessageHeader { leadership_term_id: 0, cluster_session_id: 0, timestamp: 0 }
            .encode(&mut session_header);

        LogPublisher {
            publication: None,
            session_header,
            expandable: Vec::new(),
            claim: BufferClaim::new(),
        }
    }

    /// Install the publication for this leadership tenure, replacing any
    /// previous binding without closing it.
    pub fn bind(&mut self, publication: P) {
        self.publication = Some(publication);
    }

    /// Release the bound publication. Idempotent; afterwards
    /// [`position`](Self::position) reports 0.
    pub fn disconnect(&mut self) {
        if let Some(mut publication) = self.publication.take() {
            tracing::debug!("log publisher disconnecting");
            publication.close();
        }
    }

    /// Current publication position, or 0 when unbound.
    pub fn position(&self) -> i64 {
        match &self.publication {
            Some(publication) => publication.position(),
            None => 0,
        }
    }

    /// Session id of the bound publication.
    pub fn session_id(&self) -> Result<i32, PublicationError> {
        match &self.publication {
            Some(publication) => Ok(publication.session_id()),
            None => Err(PublicationError::NotConnected),
        }
    }

    /// The bound publication, if any.
    pub fn publication(&self) -> Option<&P> {
        self.publication.as_ref()
    }

    /// Register a passive follower as a multi-destination-cast endpoint.
    /// No-op when unbound.
    pub fn add_passive_follower(&mut self, follower_log_endpoint: &str) {
        if let Some(publication) = &mut self.publication {
            publication.add_destination(&log_destination(follower_log_endpoint));
        }
    }

    /// Unregister a passive follower endpoint. No-op when unbound.
    pub fn remove_passive_follower(&mut self, follower_log_endpoint: &str) {
        if let Some(publication) = &mut self.publication {
            publication.remove_destination(&log_destination(follower_log_endpoint));
        }
    }

    /// Append a client session message: rewrite the session-header fields,
    /// then gather-offer the header and the opaque payload as one record.
    ///
    /// Returns the new position, or the last benign negative code once the
    /// retry budget is spent.
    pub fn append_message(
        &mut self,
        leadership_term_id: i64,
        cluster_session_id: i64,
        timestamp: i64,
        payload: &[u8],
    ) -> Result<i64, PublicationError> {
        let publication = self.publication.as_mut().ok_or(PublicationError::NotConnected)?;

        put_i64(&mut self.session_header, SESSION_LEADERSHIP_TERM_ID_OFFSET, leadership_term_id);
        put_i64(&mut self.session_header, SESSION_CLUSTER_SESSION_ID_OFFSET, cluster_session_id);
        put_i64(&mut self.session_header, SESSION_TIMESTAMP_OFFSET, timestamp);

        let mut attempts = SEND_ATTEMPTS;
        loop {
            let result = publication.offer_gather(&self.session_header, payload);
            if result > 0 {
                return Ok(result);
            }

            check_result(result)?;
            attempts -= 1;
            if attempts == 0 {
                tracing::debug!(result, "append_message retries exhausted");
                return Ok(result);
            }
        }
    }

    /// Append a session-open event from the growable scratch buffer.
    pub fn append_session_open(
        &mut self,
        session: &ClusterSession,
        leadership_term_id: i64,
        timestamp: i64,
    ) -> Result<i64, PublicationError> {
        let publication = self.publication.as_mut().ok_or(PublicationError::NotConnected)?;

        let event = SessionOpenEvent {
            leadership_term_id,
            cluster_session_id: session.id(),
            correlation_id: session.correlation_id(),
            timestamp,
            response_stream_id: session.response_stream_id(),
            response_channel: session.response_channel().to_string(),
            encoded_principal: session.encoded_principal().to_vec(),
        };
        let length = event.encode(&mut self.expandable);

        let mut attempts = SEND_ATTEMPTS;
        loop {
            let result = publication.offer(&self.expandable[..length]);
            if result > 0 {
                return Ok(result);
            }

            check_result(result)?;
            attempts -= 1;
            if attempts == 0 {
                tracing::debug!(result, "append_session_open retries exhausted");
                return Ok(result);
            }
        }
    }

    /// Append a session-close event by claiming its exact length and
    /// encoding in place.
    pub fn append_session_close(
        &mut self,
        session: &ClusterSession,
        leadership_term_id: i64,
        timestamp: i64,
    ) -> Result<bool, PublicationError> {
        let publication = self.publication.as_mut().ok_or(PublicationError::NotConnected)?;

        let event = SessionCloseEvent {
            leadership_term_id,
            cluster_session_id: session.id(),
            timestamp,
            close_reason: session.close_reason(),
        };

        let mut attempts = SEND_ATTEMPTS;
        loop {
            let result = publication.try_claim(SessionCloseEvent::ENCODED_LENGTH, &mut self.claim);
            if result > 0 {
                event.encode(self.claim.buffer_mut());
                publication.commit(&mut self.claim);
                return Ok(true);
            }

            check_result(result)?;
            attempts -= 1;
            if attempts == 0 {
                tracing::debug!(result, "append_session_close retries exhausted");
                return Ok(false);
            }
        }
    }

    /// Append a timer-expiry event.
    pub fn append_timer(
        &mut self,
        correlation_id: i64,
        leadership_term_id: i64,
        timestamp: i64,
    ) -> Result<i64, PublicationError> {
        let publication = self.publication.as_mut().ok_or(PublicationError::NotConnected)?;

        let event = TimerEvent { leadership_term_id, correlation_id, timestamp };

        let mut attempts = SEND_ATTEMPTS;
        loop {
            let result = publication.try_claim(TimerEvent::ENCODED_LENGTH, &mut self.claim);
            if result > 0 {
                event.encode(self.claim.buffer_mut());
                publication.commit(&mut self.claim);
                return Ok(result);
            }

            check_result(result)?;
            attempts -= 1;
            if attempts == 0 {
                return Ok(result);
            }
        }
    }

    /// Append a cluster action carrying the log position of its own end.
    ///
    /// The record cannot be claim-then-patch: the claim succeeds at the
    /// current position but the record must name the position after itself,
    /// so the aligned frame length is added to the pre-claim position.
    pub fn append_cluster_action(
        &mut self,
        leadership_term_id: i64,
        timestamp: i64,
        action: ClusterAction,
    ) -> Result<bool, PublicationError> {
        let publication = self.publication.as_mut().ok_or(PublicationError::NotConnected)?;

        let fragment_length = HEADER_LENGTH + ClusterActionRequest::ENCODED_LENGTH;

        let mut attempts = SEND_ATTEMPTS;
        loop {
            let log_position =
                publication.position() + align(fragment_length, FRAME_ALIGNMENT) as i64;
            let result = publication.try_claim(ClusterActionRequest::ENCODED_LENGTH, &mut self.claim);
            if result > 0 {
                ClusterActionRequest { leadership_term_id, log_position, timestamp, action }
                    .encode(self.claim.buffer_mut());
                publication.commit(&mut self.claim);
                return Ok(true);
            }

            check_result(result)?;
            attempts -= 1;
            if attempts == 0 {
                tracing::debug!(result, "append_cluster_action retries exhausted");
                return Ok(false);
            }
        }
    }

    /// Append the event opening a new leadership term, carrying the log
    /// position of its own end.
    #[allow(clippy::too_many_arguments)]
    pub fn append_new_leadership_term_event(
        &mut self,
        leadership_term_id: i64,
        timestamp: i64,
        term_base_log_position: i64,
        leader_member_id: i32,
        log_session_id: i32,
        time_unit: ClusterTimeUnit,
        app_version: i32,
    ) -> Result<bool, PublicationError> {
        let publication = self.publication.as_mut().ok_or(PublicationError::NotConnected)?;

        let fragment_length = HEADER_LENGTH + NewLeadershipTermEvent::ENCODED_LENGTH;

        let mut attempts = SEND_ATTEMPTS;
        loop {
            let log_position =
                publication.position() + align(fragment_length, FRAME_ALIGNMENT) as i64;
            let result =
                publication.try_claim(NewLeadershipTermEvent::ENCODED_LENGTH, &mut self.claim);
            if result > 0 {
                NewLeadershipTermEvent {
                    leadership_term_id,
                    log_position,
                    timestamp,
                    term_base_log_position,
                    leader_member_id,
                    log_session_id,
                    time_unit,
                    app_version,
                }
                .encode(self.claim.buffer_mut());
                publication.commit(&mut self.claim);
                return Ok(true);
            }

            check_result(result)?;
            attempts -= 1;
            if attempts == 0 {
                tracing::debug!(result, "append_new_leadership_term_event retries exhausted");
                return Ok(false);
            }
        }
    }

    /// Append a membership change. The record is variable length and may
    /// span several frames, so its log position is the pre-offer position
    /// plus the fragmented on-wire length.
    #[allow(clippy::too_many_arguments)]
    pub fn append_membership_change_event(
        &mut self,
        leadership_term_id: i64,
        timestamp: i64,
        leader_member_id: i32,
        cluster_size: i32,
        change_type: ChangeType,
        member_id: i32,
        cluster_members: &str,
    ) -> Result<i64, PublicationError> {
        let publication = self.publication.as_mut().ok_or(PublicationError::NotConnected)?;

        let message_length = MembershipChangeEvent::encoded_length(cluster_members);
        let on_wire_length = fragmented_length(message_length, publication.max_payload_length());

        let mut attempts = SEND_ATTEMPTS;
        loop {
            let event = MembershipChangeEvent {
                leadership_term_id,
                log_position: publication.position() + on_wire_length as i64,
                timestamp,
                leader_member_id,
                cluster_size,
                change_type,
                member_id,
                cluster_members: cluster_members.to_string(),
            };
            let length = event.encode(&mut self.expandable);

            let result = publication.offer(&self.expandable[..length]);
            if result > 0 {
                return Ok(result);
            }

            check_result(result)?;
            attempts -= 1;
            if attempts == 0 {
                tracing::debug!(result, "append_membership_change_event retries exhausted");
                return Ok(result);
            }
        }
    }
}

fn log_destination(endpoint: &str) -> String {
    format!("aeron:udp?endpoint={}", endpoint)
}
