//! Fixed-schema codecs for the consensus event records.
//!
//! Every event is a length-prefixed binary record: an 8-byte message header
//! carrying (block length, template id, schema id, version) followed by the
//! fixed block and any variable-length tails. Variable-length fields are a
//! `u32` byte count followed by the bytes.
//!
//! Compatibility is frozen: fields may be appended as optional tails but
//! never reordered or resized.

use thiserror::Error;

use super::{get_i32, get_i64, get_u16, put_i32, put_i64, put_u16};

/// Length of the message header prefixing every event record.
pub const MESSAGE_HEADER_LENGTH: usize = 8;

/// Schema id shared by all consensus event records.
pub const SCHEMA_ID: u16 = 111;

/// Schema version emitted by the encoders.
pub const SCHEMA_VERSION: u16 = 1;

/// Length of the pre-encoded session message header: message header plus
/// the session block. User payload follows opaquely on the wire.
pub const SESSION_HEADER_LENGTH: usize = MESSAGE_HEADER_LENGTH + SessionMessageHeader::BLOCK_LENGTH as usize;

/// Errors raised when decoding event records.
#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("buffer too short: need {needed} bytes, have {available}")]
    ShortBuffer { needed: usize, available: usize },

    #[error("unexpected template id {actual}, expected {expected}")]
    UnexpectedTemplate { expected: u16, actual: u16 },

    #[error("unsupported schema id {0}")]
    UnsupportedSchema(u16),

    #[error("unknown {name} discriminant {value}")]
    UnknownDiscriminant { name: &'static str, value: i32 },
}

// =============================================================================
// MESSAGE HEADER
// =============================================================================

/// The 8-byte header prefixing every event record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub block_length: u16,
    pub template_id: u16,
    pub schema_id: u16,
    pub version: u16,
}

impl MessageHeader {
    pub fn encode(&self, buf: &mut [u8], offset: usize) {
        put_u16(buf, offset, self.block_length);
        put_u16(buf, offset + 2, self.template_id);
        put_u16(buf, offset + 4, self.schema_id);
        put_u16(buf, offset + 6, self.version);
    }

    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, EventDecodeError> {
        check_length(buf, offset + MESSAGE_HEADER_LENGTH)?;

        Ok(MessageHeader {
            block_length: get_u16(buf, offset),
            template_id: get_u16(buf, offset + 2),
            schema_id: get_u16(buf, offset + 4),
            version: get_u16(buf, offset + 6),
        })
    }
}

fn check_length(buf: &[u8], needed: usize) -> Result<(), EventDecodeError> {
    if buf.len() < needed {
        return Err(EventDecodeError::ShortBuffer { needed, available: buf.len() });
    }
    Ok(())
}

/// Decode and validate the message header for `template_id`.
fn expect_header(buf: &[u8], template_id: u16) -> Result<MessageHeader, EventDecodeError> {
    let header = MessageHeader::decode(buf, 0)?;
    if header.schema_id != SCHEMA_ID {
        return Err(EventDecodeError::UnsupportedSchema(header.schema_id));
    }
    if header.template_id != template_id {
        return Err(EventDecodeError::UnexpectedTemplate {
            expected: template_id,
            actual: header.template_id,
        });
    }
    check_length(buf, MESSAGE_HEADER_LENGTH + header.block_length as usize)?;
    Ok(header)
}

fn put_message_header(buf: &mut [u8], block_length: u16, template_id: u16) {
    MessageHeader {
        block_length,
        template_id,
        schema_id: SCHEMA_ID,
        version: SCHEMA_VERSION,
    }
    .encode(buf, 0);
}

/// Append a variable-length field (u32 byte count + bytes).
fn put_var_data(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
}

/// Read a variable-length field at `offset`, returning (bytes, next offset).
fn get_var_data(buf: &[u8], offset: usize) -> Result<(&[u8], usize), EventDecodeError> {
    check_length(buf, offset + 4)?;
    let length = u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]) as usize;
    let data_offset = offset + 4;
    check_length(buf, data_offset + length)?;
    Ok((&buf[data_offset..data_offset + length], data_offset + length))
}

// =============================================================================
// CARRIED ENUMS
// =============================================================================

/// Why a cluster session was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    ClientAction,
    ServiceAction,
    TimedOut,
}

impl CloseReason {
    pub fn code(self) -> i32 {
        match self {
            CloseReason::ClientAction => 0,
            CloseReason::ServiceAction => 1,
            CloseReason::TimedOut => 2,
        }
    }

    pub fn from_code(value: i32) -> Result<Self, EventDecodeError> {
        match value {
            0 => Ok(CloseReason::ClientAction),
            1 => Ok(CloseReason::ServiceAction),
            2 => Ok(CloseReason::TimedOut),
            _ => Err(EventDecodeError::UnknownDiscriminant { name: "CloseReason", value }),
        }
    }
}

/// Action requested of the whole cluster at a known log position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterAction {
    Suspend,
    Resume,
    Snapshot,
    Shutdown,
    Abort,
}

impl ClusterAction {
    pub fn code(self) -> i32 {
        match self {
            ClusterAction::Suspend => 0,
            ClusterAction::Resume => 1,
            ClusterAction::Snapshot => 2,
            ClusterAction::Shutdown => 3,
            ClusterAction::Abort => 4,
        }
    }

    pub fn from_code(value: i32) -> Result<Self, EventDecodeError> {
        match value {
            0 => Ok(ClusterAction::Suspend),
            1 => Ok(ClusterAction::Resume),
            2 => Ok(ClusterAction::Snapshot),
            3 => Ok(ClusterAction::Shutdown),
            4 => Ok(ClusterAction::Abort),
            _ => Err(EventDecodeError::UnknownDiscriminant { name: "ClusterAction", value }),
        }
    }
}

/// Kind of membership change recorded in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Join,
    Quit,
}

impl ChangeType {
    pub fn code(self) -> i32 {
        match self {
            ChangeType::Join => 0,
            ChangeType::Quit => 1,
        }
    }

    pub fn from_code(value: i32) -> Result<Self, EventDecodeError> {
        match value {
            0 => Ok(ChangeType::Join),
            1 => Ok(ChangeType::Quit),
            _ => Err(EventDecodeError::UnknownDiscriminant { name: "ChangeType", value }),
        }
    }
}

/// Resolution of cluster timestamps, fixed per deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterTimeUnit {
    Millis,
    Micros,
    Nanos,
}

impl ClusterTimeUnit {
    pub fn code(self) -> i32 {
        match self {
            ClusterTimeUnit::Millis => 0,
            ClusterTimeUnit::Micros => 1,
            ClusterTimeUnit::Nanos => 2,
        }
    }

    pub fn from_code(value: i32) -> Result<Self, EventDecodeError> {
        match value {
            0 => Ok(ClusterTimeUnit::Millis),
            1 => Ok(ClusterTimeUnit::Micros),
            2 => Ok(ClusterTimeUnit::Nanos),
            _ => Err(EventDecodeError::UnknownDiscriminant { name: "ClusterTimeUnit", value }),
        }
    }
}

// =============================================================================
// SESSION MESSAGE HEADER (template 1)
// =============================================================================

/// Header prefixed to every client session message; the user payload follows
/// opaquely after the block.
///
/// The publisher keeps one pre-encoded copy and rewrites only the three
/// block fields per append; the message-header bytes stay fixed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionMessageHeader {
    pub leadership_term_id: i64,
    pub cluster_session_id: i64,
    pub timestamp: i64,
}

/// Block-field offsets within the encoded session header, for in-place
/// rewriting.
pub const SESSION_LEADERSHIP_TERM_ID_OFFSET: usize = MESSAGE_HEADER_LENGTH;
pub const SESSION_CLUSTER_SESSION_ID_OFFSET: usize = MESSAGE_HEADER_LENGTH + 8;
pub const SESSION_TIMESTAMP_OFFSET: usize = MESSAGE_HEADER_LENGTH + 16;

impl SessionMessageHeader {
    pub const TEMPLATE_ID: u16 = 1;
    pub const BLOCK_LENGTH: u16 = 24;

    pub fn encode(&self, buf: &mut [u8]) {
        put_message_header(buf, Self::BLOCK_LENGTH, Self::TEMPLATE_ID);
        put_i64(buf, SESSION_LEADERSHIP_TERM_ID_OFFSET, self.leadership_term_id);
        put_i64(buf, SESSION_CLUSTER_SESSION_ID_OFFSET, self.cluster_session_id);
        put_i64(buf, SESSION_TIMESTAMP_OFFSET, self.timestamp);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, EventDecodeError> {
        expect_header(buf, Self::TEMPLATE_ID)?;

        Ok(SessionMessageHeader {
            leadership_term_id: get_i64(buf, SESSION_LEADERSHIP_TERM_ID_OFFSET),
            cluster_session_id: get_i64(buf, SESSION_CLUSTER_SESSION_ID_OFFSET),
            timestamp: get_i64(buf, SESSION_TIMESTAMP_OFFSET),
        })
    }
}

// =============================================================================
// TIMER EVENT (template 2)
// =============================================================================

/// A timer expiry that made it into the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerEvent {
    pub leadership_term_id: i64,
    pub correlation_id: i64,
    pub timestamp: i64,
}

impl TimerEvent {
    pub const TEMPLATE_ID: u16 = 2;
    pub const BLOCK_LENGTH: u16 = 24;
    pub const ENCODED_LENGTH: usize = MESSAGE_HEADER_LENGTH + Self::BLOCK_LENGTH as usize;

    pub fn encode(&self, buf: &mut [u8]) {
        put_message_header(buf, Self::BLOCK_LENGTH, Self::TEMPLATE_ID);
        put_i64(buf, MESSAGE_HEADER_LENGTH, self.leadership_term_id);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 8, self.correlation_id);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 16, self.timestamp);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, EventDecodeError> {
        expect_header(buf, Self::TEMPLATE_ID)?;

        Ok(TimerEvent {
            leadership_term_id: get_i64(buf, MESSAGE_HEADER_LENGTH),
            correlation_id: get_i64(buf, MESSAGE_HEADER_LENGTH + 8),
            timestamp: get_i64(buf, MESSAGE_HEADER_LENGTH + 16),
        })
    }
}

// =============================================================================
// SESSION OPEN EVENT (template 3)
// =============================================================================

/// Records a client session being admitted to the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOpenEvent {
    pub leadership_term_id: i64,
    pub cluster_session_id: i64,
    pub correlation_id: i64,
    pub timestamp: i64,
    pub response_stream_id: i32,
    pub response_channel: String,
    pub encoded_principal: Vec<u8>,
}

impl SessionOpenEvent {
    pub const TEMPLATE_ID: u16 = 3;
    pub const BLOCK_LENGTH: u16 = 36;

    /// Encode into `buf`, replacing its contents. Returns the encoded length.
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        buf.clear();
        buf.resize(MESSAGE_HEADER_LENGTH + Self::BLOCK_LENGTH as usize, 0);
        put_message_header(buf, Self::BLOCK_LENGTH, Self::TEMPLATE_ID);
        put_i64(buf, MESSAGE_HEADER_LENGTH, self.leadership_term_id);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 8, self.cluster_session_id);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 16, self.correlation_id);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 24, self.timestamp);
        put_i32(buf, MESSAGE_HEADER_LENGTH + 32, self.response_stream_id);
        put_var_data(buf, self.response_channel.as_bytes());
        put_var_data(buf, &self.encoded_principal);
        buf.len()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, EventDecodeError> {
        expect_header(buf, Self::TEMPLATE_ID)?;

        let var_offset = MESSAGE_HEADER_LENGTH + Self::BLOCK_LENGTH as usize;
        let (channel, next) = get_var_data(buf, var_offset)?;
        let (principal, _) = get_var_data(buf, next)?;

        Ok(SessionOpenEvent {
            leadership_term_id: get_i64(buf, MESSAGE_HEADER_LENGTH),
            cluster_session_id: get_i64(buf, MESSAGE_HEADER_LENGTH + 8),
            correlation_id: get_i64(buf, MESSAGE_HEADER_LENGTH + 16),
            timestamp: get_i64(buf, MESSAGE_HEADER_LENGTH + 24),
            response_stream_id: get_i32(buf, MESSAGE_HEADER_LENGTH + 32),
            response_channel: String::from_utf8_lossy(channel).into_owned(),
            encoded_principal: principal.to_vec(),
        })
    }
}

// =============================================================================
// SESSION CLOSE EVENT (template 4)
// =============================================================================

/// Records a client session leaving the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionCloseEvent {
    pub leadership_term_id: i64,
    pub cluster_session_id: i64,
    pub timestamp: i64,
    pub close_reason: CloseReason,
}

impl SessionCloseEvent {
    pub const TEMPLATE_ID: u16 = 4;
    pub const BLOCK_LENGTH: u16 = 28;
    pub const ENCODED_LENGTH: usize = MESSAGE_HEADER_LENGTH + Self::BLOCK_LENGTH as usize;

    pub fn encode(&self, buf: &mut [u8]) {
        put_message_header(buf, Self::BLOCK_LENGTH, Self::TEMPLATE_ID);
        put_i64(buf, MESSAGE_HEADER_LENGTH, self.leadership_term_id);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 8, self.cluster_session_id);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 16, self.timestamp);
        put_i32(buf, MESSAGE_HEADER_LENGTH + 24, self.close_reason.code());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, EventDecodeError> {
        expect_header(buf, Self::TEMPLATE_ID)?;

        Ok(SessionCloseEvent {
            leadership_term_id: get_i64(buf, MESSAGE_HEADER_LENGTH),
            cluster_session_id: get_i64(buf, MESSAGE_HEADER_LENGTH + 8),
            timestamp: get_i64(buf, MESSAGE_HEADER_LENGTH + 16),
            close_reason: CloseReason::from_code(get_i32(buf, MESSAGE_HEADER_LENGTH + 24))?,
        })
    }
}

// =============================================================================
// CLUSTER ACTION REQUEST (template 5)
// =============================================================================

/// An action the whole cluster takes at an agreed log position.
///
/// `log_position` names the first byte past this record's own final
/// fragment, so a state machine replaying the log knows exactly where to
/// act.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterActionRequest {
    pub leadership_term_id: i64,
    pub log_position: i64,
    pub timestamp: i64,
    pub action: ClusterAction,
}

impl ClusterActionRequest {
    pub const TEMPLATE_ID: u16 = 5;
    pub const BLOCK_LENGTH: u16 = 28;
    pub const ENCODED_LENGTH: usize = MESSAGE_HEADER_LENGTH + Self::BLOCK_LENGTH as usize;

    pub fn encode(&self, buf: &mut [u8]) {
        put_message_header(buf, Self::BLOCK_LENGTH, Self::TEMPLATE_ID);
        put_i64(buf, MESSAGE_HEADER_LENGTH, self.leadership_term_id);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 8, self.log_position);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 16, self.timestamp);
        put_i32(buf, MESSAGE_HEADER_LENGTH + 24, self.action.code());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, EventDecodeError> {
        expect_header(buf, Self::TEMPLATE_ID)?;

        Ok(ClusterActionRequest {
            leadership_term_id: get_i64(buf, MESSAGE_HEADER_LENGTH),
            log_position: get_i64(buf, MESSAGE_HEADER_LENGTH + 8),
            timestamp: get_i64(buf, MESSAGE_HEADER_LENGTH + 16),
            action: ClusterAction::from_code(get_i32(buf, MESSAGE_HEADER_LENGTH + 24))?,
        })
    }
}

// =============================================================================
// NEW LEADERSHIP TERM EVENT (template 6)
// =============================================================================

/// Marks the start of a leadership term in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewLeadershipTermEvent {
    pub leadership_term_id: i64,
    pub log_position: i64,
    pub timestamp: i64,
    pub term_base_log_position: i64,
    pub leader_member_id: i32,
    pub log_session_id: i32,
    pub time_unit: ClusterTimeUnit,
    pub app_version: i32,
}

impl NewLeadershipTermEvent {
    pub const TEMPLATE_ID: u16 = 6;
    pub const BLOCK_LENGTH: u16 = 48;
    pub const ENCODED_LENGTH: usize = MESSAGE_HEADER_LENGTH + Self::BLOCK_LENGTH as usize;

    pub fn encode(&self, buf: &mut [u8]) {
        put_message_header(buf, Self::BLOCK_LENGTH, Self::TEMPLATE_ID);
        put_i64(buf, MESSAGE_HEADER_LENGTH, self.leadership_term_id);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 8, self.log_position);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 16, self.timestamp);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 24, self.term_base_log_position);
        put_i32(buf, MESSAGE_HEADER_LENGTH + 32, self.leader_member_id);
        put_i32(buf, MESSAGE_HEADER_LENGTH + 36, self.log_session_id);
        put_i32(buf, MESSAGE_HEADER_LENGTH + 40, self.time_unit.code());
        put_i32(buf, MESSAGE_HEADER_LENGTH + 44, self.app_version);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, EventDecodeError> {
        expect_header(buf, Self::TEMPLATE_ID)?;

        Ok(NewLeadershipTermEvent {
            leadership_term_id: get_i64(buf, MESSAGE_HEADER_LENGTH),
            log_position: get_i64(buf, MESSAGE_HEADER_LENGTH + 8),
            timestamp: get_i64(buf, MESSAGE_HEADER_LENGTH + 16),
            term_base_log_position: get_i64(buf, MESSAGE_HEADER_LENGTH + 24),
            leader_member_id: get_i32(buf, MESSAGE_HEADER_LENGTH + 32),
            log_session_id: get_i32(buf, MESSAGE_HEADER_LENGTH + 36),
            time_unit: ClusterTimeUnit::from_code(get_i32(buf, MESSAGE_HEADER_LENGTH + 40))?,
            app_version: get_i32(buf, MESSAGE_HEADER_LENGTH + 44),
        })
    }
}

// =============================================================================
// MEMBERSHIP CHANGE EVENT (template 7)
// =============================================================================

/// Records a member joining or quitting, with the resulting member list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipChangeEvent {
    pub leadership_term_id: i64,
    pub log_position: i64,
    pub timestamp: i64,
    pub leader_member_id: i32,
    pub cluster_size: i32,
    pub change_type: ChangeType,
    pub member_id: i32,
    pub cluster_members: String,
}

impl MembershipChangeEvent {
    pub const TEMPLATE_ID: u16 = 7;
    pub const BLOCK_LENGTH: u16 = 40;

    /// Length of the `cluster_members` var-field count prefix.
    pub const CLUSTER_MEMBERS_HEADER_LENGTH: usize = 4;

    /// Total record length for a given member-list string.
    pub fn encoded_length(cluster_members: &str) -> usize {
        MESSAGE_HEADER_LENGTH
            + Self::BLOCK_LENGTH as usize
            + Self::CLUSTER_MEMBERS_HEADER_LENGTH
            + cluster_members.len()
    }

    /// Encode into `buf`, replacing its contents. Returns the encoded length.
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        buf.clear();
        buf.resize(MESSAGE_HEADER_LENGTH + Self::BLOCK_LENGTH as usize, 0);
        put_message_header(buf, Self::BLOCK_LENGTH, Self::TEMPLATE_ID);
        put_i64(buf, MESSAGE_HEADER_LENGTH, self.leadership_term_id);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 8, self.log_position);
        put_i64(buf, MESSAGE_HEADER_LENGTH + 16, self.timestamp);
        put_i32(buf, MESSAGE_HEADER_LENGTH + 24, self.leader_member_id);
        put_i32(buf, MESSAGE_HEADER_LENGTH + 28, self.cluster_size);
        put_i32(buf, MESSAGE_HEADER_LENGTH + 32, self.change_type.code());
        put_i32(buf, MESSAGE_HEADER_LENGTH + 36, self.member_id);
        put_var_data(buf, self.cluster_members.as_bytes());
        buf.len()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, EventDecodeError> {
        expect_header(buf, Self::TEMPLATE_ID)?;

        let var_offset = MESSAGE_HEADER_LENGTH + Self::BLOCK_LENGTH as usize;
        let (members, _) = get_var_data(buf, var_offset)?;

        Ok(MembershipChangeEvent {
            leadership_term_id: get_i64(buf, MESSAGE_HEADER_LENGTH),
            log_position: get_i64(buf, MESSAGE_HEADER_LENGTH + 8),
            timestamp: get_i64(buf, MESSAGE_HEADER_LENGTH + 16),
            leader_member_id: get_i32(buf, MESSAGE_HEADER_LENGTH + 24),
            cluster_size: get_i32(buf, MESSAGE_HEADER_LENGTH + 28),
            change_type: ChangeType::from_code(get_i32(buf, MESSAGE_HEADER_LENGTH + 32))?,
            member_id: get_i32(buf, MESSAGE_HEADER_LENGTH + 36),
            cluster_members: String::from_utf8_lossy(members).into_owned(),
        })
    }
}
