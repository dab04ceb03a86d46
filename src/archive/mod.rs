//! On-disk recording model and the collaborators replay consumes.
//!
//! A recording is a numbered sequence of segment files of identical size,
//! each holding an integral number of terms. Frames inside terms use the
//! same wire framing as the live publication, so replayed bytes are
//! byte-identical to what the publisher appended.

pub mod reader;

pub use reader::{RecordingReader, ReplayError};

use std::path::{Path, PathBuf};

/// Sentinel meaning "no position supplied"; replay starts at the
/// recording's start position.
pub const NULL_POSITION: i64 = -1;

/// Sentinel meaning "no length supplied"; replay runs to the recording's
/// stop (or tails a live recording indefinitely).
pub const NULL_LENGTH: i64 = -1;

/// Descriptor of one recording, as the catalog stores it.
#[derive(Clone, Debug)]
pub struct RecordingSummary {
    pub recording_id: i64,
    pub start_position: i64,
    pub stop_position: i64,
    pub initial_term_id: i32,
    pub stream_id: i32,
    /// Term size in bytes; a power of two.
    pub term_length: usize,
    /// Segment file size in bytes; a power-of-two multiple of the term
    /// length.
    pub segment_length: usize,
}

/// Consumed contract: the catalog's durable view of recordings.
pub trait Catalog {
    /// Durable stop position of a recording.
    fn stop_position(&self, recording_id: i64) -> i64;
}

/// Consumed contract: the live position counter a recording's writer
/// publishes. The counter is updated only after frames are committed, so
/// reads up to its value are already durable.
pub trait RecordingPosition {
    /// Latest durable position.
    fn get(&self) -> i64;

    /// Whether the recording has terminated.
    fn is_closed(&self) -> bool;
}

/// File name of one recording segment.
pub fn segment_file_name(recording_id: i64, segment_index: usize) -> String {
    format!("{}-{}.rec", recording_id, segment_index)
}

/// Path of one recording segment under `archive_dir`.
pub fn segment_file_path(archive_dir: &Path, recording_id: i64, segment_index: usize) -> PathBuf {
    archive_dir.join(segment_file_name(recording_id, segment_index))
}

/// Number of bit positions to shift when dividing or multiplying by the
/// term length.
pub fn position_bits_to_shift(term_length: usize) -> u32 {
    debug_assert!(term_length.is_power_of_two());
    term_length.trailing_zeros()
}

/// Start of the term containing `start_position`; segment files begin on
/// term boundaries.
pub fn start_term_base_position(start_position: i64, term_length: usize) -> i64 {
    start_position - (start_position & (term_length as i64 - 1))
}

/// Index of the segment file containing `position`.
pub fn segment_file_index(
    start_position: i64,
    position: i64,
    term_length: usize,
    segment_length: usize,
) -> usize {
    let base = start_term_base_position(start_position, term_length);
    ((position - base) / segment_length as i64) as usize
}
