//! Replay of a segmented on-disk recording.
//!
//! # Visibility Contract
//!
//! - A reader never delivers bytes past `stop_position`. For a live
//!   recording that bound comes from the writer's position counter, which
//!   is advanced only after frames are committed, so everything below it is
//!   durable.
//! - A reader owns at most one mapped segment at a time; the mapping is
//!   released on segment advance, on reaching the replay limit, on close,
//!   and on every construction failure after mapping succeeded.
//! - `close` is idempotent and safe on a partially constructed reader.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use thiserror::Error;

use crate::codec::{
    align, frame_flags, frame_length, frame_reserved_value, frame_stream_id, frame_term_id,
    frame_term_offset, frame_type, FRAME_ALIGNMENT, HEADER_LENGTH,
};

use super::{
    position_bits_to_shift, segment_file_index, segment_file_path, start_term_base_position,
    Catalog, RecordingPosition, RecordingSummary, NULL_LENGTH, NULL_POSITION,
};

/// Errors raised when constructing or advancing a replay.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay length must be positive, was {0}")]
    InvalidLength(i64),

    #[error("position {position} is after current recording position {current}")]
    PositionAheadOfRecording { position: i64, current: i64 },

    #[error("position {0} not aligned to a valid fragment")]
    NotFrameAligned(i64),

    #[error("failed to open recording segment file {path:?}")]
    MissingSegmentFile { path: PathBuf },

    #[error("segment file {path:?} is {actual} bytes, expected at least {expected}")]
    TruncatedSegmentFile { path: PathBuf, actual: usize, expected: usize },

    #[error("io error on recording segment: {0}")]
    Io(#[from] std::io::Error),
}

/// Walks a recording term by term, delivering frames to a handler.
///
/// Created per replay request. The handler receives
/// `(term_buffer, data_offset, data_length, frame_type, flags,
/// reserved_value)` for each frame, padding frames included.
pub struct RecordingReader {
    catalog: Arc<dyn Catalog>,
    live_position: Option<Arc<dyn RecordingPosition>>,
    archive_dir: PathBuf,
    recording_id: i64,
    stream_id: i32,
    term_length: usize,
    segment_length: usize,
    mapped_segment: Option<Mmap>,
    stop_position: i64,
    replay_position: i64,
    replay_limit: i64,
    term_offset: usize,
    term_base_segment_offset: usize,
    segment_file_index: usize,
    is_done: bool,
}

impl std::fmt::Debug for RecordingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingReader")
            .field("archive_dir", &self.archive_dir)
            .field("recording_id", &self.recording_id)
            .field("stream_id", &self.stream_id)
            .field("term_length", &self.term_length)
            .field("segment_length", &self.segment_length)
            .field("stop_position", &self.stop_position)
            .field("replay_position", &self.replay_position)
            .field("replay_limit", &self.replay_limit)
            .field("term_offset", &self.term_offset)
            .field("term_base_segment_offset", &self.term_base_segment_offset)
            .field("segment_file_index", &self.segment_file_index)
            .field("is_done", &self.is_done)
            .finish()
    }
}

impl RecordingReader {
    /// Open a replay of `summary` starting at `position` for `length`
    /// bytes.
    ///
    /// `position == NULL_POSITION` starts at the recording's start;
    /// `length == NULL_LENGTH` replays to the stop position, or tails
    /// indefinitely when a live counter is supplied.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        summary: &RecordingSummary,
        archive_dir: &Path,
        position: i64,
        length: i64,
        live_position: Option<Arc<dyn RecordingPosition>>,
    ) -> Result<Self, ReplayError> {
        let term_length = summary.term_length;
        let segment_length = summary.segment_length;

        let stop_position = match &live_position {
            Some(counter) => counter.get(),
            None => summary.stop_position,
        };

        let start_position = summary.start_position;
        let from_position = if position == NULL_POSITION { start_position } else { position };
        let max_length = match &live_position {
            Some(_) => i64::MAX - from_position,
            None => stop_position - from_position,
        };

        let replay_length = if length == NULL_LENGTH { max_length } else { length.min(max_length) };
        if replay_length < 0 {
            return Err(ReplayError::InvalidLength(replay_length));
        }

        if let Some(counter) = &live_position {
            let current_position = counter.get();
            if current_position < from_position {
                return Err(ReplayError::PositionAheadOfRecording {
                    position: from_position,
                    current: current_position,
                });
            }
        }

        let position_bits = position_bits_to_shift(term_length);
        let term_base = start_term_base_position(start_position, term_length);
        let segment_offset = ((from_position - term_base) & (segment_length as i64 - 1)) as usize;
        let term_id = (from_position >> position_bits) as i32 + summary.initial_term_id;
        let term_offset = (from_position & (term_length as i64 - 1)) as usize;

        let mut reader = RecordingReader {
            catalog,
            live_position,
            archive_dir: archive_dir.to_path_buf(),
            recording_id: summary.recording_id,
            stream_id: summary.stream_id,
            term_length,
            segment_length,
            mapped_segment: None,
            stop_position,
            replay_position: from_position,
            replay_limit: from_position + replay_length,
            term_offset,
            term_base_segment_offset: segment_offset - term_offset,
            segment_file_index: segment_file_index(
                start_position,
                from_position,
                term_length,
                segment_length,
            ),
            is_done: false,
        };

        reader.open_segment()?;

        // Starting mid-recording must land on a frame boundary: the header
        // there has to agree on term offset, term id, and stream id. Exempt
        // when positioned exactly at the end, where no frame exists yet and
        // a tailer may legitimately start.
        if from_position > start_position && from_position != stop_position {
            let term = reader.term();
            if frame_term_offset(term, term_offset) != term_offset as i32
                || frame_term_id(term, term_offset) != term_id
                || frame_stream_id(term, term_offset) != reader.stream_id
            {
                reader.close();
                return Err(ReplayError::NotFrameAligned(from_position));
            }
        }

        Ok(reader)
    }

    /// Deliver up to `fragment_limit` frames to `handler`.
    ///
    /// Returns the number of fragments delivered; 0 when tailing a live
    /// recording with no new data or once the replay is done.
    pub fn poll<H>(&mut self, handler: &mut H, fragment_limit: usize) -> Result<usize, ReplayError>
    where
        H: FnMut(&[u8], usize, usize, u16, u8, i64),
    {
        let mut fragments = 0;

        if self.is_done {
            return Ok(fragments);
        }

        if self.live_position.is_some()
            && self.replay_position == self.stop_position
            && self.no_new_data()
        {
            return Ok(fragments);
        }

        while self.replay_position < self.stop_position && fragments < fragment_limit {
            if self.term_offset == self.term_length {
                self.next_term()?;
            }

            let frame_offset = self.term_offset;
            let term = self.term();
            let frame_length = frame_length(term, frame_offset) as usize;
            let frame_type = frame_type(term, frame_offset);
            let flags = frame_flags(term, frame_offset);
            let reserved_value = frame_reserved_value(term, frame_offset);

            let aligned_length = align(frame_length, FRAME_ALIGNMENT);
            let data_offset = frame_offset + HEADER_LENGTH;
            let data_length = frame_length - HEADER_LENGTH;

            handler(term, data_offset, data_length, frame_type, flags, reserved_value);

            self.replay_position += aligned_length as i64;
            self.term_offset += aligned_length;
            fragments += 1;

            if self.replay_position >= self.replay_limit {
                self.is_done = true;
                tracing::debug!(
                    recording_id = self.recording_id,
                    replay_position = self.replay_position,
                    "replay done"
                );
                self.close_segment();
                break;
            }
        }

        Ok(fragments)
    }

    #[inline]
    pub fn recording_id(&self) -> i64 {
        self.recording_id
    }

    #[inline]
    pub fn replay_position(&self) -> i64 {
        self.replay_position
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.is_done
    }

    /// Release the mapped segment. Idempotent.
    pub fn close(&mut self) {
        self.close_segment();
    }

    /// Current term slice of the mapped segment.
    ///
    /// # Panics
    /// Panics if no segment is mapped; callers hold the mapping invariant.
    fn term(&self) -> &[u8] {
        let segment = match &self.mapped_segment {
            Some(segment) => segment,
            None => panic!("no mapped segment"),
        };
        &segment[self.term_base_segment_offset..self.term_base_segment_offset + self.term_length]
    }

    /// Refresh the stop position from the live counter or, once the
    /// recording has stopped, from the catalog. Returns true when there is
    /// nothing new to read.
    ///
    /// When the recording has stopped the replay limit is lowered before
    /// any new data is reported, so a poll can never over-read past the
    /// final stop.
    fn no_new_data(&mut self) -> bool {
        let counter = match &self.live_position {
            Some(counter) => counter,
            None => return true,
        };

        let current_recording_position = counter.get();
        let has_recording_stopped = counter.is_closed();
        let new_stop_position = if has_recording_stopped {
            self.catalog.stop_position(self.recording_id)
        } else {
            current_recording_position
        };

        if has_recording_stopped && new_stop_position < self.replay_limit {
            self.replay_limit = new_stop_position;
        }

        if self.replay_position >= self.replay_limit {
            self.is_done = true;
        } else if new_stop_position > self.stop_position {
            self.stop_position = new_stop_position;
            return false;
        }

        true
    }

    /// Advance to the next term, crossing into the next segment file when
    /// the current one is exhausted.
    fn next_term(&mut self) -> Result<(), ReplayError> {
        self.term_offset = 0;
        self.term_base_segment_offset += self.term_length;

        if self.term_base_segment_offset == self.segment_length {
            self.close_segment();
            self.segment_file_index += 1;
            self.open_segment()?;
            self.term_base_segment_offset = 0;
        }

        Ok(())
    }

    fn open_segment(&mut self) -> Result<(), ReplayError> {
        let path = segment_file_path(&self.archive_dir, self.recording_id, self.segment_file_index);
        if !path.exists() {
            return Err(ReplayError::MissingSegmentFile { path });
        }

        let file = File::open(&path)?;
        // SAFETY: segments are immutable once their frames are committed and
        // the reader never goes past the committed stop position, so the
        // mapping is never read where a writer could still be active.
        let mapped = unsafe { Mmap::map(&file)? };
        if mapped.len() < self.segment_length {
            return Err(ReplayError::TruncatedSegmentFile {
                path,
                actual: mapped.len(),
                expected: self.segment_length,
            });
        }

        tracing::trace!(
            recording_id = self.recording_id,
            segment_file_index = self.segment_file_index,
            "mapped recording segment"
        );
        self.mapped_segment = Some(mapped);
        Ok(())
    }

    fn close_segment(&mut self) {
        self.mapped_segment = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FRAME_TYPE_DATA, FRAME_TYPE_PAD};
    use crate::transport::loopback::LoopbackPublication;
    use crate::transport::Publication;
    use std::fs;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use tempfile::TempDir;

    const RECORDING_ID: i64 = 1;
    const STREAM_ID: i32 = 100;
    const TERM_LENGTH: usize = 1024;
    const SEGMENT_LENGTH: usize = 1024;

    struct TestCatalog {
        stop: AtomicI64,
    }

    impl TestCatalog {
        fn new(stop: i64) -> Arc<Self> {
            Arc::new(TestCatalog { stop: AtomicI64::new(stop) })
        }

        fn set_stop(&self, stop: i64) {
            self.stop.store(stop, Ordering::Release);
        }
    }

    impl Catalog for TestCatalog {
        fn stop_position(&self, _recording_id: i64) -> i64 {
            self.stop.load(Ordering::Acquire)
        }
    }

    struct TestCounter {
        position: AtomicI64,
        closed: AtomicBool,
    }

    impl TestCounter {
        fn new(position: i64) -> Arc<Self> {
            Arc::new(TestCounter { position: AtomicI64::new(position), closed: AtomicBool::new(false) })
        }

        fn set(&self, position: i64) {
            self.position.store(position, Ordering::Release);
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    impl RecordingPosition for TestCounter {
        fn get(&self) -> i64 {
            self.position.load(Ordering::Acquire)
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    /// One delivered fragment, captured for assertions.
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Fragment {
        data: Vec<u8>,
        frame_type: u16,
        flags: u8,
        reserved_value: i64,
    }

    fn collector(fragments: &mut Vec<Fragment>) -> impl FnMut(&[u8], usize, usize, u16, u8, i64) + '_ {
        |buffer, data_offset, data_length, frame_type, flags, reserved_value| {
            fragments.push(Fragment {
                data: buffer[data_offset..data_offset + data_length].to_vec(),
                frame_type,
                flags,
                reserved_value,
            })
        }
    }

    /// Append `count` records of `payload_length` bytes, then dump the term
    /// buffers into segment files under `dir`. Returns the final position.
    fn write_recording(dir: &Path, count: usize, payload_length: usize) -> i64 {
        let mut publication = LoopbackPublication::new(7, STREAM_ID, 0, TERM_LENGTH, 256);
        for i in 0..count {
            publication.set_reserved_value(i as i64);
            let payload = vec![i as u8 + 1; payload_length];
            assert!(publication.offer(&payload) > 0);
        }
        dump_segments(dir, &publication);
        publication.position()
    }

    fn dump_segments(dir: &Path, publication: &LoopbackPublication) {
        let terms_per_segment = SEGMENT_LENGTH / TERM_LENGTH;
        for (segment_index, chunk) in publication.terms().chunks(terms_per_segment).enumerate() {
            let mut bytes = Vec::with_capacity(SEGMENT_LENGTH);
            for term in chunk {
                bytes.extend_from_slice(term);
            }
            bytes.resize(SEGMENT_LENGTH, 0);
            fs::write(segment_file_path(dir, RECORDING_ID, segment_index), bytes).unwrap();
        }
    }

    fn summary(stop_position: i64) -> RecordingSummary {
        RecordingSummary {
            recording_id: RECORDING_ID,
            start_position: 0,
            stop_position,
            initial_term_id: 0,
            stream_id: STREAM_ID,
            term_length: TERM_LENGTH,
            segment_length: SEGMENT_LENGTH,
        }
    }

    #[test]
    fn test_completed_replay_delivers_exact_frames() {
        let dir = TempDir::new().unwrap();
        // 8 frames of 256 aligned bytes: two full terms, two segment files.
        let stop = write_recording(dir.path(), 8, 224);
        assert_eq!(stop, 2048);

        let mut reader = RecordingReader::new(
            TestCatalog::new(stop),
            &summary(stop),
            dir.path(),
            NULL_POSITION,
            NULL_LENGTH,
            None,
        )
        .unwrap();

        let mut fragments = Vec::new();
        let delivered = reader.poll(&mut collector(&mut fragments), 100).unwrap();

        assert_eq!(delivered, 8);
        assert!(reader.is_done());
        assert_eq!(reader.replay_position(), stop);
        for (i, fragment) in fragments.iter().enumerate() {
            assert_eq!(fragment.frame_type, FRAME_TYPE_DATA);
            assert_eq!(fragment.data, vec![i as u8 + 1; 224]);
            assert_eq!(fragment.reserved_value, i as i64);
        }
    }

    #[test]
    fn test_fragment_limit_bounds_delivery() {
        let dir = TempDir::new().unwrap();
        let stop = write_recording(dir.path(), 8, 224);

        let mut reader = RecordingReader::new(
            TestCatalog::new(stop),
            &summary(stop),
            dir.path(),
            NULL_POSITION,
            NULL_LENGTH,
            None,
        )
        .unwrap();

        let mut fragments = Vec::new();
        assert_eq!(reader.poll(&mut collector(&mut fragments), 3).unwrap(), 3);
        assert_eq!(reader.replay_position(), 3 * 256);
        assert_eq!(reader.poll(&mut collector(&mut fragments), 3).unwrap(), 3);
        assert_eq!(reader.poll(&mut collector(&mut fragments), 3).unwrap(), 2);
        assert_eq!(fragments.len(), 8);
        assert!(reader.is_done());
    }

    #[test]
    fn test_replay_from_mid_recording_frame_boundary() {
        let dir = TempDir::new().unwrap();
        let stop = write_recording(dir.path(), 8, 224);

        let mut reader = RecordingReader::new(
            TestCatalog::new(stop),
            &summary(stop),
            dir.path(),
            512,
            NULL_LENGTH,
            None,
        )
        .unwrap();

        let mut fragments = Vec::new();
        let delivered = reader.poll(&mut collector(&mut fragments), 100).unwrap();
        assert_eq!(delivered, 6);
        assert_eq!(fragments[0].data, vec![3; 224]);
    }

    #[test]
    fn test_misaligned_position_rejected() {
        let dir = TempDir::new().unwrap();
        let stop = write_recording(dir.path(), 8, 224);

        let result = RecordingReader::new(
            TestCatalog::new(stop),
            &summary(stop),
            dir.path(),
            288,
            NULL_LENGTH,
            None,
        );

        assert!(matches!(result, Err(ReplayError::NotFrameAligned(288))));
    }

    #[test]
    fn test_position_at_stop_exempt_from_alignment_check() {
        let dir = TempDir::new().unwrap();
        let stop = write_recording(dir.path(), 8, 224);
        // Pre-allocated empty segment past the end, as a recorder would.
        fs::write(
            segment_file_path(dir.path(), RECORDING_ID, 2),
            vec![0u8; SEGMENT_LENGTH],
        )
        .unwrap();

        let counter = TestCounter::new(stop);
        let mut reader = RecordingReader::new(
            TestCatalog::new(stop),
            &summary(stop),
            dir.path(),
            stop,
            NULL_LENGTH,
            Some(counter),
        )
        .unwrap();

        let mut fragments = Vec::new();
        assert_eq!(reader.poll(&mut collector(&mut fragments), 100).unwrap(), 0);
        assert!(!reader.is_done());
    }

    #[test]
    fn test_negative_replay_length_rejected() {
        let dir = TempDir::new().unwrap();
        let stop = write_recording(dir.path(), 8, 224);

        let result = RecordingReader::new(
            TestCatalog::new(stop),
            &summary(stop),
            dir.path(),
            stop + 1024,
            NULL_LENGTH,
            None,
        );

        assert!(matches!(result, Err(ReplayError::InvalidLength(_))));
    }

    #[test]
    fn test_position_ahead_of_live_counter_rejected() {
        let dir = TempDir::new().unwrap();
        write_recording(dir.path(), 8, 224);

        let counter = TestCounter::new(100);
        let result = RecordingReader::new(
            TestCatalog::new(0),
            &summary(0),
            dir.path(),
            512,
            NULL_LENGTH,
            Some(counter),
        );

        assert!(matches!(
            result,
            Err(ReplayError::PositionAheadOfRecording { position: 512, current: 100 })
        ));
    }

    #[test]
    fn test_missing_segment_file_named_in_error() {
        let dir = TempDir::new().unwrap();

        let result = RecordingReader::new(
            TestCatalog::new(1024),
            &summary(1024),
            dir.path(),
            NULL_POSITION,
            NULL_LENGTH,
            None,
        );

        match result {
            Err(ReplayError::MissingSegmentFile { path }) => {
                assert!(path.to_string_lossy().ends_with("1-0.rec"));
            }
            other => panic!("expected MissingSegmentFile, got {:?}", other),
        }
    }

    #[test]
    fn test_length_clamps_replay_limit() {
        let dir = TempDir::new().unwrap();
        let stop = write_recording(dir.path(), 8, 224);

        let mut reader = RecordingReader::new(
            TestCatalog::new(stop),
            &summary(stop),
            dir.path(),
            NULL_POSITION,
            512,
            None,
        )
        .unwrap();

        let mut fragments = Vec::new();
        assert_eq!(reader.poll(&mut collector(&mut fragments), 100).unwrap(), 2);
        assert!(reader.is_done());
        assert_eq!(reader.replay_position(), 512);

        // Done: further polls deliver nothing.
        assert_eq!(reader.poll(&mut collector(&mut fragments), 100).unwrap(), 0);
    }

    #[test]
    fn test_live_tail_follows_position_counter() {
        let dir = TempDir::new().unwrap();
        let stop = write_recording(dir.path(), 8, 224);
        assert_eq!(stop, 2048);

        let catalog = TestCatalog::new(0);
        let counter = TestCounter::new(512);
        let mut reader = RecordingReader::new(
            catalog.clone(),
            &summary(0),
            dir.path(),
            NULL_POSITION,
            NULL_LENGTH,
            Some(counter.clone()),
        )
        .unwrap();

        // Only the two durable frames are visible.
        let mut fragments = Vec::new();
        assert_eq!(reader.poll(&mut collector(&mut fragments), 100).unwrap(), 2);
        assert_eq!(reader.replay_position(), 512);

        // Caught up, no new data.
        assert_eq!(reader.poll(&mut collector(&mut fragments), 100).unwrap(), 0);
        assert!(!reader.is_done());

        // The writer advances; the next poll crosses into the second
        // segment and drains the rest.
        counter.set(2048);
        assert_eq!(reader.poll(&mut collector(&mut fragments), 100).unwrap(), 6);
        assert_eq!(reader.replay_position(), 2048);
        assert!(!reader.is_done());

        // The recording stops: the limit is lowered and the replay is done.
        counter.close();
        catalog.set_stop(2048);
        assert_eq!(reader.poll(&mut collector(&mut fragments), 100).unwrap(), 0);
        assert!(reader.is_done());
        assert_eq!(reader.replay_position(), 2048);
        assert_eq!(fragments.len(), 8);
    }

    #[test]
    fn test_live_stop_below_limit_never_over_reads() {
        let dir = TempDir::new().unwrap();
        write_recording(dir.path(), 8, 224);

        let catalog = TestCatalog::new(0);
        let counter = TestCounter::new(256);
        let mut reader = RecordingReader::new(
            catalog.clone(),
            &summary(0),
            dir.path(),
            NULL_POSITION,
            NULL_LENGTH,
            Some(counter.clone()),
        )
        .unwrap();

        let mut fragments = Vec::new();
        assert_eq!(reader.poll(&mut collector(&mut fragments), 100).unwrap(), 1);

        // Counter closes while also reporting growth: the lowered limit
        // must win over the new data.
        counter.set(768);
        counter.close();
        catalog.set_stop(512);
        let delivered = reader.poll(&mut collector(&mut fragments), 100).unwrap();
        assert_eq!(delivered, 1, "must not read past the final stop");
        assert!(reader.is_done());
        assert_eq!(reader.replay_position(), 512);
    }

    #[test]
    fn test_padding_frames_delivered_with_type() {
        let dir = TempDir::new().unwrap();

        // Three 288-byte frames leave a 160-byte padding frame at the term
        // end, then one frame in the next term.
        let mut publication = LoopbackPublication::new(7, STREAM_ID, 0, TERM_LENGTH, 256);
        for _ in 0..4 {
            assert!(publication.offer(&[0x42; 256]) > 0);
        }
        dump_segments(dir.path(), &publication);
        let stop = publication.position();
        assert_eq!(stop, 1024 + 288);

        let mut reader = RecordingReader::new(
            TestCatalog::new(stop),
            &summary(stop),
            dir.path(),
            NULL_POSITION,
            NULL_LENGTH,
            None,
        )
        .unwrap();

        let mut fragments = Vec::new();
        assert_eq!(reader.poll(&mut collector(&mut fragments), 100).unwrap(), 5);
        assert_eq!(fragments[3].frame_type, FRAME_TYPE_PAD);
        assert_eq!(fragments[4].frame_type, FRAME_TYPE_DATA);
        assert!(reader.is_done());
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let stop = write_recording(dir.path(), 8, 224);

        let mut reader = RecordingReader::new(
            TestCatalog::new(stop),
            &summary(stop),
            dir.path(),
            NULL_POSITION,
            NULL_LENGTH,
            None,
        )
        .unwrap();

        reader.close();
        reader.close();
    }
}
