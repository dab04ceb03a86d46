//! In-process publication writing real frames into term buffers.
//!
//! `LoopbackPublication` implements the full framing contract (payload
//! fragmentation at `max_payload_length`, frame alignment, and padding
//! frames at term ends) over plain in-memory term buffers. Its terms are
//! byte-compatible with recording segments, so a replay can be driven
//! against exactly what a publisher appended without a network or an
//! archive process in between.
//!
//! Result injection exists so callers can exercise their back-pressure and
//! fatal-code handling deterministically.

use std::collections::VecDeque;

use crate::codec::{
    align, DataFrameHeader, FLAGS_UNFRAGMENTED, FLAG_BEGIN_FRAGMENT, FLAG_END_FRAGMENT,
    FRAME_ALIGNMENT, FRAME_TYPE_DATA, FRAME_TYPE_PAD, FRAME_VERSION, HEADER_LENGTH,
};

use super::{BufferClaim, Publication, CLOSED};

pub struct LoopbackPublication {
    session_id: i32,
    stream_id: i32,
    initial_term_id: i32,
    term_length: usize,
    max_payload_length: usize,
    /// Term buffers in order; the last is the active term. Buffers are
    /// pre-zeroed, so an unfinished term reads as zero frames past the tail.
    terms: Vec<Vec<u8>>,
    term_offset: usize,
    position: i64,
    reserved_value: i64,
    destinations: Vec<String>,
    injected_results: VecDeque<i64>,
    pending_claim_length: Option<usize>,
    is_closed: bool,
}

impl LoopbackPublication {
    /// # Panics
    /// Panics unless `term_length` is a power of two with room for at least
    /// one max-payload frame.
    pub fn new(
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        term_length: usize,
        max_payload_length: usize,
    ) -> Self {
        assert!(term_length.is_power_of_two(), "term length must be a power of two");
        assert!(
            align(max_payload_length + HEADER_LENGTH, FRAME_ALIGNMENT) <= term_length,
            "max payload frame must fit in a term"
        );

        LoopbackPublication {
            session_id,
            stream_id,
            initial_term_id,
            term_length,
            max_payload_length,
            terms: vec![vec![0u8; term_length]],
            term_offset: 0,
            position: 0,
            reserved_value: 0,
            destinations: Vec::new(),
            injected_results: VecDeque::new(),
            pending_claim_length: None,
            is_closed: false,
        }
    }

    /// All term buffers written so far, the active term last.
    pub fn terms(&self) -> &[Vec<u8>] {
        &self.terms
    }

    pub fn term_length(&self) -> usize {
        self.term_length
    }

    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    /// Value stamped into the reserved field of subsequent frames.
    pub fn set_reserved_value(&mut self, value: i64) {
        self.reserved_value = value;
    }

    /// Queue a status code to return from the next offer or claim attempt
    /// instead of writing.
    pub fn inject_result(&mut self, code: i64) {
        self.injected_results.push_back(code);
    }

    fn current_term_id(&self) -> i32 {
        self.initial_term_id + (self.terms.len() - 1) as i32
    }

    /// Pad out the active term (if anything remains) and start the next.
    fn rotate_term(&mut self) {
        let remaining = self.term_length - self.term_offset;
        if remaining > 0 {
            let header = DataFrameHeader {
                frame_length: remaining as i32,
                version: FRAME_VERSION,
                flags: FLAGS_UNFRAGMENTED,
                frame_type: FRAME_TYPE_PAD,
                term_offset: self.term_offset as i32,
                session_id: self.session_id,
                stream_id: self.stream_id,
                term_id: self.current_term_id(),
                reserved_value: 0,
            };
            let active = self.terms.len() - 1;
            header.encode(&mut self.terms[active], self.term_offset);
            self.position += remaining as i64;
        }

        self.terms.push(vec![0u8; self.term_length]);
        self.term_offset = 0;
    }

    /// Write one frame, rotating the term first if the frame cannot fit.
    fn write_frame(&mut self, flags: u8, parts: &[&[u8]]) {
        let payload_length: usize = parts.iter().map(|p| p.len()).sum();
        debug_assert!(payload_length <= self.max_payload_length);

        let frame_length = HEADER_LENGTH + payload_length;
        let aligned_length = align(frame_length, FRAME_ALIGNMENT);
        if self.term_offset + aligned_length > self.term_length {
            self.rotate_term();
        }

        let header = DataFrameHeader {
            frame_length: frame_length as i32,
            version: FRAME_VERSION,
            flags,
            frame_type: FRAME_TYPE_DATA,
            term_offset: self.term_offset as i32,
            session_id: self.session_id,
            stream_id: self.stream_id,
            term_id: self.current_term_id(),
            reserved_value: self.reserved_value,
        };

        let term_offset = self.term_offset;
        let active = self.terms.len() - 1;
        let term = &mut self.terms[active];
        header.encode(term, term_offset);
        let mut data_offset = term_offset + HEADER_LENGTH;
        for part in parts {
            term[data_offset..data_offset + part.len()].copy_from_slice(part);
            data_offset += part.len();
        }

        self.term_offset += aligned_length;
        self.position += aligned_length as i64;
    }

    fn offer_record(&mut self, parts: &[&[u8]]) -> i64 {
        if let Some(code) = self.injected_results.pop_front() {
            return code;
        }
        if self.is_closed {
            return CLOSED;
        }

        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total <= self.max_payload_length {
            self.write_frame(FLAGS_UNFRAGMENTED, parts);
        } else {
            let mut record = Vec::with_capacity(total);
            for part in parts {
                record.extend_from_slice(part);
            }

            let fragment_count = (total + self.max_payload_length - 1) / self.max_payload_length;
            for (i, chunk) in record.chunks(self.max_payload_length).enumerate() {
                let mut flags = 0u8;
                if i == 0 {
                    flags |= FLAG_BEGIN_FRAGMENT;
                }
                if i == fragment_count - 1 {
                    flags |= FLAG_END_FRAGMENT;
                }
                self.write_frame(flags, &[chunk]);
            }
        }

        self.position
    }
}

impl Publication for LoopbackPublication {
    fn position(&self) -> i64 {
        self.position
    }

    fn session_id(&self) -> i32 {
        self.session_id
    }

    fn max_payload_length(&self) -> usize {
        self.max_payload_length
    }

    fn offer(&mut self, buf: &[u8]) -> i64 {
        self.offer_record(&[buf])
    }

    fn offer_gather(&mut self, header: &[u8], payload: &[u8]) -> i64 {
        self.offer_record(&[header, payload])
    }

    fn try_claim(&mut self, length: usize, claim: &mut BufferClaim) -> i64 {
        assert!(length <= self.max_payload_length, "claim exceeds max payload length");

        if let Some(code) = self.injected_results.pop_front() {
            return code;
        }
        if self.is_closed {
            return CLOSED;
        }

        claim.prepare(length);
        self.pending_claim_length = Some(length);

        // Prospective position: padding for a term rotation, then the frame.
        let aligned_length = align(HEADER_LENGTH + length, FRAME_ALIGNMENT) as i64;
        let remaining = self.term_length - self.term_offset;
        let padding = if remaining < aligned_length as usize { remaining as i64 } else { 0 };
        self.position + padding + aligned_length
    }

    fn commit(&mut self, claim: &mut BufferClaim) -> i64 {
        let length = self
            .pending_claim_length
            .take()
            .expect("commit without outstanding claim");
        debug_assert_eq!(claim.buffer().len(), length);

        let bytes = claim.buffer().to_vec();
        self.write_frame(FLAGS_UNFRAGMENTED, &[&bytes]);
        claim.release();
        self.position
    }

    fn abort(&mut self, claim: &mut BufferClaim) {
        self.pending_claim_length = None;
        claim.release();
    }

    fn add_destination(&mut self, endpoint_uri: &str) {
        self.destinations.push(endpoint_uri.to_string());
    }

    fn remove_destination(&mut self, endpoint_uri: &str) {
        self.destinations.retain(|d| d != endpoint_uri);
    }

    fn close(&mut self) {
        if !self.is_closed {
            tracing::debug!(session_id = self.session_id, position = self.position, "publication closed");
            self.is_closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{frame_flags, frame_length, frame_term_id, frame_term_offset, frame_type};

    fn publication() -> LoopbackPublication {
        LoopbackPublication::new(7, 100, 0, 1024, 256)
    }

    #[test]
    fn test_offer_advances_position_by_aligned_frame() {
        let mut publication = publication();

        let result = publication.offer(&[0xAA; 100]);
        let aligned = align(HEADER_LENGTH + 100, FRAME_ALIGNMENT) as i64;
        assert_eq!(result, aligned);
        assert_eq!(publication.position(), aligned);

        let term = &publication.terms()[0];
        assert_eq!(frame_length(term, 0), (HEADER_LENGTH + 100) as i32);
        assert_eq!(frame_type(term, 0), FRAME_TYPE_DATA);
        assert_eq!(frame_flags(term, 0), FLAGS_UNFRAGMENTED);
        assert_eq!(frame_term_offset(term, 0), 0);
    }

    #[test]
    fn test_gather_offer_concatenates_ranges() {
        let mut publication = publication();

        publication.offer_gather(&[1, 2, 3, 4], &[5, 6]);
        let term = &publication.terms()[0];
        assert_eq!(frame_length(term, 0), (HEADER_LENGTH + 6) as i32);
        assert_eq!(&term[HEADER_LENGTH..HEADER_LENGTH + 6], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_large_record_fragments() {
        let mut publication = publication();

        // 600 bytes over 256-byte payloads: 256 + 256 + 88.
        let record = vec![0x5A; 600];
        let result = publication.offer(&record);

        let expected = 2 * (256 + HEADER_LENGTH) as i64 + align(88 + HEADER_LENGTH, FRAME_ALIGNMENT) as i64;
        assert_eq!(result, expected);

        let term = &publication.terms()[0];
        assert_eq!(frame_flags(term, 0), FLAG_BEGIN_FRAGMENT);
        let second = align(HEADER_LENGTH + 256, FRAME_ALIGNMENT);
        assert_eq!(frame_flags(term, second), 0);
        let third = 2 * second;
        assert_eq!(frame_flags(term, third), FLAG_END_FRAGMENT);
    }

    #[test]
    fn test_term_rotation_pads_remainder() {
        let mut publication = publication();

        // Three 288-byte frames leave 160 bytes; the next frame forces a
        // padding frame and a fresh term.
        for _ in 0..3 {
            publication.offer(&[0; 256]);
        }
        assert_eq!(publication.position(), 3 * 288);

        publication.offer(&[0; 256]);
        assert_eq!(publication.position(), 1024 + 288);
        assert_eq!(publication.terms().len(), 2);

        let first_term = &publication.terms()[0];
        assert_eq!(frame_type(first_term, 3 * 288), FRAME_TYPE_PAD);
        assert_eq!(frame_length(first_term, 3 * 288), 160);

        let second_term = &publication.terms()[1];
        assert_eq!(frame_type(second_term, 0), FRAME_TYPE_DATA);
        assert_eq!(frame_term_id(second_term, 0), 1);
    }

    #[test]
    fn test_claim_commit_writes_frame() {
        let mut publication = publication();
        let mut claim = BufferClaim::new();

        let result = publication.try_claim(24, &mut claim);
        assert_eq!(result, align(HEADER_LENGTH + 24, FRAME_ALIGNMENT) as i64);
        // Position does not move until commit.
        assert_eq!(publication.position(), 0);

        claim.buffer_mut().copy_from_slice(&[0x11; 24]);
        let committed = publication.commit(&mut claim);
        assert_eq!(committed, result);
        assert_eq!(publication.position(), result);
        assert!(!claim.is_claimed());

        let term = &publication.terms()[0];
        assert_eq!(frame_length(term, 0), (HEADER_LENGTH + 24) as i32);
        assert_eq!(&term[HEADER_LENGTH..HEADER_LENGTH + 24], &[0x11; 24]);
    }

    #[test]
    fn test_claim_abort_releases_reservation() {
        let mut publication = publication();
        let mut claim = BufferClaim::new();

        publication.try_claim(24, &mut claim);
        publication.abort(&mut claim);
        assert!(!claim.is_claimed());
        assert_eq!(publication.position(), 0);

        // The next offer lands at the original position.
        publication.offer(&[0; 8]);
        let term = &publication.terms()[0];
        assert_eq!(frame_term_offset(term, 0), 0);
    }

    #[test]
    fn test_injected_results_precede_writes() {
        let mut publication = publication();
        publication.inject_result(crate::transport::BACK_PRESSURED);

        assert_eq!(publication.offer(&[0; 8]), crate::transport::BACK_PRESSURED);
        assert_eq!(publication.position(), 0);

        assert!(publication.offer(&[0; 8]) > 0);
    }

    #[test]
    fn test_closed_publication_rejects_offers() {
        let mut publication = publication();
        publication.close();
        assert_eq!(publication.offer(&[0; 8]), CLOSED);
    }

    #[test]
    fn test_destinations_add_remove() {
        let mut publication = publication();
        publication.add_destination("aeron:udp?endpoint=host:40123");
        publication.add_destination("aeron:udp?endpoint=host:40124");
        publication.remove_destination("aeron:udp?endpoint=host:40123");
        assert_eq!(publication.destinations(), &["aeron:udp?endpoint=host:40124".to_string()]);
    }
}
