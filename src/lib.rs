//! Core of a replicated-state-machine cluster built on a reliable
//! multicast log.
//!
//! Three tightly coupled subsystems:
//!
//! - [`cluster::LogPublisher`]: the leader-side encoder appending
//!   consensus events to a single ordered publication stream, with
//!   fragment-aligned self-describing log positions and bounded
//!   back-pressure retries.
//! - [`cluster::TimerService`]: a deterministic deadline timer wheel whose
//!   expiries are themselves replicated log events; an expiry only consumes
//!   its timer once the consensus agent has durably logged it.
//! - [`archive::RecordingReader`]: the replay engine walking a segmented
//!   on-disk recording through memory-mapped segments, honouring fragment
//!   alignment and tailing a still-growing recording without racing the
//!   writer.
//!
//! Consensus, transport configuration, and catalog management live above
//! this crate; the transport publication, the consensus agent, the catalog,
//! and the recording position counter are consumed as traits.

pub mod archive;
pub mod cluster;
pub mod codec;
pub mod transport;
