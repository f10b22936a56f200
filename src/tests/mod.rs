//! End-to-end scenarios driving a full [`crate::demux::Demuxer`] against
//! hand-built packet streams, as opposed to the per-module unit tests
//! alongside each file.

mod scenarios;
