//! Program Specific Information: section reassembly plus the PAT/PMT/SI table processors.

pub mod pat;
pub mod pmt;
pub mod section;
pub mod si;
