//! Error taxonomy for the demuxer's public, unrecoverable failures.
//!
//! Recoverable conditions (malformed sections, refcount collisions, broken
//! DTS) are never represented here: they are logged via [`log::warn!`] and
//! turned into a state reset by the caller instead of aborting the parse.

use std::fmt;

/// Byte index within the packet or section an error was detected at.
pub type Location = usize;

/// Errors that abort the current `parse`/`read_more` call.
#[derive(Debug)]
pub enum DemuxError {
    /// Packet-size detection failed against the probed window.
    NotTransportStream,
    /// Mid-stream re-synchronization exhausted its search window.
    LostSync,
    /// The byte source returned fewer bytes than a complete packet needs.
    ShortRead,
    /// A [`SliceReader`](crate::slice_reader::SliceReader) read past the end of its slice.
    PacketOverrun(Location, usize),
    /// Adaptation field length or PCR/OPCR framing was inconsistent.
    BadAdaptationField(Location),
    /// PSI pointer field, header, or table-syntax framing was inconsistent.
    BadPsiHeader(Location),
    /// A PSI section failed its CRC32 check.
    PsiCrcMismatch,
    /// PES header or optional-header framing was inconsistent.
    BadPesHeader(Location),
    /// A PID was requested for a role incompatible with its current role.
    PidRoleConflict { pid: u16 },
    /// Two PAT entries referenced the same PMT PID with different program numbers.
    DuplicateProgramPid { pid: u16 },
}

impl fmt::Display for DemuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DemuxError::NotTransportStream => write!(f, "could not detect TS packet framing"),
            DemuxError::LostSync => write!(f, "lost sync byte and could not resynchronize"),
            DemuxError::ShortRead => write!(f, "short read from byte source"),
            DemuxError::PacketOverrun(loc, len) => {
                write!(f, "read of {len} bytes overran packet at offset {loc}")
            }
            DemuxError::BadAdaptationField(loc) => {
                write!(f, "malformed adaptation field at offset {loc}")
            }
            DemuxError::BadPsiHeader(loc) => write!(f, "malformed PSI header at offset {loc}"),
            DemuxError::PsiCrcMismatch => write!(f, "PSI section failed CRC32 check"),
            DemuxError::BadPesHeader(loc) => write!(f, "malformed PES header at offset {loc}"),
            DemuxError::PidRoleConflict { pid } => {
                write!(f, "PID {pid:#x} already bound to an incompatible role")
            }
            DemuxError::DuplicateProgramPid { pid } => {
                write!(f, "PAT lists PMT PID {pid:#x} for more than one program")
            }
        }
    }
}

impl std::error::Error for DemuxError {}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DemuxError>;
