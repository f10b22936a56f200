//! Sparse PID registry: typed, reference-counted entities keyed by the
//! 13-bit transport PID.
//!
//! Modeled on VLC's `ts_pid_t`/`ts_pid_list_t` (`ts_pid.h`, `ts_pid.c`): a
//! tagged-union payload per PID, a refcount governing lifetime, and an
//! append-to-new-list/decref-old-list transfer discipline so a shared PID
//! never observes refcount zero mid-transition.

use std::collections::BTreeMap;

use crate::error::{DemuxError, Result};

/// Lowest PID an elementary stream may be bound to; below this the space is
/// reserved for PSI/PSIP tables (`ts_pid.h`'s `MIN_ES_PID`).
pub const MIN_ES_PID: u16 = 4;
/// Highest usable PID; `0x1FFF` is reserved for the null packet.
pub const MAX_ES_PID: u16 = 8190;

pub const PAT_PID: u16 = 0x0000;
pub const CAT_PID: u16 = 0x0001;
pub const ATSC_BASE_PID: u16 = 0x1FFB;
pub const SDT_PID: u16 = 0x0011;
pub const NULL_PID: u16 = 0x1FFF;

const REFCOUNT_MAX: u16 = u16::MAX;

/// The role a PID currently plays in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PidKind {
    Free,
    Cat,
    Pat,
    Pmt,
    Stream,
    Si,
    Psip,
}

bitflags::bitflags! {
    pub struct PidFlags: u8 {
        const SEEN = 0b001;
        const SCRAMBLED = 0b010;
        const FILTERED = 0b100;
    }
}

pub use crate::probe::ProbeResult as ProbeInfo;

/// Duplicate/transport-error discrimination state for continuity checking.
#[derive(Debug, Clone, Default)]
pub struct ContinuityState {
    pub continuity_counter: Option<u8>,
    pub duplicate_count: u32,
    pub prev_last_16_bytes: Option<[u8; 16]>,
}

impl ContinuityState {
    /// Outcome of continuity checking for a packet carrying `cc` and whose
    /// first 16 payload bytes are `first_16` (when short, zero-padded by the
    /// caller). `exempt` marks AFC values the "humax" workaround skips.
    pub fn check(&mut self, cc: u8, first_16: Option<[u8; 16]>, exempt: bool) -> ContinuityOutcome {
        if exempt {
            return ContinuityOutcome::Normal;
        }
        let outcome = match self.continuity_counter {
            None => ContinuityOutcome::Normal,
            Some(prev) if prev == cc => {
                if self.prev_last_16_bytes == first_16 {
                    ContinuityOutcome::Duplicate
                } else {
                    ContinuityOutcome::TransportError
                }
            }
            Some(prev) if (prev + 1) & 0xF == cc => ContinuityOutcome::Normal,
            Some(_) => ContinuityOutcome::Discontinuity,
        };
        if outcome == ContinuityOutcome::Duplicate {
            self.duplicate_count += 1;
        } else {
            self.continuity_counter = Some(cc);
            self.prev_last_16_bytes = first_16;
        }
        outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuityOutcome {
    Normal,
    Duplicate,
    TransportError,
    Discontinuity,
}

/// Kind-specific payload held by an occupied PID entry.
#[derive(Debug)]
pub enum PidPayload {
    None,
    Pat(crate::psi::pat::Pat),
    Pmt(crate::psi::pmt::Pmt),
    Stream(crate::gather::StreamState),
    Si(crate::psi::si::SiState),
    Psip,
}

/// One slot of the PID registry.
#[derive(Debug)]
pub struct PidEntry {
    pub pid: u16,
    pub kind: PidKind,
    pub refcount: u16,
    pub flags: PidFlags,
    pub continuity: ContinuityState,
    pub probe: ProbeInfo,
    pub payload: PidPayload,
}

impl PidEntry {
    fn free(pid: u16) -> Self {
        Self {
            pid,
            kind: PidKind::Free,
            refcount: 0,
            flags: PidFlags::empty(),
            continuity: ContinuityState::default(),
            probe: ProbeInfo::default(),
            payload: PidPayload::None,
        }
    }
}

/// The sparse `pid -> entry` map plus the three always-present slots.
#[derive(Debug)]
pub struct PidTable {
    entries: BTreeMap<u16, PidEntry>,
}

impl PidTable {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(PAT_PID, PidEntry {
            kind: PidKind::Pat,
            refcount: 1,
            payload: PidPayload::Pat(crate::psi::pat::Pat::default()),
            ..PidEntry::free(PAT_PID)
        });
        entries.insert(ATSC_BASE_PID, PidEntry::free(ATSC_BASE_PID));
        entries.insert(NULL_PID, PidEntry::free(NULL_PID));
        Self { entries }
    }

    pub fn get(&self, pid: u16) -> Option<&PidEntry> {
        self.entries.get(&pid)
    }

    pub fn get_mut(&mut self, pid: u16) -> Option<&mut PidEntry> {
        self.entries.get_mut(&pid)
    }

    fn entry_or_free(&mut self, pid: u16) -> &mut PidEntry {
        self.entries.entry(pid).or_insert_with(|| PidEntry::free(pid))
    }

    /// Binds `pid` to `kind`, incrementing its refcount. A PID currently
    /// `Free` is allocated fresh; a PID already of the same `kind` simply
    /// gains a reference; any other combination is a [`DemuxError::PidRoleConflict`].
    pub fn setup(&mut self, pid: u16, kind: PidKind, payload: impl FnOnce() -> PidPayload) -> Result<()> {
        let entry = self.entry_or_free(pid);
        match entry.kind {
            PidKind::Free => {
                entry.kind = kind;
                entry.refcount = 1;
                entry.payload = payload();
                Ok(())
            }
            existing if existing == kind => {
                if entry.refcount < REFCOUNT_MAX {
                    entry.refcount += 1;
                }
                Ok(())
            }
            _ => Err(DemuxError::PidRoleConflict { pid }),
        }
    }

    /// Decrements `pid`'s refcount; at zero, tears down the payload and
    /// restores `Free`. PAT is pinned and never released this way.
    pub fn release(&mut self, pid: u16) {
        if pid == PAT_PID {
            return;
        }
        let Some(entry) = self.entries.get_mut(&pid) else {
            return;
        };
        if entry.refcount == 0 {
            return;
        }
        entry.refcount -= 1;
        if entry.refcount == 0 {
            let sub_pids = sub_pids_owned_by(&entry.payload);
            entry.kind = PidKind::Free;
            entry.payload = PidPayload::None;
            entry.flags.remove(PidFlags::FILTERED);
            for sub in sub_pids {
                self.release(sub);
            }
        }
    }

    pub fn mark_seen(&mut self, pid: u16) {
        self.entry_or_free(pid).flags.insert(PidFlags::SEEN);
    }

    /// True when `pid` lies in the range ES binding is permitted in, per the
    /// original's defensive `MIN_ES_PID`/`MAX_ES_PID` bound.
    pub fn is_valid_es_pid(pid: u16) -> bool {
        (MIN_ES_PID..=MAX_ES_PID).contains(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PidEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PidEntry> {
        self.entries.values_mut()
    }
}

impl Default for PidTable {
    fn default() -> Self {
        Self::new()
    }
}

fn sub_pids_owned_by(payload: &PidPayload) -> Vec<u16> {
    match payload {
        PidPayload::Pmt(pmt) => pmt.owned_sub_pids(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pat_pid_starts_pinned() {
        let table = PidTable::new();
        let pat = table.get(PAT_PID).unwrap();
        assert_eq!(pat.kind, PidKind::Pat);
        assert_eq!(pat.refcount, 1);
    }

    #[test]
    fn release_never_drops_pat_below_one() {
        let mut table = PidTable::new();
        table.release(PAT_PID);
        table.release(PAT_PID);
        assert_eq!(table.get(PAT_PID).unwrap().refcount, 1);
    }

    #[test]
    fn setup_on_free_pid_allocates_with_refcount_one() {
        let mut table = PidTable::new();
        table.setup(0x100, PidKind::Pmt, || PidPayload::Pmt(crate::psi::pmt::Pmt::new(1))).unwrap();
        let entry = table.get(0x100).unwrap();
        assert_eq!(entry.kind, PidKind::Pmt);
        assert_eq!(entry.refcount, 1);
    }

    #[test]
    fn setup_on_matching_kind_increments_refcount() {
        let mut table = PidTable::new();
        table.setup(0x100, PidKind::Pmt, || PidPayload::Pmt(crate::psi::pmt::Pmt::new(1))).unwrap();
        table.setup(0x100, PidKind::Pmt, || unreachable!()).unwrap();
        assert_eq!(table.get(0x100).unwrap().refcount, 2);
    }

    #[test]
    fn setup_on_mismatched_kind_conflicts() {
        let mut table = PidTable::new();
        table.setup(0x100, PidKind::Pmt, || PidPayload::Pmt(crate::psi::pmt::Pmt::new(1))).unwrap();
        let err = table.setup(0x100, PidKind::Stream, || unreachable!()).unwrap_err();
        assert!(matches!(err, DemuxError::PidRoleConflict { pid: 0x100 }));
    }

    #[test]
    fn release_to_zero_frees_entry() {
        let mut table = PidTable::new();
        table.setup(0x100, PidKind::Pmt, || PidPayload::Pmt(crate::psi::pmt::Pmt::new(1))).unwrap();
        table.release(0x100);
        let entry = table.get(0x100).unwrap();
        assert_eq!(entry.kind, PidKind::Free);
        assert_eq!(entry.refcount, 0);
    }

    #[test]
    fn refcount_matches_program_sharing_invariant() {
        // invariant 2: refcount(x) == |{programs referencing x}|
        let mut table = PidTable::new();
        table.setup(0x200, PidKind::Stream, || PidPayload::Stream(Default::default())).unwrap();
        table.setup(0x200, PidKind::Stream, || unreachable!()).unwrap();
        assert_eq!(table.get(0x200).unwrap().refcount, 2);
        table.release(0x200);
        assert_eq!(table.get(0x200).unwrap().refcount, 1);
        table.release(0x200);
        assert_eq!(table.get(0x200).unwrap().kind, PidKind::Free);
    }

    #[test]
    fn continuity_detects_duplicate_and_transport_error() {
        let mut cc = ContinuityState::default();
        assert_eq!(cc.check(3, Some([1; 16]), false), ContinuityOutcome::Normal);
        assert_eq!(cc.check(3, Some([1; 16]), false), ContinuityOutcome::Duplicate);
        assert_eq!(cc.check(3, Some([2; 16]), false), ContinuityOutcome::TransportError);
        assert_eq!(cc.check(4, Some([2; 16]), false), ContinuityOutcome::Normal);
    }

    #[test]
    fn cc_exempt_afc_never_flags_discontinuity() {
        let mut cc = ContinuityState::default();
        cc.check(3, None, false);
        assert_eq!(cc.check(9, None, true), ContinuityOutcome::Normal);
    }
}
