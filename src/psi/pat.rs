//! PAT parsing and the program-list replacement algorithm.
//!
//! Grounded on VLC's `ts_psi.c` `PATCallBack` (snapshot/append/decref
//! pattern) and `mpegts-io::psi`'s `PatEntry` bitfield.

use std::collections::BTreeMap;

use log::warn;
use modular_bitfield_msb::prelude::*;

use crate::error::{DemuxError, Result};
use crate::pid::{PidKind, PidPayload, PidTable};
use crate::psi::section::Section;
use crate::slice_reader::SliceReader;

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PatEntryHeader {
    pub program_number: B16,
    pub reserved: B3,
    pub program_map_pid: B13,
}

/// Current Program Association Table state for the session.
#[derive(Debug, Default)]
pub struct Pat {
    /// `program_number -> pmt_pid`.
    pub programs: BTreeMap<u16, u16>,
    pub version: Option<u8>,
    pub ts_id: u16,
    /// True once this table was synthesised by the missing-PAT fix-up
    /// rather than observed on the wire.
    pub generated: bool,
}

/// One entry parsed out of a PAT section body.
#[derive(Debug, Clone, Copy)]
struct ParsedEntry {
    program_number: u16,
    pmt_pid: u16,
}

fn parse_entries(body: &[u8]) -> Result<Vec<ParsedEntry>> {
    let mut reader = SliceReader::new(body);
    let mut entries = Vec::new();
    while reader.remaining_len() >= 4 {
        let bytes = reader.read_array_ref::<4>()?;
        let header = PatEntryHeader::from_bytes(bytes);
        entries.push(ParsedEntry {
            program_number: header.program_number(),
            pmt_pid: header.program_map_pid(),
        });
    }
    Ok(entries)
}

/// Outcome of [`apply_pat`], telling the caller which programs to
/// instantiate/tear down so it can drive PMT binding and sink notification.
#[derive(Debug, Default)]
pub struct PatDiff {
    /// Programs newly present (or re-pointed to a different PMT PID).
    pub added_or_changed: Vec<(u16, u16)>,
    /// Programs present in the old table but absent from the new one;
    /// their PMT PID (and transitively, ES PIDs) must be decref'd.
    pub removed: Vec<(u16, u16)>,
}

/// Applies a freshly parsed PAT section to `pat`/`pids`, implementing the
/// snapshot/append/decref sequence of §4.5. Returns `None` (no-op) when the
/// section matches the already-stored version and `ts_id` (invariant 3/7).
pub fn apply_pat(pat: &mut Pat, pids: &mut PidTable, section: &Section) -> Result<Option<PatDiff>> {
    debug_assert_eq!(section.table_id, 0x00);
    let ts_id = section.table_id_extension;
    if pat.version == Some(section.version) && pat.ts_id == ts_id && !pat.programs.is_empty() {
        return Ok(None);
    }

    let entries = parse_entries(&section.body)?;

    // Validate: no two entries may share the same PMT PID (Dreambox bug).
    let mut seen_pmt_pids = std::collections::HashSet::new();
    for e in &entries {
        if e.program_number == 0 {
            continue;
        }
        if !seen_pmt_pids.insert(e.pmt_pid) {
            warn!("PAT rejected: PMT PID {:#x} claimed by more than one program", e.pmt_pid);
            return Err(DemuxError::DuplicateProgramPid { pid: e.pmt_pid });
        }
    }

    let old_programs = pat.programs.clone();
    let mut new_programs = BTreeMap::new();
    let mut diff = PatDiff::default();

    for e in &entries {
        if e.program_number == 0 {
            continue; // Network Information Table pointer, not a program.
        }
        if let Some(&old_pid) = old_programs.get(&e.program_number) {
            if old_pid != e.pmt_pid {
                diff.added_or_changed.push((e.program_number, e.pmt_pid));
            }
        } else {
            diff.added_or_changed.push((e.program_number, e.pmt_pid));
        }
        if pids.setup(e.pmt_pid, PidKind::Pmt, || {
            PidPayload::Pmt(crate::psi::pmt::Pmt::new(e.program_number))
        }).is_err() {
            warn!("PAT entry for program {} wants PMT PID {:#x} already bound to another role", e.program_number, e.pmt_pid);
            continue;
        }
        new_programs.insert(e.program_number, e.pmt_pid);
    }

    for (&program_number, &old_pid) in &old_programs {
        if !new_programs.contains_key(&program_number) {
            diff.removed.push((program_number, old_pid));
        }
    }

    for (_, old_pid) in old_programs {
        pids.release(old_pid);
    }

    pat.programs = new_programs;
    pat.version = Some(section.version);
    pat.ts_id = ts_id;
    pat.generated = false;

    Ok(Some(diff))
}
