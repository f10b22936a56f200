//! Clock engine: PCR ingestion, per-program clock update, PCR-candidate
//! election, and the first-PCR fix-up, per §4.7.
//!
//! Grounded on VLC's `ts.c` `PCRHandle`/`FindPCRCandidate` and
//! `ts_hotfixes.c`'s video-end sweep before a PCR update.

use crate::psi::pmt::{PcrState, Pmt};
use crate::stream_types::Category;
use crate::timestamp::wrap_correct;

/// Updates a program's PCR state with a newly extracted, not-yet-wrapped
/// 33-bit PCR base (already converted to microseconds by the caller).
///
/// Returns `true` on the program's very first PCR, the signal the driver
/// uses to flush the stream's pre-PCR queues (§4.6 "Pre-PCR queue").
pub fn update_program_pcr(pcr: &mut PcrState, raw_us: i64) -> bool {
    let corrected = wrap_correct(pcr.first, raw_us);
    if pcr.current.is_none() {
        pcr.first = Some(corrected);
        pcr.current = Some(corrected);
        true
    } else {
        pcr.current = Some(corrected);
        false
    }
}

/// One PID's observed PCR/stream statistics, the input to candidate election.
#[derive(Debug, Clone, Copy)]
pub struct CandidateStats {
    pub pid: u16,
    pub pcr_count: u32,
    pub category: Category,
}

/// Elects the PCR-candidate PID: highest PCR count; ties broken by video
/// over audio over the current default (the last element of `candidates`
/// with an equal count is treated as "current default" and wins ties,
/// matching a "last one standing" reduce).
pub fn elect_pcr_candidate(candidates: &[CandidateStats], current_default: Option<u16>) -> Option<u16> {
    fn rank(c: &CandidateStats, current_default: Option<u16>) -> (u32, u8) {
        let tie_break = match c.category {
            Category::Video => 2,
            Category::Audio => 1,
            _ => 0,
        };
        let default_bonus = if Some(c.pid) == current_default { 1 } else { 0 };
        (c.pcr_count, tie_break + default_bonus)
    }
    candidates
        .iter()
        .max_by_key(|c| rank(c, current_default))
        .map(|c| c.pid)
}

/// §4.7's first-PCR fix-up: once `elapsed_dts_us` has passed on a PID with
/// no PCR from the declared PCR source, decide the next PCR strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupOutcome {
    /// Keep waiting; not enough time has elapsed yet.
    Wait,
    /// Elect this PID as the new PCR source.
    ElectCandidate(u16),
    /// No usable PCR source exists anywhere; synthesise from DTS.
    DisablePermanently,
}

pub const FIRST_PCR_FIXUP_THRESHOLD_US: i64 = 500_000;

pub fn first_pcr_fixup(
    elapsed_dts_us: i64,
    declared_pcr_pid_count: u32,
    candidates: &[CandidateStats],
    current_default: Option<u16>,
) -> FixupOutcome {
    if elapsed_dts_us < FIRST_PCR_FIXUP_THRESHOLD_US || declared_pcr_pid_count > 0 {
        return FixupOutcome::Wait;
    }
    match elect_pcr_candidate(candidates, current_default) {
        Some(pid) => {
            let elected_count = candidates.iter().find(|c| c.pid == pid).map(|c| c.pcr_count).unwrap_or(0);
            if elected_count > 0 {
                FixupOutcome::ElectCandidate(pid)
            } else {
                FixupOutcome::DisablePermanently
            }
        }
        None => FixupOutcome::DisablePermanently,
    }
}

/// Synthesises a PCR value from a DTS when PCR is permanently disabled,
/// applying the configurable decode-buffering offset (§4.7, default 120 ms).
pub fn generate_pcr_from_dts(dts_us: i64, dpb_offset_us: i64) -> i64 {
    dts_us - dpb_offset_us
}

/// §4.6's fixed-padding PCR/DTS offset correction: a block whose DTS lands
/// before the current PCR by more than the legitimate jitter window gets a
/// permanent correction added to the program's `pcroffset`.
pub fn measure_pcr_offset_correction(dts_us: i64, pcr_current_us: i64, fixed_padding_us: i64) -> Option<i64> {
    if dts_us < pcr_current_us {
        Some(fixed_padding_us)
    } else {
        None
    }
}

/// Sweeps a program's queued-but-ungathered video for an end-of-sequence
/// marker (MPEG-2/H.264/VC-1 trailing `00 00 01 B7|0A`) whose DTS has
/// already been passed by `incoming_pcr_us`, per §4.7's pre-update sweep.
/// Returns the indices (into `queue`) that should be drained immediately to
/// avoid stalling A/V sync.
pub fn video_end_sweep(queue: &[(i64, [u8; 4])], incoming_pcr_us: i64) -> Vec<usize> {
    queue
        .iter()
        .enumerate()
        .filter(|(_, (dts, tail))| *dts <= incoming_pcr_us && is_video_end_marker(tail))
        .map(|(i, _)| i)
        .collect()
}

fn is_video_end_marker(tail: &[u8; 4]) -> bool {
    tail[0] == 0x00 && tail[1] == 0x00 && tail[2] == 0x01 && matches!(tail[3], 0xB7 | 0x0A)
}

/// Applies `update_program_pcr` to `pmt.pcr`, returning whether this was the
/// program's first PCR.
pub fn apply_to_program(pmt: &mut Pmt, raw_us: i64) -> bool {
    update_program_pcr(&mut pmt.pcr, raw_us)
}
