//! Missing-PAT fix-up: synthesises PAT+PMT sections from observed streams
//! when no PAT has been seen for `MIN_PAT_INTERVAL`, per §4.9.
//!
//! Grounded on VLC's `ts.c` `GenerateBogusPAT`/`PATCallback` fallback path.

use crc::{Crc, CRC_32_MPEG_2};

use crate::probe::ProbeResult;
use crate::stream_types::Category;

const CRC32_MPEG2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// One second of elapsed DTS with no PAT observed triggers synthesis (§4.9).
pub const MIN_PAT_INTERVAL_US: i64 = 1_000_000;

/// First PMT PID tried for a synthesised PAT; incremented on collision.
pub const FIRST_SYNTHETIC_PMT_PID: u16 = 1337;

/// Synthesised program number, a fixed sentinel the original uses.
pub const SYNTHETIC_PROGRAM_NUMBER: u16 = 1234;

/// Picks a free PMT PID starting at [`FIRST_SYNTHETIC_PMT_PID`], skipping
/// any already occupied (per `is_occupied`).
pub fn allocate_synthetic_pmt_pid(is_occupied: impl Fn(u16) -> bool) -> u16 {
    let mut pid = FIRST_SYNTHETIC_PMT_PID;
    while is_occupied(pid) && pid < crate::pid::MAX_ES_PID {
        pid += 1;
    }
    pid
}

/// Selects the PCR PID candidate for a synthesised program: first PID with
/// any PCR, else the audio PID with the highest DTS count, else any PID
/// with DTS, else any seen PID (§4.9's fallback chain).
pub fn select_synthetic_pcr_pid(probes: &[(u16, ProbeResult)]) -> Option<u16> {
    if let Some((pid, _)) = probes.iter().find(|(_, p)| p.pcr_count > 0) {
        return Some(*pid);
    }
    if let Some((pid, _)) = probes
        .iter()
        .filter(|(_, p)| p.category == Some(Category::Audio) && p.dts_count > 0)
        .max_by_key(|(_, p)| p.dts_count)
    {
        return Some(*pid);
    }
    if let Some((pid, _)) = probes.iter().find(|(_, p)| p.dts_count > 0) {
        return Some(*pid);
    }
    probes.first().map(|(pid, _)| *pid)
}

fn section_syntax_bytes(version: u8, section_num: u8, last_section_num: u8) -> [u8; 3] {
    [
        0b1100_0000 | (version << 1) | 1,
        section_num,
        last_section_num,
    ]
}

/// Builds a complete, CRC-sealed PAT section pointing the synthetic program
/// at `pmt_pid`.
pub fn build_synthetic_pat(ts_id: u16, pmt_pid: u16) -> Vec<u8> {
    let mut syntax = Vec::new();
    syntax.extend_from_slice(&ts_id.to_be_bytes());
    syntax.extend_from_slice(&section_syntax_bytes(0, 0, 0));
    syntax.extend_from_slice(&SYNTHETIC_PROGRAM_NUMBER.to_be_bytes());
    syntax.extend_from_slice(&(0xE000 | pmt_pid).to_be_bytes());

    seal_section(0x00, syntax)
}

/// Builds a complete, CRC-sealed PMT section enumerating every probed PID
/// with a detected codec, preserving each PID's observed `stream_id`.
pub fn build_synthetic_pmt(pcr_pid: u16, probes: &[(u16, ProbeResult)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());
    body.extend_from_slice(&0u16.to_be_bytes()); // program_info_length = 0

    for (pid, probe) in probes {
        let Some(stream_type) = probe.stream_type else {
            continue;
        };
        body.push(stream_type);
        body.extend_from_slice(&(0xE000 | pid).to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes()); // es_info_length = 0
    }

    let mut syntax = Vec::new();
    syntax.extend_from_slice(&SYNTHETIC_PROGRAM_NUMBER.to_be_bytes());
    syntax.extend_from_slice(&section_syntax_bytes(0, 0, 0));
    syntax.extend_from_slice(&body);

    seal_section(0x02, syntax)
}

fn seal_section(table_id: u8, syntax_and_body: Vec<u8>) -> Vec<u8> {
    let section_length = syntax_and_body.len() + 4;
    let mut out = Vec::with_capacity(3 + section_length);
    out.push(table_id);
    out.push(0x80 | ((section_length >> 8) as u8 & 0x0F));
    out.push(section_length as u8);
    out.extend_from_slice(&syntax_and_body);
    let crc = CRC32_MPEG2.checksum(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}
