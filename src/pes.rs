//! PES header parsing: sync code, stream ID, optional header with
//! PTS/DTS, and the handful of codec-specific extra-header skips (AC-3/DTS
//! substream id, LPCM header, MPEG-4 SUBT length).
//!
//! Grounded on `mpegts-io::pes`'s `PESHeader`/`PESOptionalHeader` bitfields
//! and VLC's `ts_pes.c` `ParsePESHeader`.

use log::warn;
use modular_bitfield_msb::prelude::*;

use crate::error::{DemuxError, Result};
use crate::slice_reader::SliceReader;
use crate::timestamp::wrap_correct;

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PesHeader {
    pub start_code: B24,
    pub stream_id: B8,
    pub packet_length: B16,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PesOptionalHeader {
    pub marker_bits: B2,
    pub scrambling_control: B2,
    pub priority: bool,
    pub data_alignment_indicator: bool,
    pub copyright: bool,
    pub original: bool,
    pub has_pts: bool,
    pub has_dts: bool,
    pub escr: bool,
    pub es_rate: bool,
    pub dsm_trick_mode: bool,
    pub has_additional_copy_info: bool,
    pub has_crc: bool,
    pub has_extension: bool,
    pub additional_header_length: B8,
}

pub const START_CODE: u32 = 0x00_0001;

/// Stream IDs that never carry an optional header (padding / private without PTS/DTS framing).
pub fn has_optional_header(stream_id: u8) -> bool {
    !matches!(stream_id, 0xBC | 0xBE | 0xBF | 0xF0 | 0xF1 | 0xFF | 0xF2 | 0xF8)
}

/// A parsed PES header plus the offset its payload begins at within the
/// gathered byte chain.
#[derive(Debug)]
pub struct PesHeaderInfo {
    pub stream_id: u8,
    pub declared_length: u16,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub payload_offset: usize,
}

/// Parses a PTS or DTS field: `0010`/`0001`/`0011` marker nibble, then
/// 3+1+15+1+15+1 = 33 bits of timestamp interleaved with three marker bits.
pub fn parse_timestamp(b: [u8; 5]) -> u64 {
    let mut v: u64 = ((b[0] as u64 & 0x0E) >> 1) << 30;
    v |= (b[1] as u64) << 22;
    v |= ((b[2] as u64 & 0xFE) >> 1) << 15;
    v |= (b[3] as u64) << 7;
    v |= (b[4] as u64 & 0xFE) >> 1;
    v
}

/// Parses the PES header at the start of `reader`, which must be positioned
/// right after the `00 00 01` start code has already been confirmed by the
/// caller (the gatherer, which needs to see the start code itself to locate
/// unit boundaries).
pub fn parse_pes_header(reader: &mut SliceReader) -> Result<PesHeaderInfo> {
    let header_bytes = reader.read_array_ref::<6>()?;
    let header = PesHeader::from_bytes(header_bytes);
    if header.start_code() != START_CODE {
        return Err(DemuxError::BadPesHeader(reader.location()));
    }
    let stream_id = header.stream_id();
    let declared_length = header.packet_length();

    let mut pts = None;
    let mut dts = None;
    let mut consumed = 0usize;

    if has_optional_header(stream_id) {
        let optional_bytes = reader.read_array_ref::<3>()?;
        let optional = PesOptionalHeader::from_bytes(optional_bytes);
        let additional_length = optional.additional_header_length() as usize;
        consumed = 3 + additional_length;
        let mut sub = reader.new_sub_reader(additional_length)?;

        if optional.has_pts() {
            if sub.remaining_len() < 5 {
                warn!("short read of PTS in PES header");
                return Err(DemuxError::BadPesHeader(sub.location()));
            }
            pts = Some(parse_timestamp(sub.read_array_ref::<5>()?));
        }
        if optional.has_dts() {
            if sub.remaining_len() < 5 {
                warn!("short read of DTS in PES header");
                return Err(DemuxError::BadPesHeader(sub.location()));
            }
            dts = Some(parse_timestamp(sub.read_array_ref::<5>()?));
        }
        // ESCR, ES-rate, trick-mode, additional-copy, CRC, and extension
        // fields are present per the flag bits but never consulted
        // downstream, so we simply let `sub`'s drop skip past them.
    }

    Ok(PesHeaderInfo {
        stream_id,
        declared_length,
        pts,
        dts,
        payload_offset: 6 + consumed,
    })
}

/// Applies wrap correction to a PTS/DTS field against the program's last
/// known PCR, per §4.6's "applies wrap correction against the program's PCR".
pub fn correct_timestamp(pcr_reference_us: Option<i64>, raw_ticks_90k: u64) -> i64 {
    wrap_correct(pcr_reference_us, crate::timestamp::to_micros(raw_ticks_90k))
}

/// Skips codec-specific extra header bytes that sit between the PES
/// optional header and the actual elementary payload: AC-3/DTS substream
/// id (4 bytes), LPCM header (4 bytes), MPEG-4 SUBT length field (2 bytes).
pub fn codec_extra_header_len(fourcc: &[u8; 4], stream_id: u8) -> usize {
    match fourcc {
        b"ac-3" | b"eac3" | b"dts " if stream_id == 0xBD => 4,
        b"lpcm" => 4,
        b"subt" => 2,
        _ => 0,
    }
}
