//! Transport packet bit layout, size detection, and sync recovery.
//!
//! The header/adaptation-field bitfields follow `mpegts-io`'s
//! `modular-bitfield-msb` idiom (`PacketHeader`, `AdaptationFieldHeader`);
//! the framing/resync logic is new, grounded on VLC's `ts.c`
//! `Detect`/`ReadPacket` pair.

use crate::error::{DemuxError, Result};
use crate::slice_reader::SliceReader;
use modular_bitfield_msb::prelude::*;

/// TSC information carried in a packet's header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BitfieldSpecifier)]
#[bits = 2]
pub enum TransportScramblingControl {
    NotScrambled,
    Reserved,
    ScrambledEvenKey,
    ScrambledOddKey,
}

/// Link-layer header found at the start of every 188-byte packet.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub sync_byte: B8,
    pub transport_error_indicator: bool,
    pub payload_unit_start_indicator: bool,
    pub transport_priority: bool,
    pub pid: B13,
    pub transport_scrambling_control: TransportScramblingControl,
    pub adaptation_field_control: B2,
    pub continuity_counter: B4,
}

impl PacketHeader {
    pub fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control() & 0b10 != 0
    }

    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control() & 0b01 != 0
    }

    /// True when AFC is `00` (reserved) or `10` (adaptation field only, no
    /// payload): the "humax" workaround in `ts_hotfixes.c` suppresses
    /// continuity-counter advancement for these, since several muxers stall
    /// the counter between real payload packets.
    pub fn is_cc_exempt(&self) -> bool {
        matches!(self.adaptation_field_control(), 0b00 | 0b10)
    }
}

/// Adaptation-field flag byte, following the 1-byte length.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct AdaptationFieldHeader {
    pub discontinuity_indicator: bool,
    pub random_access_indicator: bool,
    pub elementary_stream_priority_indicator: bool,
    pub pcr_flag: bool,
    pub opcr_flag: bool,
    pub splicing_point_flag: bool,
    pub transport_private_data_flag: bool,
    pub adaptation_field_extension_flag: bool,
}

/// A 33-bit base / 9-bit extension Program Clock Reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcrTimestamp {
    /// 33 bits of 90 kHz base clock.
    pub base: u64,
    /// 9 bits of 27 MHz extension, rolling over every 300 counts into `base`.
    pub extension: u16,
}

impl PcrTimestamp {
    /// Base converted to microseconds, ignoring the sub-tick extension.
    pub fn micros(&self) -> i64 {
        crate::timestamp::to_micros(self.base)
    }
}

fn parse_pcr(b: [u8; 6]) -> PcrTimestamp {
    let mut base: u64 = (b[0] as u64) << 25;
    base |= (b[1] as u64) << 17;
    base |= (b[2] as u64) << 9;
    base |= (b[3] as u64) << 1;
    base |= (b[4] as u64) >> 7;

    let mut extension: u16 = ((b[4] & 0x1) as u16) << 8;
    extension |= b[5] as u16;
    PcrTimestamp { base, extension }
}

/// Parsed adaptation field: flags plus any PCR/OPCR it carries.
#[derive(Debug, Clone)]
pub struct AdaptationField {
    pub header: AdaptationFieldHeader,
    pub pcr: Option<PcrTimestamp>,
    pub opcr: Option<PcrTimestamp>,
}

pub(crate) fn read_adaptation_field(reader: &mut SliceReader) -> Result<Option<AdaptationField>> {
    let length = reader.read_u8()? as usize;
    if length == 0 {
        return Ok(None);
    }
    let mut a_reader = reader.new_sub_reader(length)?;
    let header_bytes = a_reader.read_array_ref::<1>()?;
    let header = AdaptationFieldHeader::from_bytes(header_bytes);

    let mut out = AdaptationField {
        header,
        pcr: None,
        opcr: None,
    };
    if out.header.pcr_flag() {
        if a_reader.remaining_len() < 6 {
            return Err(DemuxError::BadAdaptationField(a_reader.location()));
        }
        out.pcr = Some(parse_pcr(a_reader.read_array_ref::<6>()?));
    }
    if out.header.opcr_flag() {
        if a_reader.remaining_len() < 6 {
            return Err(DemuxError::BadAdaptationField(a_reader.location()));
        }
        out.opcr = Some(parse_pcr(a_reader.read_array_ref::<6>()?));
    }
    // Splice countdown, transport private data, and adaptation field
    // extension are skipped; nothing downstream of this crate needs them.
    Ok(out.into())
}

pub const SYNC_BYTE: u8 = 0x47;
pub const PID_NULL: u16 = 0x1FFF;

/// Packet size + pre-header framing discovered by [`detect_packet_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    /// 188, 192, or 204.
    pub packet_size: usize,
    /// 4 for BluRay-style 192-byte streams with a leading timestamp, else 0.
    pub header_prefix: usize,
}

impl FrameShape {
    /// Total bytes consumed per packet, including any pre-header.
    pub fn stride(&self) -> usize {
        self.packet_size + self.header_prefix
    }
}

const CANDIDATE_SIZES: [usize; 3] = [188, 192, 204];

/// Discovers packet framing by scanning for a sync byte that recurs at a
/// constant stride three times in a row.
///
/// `window` must hold at least `4 * 204` bytes peeked from offset 0 of the
/// byte source (including any "TFrc" Topfield prefix already stripped by
/// the caller).
pub fn detect_packet_size(window: &[u8], force_188: bool) -> Result<FrameShape> {
    let scan_len = window.len().min(204);
    for start in 0..scan_len {
        if window[start] != SYNC_BYTE {
            continue;
        }
        for &k in &CANDIDATE_SIZES {
            if matches_at_stride(window, start, k, 3) {
                let header_prefix = if k == 192 && start == 4 { 4 } else { 0 };
                return Ok(FrameShape {
                    packet_size: 188,
                    header_prefix: if k == 188 { 0 } else { header_prefix.max(k - 188) },
                }
                .normalize(k));
            }
        }
    }
    if force_188 {
        return Ok(FrameShape {
            packet_size: 188,
            header_prefix: 0,
        });
    }
    Err(DemuxError::NotTransportStream)
}

impl FrameShape {
    // `k` is the full on-wire stride (188/192/204); the payload we hand
    // callers is always the 188-byte TS packet plus any BluRay pre-header.
    fn normalize(self, k: usize) -> Self {
        match k {
            188 => FrameShape {
                packet_size: 188,
                header_prefix: 0,
            },
            192 => FrameShape {
                packet_size: 188,
                header_prefix: 4,
            },
            204 => FrameShape {
                packet_size: 188,
                header_prefix: 0,
            },
            _ => unreachable!(),
        }
    }
}

fn matches_at_stride(window: &[u8], start: usize, stride: usize, checks: usize) -> bool {
    for i in 1..=checks {
        match window.get(start + i * stride) {
            Some(&b) if b == SYNC_BYTE => continue,
            _ => return false,
        }
    }
    true
}

/// Length of the BluRay "TFrc" Topfield recording header, if present.
pub fn topfield_prefix_len(window: &[u8]) -> Option<usize> {
    if window.len() >= 7 && &window[0..4] == b"TFrc" && window[6] == 0 {
        Some(3712)
    } else {
        None
    }
}

/// Scans up to `max_packets` worth of bytes for two sync bytes spaced
/// exactly `stride` apart, returning the byte offset of the first one.
///
/// Used after a read failure or a bad sync byte to recover framing without
/// assuming the corruption is exactly one packet wide.
pub fn resync(buf: &[u8], stride: usize, max_packets: usize) -> Option<usize> {
    let limit = (max_packets * stride).min(buf.len().saturating_sub(stride));
    (0..=limit).find(|&offset| buf[offset] == SYNC_BYTE && buf.get(offset + stride) == Some(&SYNC_BYTE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_stream(packet_size: usize, header_prefix: usize, count: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..count {
            out.extend(std::iter::repeat(0u8).take(header_prefix));
            out.push(SYNC_BYTE);
            out.extend(std::iter::repeat((i % 255) as u8).take(packet_size - 1));
        }
        out
    }

    #[test]
    fn detects_188() {
        let stream = make_stream(188, 0, 4);
        let shape = detect_packet_size(&stream, false).unwrap();
        assert_eq!(shape, FrameShape { packet_size: 188, header_prefix: 0 });
    }

    #[test]
    fn detects_204_with_reed_solomon_suffix() {
        let stream = make_stream(204, 0, 4);
        let shape = detect_packet_size(&stream, false).unwrap();
        assert_eq!(shape.packet_size, 188);
        assert_eq!(shape.header_prefix, 0);
    }

    #[test]
    fn detects_bluray_192_with_4_byte_prefix() {
        let stream = make_stream(192, 4, 4);
        let shape = detect_packet_size(&stream, false).unwrap();
        assert_eq!(shape, FrameShape { packet_size: 188, header_prefix: 4 });
    }

    #[test]
    fn fails_without_force_flag_on_garbage() {
        let garbage = vec![0xAAu8; 4 * 204];
        assert!(matches!(
            detect_packet_size(&garbage, false),
            Err(DemuxError::NotTransportStream)
        ));
    }

    #[test]
    fn forces_188_when_requested() {
        let garbage = vec![0xAAu8; 4 * 204];
        let shape = detect_packet_size(&garbage, true).unwrap();
        assert_eq!(shape.packet_size, 188);
    }

    #[test]
    fn resync_finds_sync_pair_after_garbage() {
        let mut buf = vec![0xFFu8; 200];
        buf[200..].to_vec();
        buf.extend(vec![0u8; 0]);
        let mut stream = vec![0xFFu8; 200];
        stream.push(SYNC_BYTE);
        stream.extend(std::iter::repeat(0u8).take(187));
        stream.push(SYNC_BYTE);
        stream.extend(std::iter::repeat(0u8).take(187));
        let offset = resync(&stream, 188, 10).unwrap();
        assert_eq!(offset, 200);
    }
}
