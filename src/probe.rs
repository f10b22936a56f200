//! Codec detection before a PMT arrives: payload sniffing for PID-fix-up
//! and the missing-PAT synthesis path, per §4.10.
//!
//! Grounded on VLC's `ts.c` `AddAndCreateES`/probe path that inspects the
//! first PES payload bytes on an as-yet-unbound PID.

use crate::stream_types::Category;

/// Accumulated probe observations for one PID, §3's "probe record".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProbeResult {
    pub pcr_count: u32,
    pub dts_count: u32,
    pub category: Option<Category>,
    /// A best-effort ISO/IEC 13818-1 `stream_type` guess, used only to fill
    /// in a synthetic PMT entry; never treated as wire-authoritative.
    pub stream_type: Option<u8>,
    /// Most recently observed raw DTS (or PTS when DTS is absent), in
    /// microseconds, uncorrected: no PCR reference exists yet to wrap
    /// against, since probing only happens on PIDs no program claims.
    pub last_dts_us: Option<i64>,
    /// Most recently observed PCR, in microseconds, uncorrected. Lets PCR
    /// candidate election compare activity across PIDs a program hasn't
    /// declared as its PCR source.
    pub last_pcr_us: Option<i64>,
}

fn detect_private_stream_1(first_bytes: &[u8]) -> Option<(Category, u8)> {
    if first_bytes.starts_with(&[0x7F, 0xFE, 0x80, 0x01]) {
        Some((Category::Audio, 0x82)) // DTS
    } else if first_bytes.starts_with(&[0x0B, 0x77]) {
        Some((Category::Audio, 0x81)) // E-AC-3 (carried under the AC-3 stream_type slot)
    } else {
        None
    }
}

fn detect_audio(first_bytes: &[u8]) -> Option<(Category, u8)> {
    if first_bytes.len() < 2 {
        return None;
    }
    if first_bytes[0] == 0xFF && first_bytes[1] & 0xF6 == 0xF0 {
        Some((Category::Audio, 0x0F)) // ADTS AAC
    } else if first_bytes[0] == 0xFF && first_bytes[1] & 0xE0 == 0xE0 {
        Some((Category::Audio, 0x03)) // MPEG audio
    } else {
        None
    }
}

fn detect_video(first_bytes: &[u8]) -> Option<(Category, u8)> {
    if first_bytes.starts_with(&[0x00, 0x00, 0x00, 0x01]) {
        Some((Category::Video, 0x1B)) // H.264
    } else if first_bytes.starts_with(&[0x00, 0x00, 0x01]) {
        Some((Category::Video, 0x02)) // MPEG video
    } else {
        None
    }
}

/// Inspects a PES header's `stream_id` and the first bytes of its payload
/// to guess a category/stream-type, updating `probe`.
pub fn observe_pes(probe: &mut ProbeResult, stream_id: u8, payload_start: &[u8]) {
    let detected = match stream_id {
        0xBD => detect_private_stream_1(payload_start),
        0xC0..=0xDF => detect_audio(payload_start),
        0xE0..=0xEF => detect_video(payload_start),
        _ => None,
    };
    if let Some((category, stream_type)) = detected {
        probe.category = Some(category);
        probe.stream_type = Some(stream_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_h264_from_video_stream_id() {
        let mut probe = ProbeResult::default();
        observe_pes(&mut probe, 0xE0, &[0x00, 0x00, 0x00, 0x01, 0x67]);
        assert_eq!(probe.category, Some(Category::Video));
        assert_eq!(probe.stream_type, Some(0x1B));
    }

    #[test]
    fn detects_mpeg_video_from_three_byte_start_code() {
        let mut probe = ProbeResult::default();
        observe_pes(&mut probe, 0xE0, &[0x00, 0x00, 0x01, 0xB3]);
        assert_eq!(probe.stream_type, Some(0x02));
    }

    #[test]
    fn detects_dts_under_private_stream_1() {
        let mut probe = ProbeResult::default();
        observe_pes(&mut probe, 0xBD, &[0x7F, 0xFE, 0x80, 0x01]);
        assert_eq!(probe.category, Some(Category::Audio));
        assert_eq!(probe.stream_type, Some(0x82));
    }

    #[test]
    fn detects_adts_aac() {
        let mut probe = ProbeResult::default();
        observe_pes(&mut probe, 0xC0, &[0xFF, 0xF1, 0x00]);
        assert_eq!(probe.stream_type, Some(0x0F));
    }

    #[test]
    fn unrecognized_payload_leaves_probe_untouched() {
        let mut probe = ProbeResult::default();
        observe_pes(&mut probe, 0xE0, &[0xAA, 0xBB]);
        assert_eq!(probe.category, None);
    }
}
