//! PES gathering: the per-stream state machine that turns a run of TS
//! packets into complete PES byte chains, then parsed [`EsBlock`]s.
//!
//! Grounded on VLC's `ts_pes.c` (`ts_pes_Push`, `ts_pes_Gather`,
//! `FindNextPESHeader`'s bit-flow trick, `block_Split`) — `mpegts-io`'s own
//! `pes.rs` parses one in-memory PES and does not gather across packets, so
//! this state machine is new code written in `mpegts-io`'s struct-of-buffers,
//! explicit-state style.

use smallvec::SmallVec;

use crate::error::Result;
use crate::pes::{codec_extra_header_len, correct_timestamp, parse_pes_header};

/// Per-stream transport mode, selecting how its payload is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    #[default]
    Pes,
    Sections,
    Ignore,
}

/// A fully reassembled, timestamped elementary-stream block ready for the sink.
#[derive(Debug, Clone)]
pub struct EsBlock {
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub discontinuity: bool,
    pub random_access: bool,
}

/// Gather state internal to one PES assembly in progress.
#[derive(Debug, Default)]
struct GatherBuf {
    buf: Vec<u8>,
    active: bool,
    /// `None` while active means "declared size 0: unbounded".
    declared_size: Option<usize>,
}

/// Per-stream-PID state: gather buffer, saved cross-packet bytes, pre-PCR
/// queue, and the flags carried from discontinuity/random-access packets to
/// the next emitted block.
#[derive(Debug, Default)]
pub struct StreamState {
    pub transport_mode: TransportMode,
    /// Per-stream policy switch of §4.6: unreliable unit-start, multiple
    /// PES headers per packet, located by scanning rather than trusting PUSI.
    pub broken_pusi_conformance: bool,
    gather: GatherBuf,
    saved: SmallVec<[u8; 5]>,
    pub pre_pcr_queue: Vec<EsBlock>,
    pub last_dts: Option<i64>,
    pending_discontinuity: bool,
    pending_random_access: bool,
}

/// Locates the next `00 00 01` start code at or after `from`, using the bit
/// flow trick of `ts_pes.c`'s `FindNextPESHeader`: a 3-bit shift register
/// tracks "was this byte zero", and a start code is recognised when the two
/// bytes before the current one were both zero and the current one is 0x01.
fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    let mut state: u8 = 0;
    for i in from..data.len() {
        state = (state << 1) | (data[i] == 0) as u8;
        if state & 0x6 == 0x6 && data[i] == 0x01 {
            return Some(i - 2);
        }
    }
    None
}

impl StreamState {
    /// Feeds one TS packet's payload. `scrambled` forces an immediate flush
    /// and discard (§4.6 "handling scrambled packets"); `discontinuity`
    /// flushes and invalidates the declared size of whatever follows;
    /// `random_access` marks the next emitted block. Returns every PES byte
    /// chain completed by this call, oldest first.
    pub fn push(
        &mut self,
        payload: &[u8],
        unit_start: bool,
        scrambled: bool,
        discontinuity: bool,
        random_access: bool,
    ) -> Vec<Vec<u8>> {
        if random_access {
            self.pending_random_access = true;
        }

        if scrambled {
            let mut out = Vec::new();
            if let Some(flushed) = self.flush() {
                out.push(flushed);
            }
            return out;
        }

        if discontinuity {
            self.pending_discontinuity = true;
            if let Some(flushed) = self.flush() {
                return self.continue_push(payload, unit_start, vec![flushed]);
            }
        }

        self.continue_push(payload, unit_start, Vec::new())
    }

    fn continue_push(&mut self, payload: &[u8], unit_start: bool, mut out: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut owned;
        let mut data: &[u8] = payload;
        if !self.saved.is_empty() {
            owned = self.saved.to_vec();
            owned.extend_from_slice(payload);
            self.saved.clear();
            data = &owned[..];
        }

        let mut offset = 0usize;
        let mut first = true;
        loop {
            if self.gather.active && self.gather.declared_size.is_none() {
                // Unbounded gather: the only flush trigger is the next unit
                // start (§4.6, invariant 10).
                let new_start = if self.broken_pusi_conformance {
                    find_start_code(data, offset)
                } else if first && unit_start && data.len() - offset >= 6 && data[offset..offset + 3] == [0, 0, 1] {
                    Some(offset)
                } else {
                    None
                };
                if let Some(new_start) = new_start {
                    if new_start > offset {
                        self.gather.buf.extend_from_slice(&data[offset..new_start]);
                    }
                    out.push(std::mem::take(&mut self.gather.buf));
                    self.gather.active = false;
                    self.gather.declared_size = None;
                    offset = new_start;
                }
            }

            if !self.gather.active {
                let start = if self.broken_pusi_conformance {
                    find_start_code(data, offset)
                } else if first && unit_start {
                    (data.len() >= 6 && data[offset..offset + 3] == [0, 0, 1]).then_some(offset)
                } else if !first {
                    (data.len() - offset >= 6 && data[offset..offset + 3] == [0, 0, 1]).then_some(offset)
                } else {
                    None
                };

                let Some(start) = start else {
                    self.save_trailing(&data[offset..]);
                    break;
                };
                if data.len() - start < 6 {
                    self.save_trailing(&data[start..]);
                    break;
                }
                let declared = u16::from_be_bytes([data[start + 4], data[start + 5]]) as usize;
                self.gather.active = true;
                // `declared` is PES_packet_length (bytes after the length
                // field); the full raw chain we buffer also includes the
                // 6-byte start code + stream id + length field itself.
                self.gather.declared_size = if declared == 0 { None } else { Some(6 + declared) };
                self.gather.buf.clear();
                offset = start;
            }

            match self.gather.declared_size {
                None => {
                    // Unbounded: keep everything; a later unit_start or
                    // discontinuity is the only flush trigger (invariant 10).
                    self.gather.buf.extend_from_slice(&data[offset..]);
                    offset = data.len();
                }
                Some(n) => {
                    let have = self.gather.buf.len();
                    let need = n.saturating_sub(have);
                    let take = need.min(data.len() - offset);
                    self.gather.buf.extend_from_slice(&data[offset..offset + take]);
                    offset += take;
                    if self.gather.buf.len() >= n {
                        out.push(std::mem::take(&mut self.gather.buf));
                        self.gather.active = false;
                        self.gather.declared_size = None;
                    }
                }
            }

            first = false;
            if offset >= data.len() {
                break;
            }
            if !self.gather.active {
                continue;
            }
            // Gather still active (unbounded) but we consumed the whole
            // packet; nothing more to scan until the next one.
            break;
        }
        out
    }

    fn save_trailing(&mut self, tail: &[u8]) {
        // Only worth saving if it could be the prefix of a start code plus
        // the 2-byte length field that follows it (at most 5 useful bytes).
        if tail.len() <= 5 && !tail.is_empty() {
            self.saved = SmallVec::from_slice(tail);
        }
    }

    /// Flushes whatever is gathered, as if a unit boundary had been reached.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if !self.gather.active || self.gather.buf.is_empty() {
            self.gather.active = false;
            self.gather.declared_size = None;
            return None;
        }
        self.gather.active = false;
        self.gather.declared_size = None;
        Some(std::mem::take(&mut self.gather.buf))
    }

    fn take_pending_flags(&mut self) -> (bool, bool) {
        let flags = (self.pending_discontinuity, self.pending_random_access);
        self.pending_discontinuity = false;
        self.pending_random_access = false;
        flags
    }

    /// Parses a completed PES byte chain into a timed [`EsBlock`], applying
    /// wrap correction against `pcr_reference_us` and skipping any
    /// codec-specific extra header bytes for `fourcc`.
    pub fn parse_unit(&mut self, raw: Vec<u8>, pcr_reference_us: Option<i64>, fourcc: Option<[u8; 4]>) -> Result<EsBlock> {
        let mut reader = crate::slice_reader::SliceReader::new(&raw);
        let info = parse_pes_header(&mut reader)?;
        let mut offset = info.payload_offset;
        if let Some(fourcc) = fourcc {
            offset += codec_extra_header_len(&fourcc, info.stream_id);
        }
        let data = raw.get(offset..).unwrap_or(&[]).to_vec();

        let pts = info.pts.map(|p| correct_timestamp(pcr_reference_us, p));
        let dts = info.dts.map(|d| correct_timestamp(pcr_reference_us, d)).or(pts);
        if let Some(dts) = dts {
            self.last_dts = Some(dts);
        }

        let (discontinuity, random_access) = self.take_pending_flags();
        Ok(EsBlock { data, pts, dts, discontinuity, random_access })
    }
}
