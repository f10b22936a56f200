//! PSI section reassembly: `pointer_field` handling, length-prefixed
//! concatenation across packets, CRC32 validation, and
//! `(table_id, extension_id)`-keyed callback dispatch.
//!
//! Grounded on VLC's `ts_psi.c` `PIDFillPSIData`/`PATCallBack` chain and on
//! `mpegts-io::psi`'s `PsiHeader`/`PsiTableSyntax` bitfields.

use std::collections::HashMap;
use std::convert::TryInto;

use crc::{Crc, CRC_32_MPEG_2};
use log::warn;
use modular_bitfield_msb::prelude::*;

use crate::error::{DemuxError, Result};
use crate::slice_reader::SliceReader;

const CRC32_MPEG2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PsiHeader {
    pub table_id: B8,
    pub section_syntax_indicator: bool,
    pub private_bit: bool,
    pub reserved_bits: B2,
    pub section_length: B12,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PsiTableSyntax {
    pub table_id_extension: B16,
    pub reserved_bits: B2,
    pub version: B5,
    pub current_next_indicator: bool,
    pub section_num: B8,
    pub last_section_num: B8,
}

/// A fully reassembled, CRC-checked PSI section ready for a table-specific parser.
#[derive(Debug)]
pub struct Section {
    pub table_id: u8,
    pub table_id_extension: u16,
    pub version: u8,
    pub current_next: bool,
    /// The section body between the table syntax header and the trailing CRC.
    pub body: Vec<u8>,
}

/// Per-PID accumulation state, one instance per PSI PID.
#[derive(Debug, Default)]
pub struct SectionAssembler {
    pending: Vec<u8>,
    declared_len: Option<usize>,
}

impl SectionAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops any accumulated fragment, per the `discontinuity` / chain
    /// `Reset` semantics of §4.4.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.declared_len = None;
    }

    /// Feeds one TS packet's PSI payload. `unit_start` carries the packet's
    /// `payload_unit_start_indicator`. Returns every section completed by
    /// this call (normally zero or one, but a payload can both finish a
    /// pending section and start a new complete one).
    pub fn push(&mut self, payload: &[u8], unit_start: bool) -> Result<Vec<Section>> {
        let mut out = Vec::new();
        let mut data = payload;

        if unit_start {
            if data.is_empty() {
                return Err(DemuxError::BadPsiHeader(0));
            }
            let pointer_field = data[0] as usize;
            if pointer_field + 1 > data.len() {
                return Err(DemuxError::BadPsiHeader(0));
            }
            let (stale, rest) = data[1..].split_at(pointer_field);
            if !self.pending.is_empty() {
                self.pending.extend_from_slice(stale);
                if let Some(section) = self.try_complete()? {
                    out.push(section);
                }
            }
            self.pending.clear();
            self.declared_len = None;
            data = rest;
        }

        self.pending.extend_from_slice(data);
        while let Some(section) = self.try_complete()? {
            out.push(section);
        }
        Ok(out)
    }

    fn try_complete(&mut self) -> Result<Option<Section>> {
        if self.pending.is_empty() || self.pending[0] == 0xFF {
            // Stuffing byte run; nothing more to parse in this packet.
            self.pending.clear();
            return Ok(None);
        }
        if self.pending.len() < 3 {
            return Ok(None);
        }
        let header_bytes: [u8; 3] = self.pending[0..3].try_into().unwrap();
        let header = PsiHeader::from_bytes(header_bytes);
        let total_len = 3 + header.section_length() as usize;
        if self.pending.len() < total_len {
            self.declared_len = Some(total_len);
            return Ok(None);
        }

        let section_bytes = self.pending[..total_len].to_vec();
        self.pending.drain(..total_len);

        if !header.section_syntax_indicator() {
            // Private, non-CRC section (e.g. raw NIT payloads we pass through).
            return Ok(Some(Section {
                table_id: header.table_id(),
                table_id_extension: 0,
                version: 0,
                current_next: true,
                body: section_bytes[3..].to_vec(),
            }));
        }

        if section_bytes.len() < 3 + 5 + 4 {
            return Err(DemuxError::BadPsiHeader(0));
        }
        let crc_offset = section_bytes.len() - 4;
        let declared_crc = u32::from_be_bytes(section_bytes[crc_offset..].try_into().unwrap());
        let computed_crc = CRC32_MPEG2.checksum(&section_bytes[..crc_offset]);
        if declared_crc != computed_crc {
            warn!("PSI section failed CRC32 check, table_id={:#x}", header.table_id());
            return Err(DemuxError::PsiCrcMismatch);
        }

        let syntax_bytes: [u8; 5] = section_bytes[3..8].try_into().unwrap();
        let syntax = PsiTableSyntax::from_bytes(syntax_bytes);
        Ok(Some(Section {
            table_id: header.table_id(),
            table_id_extension: syntax.table_id_extension(),
            version: syntax.version(),
            current_next: syntax.current_next_indicator(),
            body: section_bytes[8..crc_offset].to_vec(),
        }))
    }
}

/// Composite key a handler chain dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub table_id: u8,
    pub extension_id: u16,
}

/// A PID's set of registered section handlers. Multiple handlers per PID are
/// allowed; dispatch is keyed by `(table_id, extension_id)`, matching §4.4's
/// "chain" wording.
#[derive(Default)]
pub struct HandlerChain<H> {
    handlers: HashMap<HandlerKey, H>,
}

impl<H> HandlerChain<H> {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn register(&mut self, table_id: u8, extension_id: u16, handler: H) {
        self.handlers.insert(HandlerKey { table_id, extension_id }, handler);
    }

    pub fn get(&self, table_id: u8, extension_id: u16) -> Option<&H> {
        self.handlers.get(&HandlerKey { table_id, extension_id })
    }

    pub fn get_mut(&mut self, table_id: u8, extension_id: u16) -> Option<&mut H> {
        self.handlers.get_mut(&HandlerKey { table_id, extension_id })
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub(crate) fn slice_reader_for(section: &Section) -> SliceReader<'_> {
    SliceReader::new(&section.body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crc_append(mut bytes: Vec<u8>) -> Vec<u8> {
        let crc = CRC32_MPEG2.checksum(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes
    }

    fn build_section(table_id: u8, ext: u16, version: u8, body: &[u8]) -> Vec<u8> {
        let mut syntax_and_body = Vec::new();
        syntax_and_body.extend_from_slice(&ext.to_be_bytes());
        syntax_and_body.push(0b1100_0000 | (version << 1) | 1);
        syntax_and_body.push(0); // section_num
        syntax_and_body.push(0); // last_section_num
        syntax_and_body.extend_from_slice(body);

        let section_length = syntax_and_body.len() + 4; // + CRC
        let mut out = Vec::new();
        out.push(table_id);
        out.push(0x80 | ((section_length >> 8) as u8 & 0x0F));
        out.push(section_length as u8);
        out.extend_from_slice(&syntax_and_body);
        crc_append(out)
    }

    #[test]
    fn single_packet_section_completes_immediately() {
        let body = [0xAA, 0xBB, 0xCC];
        let section_bytes = build_section(0x00, 1, 0, &body);
        let mut payload = vec![0u8]; // pointer_field = 0
        payload.extend_from_slice(&section_bytes);

        let mut assembler = SectionAssembler::new();
        let sections = assembler.push(&payload, true).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].table_id, 0x00);
        assert_eq!(sections[0].table_id_extension, 1);
        assert_eq!(sections[0].body, body);
    }

    #[test]
    fn section_spanning_two_packets_reassembles() {
        let body = vec![0x11; 50];
        let section_bytes = build_section(0x02, 7, 3, &body);
        let mut first_payload = vec![0u8];
        first_payload.extend_from_slice(&section_bytes[..30]);
        let second_payload = section_bytes[30..].to_vec();

        let mut assembler = SectionAssembler::new();
        assert!(assembler.push(&first_payload, true).unwrap().is_empty());
        let sections = assembler.push(&second_payload, false).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].body, body);
    }

    #[test]
    fn bad_crc_is_rejected() {
        let body = [0x01, 0x02];
        let mut section_bytes = build_section(0x00, 1, 0, &body);
        let last = section_bytes.len() - 1;
        section_bytes[last] ^= 0xFF;
        let mut payload = vec![0u8];
        payload.extend_from_slice(&section_bytes);

        let mut assembler = SectionAssembler::new();
        let err = assembler.push(&payload, true).unwrap_err();
        assert!(matches!(err, DemuxError::PsiCrcMismatch));
    }

    #[test]
    fn reset_drops_pending_fragment() {
        let body = vec![0x11; 50];
        let section_bytes = build_section(0x02, 7, 3, &body);
        let mut first_payload = vec![0u8];
        first_payload.extend_from_slice(&section_bytes[..30]);

        let mut assembler = SectionAssembler::new();
        assembler.push(&first_payload, true).unwrap();
        assembler.reset();
        let second_payload = section_bytes[30..].to_vec();
        let sections = assembler.push(&second_payload, false).unwrap();
        assert!(sections.is_empty());
    }

    #[test]
    fn handler_chain_dispatches_by_composite_key() {
        let mut chain: HandlerChain<&'static str> = HandlerChain::new();
        chain.register(0x00, 1, "pat-handler");
        chain.register(0x02, 1, "pmt-handler");
        assert_eq!(chain.get(0x00, 1), Some(&"pat-handler"));
        assert_eq!(chain.get(0x02, 1), Some(&"pmt-handler"));
        assert_eq!(chain.get(0x02, 2), None);
    }
}
