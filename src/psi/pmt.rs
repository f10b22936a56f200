//! PMT parsing, program/stream topology maintenance, and PCR-candidate
//! bookkeeping.
//!
//! Grounded on VLC's `ts_psi.c` `PMTCallBack` (save/clear/append/decref,
//! registration-tag scoring, descriptor-tag codec detection) and
//! `mpegts-io`'s `PmtHeader`/`ElementaryStreamInfoHeader` bitfields.

use std::convert::TryInto;

use smallvec::SmallVec;

use crate::error::Result;
use crate::pid::{PidKind, PidPayload, PidTable};
use crate::psi::section::Section;
use crate::slice_reader::SliceReader;
use crate::stream_types::{self, Category, DescriptorTag, FourCc, RegistrationType, Standard};
use modular_bitfield_msb::prelude::*;

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct PmtHeader {
    pub reserved: B3,
    pub pcr_pid: B13,
    pub reserved2: B4,
    pub program_info_length: B12,
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct EsInfoHeader {
    pub stream_type: B8,
    pub reserved: B3,
    pub elementary_pid: B13,
    pub reserved2: B4,
    pub es_info_length: B12,
}

/// A single `{tag, data}` descriptor, the unit both program- and ES-level
/// descriptor loops iterate over.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub tag: u8,
    pub data: SmallVec<[u8; 8]>,
}

impl Descriptor {
    fn read(reader: &mut SliceReader) -> Result<Self> {
        let tag = reader.read_u8()?;
        let len = reader.read_u8()? as usize;
        let data = SmallVec::from_slice(reader.read(len)?);
        Ok(Self { tag, data })
    }
}

fn read_descriptor_loop(reader: &mut SliceReader, total_len: usize) -> Result<Vec<Descriptor>> {
    let mut sub = reader.new_sub_reader(total_len)?;
    let mut out = Vec::new();
    while sub.remaining_len() >= 2 {
        out.push(Descriptor::read(&mut sub)?);
    }
    Ok(out)
}

/// Re-encodes a descriptor loop back to wire form, for the CA-PMT a
/// CAM-capable byte source expects in EN 50221 `ca_descriptor` layout.
pub fn serialize_descriptors(descriptors: &[Descriptor]) -> Vec<u8> {
    let mut out = Vec::new();
    for d in descriptors {
        out.push(d.tag);
        out.push(d.data.len() as u8);
        out.extend_from_slice(&d.data);
    }
    out
}

/// PCR lifecycle state embedded in a program.
#[derive(Debug, Clone)]
pub struct PcrState {
    pub first: Option<i64>,
    pub current: Option<i64>,
    pub first_dts: Option<i64>,
    /// `None` == "not yet measured" (the original's `-1` sentinel);
    /// `Some(0)` == "measured, found to be zero".
    pub pcroffset: Option<i64>,
    pub disabled: bool,
    pub fix_done: bool,
}

impl Default for PcrState {
    fn default() -> Self {
        Self {
            first: None,
            current: None,
            first_dts: None,
            pcroffset: None,
            disabled: false,
            fix_done: false,
        }
    }
}

/// One elementary stream bound under a program's PMT.
#[derive(Debug, Clone)]
pub struct ElementaryStream {
    pub pid: u16,
    pub stream_type: u8,
    pub fourcc: Option<FourCc>,
    pub category: Category,
    pub registration_type: RegistrationType,
    pub descriptors: Vec<Descriptor>,
    pub language: Option<[u8; 3]>,
    pub extradata: SmallVec<[u8; 32]>,
    /// Sink handle, preserved across an equivalent re-add (§4.5 item 5, invariant 8).
    pub out_id: Option<u64>,
    /// Per-language sibling ESes sharing this PID (`Options::split_es`), e.g.
    /// a DVB subtitle or teletext descriptor listing several languages on
    /// one physical PID. Each sibling carries its own `language`/`extradata`
    /// and `out_id`; empty when the PID carries a single logical stream.
    pub extraes: Vec<ElementaryStream>,
}

impl ElementaryStream {
    /// Whether `self` and `other` are similar enough to preserve the sink
    /// handle across a PMT version bump: same codec, extradata, language,
    /// and sibling set (invariant 8).
    fn is_equivalent_to(&self, other: &ElementaryStream) -> bool {
        self.fourcc == other.fourcc
            && self.extradata == other.extradata
            && self.language == other.language
            && self.extraes.len() == other.extraes.len()
            && self.extraes.iter().zip(&other.extraes).all(|(a, b)| a.is_equivalent_to(b))
    }
}

/// Program Map Table state for one program.
#[derive(Debug)]
pub struct Pmt {
    pub program_number: u16,
    pub version: Option<u8>,
    pub pcr_pid: u16,
    pub streams: Vec<ElementaryStream>,
    pub registration_type: RegistrationType,
    pub standard: Standard,
    pub atsc_base_bound: bool,
    pub sdt_bound: bool,
    pub pcr: PcrState,
    /// Program-level CA descriptors (tag `0x09`) from the last applied
    /// section, forwarded verbatim in the CA-PMT built for a CAM-capable
    /// byte source (§4.5 item 7).
    pub ca_descriptors: Vec<Descriptor>,
}

impl Pmt {
    pub fn new(program_number: u16) -> Self {
        Self {
            program_number,
            version: None,
            pcr_pid: 0x1FFF,
            streams: Vec::new(),
            registration_type: RegistrationType::None,
            standard: Standard::Auto,
            atsc_base_bound: false,
            sdt_bound: false,
            pcr: PcrState::default(),
            ca_descriptors: Vec::new(),
        }
    }

    /// PIDs this PMT owns and must decref when torn down: its ES PIDs plus
    /// any bound ATSC-base/SDT auxiliary PID.
    pub fn owned_sub_pids(&self) -> Vec<u16> {
        let mut out: Vec<u16> = self.streams.iter().map(|s| s.pid).collect();
        if self.atsc_base_bound {
            out.push(crate::pid::ATSC_BASE_PID);
        }
        if self.sdt_bound {
            out.push(crate::pid::SDT_PID);
        }
        out
    }
}

fn detect_registration_type(descriptors: &[Descriptor]) -> RegistrationType {
    for d in descriptors {
        if d.tag == 0x05 && d.data.len() >= 4 {
            let fmt: [u8; 4] = d.data[..4].try_into().unwrap();
            match &fmt {
                b"HDMV" | b"BSSD" => return RegistrationType::Bluray,
                b"GA94" => return RegistrationType::Atsc,
                _ => {}
            }
        }
    }
    RegistrationType::None
}

fn arib_probe_score(descriptors: &[Descriptor]) -> u32 {
    descriptors
        .iter()
        .filter(|d| stream_types::ARIB_PROBE_TAGS.contains(&d.tag))
        .count() as u32
}

/// Splits an ISO_639_language_descriptor's repeating `{lang(3), audio_type(1)}`
/// entries. Falls back to a single 3-byte read when the body is shorter than
/// one full entry (some muxes omit the trailing `audio_type` byte).
fn split_language_entries(data: &[u8]) -> Vec<[u8; 3]> {
    let mut entries: Vec<[u8; 3]> = data.chunks_exact(4).map(|c| [c[0], c[1], c[2]]).collect();
    if entries.is_empty() && data.len() >= 3 {
        entries.push([data[0], data[1], data[2]]);
    }
    entries
}

/// Splits a DVB subtitling_descriptor's repeating 8-byte
/// `{lang(3), subtitling_type(1), composition_page(2), ancillary_page(2)}`
/// entries, keeping each whole entry as that sibling's extradata.
fn split_dvb_subtitle_entries(data: &[u8]) -> Vec<([u8; 3], SmallVec<[u8; 32]>)> {
    data.chunks_exact(8)
        .map(|c| ([c[0], c[1], c[2]], SmallVec::from_slice(c)))
        .collect()
}

/// Splits a teletext/VBI-teletext descriptor's repeating 5-byte
/// `{lang(3), type+magazine(1), page(1)}` entries.
fn split_teletext_entries(data: &[u8]) -> Vec<[u8; 3]> {
    data.chunks_exact(5).map(|c| [c[0], c[1], c[2]]).collect()
}

/// Resolves a descriptor-driven codec/category/language for one ES, plus any
/// additional per-language entries beyond the first (`Options::split_es`
/// sibling candidates; empty when the descriptor names a single language).
fn resolve_codec(
    stream_type: u8,
    descriptors: &[Descriptor],
) -> (Option<FourCc>, Category, Option<[u8; 3]>, SmallVec<[u8; 32]>, Vec<([u8; 3], SmallVec<[u8; 32]>)>) {
    if let Some((fourcc, category)) = stream_types::stream_type_codec(stream_type) {
        return (Some(fourcc), category, None, SmallVec::new(), Vec::new());
    }

    let mut language = None;
    let mut extradata: SmallVec<[u8; 32]> = SmallVec::new();
    let mut fourcc = None;
    let mut category = Category::Unknown;
    let mut extra_entries: Vec<([u8; 3], SmallVec<[u8; 32]>)> = Vec::new();

    for d in descriptors {
        if d.tag == 0x0A && d.data.len() >= 3 {
            let entries = split_language_entries(&d.data);
            language = entries.first().copied();
            extra_entries.extend(entries.into_iter().skip(1).map(|l| (l, SmallVec::new())));
            continue;
        }
        if d.tag == 0x05 && d.data.len() >= 4 {
            let fmt: [u8; 4] = d.data[..4].try_into().unwrap();
            if let Some(codec) = stream_types::registration_codec(&fmt) {
                fourcc = Some(codec);
                category = if codec == *b"ac-3" || codec == *b"eac3" || codec == *b"dts " {
                    Category::Audio
                } else if codec == *b"hevc" || codec == *b"vc-1" {
                    Category::Video
                } else {
                    Category::Unknown
                };
                continue;
            }
        }
        if let Some(tag) = DescriptorTag::from_tag(d.tag) {
            match tag {
                DescriptorTag::Ac3 | DescriptorTag::Eac3 | DescriptorTag::Dts => {
                    fourcc = tag.implied_codec();
                    category = Category::Audio;
                }
                DescriptorTag::OpusExtension if d.data.first() == Some(&0x80) => {
                    fourcc = tag.implied_codec();
                    category = Category::Audio;
                    if d.data.len() > 1 {
                        extradata = SmallVec::from_slice(&d.data[1..]);
                    }
                }
                DescriptorTag::OpusExtension => {}
                DescriptorTag::AvcVideo => {
                    fourcc = Some(*b"h264");
                    category = Category::Video;
                }
                DescriptorTag::J2kVideo => {
                    fourcc = Some(*b"mjp2");
                    category = Category::Video;
                }
                DescriptorTag::DvbSubtitle => {
                    fourcc = Some(*b"subt");
                    category = Category::Subtitle;
                    let entries = split_dvb_subtitle_entries(&d.data);
                    if let Some((lang0, extra0)) = entries.first() {
                        language = Some(*lang0);
                        extradata = extra0.clone();
                    } else {
                        extradata = SmallVec::from_slice(&d.data);
                    }
                    extra_entries.extend(entries.into_iter().skip(1));
                }
                DescriptorTag::Teletext | DescriptorTag::VbiTeletext => {
                    fourcc = Some(*b"telx");
                    category = Category::Subtitle;
                    let entries = split_teletext_entries(&d.data);
                    language = entries.first().copied().or(language);
                    extra_entries.extend(entries.into_iter().skip(1).map(|l| (l, SmallVec::new())));
                }
                DescriptorTag::MetadataId3 => {
                    fourcc = Some(*b"ID3 ");
                    category = Category::Data;
                }
                DescriptorTag::Mscodec => {
                    fourcc = Some(*b"msc ");
                    category = Category::Video;
                }
                DescriptorTag::SlOrFmc | DescriptorTag::SlOrFmcAlt => {
                    // MPEG-4 SL/FlexMux streams name their real codec in the
                    // program's IOD (tag 0x1D in ISO/IEC 14496-1), keyed by
                    // this descriptor's ES_ID, rather than in stream_type.
                    // Tag 0x1D is already `DescriptorTag::Mscodec` here, so
                    // there is no free slot to carry an IOD parse without
                    // colliding with that mapping. Left unresolved: such an
                    // ES keeps `fourcc = None` and reports its bare
                    // stream_type only.
                }
            }
        }
    }
    (fourcc, category, language, extradata, extra_entries)
}

/// Outcome of applying a PMT section: which ES PIDs need (re)binding and
/// which need release, for the caller to drive `PidTable`/gather setup.
#[derive(Debug, Default)]
pub struct PmtDiff {
    pub bound: Vec<u16>,
    pub released: Vec<u16>,
    pub reused: Vec<u16>,
}

/// Applies a freshly parsed PMT section, implementing §4.5's save/clear,
/// descriptor scoring, per-ES codec resolution, and preserve-on-equivalence
/// policy.
pub fn apply_pmt(pmt: &mut Pmt, pids: &mut PidTable, section: &Section, split_es: bool) -> Result<Option<PmtDiff>> {
    if pmt.version == Some(section.version) && !pmt.streams.is_empty() {
        return Ok(None);
    }

    let mut reader = SliceReader::new(&section.body);
    let header_bytes = reader.read_array_ref::<4>()?;
    let header = PmtHeader::from_bytes(header_bytes);
    let program_descriptors = read_descriptor_loop(&mut reader, header.program_info_length() as usize)?;

    pmt.registration_type = detect_registration_type(&program_descriptors);
    if matches!(pmt.standard, Standard::Auto) {
        pmt.standard = match pmt.registration_type {
            RegistrationType::Bluray => Standard::Mpeg,
            RegistrationType::Atsc => Standard::Atsc,
            RegistrationType::Arib => Standard::Arib,
            RegistrationType::None if arib_probe_score(&program_descriptors) >= 2 => Standard::Arib,
            RegistrationType::None => Standard::Dvb,
        };
    }
    pmt.ca_descriptors = program_descriptors.iter().filter(|d| d.tag == 0x09).cloned().collect();

    // SDT (PID 0x11) carries service names for any DVB-family program; the
    // ATSC PSIP base PID carries the MGT/VCT chain for an ATSC one. Bound
    // once per program and refcounted like any other owned sub-PID so a
    // torn-down program releases its share (`owned_sub_pids`).
    if matches!(pmt.standard, Standard::Dvb | Standard::Mpeg | Standard::Tdmb) && !pmt.sdt_bound {
        if pids.setup(crate::pid::SDT_PID, PidKind::Si, || PidPayload::Si(crate::psi::si::SiState::default())).is_ok() {
            pmt.sdt_bound = true;
        }
    }
    if matches!(pmt.standard, Standard::Atsc) && !pmt.atsc_base_bound {
        if pids.setup(crate::pid::ATSC_BASE_PID, PidKind::Psip, || PidPayload::Psip).is_ok() {
            pmt.atsc_base_bound = true;
        }
    }

    let old_streams = std::mem::take(&mut pmt.streams);
    let mut diff = PmtDiff::default();

    let mut new_streams = Vec::new();
    while reader.remaining_len() >= 5 {
        let es_header_bytes = reader.read_array_ref::<5>()?;
        let es_header = EsInfoHeader::from_bytes(es_header_bytes);
        let descriptors = read_descriptor_loop(&mut reader, es_header.es_info_length() as usize)?;
        let pid = es_header.elementary_pid();

        if !PidTable::is_valid_es_pid(pid) {
            continue;
        }

        let (fourcc, category, language, extradata, extra_entries) = resolve_codec(es_header.stream_type(), &descriptors);
        let mut es = ElementaryStream {
            pid,
            stream_type: es_header.stream_type(),
            fourcc,
            category,
            registration_type: pmt.registration_type,
            descriptors,
            language,
            extradata,
            out_id: None,
            extraes: Vec::new(),
        };
        if split_es && !extra_entries.is_empty() {
            es.extraes = extra_entries
                .into_iter()
                .map(|(lang, extra)| ElementaryStream {
                    pid,
                    stream_type: es.stream_type,
                    fourcc: es.fourcc,
                    category: es.category,
                    registration_type: es.registration_type,
                    descriptors: es.descriptors.clone(),
                    language: Some(lang),
                    extradata: extra,
                    out_id: None,
                    extraes: Vec::new(),
                })
                .collect();
        }

        if let Some(old) = old_streams.iter().find(|o| o.pid == pid) {
            if es.is_equivalent_to(old) {
                es.out_id = old.out_id;
                diff.reused.push(pid);
            } else {
                diff.bound.push(pid);
            }
        } else {
            diff.bound.push(pid);
        }

        if pids.setup(pid, PidKind::Stream, || PidPayload::Stream(Default::default())).is_ok() {
            new_streams.push(es);
        }
    }

    for old in &old_streams {
        if !new_streams.iter().any(|n| n.pid == old.pid) {
            diff.released.push(old.pid);
        }
    }
    for old_pid in old_streams.iter().map(|s| s.pid) {
        if !new_streams.iter().any(|n| n.pid == old_pid) {
            pids.release(old_pid);
        }
    }

    pmt.pcr_pid = header.pcr_pid();
    pmt.streams = new_streams;
    pmt.version = Some(section.version);

    Ok(Some(diff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::section::SectionAssembler;

    fn pmt_section(version: u8, program_number: u16, pcr_pid: u16, streams: &[(u8, u16)]) -> Section {
        use crc::{Crc, CRC_32_MPEG_2};
        const CRC32_MPEG2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

        let mut body = Vec::new();
        body.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes()); // program_info_length = 0
        for &(stream_type, pid) in streams {
            body.push(stream_type);
            body.extend_from_slice(&(0xE000 | pid).to_be_bytes());
            body.extend_from_slice(&0u16.to_be_bytes()); // es_info_length = 0
        }

        let mut syntax = Vec::new();
        syntax.extend_from_slice(&program_number.to_be_bytes());
        syntax.push(0b1100_0000 | (version << 1) | 1);
        syntax.push(0);
        syntax.push(0);
        syntax.extend_from_slice(&body);

        let section_length = syntax.len() + 4;
        let mut full = Vec::new();
        full.push(0x02);
        full.push(0x80 | ((section_length >> 8) as u8 & 0x0F));
        full.push(section_length as u8);
        full.extend_from_slice(&syntax);
        let crc = CRC32_MPEG2.checksum(&full);
        full.extend_from_slice(&crc.to_be_bytes());

        let mut assembler = SectionAssembler::new();
        let mut payload = vec![0u8];
        payload.extend_from_slice(&full);
        assembler.push(&payload, true).unwrap().pop().unwrap()
    }

    #[test]
    fn first_pmt_binds_streams() {
        let mut pmt = Pmt::new(1);
        let mut pids = PidTable::new();
        let section = pmt_section(0, 1, 0x101, &[(0x02, 0x101)]);
        let diff = apply_pmt(&mut pmt, &mut pids, &section, false).unwrap().unwrap();
        assert_eq!(diff.bound, vec![0x101]);
        assert_eq!(pmt.streams[0].fourcc, Some(*b"mpgv"));
        assert_eq!(pmt.pcr_pid, 0x101);
        assert_eq!(pids.get(0x101).unwrap().kind, PidKind::Stream);
    }

    #[test]
    fn equivalent_readd_preserves_out_id() {
        let mut pmt = Pmt::new(1);
        let mut pids = PidTable::new();
        let v0 = pmt_section(0, 1, 0x101, &[(0x02, 0x101)]);
        apply_pmt(&mut pmt, &mut pids, &v0, false).unwrap();
        pmt.streams[0].out_id = Some(42);

        let v1 = pmt_section(1, 1, 0x101, &[(0x02, 0x101)]);
        let diff = apply_pmt(&mut pmt, &mut pids, &v1, false).unwrap().unwrap();
        assert_eq!(diff.reused, vec![0x101]);
        assert_eq!(pmt.streams[0].out_id, Some(42));
    }

    #[test]
    fn removed_stream_releases_pid() {
        let mut pmt = Pmt::new(1);
        let mut pids = PidTable::new();
        let v0 = pmt_section(0, 1, 0x101, &[(0x02, 0x101), (0x03, 0x102)]);
        apply_pmt(&mut pmt, &mut pids, &v0, false).unwrap();

        let v1 = pmt_section(1, 1, 0x101, &[(0x02, 0x101)]);
        let diff = apply_pmt(&mut pmt, &mut pids, &v1, false).unwrap().unwrap();
        assert_eq!(diff.released, vec![0x102]);
        assert_eq!(pids.get(0x102).unwrap().kind, PidKind::Free);
    }
}
