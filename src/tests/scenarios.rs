//! Scenario tests, §8: a full [`Demuxer`] driven against hand-built 188-byte
//! packet streams through an in-memory [`ByteSource`]/[`Sink`] pair.

use std::io;

use crc::{Crc, CRC_32_MPEG_2};

use crate::config::Options;
use crate::demux::{ByteSource, CaPmt, Demuxer, OutId, ProgramUpdate, Sink};
use crate::gather::EsBlock;
use crate::psi::si::ServiceEntry;

const CRC32_MPEG2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

// ---- packet/section builders ------------------------------------------

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

fn pat_section(version: u8, ts_id: u16, programs: &[(u16, u16)]) -> Vec<u8> {
    let mut syntax = Vec::new();
    syntax.extend_from_slice(&ts_id.to_be_bytes());
    syntax.push(0b1100_0000 | (version << 1) | 1);
    syntax.push(0);
    syntax.push(0);
    for &(num, pid) in programs {
        syntax.extend_from_slice(&num.to_be_bytes());
        syntax.extend_from_slice(&(0xE000 | pid).to_be_bytes());
    }
    seal_section(0x00, syntax)
}

fn pmt_section(version: u8, program_number: u16, pcr_pid: u16, streams: &[(u8, u16)]) -> Vec<u8> {
    pmt_section_with_descriptors(version, program_number, pcr_pid, &[], streams)
}

/// Like [`pmt_section`], but with a raw program-level descriptor loop (e.g. a
/// CA descriptor, tag `0x09`) ahead of the ES loop.
fn pmt_section_with_descriptors(version: u8, program_number: u16, pcr_pid: u16, program_descriptors: &[u8], streams: &[(u8, u16)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(0xE000 | pcr_pid).to_be_bytes());
    body.extend_from_slice(&(0xF000 | program_descriptors.len() as u16).to_be_bytes());
    body.extend_from_slice(program_descriptors);
    for &(stream_type, pid) in streams {
        body.push(stream_type);
        body.extend_from_slice(&(0xE000 | pid).to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
    }
    let mut syntax = Vec::new();
    syntax.extend_from_slice(&program_number.to_be_bytes());
    syntax.push(0b1100_0000 | (version << 1) | 1);
    syntax.push(0);
    syntax.push(0);
    syntax.extend_from_slice(&body);
    seal_section(0x02, syntax)
}

/// A short, non-CRC TDT section body (MJD + BCD h:m:s), the `table_id=0x70`
/// framing `SectionAssembler` parses via its `section_syntax_indicator=0` path.
fn tdt_section(mjd: u16, hour: u8, minute: u8, second: u8) -> Vec<u8> {
    fn to_bcd(v: u8) -> u8 {
        ((v / 10) << 4) | (v % 10)
    }
    let mut body = Vec::new();
    body.extend_from_slice(&mjd.to_be_bytes());
    body.push(to_bcd(hour));
    body.push(to_bcd(minute));
    body.push(to_bcd(second));
    let section_length = body.len();
    let mut out = Vec::with_capacity(3 + section_length);
    out.push(0x70);
    out.push((section_length >> 8) as u8 & 0x0F);
    out.push(section_length as u8);
    out.extend_from_slice(&body);
    out
}

/// One 188-byte packet with AFC=01 or 11 (stuffing via the adaptation field,
/// never via trailing junk in the payload itself, so PES/PSI parsing never
/// sees garbage past a declared length).
fn packet(pid: u16, pusi: bool, cc: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 184, "payload too long for a single packet in these fixtures");
    let mut p = Vec::with_capacity(188);
    p.push(0x47);
    p.push(((pusi as u8) << 6) | ((pid >> 8) as u8 & 0x1F));
    p.push((pid & 0xFF) as u8);
    if payload.len() == 184 {
        p.push(0b01_00_0000 | (cc & 0x0F));
    } else {
        p.push(0b11_00_0000 | (cc & 0x0F));
        let l = 183 - payload.len();
        p.push(l as u8);
        p.push(0); // adaptation field flags: all clear
        p.extend(std::iter::repeat(0xFFu8).take(l - 1));
    }
    p.extend_from_slice(payload);
    assert_eq!(p.len(), 188);
    p
}

fn encode_pcr(base_90k: u64, ext_27m: u16) -> [u8; 6] {
    let b0 = ((base_90k >> 25) & 0xFF) as u8;
    let b1 = ((base_90k >> 17) & 0xFF) as u8;
    let b2 = ((base_90k >> 9) & 0xFF) as u8;
    let b3 = ((base_90k >> 1) & 0xFF) as u8;
    let b4 = (((base_90k & 1) as u8) << 7) | 0b0111_1110 | (((ext_27m >> 8) & 1) as u8);
    let b5 = (ext_27m & 0xFF) as u8;
    [b0, b1, b2, b3, b4, b5]
}

/// A packet carrying only a PCR in its adaptation field, plus (optionally) a
/// payload tail, matching how a real PCR-bearing packet is laid out.
fn packet_with_pcr(pid: u16, pusi: bool, cc: u8, pcr_base: u64, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 176);
    let pcr_bytes = encode_pcr(pcr_base, 0);
    let content_len = 1 + 6; // flags byte + pcr
    let mut p = Vec::with_capacity(188);
    p.push(0x47);
    p.push(((pusi as u8) << 6) | ((pid >> 8) as u8 & 0x1F));
    p.push((pid & 0xFF) as u8);
    let afc = if payload.is_empty() { 0b10 } else { 0b11 };
    p.push((afc << 4) | (cc & 0x0F));
    let l = 183 - payload.len();
    p.push(l as u8);
    p.push(0b0001_0000); // pcr_flag
    p.extend_from_slice(&pcr_bytes);
    for _ in 0..(l - content_len) {
        p.push(0xFF);
    }
    p.extend_from_slice(payload);
    assert_eq!(p.len(), 188);
    p
}

fn psi_payload(section: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8];
    out.extend_from_slice(section);
    out
}

fn pes_unit(stream_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x01, stream_id];
    let declared = 3 + payload.len();
    out.extend_from_slice(&(declared as u16).to_be_bytes());
    out.push(0b1000_0000);
    out.push(0);
    out.push(0);
    out.extend_from_slice(payload);
    out
}

fn encode_timestamp(marker: u8, ticks: u64) -> [u8; 5] {
    let mut b = [0u8; 5];
    b[0] = (marker << 4) | (((ticks >> 30) & 0x7) as u8) << 1 | 1;
    b[1] = ((ticks >> 22) & 0xFF) as u8;
    b[2] = (((ticks >> 15) & 0x7F) as u8) << 1 | 1;
    b[3] = ((ticks >> 7) & 0xFF) as u8;
    b[4] = (((ticks) & 0x7F) as u8) << 1 | 1;
    b
}

fn pes_unit_with_dts(stream_id: u8, dts_ticks: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x01, stream_id];
    let ts = encode_timestamp(0b0001, dts_ticks);
    let declared = 3 + 5 + payload.len();
    out.extend_from_slice(&(declared as u16).to_be_bytes());
    out.push(0b1000_0000);
    out.push(0b0100_0000); // has_dts
    out.push(5);
    out.extend_from_slice(&ts);
    out.extend_from_slice(payload);
    out
}

// ---- in-memory ByteSource/Sink -----------------------------------------

struct MemSource {
    data: Vec<u8>,
    pos: usize,
    cam: bool,
    ca_pmts: Vec<CaPmt>,
}

fn null_packet() -> Vec<u8> {
    let mut p = vec![0x47, 0x1F, 0xFF, 0x10];
    p.extend(std::iter::repeat(0xFFu8).take(184));
    p
}

impl MemSource {
    /// Pads with null packets so at least 4 packets are present: framing
    /// detection needs sync bytes three strides ahead of the first one.
    fn new(mut packets: Vec<Vec<u8>>) -> Self {
        while packets.len() < 4 {
            packets.push(null_packet());
        }
        Self { data: packets.concat(), pos: 0, cam: false, ca_pmts: Vec::new() }
    }

    fn new_with_cam(packets: Vec<Vec<u8>>) -> Self {
        let mut s = Self::new(packets);
        s.cam = true;
        s
    }
}

impl ByteSource for MemSource {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let avail = self.data.len().saturating_sub(self.pos);
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn peek(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let end = (self.pos + len).min(self.data.len());
        Ok(self.data[self.pos..end].to_vec())
    }

    fn seek(&mut self, pos: u64) -> io::Result<u64> {
        self.pos = pos as usize;
        Ok(pos)
    }

    fn stream_len(&mut self) -> io::Result<Option<u64>> {
        Ok(Some(self.data.len() as u64))
    }

    fn is_fast_seekable(&self) -> bool {
        true
    }

    fn supports_cam(&self) -> bool {
        self.cam
    }

    fn send_ca_pmt(&mut self, pmt: &CaPmt) {
        self.ca_pmts.push(pmt.clone());
    }
}

#[derive(Default)]
struct RecordingSink {
    blocks: Vec<(OutId, EsBlock)>,
    updates: Vec<(u16, ProgramUpdate)>,
    pcrs: Vec<(u16, i64)>,
    services: Vec<ServiceEntry>,
    times: Vec<i64>,
}

impl Sink for RecordingSink {
    fn on_es_block(&mut self, out_id: OutId, block: EsBlock) {
        self.blocks.push((out_id, block));
    }

    fn on_program_update(&mut self, program_number: u16, update: ProgramUpdate) {
        self.updates.push((program_number, update));
    }

    fn on_pcr(&mut self, program_number: u16, pcr_us: i64) {
        self.pcrs.push((program_number, pcr_us));
    }

    fn on_services(&mut self, services: Vec<ServiceEntry>) {
        self.services.extend(services);
    }

    fn on_time(&mut self, utc_unix_seconds: i64) {
        self.times.push(utc_unix_seconds);
    }
}

fn matches_added(u: &ProgramUpdate, expected_pmt_pid: u16) -> bool {
    matches!(u, ProgramUpdate::Added { pmt_pid } if *pmt_pid == expected_pmt_pid)
}

/// The crate deliberately keeps `source`/`sink` private to the demuxer, so
/// scenario tests reach in through a cfg(test) hook rather than widening the
/// public surface.
fn demux_sink<S: ByteSource>(demux: &Demuxer<S, RecordingSink>) -> &RecordingSink {
    demux.sink_for_test()
}

// ---- S1: single-program MPEG video -------------------------------------

#[test]
fn s1_single_program_video_flows_end_to_end() {
    let video_pid = 0x101u16;
    let pmt_pid = 0x100u16;

    let pat = packet(0, true, 0, &psi_payload(&pat_section(0, 1, &[(1, pmt_pid)])));
    let pmt = packet(pmt_pid, true, 0, &psi_payload(&pmt_section(0, 1, video_pid, &[(0x02, video_pid)])));
    let pcr_only = packet_with_pcr(video_pid, false, 0, 0, &[]);
    let es_payload = pes_unit(0xE0, &[0xDE, 0xAD, 0xBE, 0xEF]);
    let es = packet(video_pid, true, 1, &es_payload);

    let source = MemSource::new(vec![pat, pmt, pcr_only, es]);
    let mut demux = Demuxer::new(source, RecordingSink::default(), Options::default()).unwrap();
    demux.read_more(10).unwrap();

    let sink = demux_sink(&demux);
    assert!(sink.updates.iter().any(|(num, u)| *num == 1 && matches_added(u, pmt_pid)));
    assert!(sink.updates.iter().any(|(num, u)| *num == 1 && matches!(u, ProgramUpdate::StreamsChanged)));
    assert_eq!(sink.pcrs.len(), 1);
    assert_eq!(sink.pcrs[0].0, 1);
    assert_eq!(sink.blocks.len(), 1);
    assert_eq!(sink.blocks[0].1.data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
}

// ---- S2: missing-PAT synthesis ------------------------------------------

#[test]
fn s2_missing_pat_triggers_synthesis_after_one_second() {
    let video_pid = 0x201u16;
    let h264_sps = [0x00, 0x00, 0x00, 0x01, 0x67, 0xAA];

    let first = pes_unit_with_dts(0xE0, 0, &h264_sps);
    let pkt1 = packet(video_pid, true, 0, &first);
    // 90_000 ticks/s * 2s = 180_000 ticks, comfortably past the 1s threshold.
    let second = pes_unit_with_dts(0xE0, 180_000, &h264_sps);
    let pkt2 = packet(video_pid, true, 1, &second);

    let source = MemSource::new(vec![pkt1, pkt2]);
    let mut demux = Demuxer::new(source, RecordingSink::default(), Options::default()).unwrap();
    demux.read_more(10).unwrap();

    assert!(demux.pat_for_test().generated);
    assert!(demux.pat_for_test().programs.values().any(|&pmt_pid| pmt_pid == 1337));
}

// ---- S5: duplicate packet dropping ---------------------------------------

#[test]
fn s5_duplicate_packet_is_dropped() {
    let video_pid = 0x101u16;
    let pmt_pid = 0x100u16;
    let pat = packet(0, true, 0, &psi_payload(&pat_section(0, 1, &[(1, pmt_pid)])));
    let pmt = packet(pmt_pid, true, 0, &psi_payload(&pmt_section(0, 1, video_pid, &[(0x02, video_pid)])));
    let pcr_only = packet_with_pcr(video_pid, false, 0, 0, &[]);
    let es_payload = pes_unit(0xE0, &[1, 2, 3]);
    let es = packet(video_pid, true, 5, &es_payload);
    let duplicate = es.clone(); // identical cc + identical first bytes

    let source = MemSource::new(vec![pat, pmt, pcr_only, es, duplicate]);
    let mut demux = Demuxer::new(source, RecordingSink::default(), Options::default()).unwrap();
    demux.read_more(10).unwrap();

    assert_eq!(demux_sink(&demux).blocks.len(), 1);
}

// ---- S6: program replacement ---------------------------------------------

#[test]
fn s6_program_replacement_removes_and_keeps() {
    let pat_v0 = packet(0, true, 0, &psi_payload(&pat_section(0, 1, &[(1, 0x100), (2, 0x200)])));
    let pmt1 = packet(0x100, true, 0, &psi_payload(&pmt_section(0, 1, 0x101, &[(0x02, 0x101)])));
    let pmt2 = packet(0x200, true, 0, &psi_payload(&pmt_section(0, 2, 0x201, &[(0x02, 0x201)])));
    let pat_v1 = packet(0, true, 1, &psi_payload(&pat_section(1, 1, &[(1, 0x100), (3, 0x300)])));

    let source = MemSource::new(vec![pat_v0, pmt1, pmt2, pat_v1]);
    let mut demux = Demuxer::new(source, RecordingSink::default(), Options::default()).unwrap();
    demux.read_more(10).unwrap();

    let sink = demux_sink(&demux);
    assert!(sink.updates.iter().any(|(num, u)| *num == 2 && matches!(u, ProgramUpdate::Removed)));
    assert!(sink.updates.iter().any(|(num, u)| *num == 3 && matches_added(u, 0x300)));
    assert!(sink.updates.iter().any(|(num, u)| *num == 1 && matches_added(u, 0x100)));
}

// ---- S4 (integration): broken_pusi_pids wiring ---------------------------

#[test]
fn s4_broken_pusi_pids_option_splits_packed_units() {
    let video_pid = 0x101u16;
    let pmt_pid = 0x100u16;
    let pat = packet(0, true, 0, &psi_payload(&pat_section(0, 1, &[(1, pmt_pid)])));
    let pmt = packet(pmt_pid, true, 0, &psi_payload(&pmt_section(0, 1, video_pid, &[(0x02, video_pid)])));
    let pcr_only = packet_with_pcr(video_pid, false, 0, 0, &[]);

    let unit = pes_unit(0xE0, &[0xAA, 0xBB, 0xCC, 0xDD]);
    let mut packed = Vec::new();
    packed.extend_from_slice(&unit);
    packed.extend_from_slice(&unit);
    let es = packet(video_pid, false, 1, &packed);

    let mut options = Options::default();
    options.broken_pusi_pids.push(video_pid);

    let source = MemSource::new(vec![pat, pmt, pcr_only, es]);
    let mut demux = Demuxer::new(source, RecordingSink::default(), options).unwrap();
    demux.read_more(10).unwrap();

    assert_eq!(demux_sink(&demux).blocks.len(), 2);
}

// ---- S9: pre-PCR queue flushes every stream of the program ---------------

#[test]
fn s9_pre_pcr_flush_uses_each_streams_own_out_id() {
    let video_pid = 0x101u16;
    let audio_pid = 0x102u16;
    let pmt_pid = 0x100u16;

    let pat = packet(0, true, 0, &psi_payload(&pat_section(0, 1, &[(1, pmt_pid)])));
    let pmt = packet(pmt_pid, true, 0, &psi_payload(&pmt_section(0, 1, video_pid, &[(0x02, video_pid), (0x04, audio_pid)])));
    // Both ES queue up before any PCR has been seen on the program.
    let video_es = packet(video_pid, true, 0, &pes_unit(0xE0, &[0xAA]));
    let audio_es = packet(audio_pid, true, 0, &pes_unit(0xC0, &[0xBB]));
    let pcr_only = packet_with_pcr(video_pid, false, 1, 0, &[]);

    let source = MemSource::new(vec![pat, pmt, video_es, audio_es, pcr_only]);
    let mut demux = Demuxer::new(source, RecordingSink::default(), Options::default()).unwrap();
    demux.read_more(10).unwrap();

    let sink = demux_sink(&demux);
    assert_eq!(sink.blocks.len(), 2);
    // Monotonic `OutId` allocation (the default `es_id_pid=false`): the two
    // streams must keep distinct ids rather than both collapsing onto
    // `OutId(pid)` or onto a single id.
    let ids: Vec<u64> = sink.blocks.iter().map(|(id, _)| id.0).collect();
    assert_ne!(ids[0], ids[1]);
    assert!(ids.iter().all(|&id| id != video_pid as u64 && id != audio_pid as u64));
}

// ---- S10: pmtfix_wait_data lazily allocates an out_id on first data -----

#[test]
fn s10_pmtfix_wait_data_allocates_out_id_lazily() {
    let video_pid = 0x101u16;
    let pmt_pid = 0x100u16;

    let pat = packet(0, true, 0, &psi_payload(&pat_section(0, 1, &[(1, pmt_pid)])));
    let pmt = packet(pmt_pid, true, 0, &psi_payload(&pmt_section(0, 1, video_pid, &[(0x02, video_pid)])));

    let mut options = Options::default();
    options.pmtfix_wait_data = true;
    let source = MemSource::new(vec![pat, pmt]);
    let mut demux = Demuxer::new(source, RecordingSink::default(), options).unwrap();
    demux.read_more(10).unwrap();

    // No data has arrived yet: a program-level update was still announced,
    // but nothing has been allocated a sink handle.
    assert!(demux_sink(&demux).updates.iter().any(|(num, u)| *num == 1 && matches!(u, ProgramUpdate::StreamsChanged)));
    assert!(demux_sink(&demux).blocks.is_empty());
}

// ---- S11: declared PCR PID silent long enough disables wire PCR ----------

#[test]
fn s11_silent_pcr_pid_falls_back_to_dts_derived_timing() {
    let video_pid = 0x101u16;
    let pmt_pid = 0x100u16;

    let pat = packet(0, true, 0, &psi_payload(&pat_section(0, 1, &[(1, pmt_pid)])));
    // Declares video_pid as the PCR source, but no adaptation-field PCR is
    // ever actually sent on it.
    let pmt = packet(pmt_pid, true, 0, &psi_payload(&pmt_section(0, 1, video_pid, &[(0x02, video_pid)])));
    let first = packet(video_pid, true, 0, &pes_unit_with_dts(0xE0, 0, &[0xAA]));
    // 50_000 ticks at 90kHz is ~555ms, past the fix-up threshold.
    let second = packet(video_pid, true, 1, &pes_unit_with_dts(0xE0, 50_000, &[0xBB]));

    let source = MemSource::new(vec![pat, pmt, first, second]);
    let mut demux = Demuxer::new(source, RecordingSink::default(), Options::default()).unwrap();
    demux.read_more(10).unwrap();

    let sink = demux_sink(&demux);
    // Both blocks must eventually flow: the first drained out of the
    // pre-PCR queue once the clock gives up, the second emitted directly.
    assert_eq!(sink.blocks.len(), 2);
    assert!(!sink.pcrs.is_empty());
    // Every emitted PCR is DTS-derived (dts - 120ms default dpb offset), not
    // a value that could have come from a wire adaptation field.
    assert!(sink.pcrs.iter().all(|&(num, pcr_us)| num == 1 && (pcr_us == -120_000 || pcr_us == 435_555)));
}

// ---- S12: SDT PID 0x11 gets bound and TDT updates the sink's clock -------

#[test]
fn s12_tdt_on_sdt_pid_reaches_sink() {
    let video_pid = 0x101u16;
    let pmt_pid = 0x100u16;

    let pat = packet(0, true, 0, &psi_payload(&pat_section(0, 1, &[(1, pmt_pid)])));
    let pmt = packet(pmt_pid, true, 0, &psi_payload(&pmt_section(0, 1, video_pid, &[(0x02, video_pid)])));
    // 1 Jan 2020 00:00:00 UTC, MJD 58849.
    let tdt = packet(0x0011, true, 0, &psi_payload(&tdt_section(58849, 0, 0, 0)));

    let source = MemSource::new(vec![pat, pmt, tdt]);
    let mut demux = Demuxer::new(source, RecordingSink::default(), Options::default()).unwrap();
    demux.read_more(10).unwrap();

    assert_eq!(demux_sink(&demux).times, vec![1_577_836_800]);
}

// ---- S13: CA-PMT forwards the program's real CA descriptor ---------------

#[test]
fn s13_ca_pmt_forwards_program_ca_descriptor() {
    let video_pid = 0x101u16;
    let pmt_pid = 0x100u16;
    // A minimal CA descriptor: tag 0x09, ca_system_id + ca_pid.
    let ca_descriptor = [0x09, 0x04, 0x09, 0x88, 0xE1, 0x20];

    let pat = packet(0, true, 0, &psi_payload(&pat_section(0, 1, &[(1, pmt_pid)])));
    let pmt_body = pmt_section_with_descriptors(0, 1, video_pid, &ca_descriptor, &[(0x02, video_pid)]);
    let pmt = packet(pmt_pid, true, 0, &psi_payload(&pmt_body));

    let source = MemSource::new_with_cam(vec![pat, pmt]);
    let mut demux = Demuxer::new(source, RecordingSink::default(), Options::default()).unwrap();
    demux.read_more(10).unwrap();

    let ca_pmts = &demux.source_for_test().ca_pmts;
    assert_eq!(ca_pmts.len(), 1);
    assert_eq!(ca_pmts[0].program_number, 1);
    assert_eq!(ca_pmts[0].program_descriptors, ca_descriptor.to_vec());
}
