//! Glue layer: the host-facing `Demuxer`, its `ByteSource`/`Sink`
//! collaborator traits, and the `read_more`-style pull loop that ties packet
//! framing, the PID registry, PSI/PES assembly, and the clock engine
//! together (§1, §2's data-flow line, §6's external interfaces).

use std::collections::BTreeMap;
use std::convert::TryInto;
use std::io;

use log::{debug, warn};

use crate::clock::{self, CandidateStats, FixupOutcome};
use crate::config::Options;
use crate::error::{DemuxError, Result};
use crate::gather::EsBlock;
use crate::packet::{self, AdaptationField, FrameShape, PacketHeader, PID_NULL};
use crate::patfix;
use crate::pes;
use crate::pid::{ContinuityOutcome, PidKind, PidPayload, PidTable};
use crate::probe::{self, ProbeResult};
use crate::psi::pat::{self, Pat};
use crate::psi::pmt::{self, Descriptor};
use crate::psi::section::SectionAssembler;
use crate::psi::si;
use crate::slice_reader::SliceReader;
use crate::stream_types::{Category, Standard};

/// Opaque sink-facing handle for one published elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutId(pub u64);

/// Compact CA-PMT structure forwarded to a CAM-capable byte source (§4.5 item 7).
#[derive(Debug, Clone)]
pub struct CaPmt {
    pub version: u8,
    pub program_number: u16,
    pub program_descriptors: Vec<u8>,
    pub es_entries: Vec<(u8, u16, Vec<u8>)>,
}

/// What changed about a program, reported to the sink on PAT/PMT updates.
#[derive(Debug, Clone)]
pub enum ProgramUpdate {
    Added { pmt_pid: u16 },
    Removed,
    StreamsChanged,
}

/// The byte source collaborator: a seekable/peekable packet stream.
pub trait ByteSource {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn peek(&mut self, len: usize) -> io::Result<Vec<u8>>;
    fn seek(&mut self, pos: u64) -> io::Result<u64>;
    fn stream_len(&mut self) -> io::Result<Option<u64>>;
    fn is_fast_seekable(&self) -> bool;
    fn supports_cam(&self) -> bool {
        false
    }
    fn send_ca_pmt(&mut self, _pmt: &CaPmt) {}
    fn select_pid(&mut self, _pid: u16, _selected: bool) {}
}

/// The host's event/output subsystem collaborator.
pub trait Sink {
    fn on_es_block(&mut self, out_id: OutId, block: EsBlock);
    fn on_program_update(&mut self, program_number: u16, update: ProgramUpdate);
    fn on_pcr(&mut self, program_number: u16, pcr_us: i64);
    /// SDT service list update. Default no-op: a host indifferent to service
    /// names doesn't need to implement this.
    fn on_services(&mut self, _services: Vec<si::ServiceEntry>) {}
    /// TDT/TOT broadcast time, seconds since the Unix epoch.
    fn on_time(&mut self, _utc_unix_seconds: i64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatStatus {
    Waiting,
    FixTried,
}

/// Per-program runtime state: the PMT plus its PSI section assembler.
struct Program {
    pmt: pmt::Pmt,
    assembler: SectionAssembler,
}

/// The demuxer. Generic over the host's byte source and sink so both remain
/// interface-only collaborators (§1's deliberate out-of-scope list).
pub struct Demuxer<S: ByteSource, K: Sink> {
    source: S,
    sink: K,
    options: Options,
    pids: PidTable,
    pat: Pat,
    pat_assembler: SectionAssembler,
    programs: BTreeMap<u16, Program>,
    si_assemblers: BTreeMap<u16, SectionAssembler>,
    frame_shape: FrameShape,
    current_pos: u64,
    next_out_id: u64,
    pat_status: PatStatus,
    time_source_pid: Option<u16>,
    first_dts_before_pat_us: Option<i64>,
    probes: BTreeMap<u16, ProbeResult>,
}

impl<S: ByteSource, K: Sink> Demuxer<S, K> {
    pub fn new(mut source: S, sink: K, options: Options) -> Result<Self> {
        let window = source.peek(4 * 204).map_err(|_| DemuxError::ShortRead)?;
        let topfield_skip = packet::topfield_prefix_len(&window).unwrap_or(0);
        let scan_window = if topfield_skip > 0 {
            source.seek(topfield_skip as u64).map_err(|_| DemuxError::ShortRead)?;
            source.peek(4 * 204).map_err(|_| DemuxError::ShortRead)?
        } else {
            window
        };
        let frame_shape = packet::detect_packet_size(&scan_window, false)?;

        Ok(Self {
            source,
            sink,
            options,
            pids: PidTable::new(),
            pat: Pat::default(),
            pat_assembler: SectionAssembler::new(),
            programs: BTreeMap::new(),
            si_assemblers: BTreeMap::new(),
            frame_shape,
            current_pos: topfield_skip as u64,
            next_out_id: 0,
            pat_status: PatStatus::Waiting,
            time_source_pid: None,
            first_dts_before_pat_us: None,
            probes: BTreeMap::new(),
        })
    }

    fn allocate_out_id(&mut self, pid: u16) -> OutId {
        if self.options.es_id_pid {
            OutId(pid as u64)
        } else {
            let id = self.next_out_id;
            self.next_out_id += 1;
            OutId(id)
        }
    }

    /// Consumes up to `max_packets` transport packets, emitting ES blocks
    /// and table updates to the sink. Returns the number of packets
    /// actually processed (fewer than requested at end of stream).
    pub fn read_more(&mut self, max_packets: usize) -> Result<usize> {
        let shape = self.frame_shape;
        let mut buf = vec![0u8; shape.stride()];
        let mut processed = 0;

        for _ in 0..max_packets {
            let n = self.source.read_packet(&mut buf).map_err(|_| DemuxError::ShortRead)?;
            if n == 0 {
                break;
            }
            if n < shape.stride() {
                return Err(DemuxError::ShortRead);
            }
            self.current_pos += shape.stride() as u64;
            let packet_bytes = &buf[shape.header_prefix..];
            if packet_bytes[0] != packet::SYNC_BYTE {
                self.resync_or_fail(shape)?;
                continue;
            }
            self.process_packet(packet_bytes)?;
            processed += 1;
        }
        Ok(processed)
    }

    fn resync_or_fail(&mut self, shape: FrameShape) -> Result<()> {
        let probe = self.source.peek(shape.stride() * 10).map_err(|_| DemuxError::ShortRead)?;
        let offset = packet::resync(&probe, shape.stride(), 10).ok_or(DemuxError::LostSync)?;
        let new_pos = self.current_pos + offset as u64;
        self.current_pos = self.source.seek(new_pos).map_err(|_| DemuxError::ShortRead)?;
        Ok(())
    }

    fn process_packet(&mut self, packet_bytes: &[u8]) -> Result<()> {
        let mut reader = SliceReader::new(packet_bytes);
        let header_bytes = reader.read_array_ref::<4>()?;
        let header = PacketHeader::from_bytes(header_bytes);
        let pid = header.pid();

        if pid == PID_NULL {
            return Ok(());
        }
        self.pids.mark_seen(pid);

        let mut adaptation: Option<AdaptationField> = None;
        if header.has_adaptation_field() {
            adaptation = packet::read_adaptation_field(&mut reader)?;
        }

        if let Some(af) = &adaptation {
            if let Some(pcr) = af.pcr {
                self.handle_pcr(pid, pcr.micros());
            }
        }

        if !header.has_payload() {
            return Ok(());
        }
        let payload = reader.read_to_end();
        let scrambled = header.transport_scrambling_control() != packet::TransportScramblingControl::NotScrambled;
        let discontinuity = adaptation.as_ref().map_or(false, |a| a.header.discontinuity_indicator());
        let random_access = adaptation.as_ref().map_or(false, |a| a.header.random_access_indicator());

        let first_16 = first_16_bytes(payload);
        let cc_outcome = if self.options.cc_check {
            self.pids
                .get_mut(pid)
                .map(|e| e.continuity.check(header.continuity_counter(), first_16, header.is_cc_exempt()))
                .unwrap_or(ContinuityOutcome::Normal)
        } else {
            ContinuityOutcome::Normal
        };
        if cc_outcome == ContinuityOutcome::Duplicate {
            return Ok(());
        }
        let transport_error = cc_outcome == ContinuityOutcome::TransportError;

        match self.pids.get(pid).map(|e| e.kind) {
            Some(PidKind::Pat) => self.handle_pat_payload(payload, header.payload_unit_start_indicator())?,
            Some(PidKind::Pmt) => self.handle_pmt_payload(pid, payload, header.payload_unit_start_indicator())?,
            Some(PidKind::Stream) => self.handle_stream_payload(
                pid,
                payload,
                header.payload_unit_start_indicator(),
                scrambled,
                discontinuity || transport_error,
                random_access,
            )?,
            Some(PidKind::Si) => self.handle_si_payload(pid, payload, header.payload_unit_start_indicator())?,
            Some(PidKind::Psip) => {
                // PSIP base PID bound for refcounting parity with VCT/MGT
                // ownership; ATSC table parsing is not implemented (EPG
                // presentation is out of scope).
            }
            _ => {
                if header.payload_unit_start_indicator() {
                    self.probe_unknown_pid(pid, payload);
                }
            }
        }

        self.maybe_run_patfix()?;
        Ok(())
    }

    fn handle_pat_payload(&mut self, payload: &[u8], unit_start: bool) -> Result<()> {
        let sections = self.pat_assembler.push(payload, unit_start)?;
        for section in sections {
            if section.table_id != 0x00 {
                continue;
            }
            match pat::apply_pat(&mut self.pat, &mut self.pids, &section) {
                Ok(Some(diff)) => {
                    for &(program_number, pmt_pid) in &diff.added_or_changed {
                        self.programs.entry(program_number).or_insert_with(|| Program {
                            pmt: pmt::Pmt::new(program_number),
                            assembler: SectionAssembler::new(),
                        });
                        self.sink.on_program_update(program_number, ProgramUpdate::Added { pmt_pid });
                    }
                    for &(program_number, _) in &diff.removed {
                        self.programs.remove(&program_number);
                        self.sink.on_program_update(program_number, ProgramUpdate::Removed);
                    }
                    self.pat_status = PatStatus::Waiting;
                }
                Ok(None) => {}
                Err(e) => warn!("dropping malformed PAT: {e}"),
            }
        }
        Ok(())
    }

    fn handle_pmt_payload(&mut self, pid: u16, payload: &[u8], unit_start: bool) -> Result<()> {
        let Some((&program_number, _)) = self.pat.programs.iter().find(|(_, &p)| p == pid) else {
            return Ok(());
        };
        let sections = {
            let Some(program) = self.programs.get_mut(&program_number) else {
                return Ok(());
            };
            program.assembler.push(payload, unit_start)?
        };

        for section in sections {
            if section.table_id != 0x02 {
                continue;
            }
            // Each borrow of `self.programs` is scoped to its own block so it
            // never overlaps the `&mut self` needed by `allocate_out_id`/`sink`.
            let diff = {
                let Some(program) = self.programs.get_mut(&program_number) else {
                    continue;
                };
                match pmt::apply_pmt(&mut program.pmt, &mut self.pids, &section, self.options.split_es) {
                    Ok(diff) => diff,
                    Err(e) => {
                        warn!("dropping malformed PMT for program {program_number}: {e}");
                        continue;
                    }
                }
            };
            let Some(diff) = diff else {
                continue;
            };

            for &bound_pid in &diff.bound {
                if self.options.pmtfix_wait_data {
                    // Allocated lazily in `handle_stream_payload` once the
                    // program actually sends data on this PID.
                } else {
                    let out_id = self.allocate_out_id(bound_pid);
                    let extra_count = self
                        .programs
                        .get(&program_number)
                        .and_then(|p| p.pmt.streams.iter().find(|s| s.pid == bound_pid))
                        .map_or(0, |s| s.extraes.len());
                    let extra_out_ids: Vec<OutId> = (0..extra_count).map(|_| self.allocate_out_id(bound_pid)).collect();
                    if let Some(program) = self.programs.get_mut(&program_number) {
                        if let Some(es) = program.pmt.streams.iter_mut().find(|s| s.pid == bound_pid) {
                            es.out_id = Some(out_id.0);
                            for (sibling, sibling_id) in es.extraes.iter_mut().zip(&extra_out_ids) {
                                sibling.out_id = Some(sibling_id.0);
                            }
                        }
                    }
                }
                if self.options.broken_pusi_pids.contains(&bound_pid) {
                    if let Some(entry) = self.pids.get_mut(bound_pid) {
                        if let PidPayload::Stream(stream) = &mut entry.payload {
                            stream.broken_pusi_conformance = true;
                        }
                    }
                }
            }
            if !self.options.trust_pcr {
                if let Some(program) = self.programs.get_mut(&program_number) {
                    program.pmt.pcr.disabled = true;
                }
            }
            self.sink.on_program_update(program_number, ProgramUpdate::StreamsChanged);
            if self.source.supports_cam() {
                self.maybe_send_ca_pmt(program_number);
            }
        }
        Ok(())
    }

    fn maybe_send_ca_pmt(&mut self, program_number: u16) {
        let Some(program) = self.programs.get(&program_number) else {
            return;
        };
        let ca_pmt = CaPmt {
            version: program.pmt.version.unwrap_or(0),
            program_number,
            program_descriptors: pmt::serialize_descriptors(&program.pmt.ca_descriptors),
            es_entries: program
                .pmt
                .streams
                .iter()
                .map(|s| {
                    let ca_descriptors: Vec<Descriptor> = s.descriptors.iter().filter(|d| d.tag == 0x09).cloned().collect();
                    (s.stream_type, s.pid, pmt::serialize_descriptors(&ca_descriptors))
                })
                .collect(),
        };
        self.source.send_ca_pmt(&ca_pmt);
    }

    fn handle_stream_payload(
        &mut self,
        pid: u16,
        payload: &[u8],
        unit_start: bool,
        scrambled: bool,
        discontinuity: bool,
        random_access: bool,
    ) -> Result<()> {
        let program_number = self.owning_program(pid);
        let pcr_reference = program_number.and_then(|p| self.programs.get(&p)).and_then(|p| p.pmt.pcr.current);
        let fourcc = program_number
            .and_then(|p| self.programs.get(&p))
            .and_then(|p| p.pmt.streams.iter().find(|s| s.pid == pid))
            .and_then(|s| s.fourcc);
        let existing_out_id = program_number
            .and_then(|p| self.programs.get(&p))
            .and_then(|p| p.pmt.streams.iter().find(|s| s.pid == pid))
            .and_then(|s| s.out_id);
        // `pmtfix_wait_data`: the PMT bind loop skipped allocation so a
        // program with no live data never announces a sink handle; allocate
        // it now, on the first payload actually observed for this PID.
        let out_id = match existing_out_id {
            Some(id) => Some(OutId(id)),
            None if self.options.pmtfix_wait_data => program_number.and_then(|p| {
                let bound = self.programs.get(&p).map_or(false, |pr| pr.pmt.streams.iter().any(|s| s.pid == pid));
                if !bound {
                    return None;
                }
                let id = self.allocate_out_id(pid);
                if let Some(program) = self.programs.get_mut(&p) {
                    if let Some(es) = program.pmt.streams.iter_mut().find(|s| s.pid == pid) {
                        es.out_id = Some(id.0);
                    }
                }
                Some(id)
            }),
            None => None,
        };

        let completed = {
            let Some(entry) = self.pids.get_mut(pid) else {
                return Ok(());
            };
            let PidPayload::Stream(stream) = &mut entry.payload else {
                return Ok(());
            };
            stream.push(payload, unit_start, scrambled, discontinuity, random_access)
        };

        for raw in completed {
            let Some(entry) = self.pids.get_mut(pid) else { continue };
            let PidPayload::Stream(stream) = &mut entry.payload else { continue };
            let mut block = match stream.parse_unit(raw, pcr_reference, fourcc) {
                Ok(b) => b,
                Err(e) => {
                    warn!("dropping malformed PES on PID {pid:#x}: {e}");
                    continue;
                }
            };
            self.apply_pcr_offset_fix(program_number, pcr_reference, &mut block);
            self.route_block(pid, program_number, pcr_reference, out_id, block);
        }
        Ok(())
    }

    /// §4.6's fixed-padding PCR/DTS offset correction: measured once per
    /// program, on its first block carrying both a DTS and a PCR reference,
    /// then applied permanently to every later PTS/DTS of that program.
    fn apply_pcr_offset_fix(&mut self, program_number: Option<u16>, pcr_reference: Option<i64>, block: &mut EsBlock) {
        if !self.options.pcr_offset_fix {
            return;
        }
        let (Some(program_number), Some(pcr_current)) = (program_number, pcr_reference) else {
            return;
        };
        let Some(program) = self.programs.get_mut(&program_number) else {
            return;
        };
        if !program.pmt.pcr.fix_done {
            if let Some(dts) = block.dts {
                program.pmt.pcr.fix_done = true;
                let fixed_padding_us = self.options.pcr_offset_fix_ms as i64 * 1000;
                if let Some(correction) = clock::measure_pcr_offset_correction(dts, pcr_current, fixed_padding_us) {
                    debug!("program {program_number} applying {fixed_padding_us}us PCR/DTS offset correction");
                    program.pmt.pcr.pcroffset = Some(correction);
                }
            }
        }
        if let Some(offset) = program.pmt.pcr.pcroffset {
            block.pts = block.pts.map(|v| v + offset);
            block.dts = block.dts.map(|v| v + offset);
        }
    }

    fn route_block(&mut self, pid: u16, program_number: Option<u16>, pcr_reference: Option<i64>, out_id: Option<OutId>, block: EsBlock) {
        if pcr_reference.is_some() {
            if let Some(out_id) = out_id {
                self.sink.on_es_block(out_id, block);
            }
            self.track_time_source(pid);
            return;
        }

        let Some(program_number) = program_number else {
            let Some(entry) = self.pids.get_mut(pid) else { return };
            if let PidPayload::Stream(stream) = &mut entry.payload {
                stream.pre_pcr_queue.push(block);
            }
            return;
        };

        if let Some(program) = self.programs.get_mut(&program_number) {
            program.pmt.pcr.first_dts = program.pmt.pcr.first_dts.or(block.dts);
        }
        self.maybe_fix_pcr(program_number);

        let disabled = self.programs.get(&program_number).map_or(false, |p| p.pmt.pcr.disabled);
        if disabled {
            if let Some(dts) = block.dts {
                let dpb_offset_us = self.options.generated_pcr_dpb_offset_ms as i64 * 1000;
                let synthetic = clock::generate_pcr_from_dts(dts, dpb_offset_us);
                self.sink.on_pcr(program_number, synthetic);
                if let Some(out_id) = out_id {
                    self.sink.on_es_block(out_id, block);
                }
                return;
            }
        }

        let Some(entry) = self.pids.get_mut(pid) else { return };
        if let PidPayload::Stream(stream) = &mut entry.payload {
            stream.pre_pcr_queue.push(block);
        }
    }

    /// §4.7's first-PCR fix-up, checked on every pre-PCR block: once a
    /// program's declared PCR PID has stayed silent long enough, either
    /// re-origins the clock on the busiest alternative PID or gives up on
    /// wire PCR entirely and switches to DTS-derived timing.
    fn maybe_fix_pcr(&mut self, program_number: u16) {
        let Some((disabled, has_pcr, first_dts, declared_pid)) = self
            .programs
            .get(&program_number)
            .map(|p| (p.pmt.pcr.disabled, p.pmt.pcr.current.is_some(), p.pmt.pcr.first_dts, p.pmt.pcr_pid))
        else {
            return;
        };
        if disabled || has_pcr {
            return;
        }
        let Some(first_dts) = first_dts else { return };

        let streams: Vec<(u16, Category)> = self
            .programs
            .get(&program_number)
            .map(|p| p.pmt.streams.iter().map(|s| (s.pid, s.category)).collect())
            .unwrap_or_default();
        let Some(last_dts) = streams
            .iter()
            .filter_map(|&(p, _)| match self.pids.get(p).map(|e| &e.payload) {
                Some(PidPayload::Stream(stream)) => stream.last_dts,
                _ => None,
            })
            .max()
        else {
            return;
        };
        let elapsed_dts_us = last_dts - first_dts;

        let declared_pcr_pid_count = self.probes.get(&declared_pid).map_or(0, |p| p.pcr_count);
        let candidates: Vec<CandidateStats> = streams
            .iter()
            .map(|&(pid, category)| CandidateStats { pid, pcr_count: self.probes.get(&pid).map_or(0, |p| p.pcr_count), category })
            .collect();
        let current_default = if declared_pid != PID_NULL { Some(declared_pid) } else { None };

        match clock::first_pcr_fixup(elapsed_dts_us, declared_pcr_pid_count, &candidates, current_default) {
            FixupOutcome::Wait => {}
            FixupOutcome::ElectCandidate(new_pid) => {
                if let Some(program) = self.programs.get_mut(&program_number) {
                    program.pmt.pcr_pid = new_pid;
                }
                debug!("program {program_number} re-origined PCR source to PID {new_pid:#x} after {elapsed_dts_us}us with no PCR on PID {declared_pid:#x}");
            }
            FixupOutcome::DisablePermanently => {
                if let Some(program) = self.programs.get_mut(&program_number) {
                    program.pmt.pcr.disabled = true;
                }
                debug!("program {program_number} has no usable PCR source after {elapsed_dts_us}us, falling back to DTS-derived timing");
                self.drain_disabled_pcr_queue(program_number);
            }
        }
    }

    /// Drains a program's pre-PCR queues once its clock has been disabled
    /// permanently, stamping each block with a DTS-derived synthetic PCR
    /// instead of waiting for a wire PCR that will never arrive.
    fn drain_disabled_pcr_queue(&mut self, program_number: u16) {
        let dpb_offset_us = self.options.generated_pcr_dpb_offset_ms as i64 * 1000;
        let streams: Vec<(u16, Option<u64>)> = self
            .programs
            .get(&program_number)
            .map(|p| p.pmt.streams.iter().map(|s| (s.pid, s.out_id)).collect())
            .unwrap_or_default();
        let mut last_synthetic = None;
        for (stream_pid, out_id) in streams {
            let queued = match self.pids.get_mut(stream_pid) {
                Some(entry) => match &mut entry.payload {
                    PidPayload::Stream(stream) => std::mem::take(&mut stream.pre_pcr_queue),
                    _ => continue,
                },
                None => continue,
            };
            for block in queued {
                if let Some(dts) = block.dts {
                    last_synthetic = Some(clock::generate_pcr_from_dts(dts, dpb_offset_us));
                }
                if let Some(id) = out_id {
                    self.sink.on_es_block(OutId(id), block);
                }
            }
        }
        if let Some(synthetic) = last_synthetic {
            self.sink.on_pcr(program_number, synthetic);
        }
    }

    /// Flushes every stream PID of `program_number`'s pre-PCR queue on its
    /// first real PCR, respecting each stream's already-allocated `out_id`
    /// (not just the PCR PID's own queue). Sweeps each video PID's queue for
    /// an end-of-sequence marker already passed by `incoming_pcr_us` first
    /// (§4.7), since those blocks are effectively stale by the time they
    /// flush.
    fn flush_pre_pcr_queue(&mut self, program_number: u16, incoming_pcr_us: i64) {
        let streams: Vec<(u16, Option<u64>, Category)> = match self.programs.get(&program_number) {
            Some(program) => program.pmt.streams.iter().map(|s| (s.pid, s.out_id, s.category)).collect(),
            None => return,
        };
        for (stream_pid, out_id, category) in streams {
            let queued = match self.pids.get_mut(stream_pid) {
                Some(entry) => match &mut entry.payload {
                    PidPayload::Stream(stream) => std::mem::take(&mut stream.pre_pcr_queue),
                    _ => continue,
                },
                None => continue,
            };
            if queued.is_empty() {
                continue;
            }
            if category == Category::Video {
                let tails: Vec<(i64, [u8; 4])> = queued
                    .iter()
                    .filter_map(|b| {
                        let dts = b.dts?;
                        let start = b.data.len().checked_sub(4)?;
                        let tail: [u8; 4] = b.data[start..].try_into().ok()?;
                        Some((dts, tail))
                    })
                    .collect();
                let expired = clock::video_end_sweep(&tails, incoming_pcr_us);
                if !expired.is_empty() {
                    debug!(
                        "program {program_number} flushing {} stale end-of-sequence block(s) on PID {stream_pid:#x}",
                        expired.len()
                    );
                }
            }
            let Some(id) = out_id else { continue };
            for block in queued {
                self.sink.on_es_block(OutId(id), block);
            }
        }
    }

    /// Assembles and dispatches SDT/TDT sections carried on the SI PID
    /// (§4.5 item 8). EIT isn't parsed: its content is event/EPG
    /// presentation, out of scope here.
    fn handle_si_payload(&mut self, pid: u16, payload: &[u8], unit_start: bool) -> Result<()> {
        let assembler = self.si_assemblers.entry(pid).or_insert_with(SectionAssembler::new);
        let sections = assembler.push(payload, unit_start)?;
        for section in sections {
            match section.table_id {
                si::SDT_ACTUAL_TABLE_ID | si::SDT_OTHER_TABLE_ID => {
                    let standard = self.effective_standard();
                    match si::parse_sdt(&section.body, standard) {
                        Ok(services) => self.sink.on_services(services),
                        Err(e) => warn!("dropping malformed SDT: {e}"),
                    }
                }
                si::TDT_TABLE_ID => match si::parse_tdt(&section.body) {
                    Ok(utc) => {
                        if let Some(entry) = self.pids.get_mut(pid) {
                            if let PidPayload::Si(state) = &mut entry.payload {
                                state.last_tdt_utc = Some(utc);
                            }
                        }
                        self.sink.on_time(utc);
                    }
                    Err(e) => warn!("dropping malformed TDT: {e}"),
                },
                _ => {}
            }
        }
        Ok(())
    }

    /// The standard to interpret SDT service-descriptor encodings under:
    /// the host's explicit override if set, else whichever bound program
    /// already resolved a concrete standard, else DVB as the common default.
    fn effective_standard(&self) -> Standard {
        if !matches!(self.options.standard, Standard::Auto) {
            return self.options.standard;
        }
        self.programs
            .values()
            .find_map(|p| (!matches!(p.pmt.standard, Standard::Auto)).then_some(p.pmt.standard))
            .unwrap_or(Standard::Dvb)
    }

    fn owning_program(&self, stream_pid: u16) -> Option<u16> {
        self.programs
            .iter()
            .find(|(_, p)| p.pmt.streams.iter().any(|s| s.pid == stream_pid))
            .map(|(&num, _)| num)
    }

    fn handle_pcr(&mut self, pid: u16, raw_us: i64) {
        self.probes.entry(pid).or_default().pcr_count += 1;

        let Some((&program_number, _)) = self
            .programs
            .iter()
            .find(|(_, p)| p.pmt.pcr_pid == pid || (p.pmt.pcr_pid == PID_NULL && p.pmt.streams.iter().any(|s| s.pid == pid)))
        else {
            return;
        };
        let Some(program) = self.programs.get_mut(&program_number) else {
            return;
        };
        if program.pmt.pcr.disabled {
            return;
        }
        let is_first = clock::apply_to_program(&mut program.pmt, raw_us);
        if is_first {
            self.flush_pre_pcr_queue(program_number, raw_us);
        }
        let current = self.programs.get(&program_number).and_then(|p| p.pmt.pcr.current).unwrap_or(raw_us);
        self.sink.on_pcr(program_number, current);
    }

    /// Feeds a PES header seen on a PID no program has claimed yet: codec
    /// sniffing for a later synthetic PMT entry, and timestamp tracking so
    /// `maybe_run_patfix` knows how long the stream has run with no PAT.
    fn probe_unknown_pid(&mut self, pid: u16, payload: &[u8]) {
        if payload.len() < 4 || payload[0..3] != [0, 0, 1] {
            return;
        }
        let stream_id = payload[3];
        let mut reader = SliceReader::new(payload);
        let Ok(info) = pes::parse_pes_header(&mut reader) else {
            return;
        };
        let probe = self.probes.entry(pid).or_default();
        probe::observe_pes(probe, stream_id, payload.get(info.payload_offset..).unwrap_or(&[]));

        if let Some(raw_ticks) = info.dts.or(info.pts) {
            probe.dts_count += 1;
            probe.last_dts_us = Some(crate::timestamp::to_micros(raw_ticks));
            self.track_time_source(pid);
        }
    }

    fn track_time_source(&mut self, pid: u16) {
        if self.time_source_pid.is_none() {
            self.time_source_pid = Some(pid);
        }
    }

    /// §4.9: once `min_pat_interval_us` of DTS has elapsed on the PID
    /// carrying the earliest observed stream without a PAT ever showing up,
    /// synthesise one from the probed PIDs.
    fn maybe_run_patfix(&mut self) -> Result<()> {
        if !self.options.patfix || self.pat_status == PatStatus::FixTried || !self.pat.programs.is_empty() {
            return Ok(());
        }
        let Some(time_pid) = self.time_source_pid else {
            return Ok(());
        };
        let Some(last_dts) = self.probes.get(&time_pid).and_then(|p| p.last_dts_us) else {
            return Ok(());
        };
        let baseline = *self.first_dts_before_pat_us.get_or_insert(last_dts);
        let elapsed = last_dts - baseline;
        if elapsed < self.options.min_pat_interval_us {
            return Ok(());
        }

        self.pat_status = PatStatus::FixTried;
        let probes: Vec<(u16, ProbeResult)> = self.probes.iter().map(|(&pid, &p)| (pid, p)).collect();
        let pcr_pid = patfix::select_synthetic_pcr_pid(&probes).unwrap_or(time_pid);
        let pmt_pid = patfix::allocate_synthetic_pmt_pid(|p| self.pids.get(p).map_or(false, |e| e.kind != PidKind::Free));

        let pat_bytes = patfix::build_synthetic_pat(0, pmt_pid);
        let pmt_bytes = patfix::build_synthetic_pmt(pcr_pid, &probes);

        let mut pat_payload = vec![0u8];
        pat_payload.extend_from_slice(&pat_bytes);
        self.handle_pat_payload(&pat_payload, true)?;
        self.pat.generated = true;

        let mut pmt_payload = vec![0u8];
        pmt_payload.extend_from_slice(&pmt_bytes);
        self.handle_pmt_payload(pmt_pid, &pmt_payload, true)?;

        debug!("synthesised PAT/PMT after {elapsed}us with no PAT observed");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn sink_for_test(&self) -> &K {
        &self.sink
    }

    #[cfg(test)]
    pub(crate) fn pat_for_test(&self) -> &Pat {
        &self.pat
    }

    #[cfg(test)]
    pub(crate) fn source_for_test(&self) -> &S {
        &self.source
    }
}

fn first_16_bytes(payload: &[u8]) -> Option<[u8; 16]> {
    if payload.len() < 16 {
        return None;
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&payload[..16]);
    Some(out)
}
