//! Host-configurable options, §6.2. A plain struct with a documented
//! `Default`; CLI/env parsing is the host's responsibility (out of scope,
//! §1).

use crate::stream_types::Standard;

/// Demuxer behavior knobs. Construct with [`Options::default`] and
/// override only the fields a host cares about.
#[derive(Debug, Clone)]
pub struct Options {
    /// Force a regional interpretation of descriptors instead of probing.
    pub standard: Standard,
    /// If false, PCR extracted from the wire is ignored at PMT bind time.
    pub trust_pcr: bool,
    /// Apply the fixed-padding DTS/PCR correction of §4.6.
    pub pcr_offset_fix: bool,
    /// Fixed padding applied by `pcr_offset_fix`, in milliseconds.
    pub pcr_offset_fix_ms: u32,
    /// Decode-buffering offset used when synthesising a PCR from DTS.
    pub generated_pcr_dpb_offset_ms: u32,
    /// Use the PID as the sink's output id instead of a monotonic counter.
    pub es_id_pid: bool,
    /// Produce per-language sibling ESes for DVB subtitles/teletext.
    pub split_es: bool,
    /// Enforce continuity-counter checking (disable for known-broken sources).
    pub cc_check: bool,
    /// Seek by byte percentage instead of PCR time.
    pub seek_percent: bool,
    /// Enable the missing-PAT fix-up of §4.9.
    pub patfix: bool,
    /// Delay ES creation until the program actually sends data.
    pub pmtfix_wait_data: bool,
    /// Minimum silent interval, in microseconds, before `patfix` triggers.
    pub min_pat_interval_us: i64,
    /// ES PIDs known in advance to be AdTech-like non-conformant producers
    /// (multiple PES headers per packet, unreliable unit-start), forcing the
    /// gatherer's scanning mode for them from the moment they're bound.
    pub broken_pusi_pids: Vec<u16>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            standard: Standard::Auto,
            trust_pcr: true,
            pcr_offset_fix: true,
            pcr_offset_fix_ms: 80,
            generated_pcr_dpb_offset_ms: 120,
            es_id_pid: false,
            split_es: false,
            cc_check: true,
            seek_percent: false,
            patfix: true,
            pmtfix_wait_data: false,
            min_pat_interval_us: crate::patfix::MIN_PAT_INTERVAL_US,
            broken_pusi_pids: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let opts = Options::default();
        assert_eq!(opts.pcr_offset_fix_ms, 80);
        assert_eq!(opts.generated_pcr_dpb_offset_ms, 120);
        assert_eq!(opts.min_pat_interval_us, 1_000_000);
        assert!(opts.patfix);
        assert!(opts.trust_pcr);
    }
}
