//! Stream-type and descriptor-tag lookup tables.
//!
//! Dozens of codec-registration sub-cases in PMT element descriptors,
//! expressed as data rather than as a long prose case analysis; grounded on
//! VLC's `ts_sl.c`/`ts.c` stream-type switch and DVB/ATSC
//! registration-descriptor tables.

/// Broad category a codec belongs to, used for PCR-candidate preference
/// (video over audio) and sink routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Video,
    Audio,
    Subtitle,
    Data,
    Unknown,
}

/// Regional descriptor-interpretation standard, §6.2's `standard` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Standard {
    Auto,
    Mpeg,
    Dvb,
    Arib,
    Atsc,
    Tdmb,
}

/// A four-character codec identifier, matching the sink's expected format.
pub type FourCc = [u8; 4];

fn fourcc(s: &[u8; 4]) -> FourCc {
    *s
}

/// Maps an ISO/IEC 13818-1 `stream_type` byte to a codec/category. `None`
/// means the stream type is unassigned or needs descriptor-level
/// disambiguation (private/reserved ranges).
pub fn stream_type_codec(stream_type: u8) -> Option<(FourCc, Category)> {
    Some(match stream_type {
        0x01 | 0x02 => (fourcc(b"mpgv"), Category::Video),
        0x03 | 0x04 => (fourcc(b"mpga"), Category::Audio),
        0x0F => (fourcc(b"mp4a"), Category::Audio),
        0x10 => (fourcc(b"mp4v"), Category::Video),
        0x1B => (fourcc(b"h264"), Category::Video),
        0x24 => (fourcc(b"hevc"), Category::Video),
        0x42 => (fourcc(b"avs2"), Category::Video),
        0x81 => (fourcc(b"ac-3"), Category::Audio),
        0x82 => (fourcc(b"dts "), Category::Audio),
        0x86 => (fourcc(b"scte"), Category::Data),
        0x90 => (fourcc(b"subt"), Category::Subtitle),
        0x91 => (fourcc(b"ac-3"), Category::Audio),
        0x95 => (fourcc(b"atsc"), Category::Data),
        _ => return None,
    })
}

/// Registration descriptor (tag `0x05`) format identifiers recognised for
/// private stream types, mapping the 4-byte `format_identifier` to a codec.
pub fn registration_codec(format_identifier: &[u8; 4]) -> Option<FourCc> {
    Some(match format_identifier {
        b"AC-3" => fourcc(b"ac-3"),
        b"EAC3" => fourcc(b"eac3"),
        b"DTS1" | b"DTS2" | b"DTS3" => fourcc(b"dts "),
        b"BSSD" => fourcc(b"bssd"),
        b"HEVC" => fourcc(b"hevc"),
        b"Opus" => fourcc(b"opus"),
        b"VC-1" => fourcc(b"vc-1"),
        b"drac" => fourcc(b"drac"),
        _ => return None,
    })
}

/// Well-known PMT-level ES descriptor tags used for private-stream
/// disambiguation when `stream_type_codec` returns `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorTag {
    Ac3 = 0x6a,
    Eac3 = 0x7a,
    Dts = 0x73,
    OpusExtension = 0x7f,
    AvcVideo = 0x28,
    J2kVideo = 0x32,
    DvbSubtitle = 0x59,
    Teletext = 0x46,
    VbiTeletext = 0x56,
    MetadataId3 = 0x26,
    Mscodec = 0x1d,
    SlOrFmc = 0x1e,
    SlOrFmcAlt = 0x1f,
}

impl DescriptorTag {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x6a => Self::Ac3,
            0x7a => Self::Eac3,
            0x73 => Self::Dts,
            0x7f => Self::OpusExtension,
            0x28 => Self::AvcVideo,
            0x32 => Self::J2kVideo,
            0x59 => Self::DvbSubtitle,
            0x46 => Self::Teletext,
            0x56 => Self::VbiTeletext,
            0x26 => Self::MetadataId3,
            0x1d => Self::Mscodec,
            0x1e => Self::SlOrFmc,
            0x1f => Self::SlOrFmcAlt,
            _ => return None,
        })
    }

    /// Codec implied by the tag alone (some, like Opus, need a supplementary
    /// extension-descriptor byte `0x80` to confirm; callers check that
    /// separately before trusting this).
    pub fn implied_codec(self) -> Option<FourCc> {
        match self {
            Self::Ac3 => Some(fourcc(b"ac-3")),
            Self::Eac3 => Some(fourcc(b"eac3")),
            Self::Dts => Some(fourcc(b"dts ")),
            Self::OpusExtension => Some(fourcc(b"opus")),
            _ => None,
        }
    }
}

/// ATSC/ARIB registration types recognised from PMT program-level
/// descriptors, per §4.5 item 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationType {
    #[default]
    None,
    Bluray,
    Atsc,
    Arib,
}

/// The three descriptor tags used to score "this PMT is probably ARIB"
/// (§4.5 item 2): data-component, hierarchical-transmission, and
/// conditional-playback descriptors.
pub const ARIB_PROBE_TAGS: [u8; 3] = [0xFD, 0xC4, 0xC8];
