//! 33-bit 90 kHz MPEG clock arithmetic and wrap-around correction.
//!
//! Two coordinate systems are used throughout the crate: `ticks_90k`, the
//! on-wire MPEG clock truncated to 33 bits, and `ticks_us`, the host's
//! integer-microsecond time base. Conversions are fixed-precision and exact
//! for the 33-bit domain: `us = (ticks_90k * 100) / 9`.

/// One full 33-bit rollover period of the 90 kHz clock, expressed in microseconds.
pub const ROLL_US: i64 = to_micros(0x1_FFFF_FFFF) + to_micros(1);

/// Half of [`ROLL_US`]; the threshold past which a "smaller" timestamp is assumed to have wrapped.
pub const HALF_ROLL_US: i64 = to_micros(0xFFFF_FFFF);

const _: () = assert!(0xFFFF_FFFFu64 == 0x1_FFFF_FFFFu64 / 2);

/// Converts a 33-bit, 90 kHz tick count to microseconds.
pub const fn to_micros(ticks_90k: u64) -> i64 {
    ((ticks_90k as i128 * 100) / 9) as i64
}

/// Converts a microsecond timestamp back to 90 kHz ticks.
pub const fn from_micros(us: i64) -> u64 {
    ((us as i128 * 9) / 100) as u64
}

/// Corrects `candidate` for 33-bit clock rollover relative to a known-past `reference`.
///
/// Both arguments and the result are in microseconds. If `reference` is `None` or
/// `candidate >= reference`, `candidate` is returned unchanged: there is nothing to
/// correct for, and a DTS legitimately trailing a recent PCR by a fraction of a second
/// must not be shifted forward by a full rollover.
///
/// Idempotent: `wrap_correct(r, wrap_correct(r, t)) == wrap_correct(r, t)`, since a
/// corrected value is by construction `>= reference`.
pub fn wrap_correct(reference: Option<i64>, candidate: i64) -> i64 {
    let Some(reference) = reference else {
        return candidate;
    };
    if candidate >= reference {
        return candidate;
    }
    let delta = reference - candidate;
    if delta >= HALF_ROLL_US {
        let rolls = (delta + ROLL_US - 1) / ROLL_US;
        candidate + rolls * ROLL_US
    } else {
        candidate
    }
}
