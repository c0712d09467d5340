//! Conversions between notes, frequencies and voltages.
//!
//! Notes are expressed in cents, i.e., hundredths of a MIDI note number: `6000` is middle C (MIDI note 60), `6950` is a
//! quarter tone above it. Frequencies follow twelve-tone equal temperament with A4 (MIDI note 69) at 440 Hz.

use libm::{log2f, powf, roundf};

/// Lowest note the module can voice, MIDI note 12 (C0), which corresponds to 0 V.
pub const MIN_CENTS: u16 = 1200;

/// Highest note the module can voice, MIDI note 127 (G9).
pub const MAX_CENTS: u16 = 12700;

const REFERENCE_CENTS: f32 = 6900.0;
const REFERENCE_HZ: f32 = 440.0;
const CENTS_PER_OCTAVE: f32 = 1200.0;

/// Returns `true` if `cents` lies within the voiceable range.
pub fn in_range(cents: u16) -> bool {
    (MIN_CENTS..=MAX_CENTS).contains(&cents)
}

/// Returns the frequency, in Hz, of a note given in cents.
pub fn cents_to_hz(cents: u16) -> f32 {
    REFERENCE_HZ * powf(2.0, (f32::from(cents) - REFERENCE_CENTS) / CENTS_PER_OCTAVE)
}

/// Returns the nearest note, in cents, to a frequency. Non-positive frequencies yield `0`; the result is not clamped
/// to the voiceable range.
pub fn hz_to_cents(hz: f32) -> u16 {
    if hz <= 0.0 {
        return 0;
    }
    // float-to-int casts saturate, so absurdly low or high frequencies land on 0 or u16::MAX
    roundf(REFERENCE_CENTS + CENTS_PER_OCTAVE * log2f(hz / REFERENCE_HZ)) as u16
}

/// Returns how far `measured` is from `target`, in cents, rounded to the nearest cent.
///
/// A non-positive `target` yields [`i16::MAX`] and a non-positive `measured` yields [`i16::MIN`]; any other result is
/// saturated to the range of [`i16`].
pub fn cents_deviation(target: f32, measured: f32) -> i16 {
    if target <= 0.0 {
        return i16::MAX;
    }
    if measured <= 0.0 {
        return i16::MIN;
    }
    let cents = CENTS_PER_OCTAVE * log2f(measured / target);
    if cents >= f32::from(i16::MAX) {
        i16::MAX
    } else if cents <= f32::from(i16::MIN) {
        i16::MIN
    } else {
        roundf(cents) as i16
    }
}

/// Converts a note to millivolts on an ideal 1 V/octave scale where C0 (MIDI note 12) sits at 0 V; e.g., middle C
/// (`6000`) yields 4000 mV.
pub fn direct_millivolts(cents: u16) -> f32 {
    if cents <= MIN_CENTS {
        return 0.0;
    }
    let octave = cents / 1200;
    let fraction = f32::from(cents % 1200) / CENTS_PER_OCTAVE;
    1000.0 * (f32::from(octave - 1) + fraction)
}
