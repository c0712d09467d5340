//! The per-channel table mapping whole notes to the voltages which make the attached VCO play them.

use crate::pitch;
use measurements::Voltage;

/// Lowest note held in a [`CalibrationTable`], MIDI note 12 (C0).
pub const FIRST_NOTE: u8 = 12;

/// Highest note held in a [`CalibrationTable`], MIDI note 127 (G9).
pub const LAST_NOTE: u8 = 127;

/// Number of entries in a [`CalibrationTable`].
pub const TABLE_LEN: usize = (LAST_NOTE - FIRST_NOTE) as usize + 1;

/// Size of a [`CalibrationTable`] in non-volatile storage: both bounds, then each entry as a little-endian `u16`.
pub const ENCODED_LEN: usize = 2 + 2 * TABLE_LEN;

/// Value of [`note_min`][CalibrationTable::note_min] and [`note_max`][CalibrationTable::note_max] when no calibration
/// has been recorded.
pub const UNSET: u8 = 255;

/// An empirically measured note-to-voltage mapping for one channel.
///
/// Entry `n` holds the millivolts that produced MIDI note `n + 12` during the last linearity sweep. Only entries
/// between [`note_min`][Self::note_min] and [`note_max`][Self::note_max] are meaningful; entries set to 0 mV were not
/// recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalibrationTable {
    note_min: u8,
    note_max: u8,
    millivolts: [u16; TABLE_LEN],
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for CalibrationTable {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "CalibrationTable {{ note_min: {}, note_max: {} }}",
            self.note_min,
            self.note_max
        );
    }
}

impl CalibrationTable {
    /// Constructs an empty [`CalibrationTable`].
    pub const fn new() -> Self {
        Self {
            note_min: UNSET,
            note_max: UNSET,
            millivolts: [0; TABLE_LEN],
        }
    }

    /// Discards all recorded entries and bounds.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Lowest calibrated note, or [`UNSET`].
    pub fn note_min(&self) -> u8 {
        self.note_min
    }

    /// Highest calibrated note, or [`UNSET`].
    pub fn note_max(&self) -> u8 {
        self.note_max
    }

    /// Records the lowest calibrated note.
    pub fn set_note_min(&mut self, note: u8) {
        self.note_min = note;
    }

    /// Records the highest calibrated note.
    pub fn set_note_max(&mut self, note: u8) {
        self.note_max = note;
    }

    /// Returns `true` if the bounds describe a usable calibration. Anything else, including values read from blank
    /// or corrupted storage, means the table must not be consulted.
    pub fn is_valid(&self) -> bool {
        (FIRST_NOTE..=LAST_NOTE).contains(&self.note_min)
            && (FIRST_NOTE..=LAST_NOTE).contains(&self.note_max)
            && self.note_min < self.note_max
    }

    /// Returns the millivolts recorded for `note`, or `None` if the note is outside the table.
    pub fn entry(&self, note: u8) -> Option<u16> {
        Self::index(note).map(|index| self.millivolts[index])
    }

    /// Records the millivolts which produce `note`. Notes outside the table are ignored.
    pub fn set_entry(&mut self, note: u8, millivolts: u16) {
        if let Some(index) = Self::index(note) {
            self.millivolts[index] = millivolts;
        }
    }

    fn index(note: u8) -> Option<usize> {
        (FIRST_NOTE..=LAST_NOTE)
            .contains(&note)
            .then(|| usize::from(note - FIRST_NOTE))
    }

    fn is_recorded(&self, note: u8) -> bool {
        self.entry(note).is_some_and(|mv| mv != 0)
    }

    /// Returns the voltage for a note given in cents by interpolating the recorded entries, or `None` if the table
    /// isn't [valid][Self::is_valid].
    ///
    /// Queries are clamped to the calibrated range. Between two recorded whole notes, the voltage is interpolated
    /// linearly; notes which were never recorded are skipped over.
    pub fn interpolate(&self, cents: u16) -> Option<Voltage> {
        if !self.is_valid() {
            return None;
        }

        let note = (f32::from(cents) / 100.0).clamp(f32::from(self.note_min), f32::from(self.note_max));
        let whole = note as u8;

        let lower = (self.note_min..=whole)
            .rev()
            .find(|&n| self.is_recorded(n))
            .unwrap_or(self.note_min);
        let upper = (whole.saturating_add(1)..=self.note_max)
            .find(|&n| self.is_recorded(n))
            .unwrap_or(self.note_max);

        let lower_mv = f32::from(self.entry(lower).unwrap_or_default());
        if upper <= lower {
            return Some(Voltage::from_millivolts(f64::from(lower_mv)));
        }
        let upper_mv = f32::from(self.entry(upper).unwrap_or_default());
        let position = (note - f32::from(lower)) / f32::from(upper - lower);
        let millivolts = lower_mv + position * (upper_mv - lower_mv);
        Some(Voltage::from_millivolts(f64::from(millivolts)))
    }

    /// Converts the table into its storage representation.
    pub fn to_bytes(&self) -> [u8; ENCODED_LEN] {
        let mut bytes = [0; ENCODED_LEN];
        bytes[0] = self.note_min;
        bytes[1] = self.note_max;
        for (chunk, mv) in bytes[2..].chunks_exact_mut(2).zip(self.millivolts.iter()) {
            chunk.copy_from_slice(&mv.to_le_bytes());
        }
        bytes
    }

    /// Reconstructs a table from its storage representation. No validation is performed; see
    /// [`is_valid`][Self::is_valid].
    pub fn from_bytes(bytes: &[u8; ENCODED_LEN]) -> Self {
        let mut millivolts = [0; TABLE_LEN];
        for (mv, chunk) in millivolts.iter_mut().zip(bytes[2..].chunks_exact(2)) {
            *mv = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
        Self {
            note_min: bytes[0],
            note_max: bytes[1],
            millivolts,
        }
    }
}

/// Returns the voltage for a note given in cents: interpolated from `table` when it holds a valid calibration, from
/// the ideal 1 V/octave formula otherwise. Notes outside the voiceable range yield 0 V.
pub fn note_to_voltage(table: Option<&CalibrationTable>, cents: u16) -> Voltage {
    if !pitch::in_range(cents) {
        return Voltage::from_millivolts(0.0);
    }
    table
        .and_then(|table| table.interpolate(cents))
        .unwrap_or_else(|| Voltage::from_millivolts(f64::from(pitch::direct_millivolts(cents))))
}
