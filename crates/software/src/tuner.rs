//! A chromatic tuner for bringing the attached VCO to a performer-selected reference note.

use crate::pitch;

/// Compares the measured VCO frequency against a target note selected on the switch bank.
///
/// The switch bank is read as two nibbles: the high nibble selects the octave (0–8) and the low nibble the note within
/// the octave (0–11, C to B). Larger values are clamped, so octave 0 note 0 is C0 (MIDI note 12) and the highest
/// selectable note is B8 (MIDI note 119).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Tuner {
    target: u16,
    deviation: i16,
}

impl Tuner {
    /// Constructs a [`Tuner`] with no target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts a switch-bank value into the selected note, in cents.
    pub fn target_from_selector(selector: u8) -> u16 {
        let octave = u16::from(selector >> 4).min(8);
        let note = u16::from(selector & 0x0F).min(11);
        octave * 1200 + note * 100 + pitch::MIN_CENTS
    }

    /// Selects the target note from the switch bank and compares it with the measured frequency. Returns the target,
    /// in cents.
    pub fn update(&mut self, selector: u8, measured_hz: f32) -> u16 {
        self.target = Self::target_from_selector(selector);
        self.deviation = pitch::cents_deviation(self.target_hz(), measured_hz);
        self.target
    }

    /// The most recently selected note, in cents.
    pub fn target(&self) -> u16 {
        self.target
    }

    /// The frequency of the selected note, in Hz.
    pub fn target_hz(&self) -> f32 {
        pitch::cents_to_hz(self.target)
    }

    /// How far the VCO is from the target, in cents; positive when sharp, negative when flat.
    pub fn deviation(&self) -> i16 {
        self.deviation
    }

    /// Forgets the last comparison.
    pub fn clear(&mut self) {
        self.deviation = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector() {
        assert_eq!(1200, Tuner::target_from_selector(0x00), "C0");
        assert_eq!(6900, Tuner::target_from_selector(0x49), "A4");
        assert_eq!(6000, Tuner::target_from_selector(0x40), "C4");
        assert_eq!(
            11900,
            Tuner::target_from_selector(0x8B),
            "B8 is the highest selectable note"
        );
        assert_eq!(
            11900,
            Tuner::target_from_selector(0xFF),
            "Out-of-range fields should clamp"
        );
        assert_eq!(
            2300,
            Tuner::target_from_selector(0x0C),
            "Note field clamps to B"
        );
    }

    #[test]
    fn reports_deviation() {
        let mut tuner = Tuner::new();
        assert_eq!(6900, tuner.update(0x49, 440.0));
        assert_eq!(0, tuner.deviation());

        tuner.update(0x49, 880.0);
        assert_eq!(1200, tuner.deviation());

        tuner.update(0x49, 437.0);
        assert_eq!(-12, tuner.deviation());
    }

    #[test]
    fn silence_is_maximally_flat() {
        let mut tuner = Tuner::new();
        tuner.update(0x49, 0.0);
        assert_eq!(i16::MIN, tuner.deviation());

        tuner.clear();
        assert_eq!(0, tuner.deviation());
    }
}
