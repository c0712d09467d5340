//! Compensates the output DAC for supply drift and amplifier gain error.
//!
//! The DAC is referenced to the supply rail, so its output for a given code scales with the supply. The supply is
//! inferred by sampling a fixed internal reference with the ADC, itself referenced to the supply: the fewer counts the
//! reference reads, the higher the supply. Each channel's output amplifier multiplies the DAC's output by a base gain
//! set by resistors, which the performer trims by a small [`GainOffset`] during calibration.

use crate::{channel::Channel, configuration::ConverterProfile, outputs::CvOutputs};
use measurements::Voltage;

/// A per-channel trim of the output amplifier's gain, entered on the switch bank.
///
/// Stored as the raw switch-bank value: bit 7 is the sign (set for positive) and bits 0–6 are the magnitude in
/// thousandths, giving a range of ±0.127.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GainOffset(u8);

impl GainOffset {
    /// Interprets a switch-bank value as a [`GainOffset`].
    pub const fn from_selector(selector: u8) -> Self {
        Self(selector)
    }

    /// The raw switch-bank value, as persisted.
    pub const fn selector(self) -> u8 {
        self.0
    }

    /// The offset to add to the base gain.
    pub fn value(self) -> f32 {
        let magnitude = f32::from(self.0 & 0x7F) / 1000.0;
        if self.0 & 0x80 != 0 {
            magnitude
        } else {
            -magnitude
        }
    }
}

/// Converts target voltages into DAC codes corrected for the measured supply and each channel's gain.
#[derive(Clone, Debug)]
pub struct VoltageCompensator {
    profile: ConverterProfile,
    supply: Voltage,
}

impl VoltageCompensator {
    /// Constructs a [`VoltageCompensator`] assuming the nominal supply until the first measurement.
    pub fn new(profile: ConverterProfile) -> Self {
        let supply = profile.nominal_supply;
        Self { profile, supply }
    }

    /// Updates the supply estimate from an ADC reading of the internal reference. Meant to run once per control
    /// cycle. A zero reading is ignored.
    pub fn measure_supply(&mut self, reference_counts: u16) {
        if reference_counts == 0 {
            warn!("Internal reference read as zero; keeping previous supply estimate");
            return;
        }
        self.supply = Voltage::from_millivolts(
            self.profile.internal_reference.as_millivolts() * f64::from(self.profile.adc_full_scale)
                / f64::from(reference_counts),
        );
    }

    /// The latest supply estimate.
    pub fn supply(&self) -> Voltage {
        self.supply
    }

    /// Total amplifier gain of `channel` with `offset` applied.
    pub fn gain(&self, channel: Channel, offset: GainOffset) -> f32 {
        self.profile.base_gain(channel) + offset.value()
    }

    /// The highest voltage `channel` can currently produce, i.e., its output at full-scale code.
    pub fn max_voltage(&self, channel: Channel, offset: GainOffset) -> Voltage {
        self.supply * f64::from(self.gain(channel, offset))
    }

    /// Returns the DAC code which produces `target` on `channel`, clamped to the converter's range.
    pub fn code(&self, channel: Channel, target: Voltage, offset: GainOffset) -> u16 {
        let max = self.max_voltage(channel, offset).as_millivolts();
        if max <= 0.0 {
            return 0;
        }
        let full_scale = f64::from(self.profile.dac_full_scale);
        let code = target.as_millivolts() / max * full_scale;
        // float-to-int casts saturate at zero, so only the top needs clamping
        code.min(full_scale) as u16
    }

    /// Returns the DAC codes for both channels' current targets.
    pub fn codes(&self, outputs: &CvOutputs, offsets: &[GainOffset; 2]) -> [u16; 2] {
        Channel::ALL.map(|channel| {
            self.code(channel, outputs.target(channel), offsets[channel.index()])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn compensator() -> VoltageCompensator {
        VoltageCompensator::new(ConverterProfile {
            internal_reference: Voltage::from_millivolts(1100.0),
            adc_full_scale: 1023,
            dac_full_scale: 4095,
            nominal_supply: Voltage::from_millivolts(5000.0),
            base_gain: [2.0, 1.5],
        })
    }

    #[test]
    fn gain_offset_encoding() {
        assert_relative_eq!(0.127, GainOffset::from_selector(0xFF).value());
        assert_relative_eq!(-0.127, GainOffset::from_selector(0x7F).value());
        assert_relative_eq!(0.005, GainOffset::from_selector(0x85).value());
        assert_relative_eq!(-0.005, GainOffset::from_selector(0x05).value());
        assert_eq!(0.0, GainOffset::from_selector(0x80).value());
        assert_eq!(0.0, GainOffset::from_selector(0x00).value());
        assert_eq!(0x85, GainOffset::from_selector(0x85).selector());
    }

    #[test]
    fn measures_supply() {
        let mut compensator = compensator();
        assert_relative_eq!(5000.0, compensator.supply().as_millivolts());

        compensator.measure_supply(225);
        assert_relative_eq!(
            1100.0 * 1023.0 / 225.0,
            compensator.supply().as_millivolts(),
            max_relative = 1e-9
        );

        compensator.measure_supply(0);
        assert_relative_eq!(
            1100.0 * 1023.0 / 225.0,
            compensator.supply().as_millivolts(),
            max_relative = 1e-9
        );
    }

    #[test]
    fn max_voltage_includes_offset() {
        let compensator = compensator();
        assert_relative_eq!(
            10_000.0,
            compensator
                .max_voltage(Channel::One, GainOffset::default())
                .as_millivolts(),
            max_relative = 1e-6
        );
        // gain 1.5 + 0.1
        assert_relative_eq!(
            8000.0,
            compensator
                .max_voltage(Channel::Two, GainOffset::from_selector(0x80 | 100))
                .as_millivolts(),
            max_relative = 1e-6
        );
    }

    #[test]
    fn code_scales_and_clamps() {
        let compensator = compensator();
        let offset = GainOffset::default();
        assert_eq!(
            0,
            compensator.code(Channel::One, Voltage::from_millivolts(0.0), offset)
        );
        assert_eq!(
            2047,
            compensator.code(Channel::One, Voltage::from_millivolts(5000.0), offset)
        );
        assert_eq!(
            4095,
            compensator.code(Channel::One, Voltage::from_millivolts(10_000.0), offset)
        );
        assert_eq!(
            4095,
            compensator.code(Channel::One, Voltage::from_millivolts(25_000.0), offset),
            "Targets beyond reach should clamp to full scale"
        );
    }

    #[test]
    fn lower_supply_needs_higher_code() {
        let mut compensator = compensator();
        let target = Voltage::from_millivolts(3000.0);
        let before = compensator.code(Channel::One, target, GainOffset::default());
        // reference now reads more counts, i.e., the supply sagged
        compensator.measure_supply(250);
        let after = compensator.code(Channel::One, target, GainOffset::default());
        assert!(after > before, "Expected {} to exceed {}", after, before);
    }

    #[test]
    fn codes_for_both_channels() {
        let compensator = compensator();
        let mut outputs = CvOutputs::new();
        outputs.set(
            Some(Voltage::from_millivolts(2500.0)),
            Some(Voltage::from_millivolts(3750.0)),
        );
        assert_eq!(
            [1023, 2047],
            compensator.codes(&outputs, &[GainOffset::default(); 2])
        );
    }
}
