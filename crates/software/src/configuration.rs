//! This module contains the tunable constants of the calibration engine, a description of the converter hardware,
//! and a trait for cycling through enum-based settings with a pushbutton.

use crate::channel::Channel;
use embassy_time::Duration;
use measurements::Voltage;
use num_traits::{FromPrimitive, ToPrimitive};

/// A trait which allows infinite cycling of an enum's variants.
///
/// Useful for pushbutton user interfaces, allowing presses to advance from the current to the next variant,
/// cycling back to the beginning when all variants have been exhausted.
pub trait CycleConfig {
    /// Return the next variant, cycling back to the beginning as needed.
    fn cycle(self) -> Self
    where
        Self: FromPrimitive + ToPrimitive + Sized,
    {
        let index = self
            .to_u8()
            .expect("enum variants should be castable to u8");
        match <Self as FromPrimitive>::from_u8(index + 1) {
            Some(new_selection) => new_selection,
            None => FromPrimitive::from_u8(0).expect("enum should not be empty"),
        }
    }
}

/// Timing and threshold constants governing a calibration session.
///
/// The defaults have been arrived at empirically with analog VCOs; slower oscillators may want a longer
/// [`step_interval`][Self::step_interval] at the cost of a longer sweep.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationConfig {
    /// Presses shorter than this are treated as contact bounce rather than released.
    pub debounce: Duration,
    /// Holding the button at least this long produces a long press.
    pub long_press: Duration,
    /// Weight given to the previous reading by the frequency filter (0..1, closer to 1 is smoother but slower).
    pub smoothing: f32,
    /// Without an edge for this long, the input is considered silent.
    pub signal_timeout: Duration,
    /// Largest deviation, in cents, at which the VCO is considered in tune before a sweep.
    pub start_deviation: u16,
    /// How long the VCO must stay in tune before the sweep lowers the voltage.
    pub tuner_hold: Duration,
    /// How long to let the VCO settle at the sweep's floor voltage.
    pub lower_settle: Duration,
    /// Voltage at which the sweep begins.
    pub sweep_floor: Voltage,
    /// Minimum delay between two frequency samples of the sweep.
    pub step_interval: Duration,
    /// Portion of the channel's maximum voltage at which the sweep ends.
    pub sweep_end_scale: f32,
    /// Largest disagreement, in cents, tolerated between samples of the stabilization window.
    pub stabilization_tolerance: u16,
    /// Voltage produced on each channel while its gain is trimmed.
    pub gain_reference: [Voltage; 2],
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(240),
            long_press: Duration::from_millis(1000),
            smoothing: 0.994,
            signal_timeout: Duration::from_millis(2000),
            start_deviation: 10,
            tuner_hold: Duration::from_millis(5000),
            lower_settle: Duration::from_millis(2000),
            sweep_floor: Voltage::from_millivolts(10.0),
            step_interval: Duration::from_millis(10),
            sweep_end_scale: 0.95,
            stabilization_tolerance: 1,
            gain_reference: [
                Voltage::from_millivolts(3000.0),
                Voltage::from_millivolts(3000.0),
            ],
        }
    }
}

/// Describes the converters and amplifiers between the microcontroller and the CV jacks.
#[derive(Clone, Debug, PartialEq)]
pub struct ConverterProfile {
    /// Voltage of the internal reference sampled to infer the supply voltage.
    pub internal_reference: Voltage,
    /// Highest count the supply-measuring ADC can produce.
    pub adc_full_scale: u16,
    /// Highest code the output DAC accepts.
    pub dac_full_scale: u16,
    /// Supply voltage assumed until the first measurement.
    pub nominal_supply: Voltage,
    /// Gain of each channel's output amplifier before calibration offsets are applied.
    pub base_gain: [f32; 2],
}

impl ConverterProfile {
    /// Returns the uncalibrated amplifier gain of `channel`.
    pub fn base_gain(&self, channel: Channel) -> f32 {
        self.base_gain[channel.index()]
    }
}

impl Default for ConverterProfile {
    /// 12-bit converters referenced to a 3.3 V supply, with the non-inverting output amplifiers set to a gain of
    /// roughly 1.82; a full-scale DAC code therefore yields just over 6 V.
    fn default() -> Self {
        Self {
            internal_reference: Voltage::from_millivolts(1210.0),
            adc_full_scale: 4095,
            dac_full_scale: 4095,
            nominal_supply: Voltage::from_millivolts(3300.0),
            base_gain: [1.824, 1.824],
        }
    }
}
