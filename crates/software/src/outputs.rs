//! Holds the voltage each CV output should produce until the next DAC write.

use crate::channel::Channel;
use measurements::Voltage;

/// The target voltage of each CV output.
///
/// Targets are only recorded here; the control loop converts them into DAC codes (see
/// [`VoltageCompensator::codes`][crate::compensation::VoltageCompensator::codes]) and writes them once per cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CvOutputs {
    targets: [Voltage; 2],
}

impl Default for CvOutputs {
    fn default() -> Self {
        Self::new()
    }
}

impl CvOutputs {
    /// Constructs [`CvOutputs`] with both channels at 0 V.
    pub fn new() -> Self {
        Self {
            targets: [Voltage::from_millivolts(0.0); 2],
        }
    }

    /// Sets the targets of both channels; `None` leaves a channel unchanged. Negative voltages are raised to 0 V, as
    /// the outputs are unipolar.
    pub fn set(&mut self, first: Option<Voltage>, second: Option<Voltage>) {
        if let Some(voltage) = first {
            self.set_channel(Channel::One, voltage);
        }
        if let Some(voltage) = second {
            self.set_channel(Channel::Two, voltage);
        }
    }

    /// Sets the target of a single channel.
    pub fn set_channel(&mut self, channel: Channel, voltage: Voltage) {
        self.targets[channel.index()] = if voltage.as_millivolts() >= 0.0 {
            voltage
        } else {
            Voltage::from_millivolts(0.0)
        };
    }

    /// Drives both channels to 0 V.
    pub fn zero(&mut self) {
        self.set(
            Some(Voltage::from_millivolts(0.0)),
            Some(Voltage::from_millivolts(0.0)),
        );
    }

    /// The target of `channel`.
    pub fn target(&self, channel: Channel) -> Voltage {
        self.targets[channel.index()]
    }
}
