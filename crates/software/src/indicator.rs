//! Renders a calibration session on the three status LEDs.
//!
//! | Stage | Green | Blue | Red |
//! |---|---|---|---|
//! | preparing | blinks once per position in the cycle | | |
//! | gain trim | | on for channel 2 | on |
//! | tuner | in tune | flat | sharp |
//! | sweep, settling | | on | |
//! | sweep, stepping | on | lit for the completed share of each second | |
//! | done | flashes | | |
//! | error | | | flashes |
//!
//! The sweep's own tuning phase is shown like the tuner.

use crate::{
    calibration::{CalibrationStage, CalibrationStatus},
    channel::Channel,
    configuration::CalibrationConfig,
    linearity::VcoSubStage,
};
use embassy_time::Instant;

/// Length of one blink sequence announcing a preparation stage; the first half is dark.
const PREPARATION_CYCLE_MS: u64 = 2000;
/// Length of the window over which sweep progress is shown.
const PROGRESS_CYCLE_MS: u64 = 1000;
/// Half period of the done and error flashes.
const FLASH_MS: u64 = 250;

/// Which status LEDs are lit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LedFrame {
    /// The green LED.
    pub green: bool,
    /// The blue LED.
    pub blue: bool,
    /// The red LED.
    pub red: bool,
}

impl LedFrame {
    const DARK: Self = Self {
        green: false,
        blue: false,
        red: false,
    };
}

/// Chooses the LED frame for a session snapshot.
#[derive(Clone, Debug)]
pub struct Indicator {
    in_tune: u16,
}

impl Indicator {
    /// Constructs an [`Indicator`] which shows the VCO as in tune within the sweep's starting tolerance.
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            in_tune: config.start_deviation,
        }
    }

    /// Returns what the LEDs should show at `now`.
    pub fn render(&self, status: &CalibrationStatus, now: Instant) -> LedFrame {
        let millis = now.as_millis();
        if status.sub_stage == VcoSubStage::Tuner {
            return self.tuner(status.deviation);
        }
        match status.stage {
            CalibrationStage::None => LedFrame::DARK,
            CalibrationStage::Prepare(preparation) => LedFrame {
                green: blink(preparation as u8 + 1, millis % PREPARATION_CYCLE_MS),
                ..LedFrame::DARK
            },
            CalibrationStage::Gain(channel) => LedFrame {
                blue: channel == Channel::Two,
                red: true,
                ..LedFrame::DARK
            },
            CalibrationStage::Tuner => self.tuner(status.deviation),
            CalibrationStage::Vco(_) => match status.sub_stage {
                VcoSubStage::Linearity => LedFrame {
                    green: true,
                    blue: ((millis % PROGRESS_CYCLE_MS) as f32)
                        < status.progress * PROGRESS_CYCLE_MS as f32,
                    red: false,
                },
                _ => LedFrame {
                    blue: true,
                    ..LedFrame::DARK
                },
            },
            CalibrationStage::Done(_) => LedFrame {
                green: (millis / FLASH_MS) % 2 == 0,
                ..LedFrame::DARK
            },
            CalibrationStage::Error => LedFrame {
                red: (millis / FLASH_MS) % 2 == 0,
                ..LedFrame::DARK
            },
        }
    }

    fn tuner(&self, deviation: i16) -> LedFrame {
        if deviation.unsigned_abs() <= self.in_tune {
            LedFrame {
                green: true,
                ..LedFrame::DARK
            }
        } else if deviation < 0 {
            LedFrame {
                blue: true,
                ..LedFrame::DARK
            }
        } else {
            LedFrame {
                red: true,
                ..LedFrame::DARK
            }
        }
    }
}

/// Returns whether the LED is lit `phase` milliseconds into a sequence of `count` blinks.
///
/// The first half of the sequence is dark. The second half is split into `2 * count - 1` frames which alternate
/// between lit and dark, so the sequence always starts and ends lit.
fn blink(count: u8, phase: u64) -> bool {
    let half = PREPARATION_CYCLE_MS / 2;
    if phase < half {
        return false;
    }
    let frames = u64::from(count) * 2 - 1;
    let frame = (phase - half) * frames / half;
    frame % 2 == 0
}
