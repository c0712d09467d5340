//! This crate contains architecture-agnostic logic for a two-channel MIDI-to-CV module which calibrates itself
//! against an attached [VCO](https://en.wikipedia.org/wiki/Voltage-controlled_oscillator). It translates notes into
//! [1 V/octave control voltages](https://en.wikipedia.org/wiki/CV/gate) and corrects both the gain error of the output
//! amplifiers and the non-linear pitch response of the oscillator.
//!
//! The heart of the crate is the [`CalibrationController`][calibration::CalibrationController], a button-driven state
//! machine which walks the performer through gain trimming, tuning, and an automatic linearity sweep. The sweep fills
//! a [`CalibrationTable`][table::CalibrationTable] per channel which is later consulted by
//! [`note_to_voltage`][calibration::CalibrationController::note_to_voltage] on every note event.

#![deny(missing_docs)]
#![no_std]

// must come first so the logging macros are visible to the modules below
mod fmt;

pub mod button;
pub mod calibration;
pub mod channel;
pub mod compensation;
pub mod configuration;
pub mod error;
pub mod frequency;
pub mod indicator;
pub mod linearity;
pub mod outputs;
pub mod performance;
pub mod pitch;
pub mod stopwatch;
pub mod store;
pub mod table;
pub mod tuner;
