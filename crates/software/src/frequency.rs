//! Measures the frequency of the attached VCO from the timing of its edges.
//!
//! Measurement is split across two execution contexts. The edge interrupt calls [`EdgeCapture::record_edge`], which
//! derives an instantaneous frequency from the period since the previous edge. The control loop owns a
//! [`FrequencyMeter`] which samples that value and smooths it into a stable reading. The [`EdgeCapture`] is the only
//! state shared between the two, and every access to it happens inside a critical section.

use crate::{configuration::CalibrationConfig, error::CalibrationError};
use core::cell::Cell;
use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use embassy_time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct EdgeState {
    /// Timestamp of the most recent edge; `None` until a baseline has been established.
    last_edge: Option<Instant>,
    /// Frequency derived from the two most recent edges, in Hz.
    hz: f32,
}

/// Edge timestamps shared between the edge interrupt and the control loop.
///
/// Intended to live in a `static`, written from interrupt context and read from the control loop.
pub struct EdgeCapture {
    state: Mutex<CriticalSectionRawMutex, Cell<EdgeState>>,
}

impl Default for EdgeCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeCapture {
    /// Constructs an [`EdgeCapture`] with no baseline.
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(Cell::new(EdgeState {
                last_edge: None,
                hz: 0.0,
            })),
        }
    }

    /// Records an edge of the VCO's output. Safe to call from interrupt context: constant time, no blocking.
    ///
    /// The first edge after construction or after [`forget`][Self::forget] only establishes a baseline, as does an
    /// edge which isn't later than its predecessor.
    pub fn record_edge(&self, timestamp: Instant) {
        self.state.lock(|cell| {
            let mut state = cell.get();
            if let Some(period) = state
                .last_edge
                .and_then(|last| timestamp.checked_duration_since(last))
                .filter(|period| period.as_ticks() > 0)
            {
                state.hz = 1e6 / period.as_micros() as f32;
            }
            state.last_edge = Some(timestamp);
            cell.set(state);
        });
    }

    /// Returns the latest instantaneous frequency and the timestamp of the edge it was measured at.
    fn snapshot(&self) -> EdgeState {
        self.state.lock(|cell| cell.get())
    }

    /// Discards the baseline and the last measurement.
    pub fn forget(&self) {
        self.state.lock(|cell| cell.set(EdgeState::default()));
    }
}

/// Smooths the instantaneous frequency published by an [`EdgeCapture`].
#[derive(Clone, Debug)]
pub struct FrequencyMeter {
    smoothing: f32,
    timeout: Duration,
    hz: f32,
}

impl FrequencyMeter {
    /// Constructs a [`FrequencyMeter`] reading 0 Hz.
    pub fn new(config: &CalibrationConfig) -> Self {
        Self {
            smoothing: config.smoothing,
            timeout: config.signal_timeout,
            hz: 0.0,
        }
    }

    /// Returns the current smoothed reading, in Hz. Zero means no signal.
    pub fn hz(&self) -> f32 {
        self.hz
    }

    /// Drops the smoothed reading so the next update starts fresh from the raw value.
    pub fn reset(&mut self) {
        self.hz = 0.0;
    }

    /// Folds the latest measurement into the smoothed reading and returns it.
    ///
    /// When no edge has arrived within the signal timeout, the reading and the capture are cleared and
    /// [`CalibrationError::SignalLost`] is returned; this is reported once per loss of signal.
    pub fn update(&mut self, capture: &EdgeCapture, now: Instant) -> Result<f32, CalibrationError> {
        let EdgeState { last_edge, hz: raw } = capture.snapshot();

        // readings at or below 1 Hz are treated as "no history" and replaced outright
        if self.hz <= 1.0 {
            self.hz = raw;
        } else {
            self.hz = self.hz * self.smoothing + raw * (1.0 - self.smoothing);
        }

        if self.hz > 0.0 {
            let silent_for = last_edge.map(|last| now.checked_duration_since(last));
            let timed_out = match silent_for {
                Some(Some(silence)) => silence > self.timeout,
                // an edge stamped after `now` was recorded mid-update
                Some(None) => false,
                None => true,
            };
            if timed_out {
                debug!("No edge from the VCO within {} ms", self.timeout.as_millis());
                self.hz = 0.0;
                capture.forget();
                return Err(CalibrationError::SignalLost);
            }
        }

        Ok(self.hz)
    }
}
