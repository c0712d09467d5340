//! The automatic sweep which measures how the attached VCO's pitch responds to voltage.
//!
//! A sweep runs in three sub-stages. First the performer tunes the VCO to the note selected on the switch bank, and
//! the sweep waits until it has stayed in tune for a while. Then the output drops to a floor voltage and the VCO is
//! given time to settle. Finally the output climbs one millivolt at a time; at each step the VCO's pitch is sampled
//! until it stabilizes, and for every whole note the voltage which came closest to it is recorded in the channel's
//! [`CalibrationTable`].

use crate::{
    configuration::CalibrationConfig, error::CalibrationError, pitch, stopwatch::Stopwatch,
    table::CalibrationTable,
};
use embassy_time::{Duration, Instant};
use measurements::Voltage;

/// Number of consecutive samples which must agree before a step's pitch is accepted.
pub const STABILIZATION_WINDOW: usize = 5;

/// The phase of a running sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VcoSubStage {
    /// No sweep is running.
    #[default]
    None,
    /// Waiting for the performer to tune the VCO.
    Tuner,
    /// Waiting for the VCO to settle at the floor voltage.
    Lower,
    /// Stepping the voltage and recording the response.
    Linearity,
}

/// What the output of the channel under test should do after a call to [`LinearityCalibrator::poll`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SweepEvent {
    /// The VCO is in tune; drive the output to this floor voltage and restart frequency measurement.
    Lowered(Voltage),
    /// Drive the output to this voltage.
    Stepped(Voltage),
    /// The table is complete.
    Finished,
}

/// The closest voltage found so far for a note.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Candidate {
    note: u8,
    millivolts: u16,
    /// How far above the whole note the VCO played, in cents.
    residual: u16,
}

/// Drives a linearity sweep of one channel.
#[derive(Clone, Debug)]
pub struct LinearityCalibrator {
    start_deviation: u16,
    tuner_hold: Duration,
    lower_settle: Duration,
    floor: u16,
    step_interval: Duration,
    end_scale: f32,
    tolerance: u16,

    sub_stage: VcoSubStage,
    timer: Stopwatch,
    window: [u16; STABILIZATION_WINDOW],
    window_index: usize,
    millivolts: u16,
    candidate: Option<Candidate>,
    last_written: Option<u8>,
    progress: f32,
}

impl LinearityCalibrator {
    /// Constructs an idle [`LinearityCalibrator`].
    pub fn new(config: &CalibrationConfig) -> Self {
        let floor = config.sweep_floor.as_millivolts() as u16;
        Self {
            start_deviation: config.start_deviation,
            tuner_hold: config.tuner_hold,
            lower_settle: config.lower_settle,
            floor,
            step_interval: config.step_interval,
            end_scale: config.sweep_end_scale,
            tolerance: config.stabilization_tolerance,

            sub_stage: VcoSubStage::None,
            timer: Stopwatch::new(),
            window: [0; STABILIZATION_WINDOW],
            window_index: 0,
            millivolts: floor,
            candidate: None,
            last_written: None,
            progress: 0.0,
        }
    }

    /// Starts a new sweep at the tuning sub-stage.
    pub fn begin(&mut self) {
        self.sub_stage = VcoSubStage::Tuner;
        self.timer.stop();
        self.clear_window();
        self.millivolts = self.floor;
        self.candidate = None;
        self.last_written = None;
        self.progress = 0.0;
    }

    /// Abandons the running sweep, if any.
    pub fn stop(&mut self) {
        self.sub_stage = VcoSubStage::None;
        self.timer.stop();
    }

    /// The current sub-stage.
    pub fn sub_stage(&self) -> VcoSubStage {
        self.sub_stage
    }

    /// Estimated completion of the stepping sub-stage, from 0 to 1.
    pub fn progress(&self) -> f32 {
        self.progress
    }

    /// Advances the sweep.
    ///
    /// `deviation` is the tuner's reading against the performer-selected note and only matters while tuning;
    /// `max_voltage` is the highest voltage the channel under test can currently produce. Recorded notes are written
    /// into `table`, which should have been [reset][CalibrationTable::reset] before the sweep began.
    ///
    /// Returns [`CalibrationError::NonMonotonicResponse`] if the VCO's pitch skips a note or falls below a recorded
    /// one; the sweep stops and the table must be considered incomplete.
    pub fn poll(
        &mut self,
        table: &mut CalibrationTable,
        measured_hz: f32,
        deviation: i16,
        max_voltage: Voltage,
        now: Instant,
    ) -> Result<Option<SweepEvent>, CalibrationError> {
        match self.sub_stage {
            VcoSubStage::None => Ok(None),
            VcoSubStage::Tuner => {
                if deviation.unsigned_abs() > self.start_deviation {
                    self.timer.restart(now);
                }
                if self.timer.has_elapsed(now, self.tuner_hold) {
                    debug!("VCO held in tune; lowering to {} mV", self.floor);
                    self.timer.stop();
                    self.sub_stage = VcoSubStage::Lower;
                    return Ok(Some(SweepEvent::Lowered(Voltage::from_millivolts(
                        f64::from(self.floor),
                    ))));
                }
                Ok(None)
            }
            VcoSubStage::Lower => {
                if self.timer.has_elapsed(now, self.lower_settle) {
                    debug!("Starting linearity sweep");
                    self.timer.stop();
                    self.clear_window();
                    self.millivolts = self.floor;
                    self.candidate = None;
                    self.last_written = None;
                    self.sub_stage = VcoSubStage::Linearity;
                }
                Ok(None)
            }
            VcoSubStage::Linearity => {
                let result = self.step(table, measured_hz, max_voltage, now);
                if result.is_err() {
                    self.stop();
                }
                result
            }
        }
    }

    fn step(
        &mut self,
        table: &mut CalibrationTable,
        measured_hz: f32,
        max_voltage: Voltage,
        now: Instant,
    ) -> Result<Option<SweepEvent>, CalibrationError> {
        if self.timer.is_running() {
            if self.timer.elapsed(now) < self.step_interval {
                return Ok(None);
            }
        } else {
            self.timer.restart(now);
        }

        let cents = pitch::hz_to_cents(measured_hz);
        if !self.is_stable(cents) {
            return Ok(None);
        }
        self.timer.restart(now);
        trace!("{} mV -> {} cents", self.millivolts, cents);

        let end = (max_voltage.as_millivolts() as f32) * self.end_scale;
        self.progress = (f32::from(cents) / f32::from(pitch::MAX_CENTS))
            .max(f32::from(self.millivolts) / end)
            .clamp(0.0, 1.0);

        if cents > pitch::MAX_CENTS {
            return self.finish(table);
        }

        if pitch::in_range(cents) {
            self.track(table, cents)?;
        } else {
            self.candidate = None;
        }

        self.millivolts = self.millivolts.saturating_add(1);
        self.clear_window();
        if f32::from(self.millivolts) >= end {
            return self.finish(table);
        }
        Ok(Some(SweepEvent::Stepped(Voltage::from_millivolts(
            f64::from(self.millivolts),
        ))))
    }

    /// Records `cents` in the stabilization window, returning `true` if it agrees with a full window.
    fn is_stable(&mut self, cents: u16) -> bool {
        let stable = self
            .window
            .iter()
            .all(|&sample| sample != 0 && sample.abs_diff(cents) <= self.tolerance);
        self.window[self.window_index] = cents;
        self.window_index = (self.window_index + 1) % STABILIZATION_WINDOW;
        stable
    }

    fn clear_window(&mut self) {
        self.window = [0; STABILIZATION_WINDOW];
        self.window_index = 0;
    }

    fn track(&mut self, table: &mut CalibrationTable, cents: u16) -> Result<(), CalibrationError> {
        let note = (cents / 100) as u8;
        let fresh = Candidate {
            note,
            millivolts: self.millivolts,
            residual: cents % 100,
        };

        match self.candidate {
            None => self.candidate = Some(fresh),
            Some(candidate) if note == candidate.note => {
                if fresh.residual < candidate.residual {
                    self.candidate = Some(fresh);
                }
            }
            Some(candidate) if note == candidate.note + 1 => {
                self.commit(table, candidate)?;
                self.candidate = Some(fresh);
            }
            Some(candidate) if note > candidate.note => {
                warn!("VCO skipped from note {} to note {}", candidate.note, note);
                return Err(CalibrationError::NonMonotonicResponse {
                    previous: candidate.note,
                    next: note,
                });
            }
            Some(_) => {
                // a brief dip back to a recorded note is noise; falling below it is not
                if let Some(previous) = self.last_written
                    && note < previous
                {
                    warn!("VCO fell from note {} to note {}", previous, note);
                    return Err(CalibrationError::NonMonotonicResponse {
                        previous,
                        next: note,
                    });
                }
            }
        }
        Ok(())
    }

    fn commit(&mut self, table: &mut CalibrationTable, candidate: Candidate) -> Result<(), CalibrationError> {
        if let Some(previous) = self.last_written
            && candidate.note <= previous
        {
            warn!("Refusing to write note {} after note {}", candidate.note, previous);
            return Err(CalibrationError::NonMonotonicResponse {
                previous,
                next: candidate.note,
            });
        }

        if self.last_written.is_none() {
            debug!("Lowest calibrated note: {}", candidate.note);
            table.set_note_min(candidate.note);
        }
        debug!("Note {} = {} mV", candidate.note, candidate.millivolts);
        table.set_entry(candidate.note, candidate.millivolts);
        self.last_written = Some(candidate.note);
        Ok(())
    }

    fn finish(&mut self, table: &mut CalibrationTable) -> Result<Option<SweepEvent>, CalibrationError> {
        if let Some(candidate) = self.candidate.take() {
            self.commit(table, candidate)?;
            table.set_note_max(candidate.note);
        }
        info!(
            "Sweep finished at {} mV, notes {} to {}",
            self.millivolts,
            table.note_min(),
            table.note_max()
        );
        self.progress = 1.0;
        self.stop();
        Ok(Some(SweepEvent::Finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A VCO which plays 1 cent higher for each millivolt, starting at C1 (2400 cents).
    fn linear(mv: f64) -> f32 {
        pitch::cents_to_hz((2400.0 + mv) as u16)
    }

    struct Rig {
        calibrator: LinearityCalibrator,
        table: CalibrationTable,
        output: Voltage,
        now: Instant,
    }

    impl Rig {
        fn new() -> Self {
            let mut calibrator = LinearityCalibrator::new(&CalibrationConfig::default());
            calibrator.begin();
            Self {
                calibrator,
                table: CalibrationTable::new(),
                output: Voltage::from_millivolts(0.0),
                now: Instant::from_millis(1_000),
            }
        }

        /// Polls once per millisecond, feeding back `vco`'s response to the current output in whole millivolts.
        fn run(
            &mut self,
            vco: impl Fn(f64) -> f32,
            deviation: i16,
            max_voltage: f64,
            millis: u64,
        ) -> Result<Option<SweepEvent>, CalibrationError> {
            for _ in 0..millis {
                self.now += Duration::from_millis(1);
                let event = self.calibrator.poll(
                    &mut self.table,
                    vco(self.output.as_millivolts().round()),
                    deviation,
                    Voltage::from_millivolts(max_voltage),
                    self.now,
                )?;
                match event {
                    Some(SweepEvent::Lowered(voltage)) | Some(SweepEvent::Stepped(voltage)) => {
                        self.output = voltage
                    }
                    Some(SweepEvent::Finished) => return Ok(event),
                    None => {}
                }
            }
            Ok(None)
        }

        /// Runs through the tuning and settling sub-stages.
        fn reach_linearity(&mut self) {
            assert_eq!(Ok(None), self.run(linear, 0, 1000.0, 5_001));
            assert_eq!(VcoSubStage::Lower, self.calibrator.sub_stage());
            assert_eq!(10.0, self.output.as_millivolts());
            assert_eq!(Ok(None), self.run(linear, 0, 1000.0, 2_001));
            assert_eq!(VcoSubStage::Linearity, self.calibrator.sub_stage());
        }
    }

    #[test]
    fn idle_until_begun() {
        let mut calibrator = LinearityCalibrator::new(&CalibrationConfig::default());
        let mut table = CalibrationTable::new();
        assert_eq!(VcoSubStage::None, calibrator.sub_stage());
        assert_eq!(
            Ok(None),
            calibrator.poll(
                &mut table,
                440.0,
                0,
                Voltage::from_millivolts(6000.0),
                Instant::from_millis(10)
            )
        );
    }

    #[test]
    fn waits_for_vco_to_stay_in_tune() {
        let mut rig = Rig::new();
        assert_eq!(Ok(None), rig.run(linear, 11, 1000.0, 10_000));
        assert_eq!(
            VcoSubStage::Tuner,
            rig.calibrator.sub_stage(),
            "Expected left but got right"
        );

        // in tune for a while, then drifts out, resetting the hold
        assert_eq!(Ok(None), rig.run(linear, -10, 1000.0, 4_000));
        assert_eq!(Ok(None), rig.run(linear, -30, 1000.0, 1));
        assert_eq!(Ok(None), rig.run(linear, 3, 1000.0, 4_999));
        assert_eq!(VcoSubStage::Tuner, rig.calibrator.sub_stage());

        assert_eq!(
            Ok(Some(SweepEvent::Lowered(Voltage::from_millivolts(10.0)))),
            rig.calibrator.poll(
                &mut rig.table,
                440.0,
                3,
                Voltage::from_millivolts(1000.0),
                rig.now + Duration::from_millis(1)
            )
        );
        assert_eq!(VcoSubStage::Lower, rig.calibrator.sub_stage());
    }

    #[test]
    fn settles_before_stepping() {
        let mut rig = Rig::new();
        assert_eq!(Ok(None), rig.run(linear, 0, 1000.0, 5_001));
        assert_eq!(VcoSubStage::Lower, rig.calibrator.sub_stage());
        assert_eq!(Ok(None), rig.run(linear, 0, 1000.0, 2_000));
        assert_eq!(VcoSubStage::Lower, rig.calibrator.sub_stage());
        assert_eq!(Ok(None), rig.run(linear, 0, 1000.0, 1));
        assert_eq!(VcoSubStage::Linearity, rig.calibrator.sub_stage());
    }

    #[test]
    fn steps_only_once_stable() {
        let mut rig = Rig::new();
        rig.reach_linearity();

        // the first sample fills the window, the next four complete it, the sixth is accepted
        assert_eq!(Ok(None), rig.run(linear, 0, 1000.0, 5));
        assert_eq!(10.0, rig.output.as_millivolts());
        assert_eq!(Ok(None), rig.run(linear, 0, 1000.0, 1));
        assert_eq!(11.0, rig.output.as_millivolts());

        // the next step waits out the interval before sampling again
        assert_eq!(Ok(None), rig.run(linear, 0, 1000.0, 14));
        assert_eq!(11.0, rig.output.as_millivolts());
        assert_eq!(Ok(None), rig.run(linear, 0, 1000.0, 1));
        assert_eq!(12.0, rig.output.as_millivolts());
    }

    #[test]
    fn noisy_pitch_never_steps() {
        let mut rig = Rig::new();
        rig.reach_linearity();
        // alternates between two pitches 17 cents apart
        let mut flip = false;
        for _ in 0..500 {
            rig.now += Duration::from_millis(1);
            flip = !flip;
            let hz = if flip { 100.0 } else { 101.0 };
            let event = rig
                .calibrator
                .poll(
                    &mut rig.table,
                    hz,
                    0,
                    Voltage::from_millivolts(1000.0),
                    rig.now,
                )
                .unwrap();
            assert_eq!(None, event);
        }
        assert_eq!(0.0, rig.calibrator.progress());
    }

    #[test]
    fn records_closest_voltage_per_note() {
        let mut rig = Rig::new();
        rig.reach_linearity();
        assert_eq!(
            Ok(Some(SweepEvent::Finished)),
            rig.run(linear, 0, 1000.0, 100_000)
        );
        assert_eq!(VcoSubStage::None, rig.calibrator.sub_stage());
        assert_eq!(1.0, rig.calibrator.progress());

        // 10 mV plays 2410 cents; the sweep ends at 95% of 1000 mV, last sampled at 949 mV (3349 cents)
        let table = rig.table;
        assert_eq!(24, table.note_min(), "Expected left but got right");
        assert_eq!(33, table.note_max(), "Expected left but got right");
        assert!(table.is_valid());
        assert_eq!(Some(10), table.entry(24));
        for note in 25..=33 {
            assert_eq!(
                Some(100 * (u16::from(note) - 24)),
                table.entry(note),
                "Note {} should be recorded at the first voltage reaching it",
                note
            );
        }
        assert_eq!(Some(0), table.entry(34));
    }

    #[test]
    fn stops_past_highest_note() {
        let mut rig = Rig::new();
        rig.reach_linearity();
        // starts at 12650 cents, exceeding the range after 51 steps
        let high = |mv: f64| pitch::cents_to_hz((12640.0 + mv) as u16);
        assert_eq!(
            Ok(Some(SweepEvent::Finished)),
            rig.run(high, 0, 10_000.0, 100_000)
        );
        assert_eq!(126, rig.table.note_min());
        assert_eq!(127, rig.table.note_max());
        assert_eq!(Some(10), rig.table.entry(126));
        assert_eq!(Some(60), rig.table.entry(127));
    }

    #[test]
    fn skipped_note_is_fatal() {
        let mut rig = Rig::new();
        rig.reach_linearity();
        // jumps from 2599 cents at 199 mV to 2750 cents at 200 mV
        let jumpy = |mv: f64| {
            let cents = if mv < 200.0 { 2400.0 + mv } else { 2550.0 + mv };
            pitch::cents_to_hz(cents as u16)
        };
        assert_eq!(
            Err(CalibrationError::NonMonotonicResponse {
                previous: 25,
                next: 27
            }),
            rig.run(jumpy, 0, 1000.0, 100_000)
        );
        assert_eq!(VcoSubStage::None, rig.calibrator.sub_stage());

        // only the notes before the skip were written, in order
        assert_eq!(24, rig.table.note_min());
        assert_eq!(Some(10), rig.table.entry(24));
        assert_eq!(Some(0), rig.table.entry(25));
        assert_eq!(Some(0), rig.table.entry(27));
    }

    #[test]
    fn brief_dip_is_ignored() {
        let mut rig = Rig::new();
        rig.reach_linearity();
        // dips back a note for a few millivolts
        let dip = |mv: f64| {
            let cents = if (120.0..125.0).contains(&mv) { 2480.0 } else { 2400.0 + mv };
            pitch::cents_to_hz(cents as u16)
        };
        assert_eq!(
            Ok(Some(SweepEvent::Finished)),
            rig.run(dip, 0, 1000.0, 100_000)
        );
        assert_eq!(Some(10), rig.table.entry(24));
        assert_eq!(Some(100), rig.table.entry(25));
        assert_eq!(Some(200), rig.table.entry(26));
    }

    #[test]
    fn falling_below_recorded_notes_is_fatal() {
        let mut rig = Rig::new();
        rig.reach_linearity();
        // notes 24 to 26 are recorded by 300 mV, then the VCO drops to 2250 cents for a few millivolts
        let drop = |mv: f64| {
            let cents = if (320.0..330.0).contains(&mv) { 2250.0 } else { 2400.0 + mv };
            pitch::cents_to_hz(cents as u16)
        };
        assert_eq!(
            Err(CalibrationError::NonMonotonicResponse {
                previous: 26,
                next: 22
            }),
            rig.run(drop, 0, 1000.0, 100_000)
        );
        assert_eq!(VcoSubStage::None, rig.calibrator.sub_stage());
        assert_eq!(Some(200), rig.table.entry(26));
        assert_eq!(Some(0), rig.table.entry(27));
    }

    #[test]
    fn progress_tracks_voltage() {
        let mut rig = Rig::new();
        rig.reach_linearity();
        // about 265 steps at 15 ms each
        assert_eq!(Ok(None), rig.run(linear, 0, 1000.0, 4_000));
        let progress = rig.calibrator.progress();
        let expected = rig.output.as_millivolts() as f32 / 950.0;
        assert!(
            (progress - expected).abs() < 0.01,
            "Expected {} but got {}",
            expected,
            progress
        );
    }
}
