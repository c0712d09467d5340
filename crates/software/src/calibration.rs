//! The button-driven calibration session.
//!
//! Holding the calibration button at power-on starts a session. The performer then cycles through seven
//! [`Preparation`] stages with short presses and enters the highlighted one with a long press:
//!
//! 1. trim the gain of channel 1 on the switch bank, then confirm with a long press;
//! 2. the same for channel 2;
//! 3. a chromatic tuner, left with a long press;
//! 4. sweep the VCO attached to channel 1, which finishes by itself;
//! 5. the same for channel 2;
//! 6. forget the sweep of channel 1;
//! 7. forget the sweep of channel 2.
//!
//! Stage changes are computed by the pure [`transition`] function, which names the side effects to perform in an
//! [`Effect`] set; [`CalibrationController`] carries them out against the hardware-facing state it owns.

use crate::{
    button::{ButtonClassifier, ButtonEvent},
    channel::Channel,
    compensation::{GainOffset, VoltageCompensator},
    configuration::{CalibrationConfig, CycleConfig},
    error::CalibrationError,
    frequency::{EdgeCapture, FrequencyMeter},
    linearity::{LinearityCalibrator, SweepEvent, VcoSubStage},
    outputs::CvOutputs,
    store::CalibrationStore,
    table::{self, CalibrationTable},
    tuner::Tuner,
};
use bitmask_enum::bitmask;
use embassy_time::Instant;
use embedded_storage::Storage;
use measurements::Voltage;
use num_derive::{FromPrimitive, ToPrimitive};

/// A stage waiting for the performer to choose it with a long press. Short presses cycle through these in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Preparation {
    /// Precedes trimming the gain of channel 1.
    Gain1,
    /// Precedes trimming the gain of channel 2.
    Gain2,
    /// Precedes the tuner.
    Tuner,
    /// Precedes sweeping channel 1.
    Vco1,
    /// Precedes sweeping channel 2.
    Vco2,
    /// Precedes forgetting the sweep of channel 1.
    ResetVco1,
    /// Precedes forgetting the sweep of channel 2.
    ResetVco2,
}

impl CycleConfig for Preparation {}

/// Where a calibration session stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationStage {
    /// No session is running.
    #[default]
    None,
    /// Waiting for a long press to enter the given stage.
    Prepare(Preparation),
    /// The channel's gain offset follows the switch bank.
    Gain(Channel),
    /// The chromatic tuner is running.
    Tuner,
    /// The channel is being swept.
    Vco(Channel),
    /// The sweep of the channel has finished.
    Done(Channel),
    /// A sweep failed. Only a restart leaves this stage.
    Error,
}

/// Anything which can move a session from one stage to another.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StageInput {
    /// The button was pressed briefly.
    ShortPress,
    /// The button was held.
    LongPress,
    /// The running sweep recorded its last note.
    SweepComplete,
    /// The running sweep lost the VCO's signal or measured a non-monotonic response.
    SweepFailed,
}

/// Side effects to carry out when changing stage, in declaration order.
#[bitmask(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Effect {
    /// Drive both outputs to 0 V.
    ZeroOutputs,
    /// Drive the channel to its gain reference voltage and the other to 0 V.
    DriveGainReference,
    /// Store the channel's live gain offset.
    PersistGainOffset,
    /// Forget the channel's calibration table.
    ResetTable,
    /// Forget the tuner's last deviation.
    ResetDeviation,
    /// Restart frequency measurement.
    ResetMeter,
    /// Start a sweep.
    BeginSweep,
    /// Store both calibration tables.
    PersistTables,
}

/// The outcome of feeding a [`StageInput`] to a [`CalibrationStage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Transition {
    /// The stage to move to.
    pub next: CalibrationStage,
    /// What to do on the way.
    pub effects: Effect,
    /// The channel the effects apply to, if any.
    pub channel: Option<Channel>,
}

impl Transition {
    fn to(next: CalibrationStage, effects: Effect) -> Self {
        Self {
            next,
            effects,
            channel: None,
        }
    }

    fn on(self, channel: Channel) -> Self {
        Self {
            channel: Some(channel),
            ..self
        }
    }
}

/// Computes the response of `stage` to `input`, or `None` if the input is ignored there.
pub fn transition(stage: CalibrationStage, input: StageInput) -> Option<Transition> {
    use CalibrationStage as S;
    use StageInput as I;

    let transition = match (stage, input) {
        (S::Prepare(preparation), I::ShortPress) => {
            Transition::to(S::Prepare(preparation.cycle()), Effect::ZeroOutputs)
        }
        (S::Prepare(preparation), I::LongPress) => match preparation {
            Preparation::Gain1 => {
                Transition::to(S::Gain(Channel::One), Effect::DriveGainReference).on(Channel::One)
            }
            Preparation::Gain2 => {
                Transition::to(S::Gain(Channel::Two), Effect::DriveGainReference).on(Channel::Two)
            }
            Preparation::Tuner => {
                Transition::to(S::Tuner, Effect::ResetDeviation | Effect::ResetMeter)
            }
            Preparation::Vco1 => Transition::to(
                S::Vco(Channel::One),
                Effect::ResetTable | Effect::ResetMeter | Effect::BeginSweep,
            )
            .on(Channel::One),
            Preparation::Vco2 => Transition::to(
                S::Vco(Channel::Two),
                Effect::ResetTable | Effect::ResetMeter | Effect::BeginSweep,
            )
            .on(Channel::Two),
            Preparation::ResetVco1 => Transition::to(
                S::Prepare(Preparation::ResetVco2),
                Effect::ResetTable | Effect::PersistTables,
            )
            .on(Channel::One),
            Preparation::ResetVco2 => Transition::to(
                S::Prepare(Preparation::Gain1),
                Effect::ResetTable | Effect::PersistTables,
            )
            .on(Channel::Two),
        },
        (S::Gain(channel), I::LongPress) => {
            let next = match channel {
                Channel::One => Preparation::Gain2,
                Channel::Two => Preparation::Tuner,
            };
            Transition::to(
                S::Prepare(next),
                Effect::PersistGainOffset | Effect::ZeroOutputs,
            )
            .on(channel)
        }
        (S::Tuner, I::LongPress) => Transition::to(
            S::Prepare(Preparation::Vco1),
            Effect::ResetDeviation | Effect::ZeroOutputs,
        ),
        (S::Vco(channel), I::SweepComplete) => Transition::to(
            S::Done(channel),
            Effect::PersistTables | Effect::ZeroOutputs,
        )
        .on(channel),
        (S::Vco(channel), I::SweepFailed) => {
            Transition::to(S::Error, Effect::ZeroOutputs).on(channel)
        }
        (S::Done(channel), I::ShortPress) => {
            let next = match channel {
                Channel::One => Preparation::Vco2,
                Channel::Two => Preparation::ResetVco1,
            };
            Transition::to(S::Prepare(next), Effect::ZeroOutputs)
        }
        _ => return None,
    };
    Some(transition)
}

/// A snapshot of the panel controls read by the control loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PanelState {
    /// `true` while the calibration button is held down.
    pub calibration_button: bool,
    /// The value of the 8-position switch bank, switch 1 being the most significant bit.
    pub switches: u8,
}

/// A snapshot of a session, as shown on the status LEDs (see [`crate::indicator`]).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CalibrationStatus {
    /// The current stage.
    pub stage: CalibrationStage,
    /// The phase of the running sweep.
    pub sub_stage: VcoSubStage,
    /// The tuner's latest deviation, in cents.
    pub deviation: i16,
    /// Completion of the running sweep, from 0 to 1.
    pub progress: f32,
}

/// Owns all calibration state and runs calibration sessions.
///
/// The controller also serves the performance path: [`note_to_voltage`][Self::note_to_voltage] and
/// [`gain_offsets`][Self::gain_offsets] are meaningful whether or not a session is running.
pub struct CalibrationController<S> {
    active: bool,
    stage: CalibrationStage,
    button: ButtonClassifier,
    store: CalibrationStore<S>,
    gain_offsets: [GainOffset; 2],
    tables: [CalibrationTable; 2],
    gain_reference: [Voltage; 2],
    meter: FrequencyMeter,
    tuner: Tuner,
    sweep: LinearityCalibrator,
}

impl<S: Storage> CalibrationController<S> {
    /// Loads the stored calibration and, if the calibration button was held at power-on, starts a session.
    ///
    /// Storage is read only here. Values which cannot be read fall back to no gain offset and no calibration table.
    pub fn new(
        mut store: CalibrationStore<S>,
        config: &CalibrationConfig,
        button_held: bool,
        now: Instant,
    ) -> Self {
        let mut gain_offsets = [GainOffset::default(); 2];
        let mut tables = [CalibrationTable::new(); 2];
        for channel in Channel::ALL {
            match store.load_gain_offset(channel) {
                Ok(offset) => gain_offsets[channel.index()] = offset,
                Err(_) => warn!("Could not read gain offset of channel {}", channel.number()),
            }
            match store.load_table(channel) {
                Ok(table) => tables[channel.index()] = table,
                Err(_) => warn!(
                    "Could not read calibration table of channel {}",
                    channel.number()
                ),
            }
        }

        let (stage, button) = if button_held {
            info!("Calibration session started");
            (
                CalibrationStage::Prepare(Preparation::Gain1),
                ButtonClassifier::held(config, now),
            )
        } else {
            (CalibrationStage::None, ButtonClassifier::new(config))
        };

        Self {
            active: button_held,
            stage,
            button,
            store,
            gain_offsets,
            tables,
            gain_reference: config.gain_reference,
            meter: FrequencyMeter::new(config),
            tuner: Tuner::new(),
            sweep: LinearityCalibrator::new(config),
        }
    }

    /// Advances the session by one control cycle. Does nothing if no session is running.
    ///
    /// Reads the button and switch bank from `panel` and the VCO's frequency from `capture`; writes the voltages the
    /// session needs into `outputs`.
    pub fn poll(
        &mut self,
        panel: PanelState,
        capture: &EdgeCapture,
        compensator: &VoltageCompensator,
        outputs: &mut CvOutputs,
        now: Instant,
    ) {
        if !self.active {
            return;
        }
        if self.stage == CalibrationStage::Error {
            outputs.zero();
            return;
        }

        if let Some(event) = self.button.poll(panel.calibration_button, now) {
            let input = match event {
                ButtonEvent::ShortPress => StageInput::ShortPress,
                ButtonEvent::LongPress => StageInput::LongPress,
            };
            self.advance(input, outputs);
        }

        if let CalibrationStage::Gain(channel) = self.stage {
            self.gain_offsets[channel.index()] = GainOffset::from_selector(panel.switches);
        }

        let hz = match self.meter.update(capture, now) {
            Ok(hz) => hz,
            Err(error) => {
                if self.vco_sub_stage() == VcoSubStage::Linearity {
                    self.fail(error, outputs);
                    return;
                }
                0.0
            }
        };

        if self.stage == CalibrationStage::Tuner || self.vco_sub_stage() == VcoSubStage::Tuner {
            let target = self.tuner.update(panel.switches, hz);
            outputs.set(
                Some(self.note_to_voltage(Channel::One, target)),
                Some(self.note_to_voltage(Channel::Two, target)),
            );
        }

        if let CalibrationStage::Vco(channel) = self.stage {
            let index = channel.index();
            let max_voltage = compensator.max_voltage(channel, self.gain_offsets[index]);
            match self.sweep.poll(
                &mut self.tables[index],
                hz,
                self.tuner.deviation(),
                max_voltage,
                now,
            ) {
                Ok(Some(SweepEvent::Lowered(voltage))) => {
                    outputs.zero();
                    outputs.set_channel(channel, voltage);
                    self.meter.reset();
                }
                Ok(Some(SweepEvent::Stepped(voltage))) => outputs.set_channel(channel, voltage),
                Ok(Some(SweepEvent::Finished)) => self.advance(StageInput::SweepComplete, outputs),
                Ok(None) => {}
                Err(error) => self.fail(error, outputs),
            }
        }
    }

    fn fail(&mut self, error: CalibrationError, outputs: &mut CvOutputs) {
        error!("Sweep failed: {}", error);
        self.sweep.stop();
        self.advance(StageInput::SweepFailed, outputs);
    }

    fn advance(&mut self, input: StageInput, outputs: &mut CvOutputs) {
        let Some(Transition {
            next,
            effects,
            channel,
        }) = transition(self.stage, input)
        else {
            return;
        };
        info!("Calibration stage {} -> {}", self.stage, next);

        if effects.contains(Effect::ZeroOutputs) {
            outputs.zero();
        }
        if let Some(channel) = channel {
            let index = channel.index();
            if effects.contains(Effect::DriveGainReference) {
                outputs.zero();
                outputs.set_channel(channel, self.gain_reference[index]);
            }
            if effects.contains(Effect::PersistGainOffset) {
                let offset = self.gain_offsets[index];
                info!(
                    "Storing gain offset {} for channel {}",
                    offset.selector(),
                    channel.number()
                );
                if self.store.save_gain_offset(channel, offset).is_err() {
                    error!("Could not store gain offset of channel {}", channel.number());
                }
            }
            if effects.contains(Effect::ResetTable) {
                self.tables[index].reset();
            }
        }
        if effects.contains(Effect::ResetDeviation) {
            self.tuner.clear();
        }
        if effects.contains(Effect::ResetMeter) {
            self.meter.reset();
        }
        if effects.contains(Effect::BeginSweep) {
            self.sweep.begin();
        }
        if effects.contains(Effect::PersistTables) && self.store.save_tables(&self.tables).is_err() {
            error!("Could not store calibration tables");
        }

        self.stage = next;
    }

    /// Returns `true` if a calibration session is running.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The current stage.
    pub fn stage(&self) -> CalibrationStage {
        self.stage
    }

    /// The phase of the running sweep, or [`VcoSubStage::None`] outside of one.
    pub fn vco_sub_stage(&self) -> VcoSubStage {
        match self.stage {
            CalibrationStage::Vco(_) => self.sweep.sub_stage(),
            _ => VcoSubStage::None,
        }
    }

    /// The tuner's latest deviation, in cents.
    pub fn deviation(&self) -> i16 {
        self.tuner.deviation()
    }

    /// Estimated completion of the running sweep, from 0 to 1.
    pub fn progress(&self) -> f32 {
        self.sweep.progress()
    }

    /// Everything the status LEDs show, in one snapshot.
    pub fn status(&self) -> CalibrationStatus {
        CalibrationStatus {
            stage: self.stage,
            sub_stage: self.vco_sub_stage(),
            deviation: self.deviation(),
            progress: self.progress(),
        }
    }

    /// The gain offsets in effect for both channels.
    pub fn gain_offsets(&self) -> [GainOffset; 2] {
        self.gain_offsets
    }

    /// The calibration table of `channel`.
    pub fn table(&self, channel: Channel) -> &CalibrationTable {
        &self.tables[channel.index()]
    }

    /// Returns the voltage which makes the VCO attached to `channel` play a note given in cents.
    ///
    /// The channel's calibration table is used when it is valid. While a sweep is being prepared or run, the ideal
    /// 1 V/octave formula is used for both channels instead.
    pub fn note_to_voltage(&self, channel: Channel, cents: u16) -> Voltage {
        let sweeping = matches!(
            self.stage,
            CalibrationStage::Prepare(Preparation::Vco1 | Preparation::Vco2)
                | CalibrationStage::Vco(_)
        );
        let table = (!sweeping).then(|| &self.tables[channel.index()]);
        table::note_to_voltage(table, cents)
    }
}
