//! Turns incoming MIDI into the note each channel should voice.
//!
//! MIDI channel 1 plays CV/gate output 1 and MIDI channel 2 plays output 2; other channels are ignored. Each output is
//! monophonic with last-note priority: the most recently pressed key that is still held sounds, and when every key is
//! released the CV keeps the last note while the gate closes.

use crate::channel::Channel;
use bitmask_enum::bitmask;
use tinyvec::ArrayVec;
use wmidi::{MidiMessage, Note, U7};

/// Number of held keys remembered per channel; further keys are ignored until one is released.
const HELD_NOTE_CAPACITY: usize = 16;

/// Largest pitch bend, in cents, reached at either end of the wheel.
pub const PITCH_BEND_RANGE: i32 = 200;

const PITCH_BEND_CENTER: i32 = 0x2000;

/// Changes caused by a MIDI message.
#[bitmask(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Operation {
    /// A key was pressed or released.
    NoteChange,
    /// The pitch bend of a channel moved.
    PitchBendChange,
}

/// What one output is playing.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Voice {
    /// Held keys in the order they were pressed.
    held: ArrayVec<[U7; HELD_NOTE_CAPACITY]>,
    /// The note the CV rests on once every key is released.
    last: Option<U7>,
    /// Current pitch bend, in cents.
    bend: i16,
}

impl Voice {
    fn press(&mut self, note: Note) {
        let u7 = U7::from_u8_lossy(note as u8);
        if self.held.len() != self.held.capacity() && !self.held.contains(&u7) {
            self.held.push(u7);
            self.last = Some(u7);
        }
    }

    fn release(&mut self, note: Note) {
        let u7 = U7::from_u8_lossy(note as u8);
        self.held.retain(|&n| n != u7);
        if let Some(&sounding) = self.held.last() {
            self.last = Some(sounding);
        }
    }
}

/// The performance state of both outputs.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Performance {
    voices: [Voice; 2],
}

#[cfg(feature = "defmt")]
impl defmt::Format for Performance {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Performance {{");
        for (channel, voice) in Channel::ALL.iter().zip(self.voices.iter()) {
            defmt::write!(
                fmt,
                " {}: {} held, bend {}",
                channel.number(),
                voice.held.len(),
                voice.bend
            );
        }
        defmt::write!(fmt, " }}");
    }
}

impl Performance {
    /// Constructs a [`Performance`] with nothing played yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the performance given a slice of USB-MIDI Event Packets. Returns the [`Operation`]s performed.
    pub fn update(&mut self, data: &[u8]) -> Operation {
        let mut operation = Operation::none();
        data.chunks(4)
            .filter_map(|potential_packet| {
                if potential_packet.len() != 4 {
                    error!("USB-MIDI Event Packets must always be 32 bits long");
                    None
                } else {
                    // the first byte is the packet header; the MIDI event follows
                    MidiMessage::from_bytes(&potential_packet[1..]).ok()
                }
            })
            .for_each(|message| operation |= self.receive(&message));
        operation
    }

    /// Applies a single MIDI message. Returns the [`Operation`]s performed.
    pub fn receive(&mut self, message: &MidiMessage<'_>) -> Operation {
        match message {
            MidiMessage::NoteOn(channel, note, velocity) => {
                let Some(voice) = self.voice_mut(*channel) else {
                    return Operation::none();
                };
                // a NoteOn without velocity is a NoteOff by convention
                if u8::from(*velocity) == 0 {
                    voice.release(*note);
                } else {
                    voice.press(*note);
                }
                debug!(
                    "NoteOn: channel {}, note {}, velocity {}",
                    channel.number(),
                    note.to_str(),
                    u8::from(*velocity)
                );
                Operation::NoteChange
            }
            MidiMessage::NoteOff(channel, note, _) => {
                let Some(voice) = self.voice_mut(*channel) else {
                    return Operation::none();
                };
                voice.release(*note);
                debug!(
                    "NoteOff: channel {}, note {}",
                    channel.number(),
                    note.to_str()
                );
                Operation::NoteChange
            }
            MidiMessage::PitchBendChange(channel, bend) => {
                let Some(voice) = self.voice_mut(*channel) else {
                    return Operation::none();
                };
                let offset = i32::from(u16::from(*bend)) - PITCH_BEND_CENTER;
                voice.bend = (offset * PITCH_BEND_RANGE / PITCH_BEND_CENTER) as i16;
                trace!(
                    "Pitch bend: channel {}, {} cents",
                    channel.number(),
                    voice.bend
                );
                Operation::PitchBendChange
            }
            _ => Operation::none(),
        }
    }

    fn voice_mut(&mut self, channel: wmidi::Channel) -> Option<&mut Voice> {
        match channel {
            wmidi::Channel::Ch1 => Some(&mut self.voices[Channel::One.index()]),
            wmidi::Channel::Ch2 => Some(&mut self.voices[Channel::Two.index()]),
            _ => None,
        }
    }

    /// The note `channel` should play, in cents, including pitch bend; `None` until the first note arrives.
    pub fn target_cents(&self, channel: Channel) -> Option<u16> {
        let voice = &self.voices[channel.index()];
        voice.last.map(|note| {
            let cents = i32::from(u8::from(note)) * 100 + i32::from(voice.bend);
            cents.clamp(0, i32::from(u16::MAX)) as u16
        })
    }

    /// Returns `true` while any key of `channel` is held.
    pub fn gate(&self, channel: Channel) -> bool {
        !self.voices[channel.index()].held.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wmidi::{Channel as MidiChannel, PitchBend, U14, Velocity};

    fn on(channel: MidiChannel, note: Note) -> MidiMessage<'static> {
        MidiMessage::NoteOn(channel, note, Velocity::from_u8_lossy(100))
    }

    fn off(channel: MidiChannel, note: Note) -> MidiMessage<'static> {
        MidiMessage::NoteOff(channel, note, Velocity::from_u8_lossy(0))
    }

    fn bend(channel: MidiChannel, value: u16) -> MidiMessage<'static> {
        let bend: PitchBend = U14::try_from(value).unwrap();
        MidiMessage::PitchBendChange(channel, bend)
    }

    #[test]
    fn silent_until_played() {
        let performance = Performance::new();
        for channel in Channel::ALL {
            assert_eq!(None, performance.target_cents(channel));
            assert!(!performance.gate(channel));
        }
    }

    #[test]
    fn channels_are_independent() {
        let mut performance = Performance::new();
        assert_eq!(
            Operation::NoteChange,
            performance.receive(&on(MidiChannel::Ch1, Note::C4))
        );
        performance.receive(&on(MidiChannel::Ch2, Note::A4));
        assert_eq!(Some(6000), performance.target_cents(Channel::One));
        assert_eq!(Some(6900), performance.target_cents(Channel::Two));
        assert!(performance.gate(Channel::One));
        assert!(performance.gate(Channel::Two));
    }

    #[test]
    fn other_channels_are_ignored() {
        let mut performance = Performance::new();
        assert_eq!(
            Operation::none(),
            performance.receive(&on(MidiChannel::Ch3, Note::C4))
        );
        assert_eq!(Performance::new(), performance);
    }

    #[test]
    fn last_note_priority() {
        let mut performance = Performance::new();
        performance.receive(&on(MidiChannel::Ch1, Note::C4));
        performance.receive(&on(MidiChannel::Ch1, Note::E4));
        performance.receive(&on(MidiChannel::Ch1, Note::G4));
        assert_eq!(
            Some(6700),
            performance.target_cents(Channel::One),
            "Expected left but got right"
        );

        performance.receive(&off(MidiChannel::Ch1, Note::G4));
        assert_eq!(
            Some(6400),
            performance.target_cents(Channel::One),
            "Releasing the sounding note should fall back to the previous one"
        );

        performance.receive(&off(MidiChannel::Ch1, Note::C4));
        assert_eq!(Some(6400), performance.target_cents(Channel::One));
    }

    #[test]
    fn release_holds_pitch_and_closes_gate() {
        let mut performance = Performance::new();
        performance.receive(&on(MidiChannel::Ch1, Note::D3));
        performance.receive(&MidiMessage::NoteOn(
            MidiChannel::Ch1,
            Note::D3,
            Velocity::from_u8_lossy(0),
        ));
        assert!(!performance.gate(Channel::One));
        assert_eq!(Some(5000), performance.target_cents(Channel::One));
    }

    #[test]
    fn pitch_bend_spans_two_semitones() {
        let mut performance = Performance::new();
        performance.receive(&on(MidiChannel::Ch2, Note::C4));
        assert_eq!(
            Operation::PitchBendChange,
            performance.receive(&bend(MidiChannel::Ch2, 0))
        );
        assert_eq!(Some(5800), performance.target_cents(Channel::Two));
        performance.receive(&bend(MidiChannel::Ch2, 0x2000));
        assert_eq!(Some(6000), performance.target_cents(Channel::Two));
        performance.receive(&bend(MidiChannel::Ch2, 0x3000));
        assert_eq!(Some(6100), performance.target_cents(Channel::Two));
        assert_eq!(None, performance.target_cents(Channel::One));
    }

    #[test]
    fn extra_keys_are_ignored() {
        let mut performance = Performance::new();
        for note in 40..=60 {
            performance.receive(&on(MidiChannel::Ch1, Note::from_u8_lossy(note)));
        }
        assert_eq!(
            Some(5500),
            performance.target_cents(Channel::One),
            "Only the first 16 keys should register"
        );
    }

    #[test]
    fn usb_packets() {
        let mut performance = Performance::new();
        let data = [
            0x09, 0x90, 60, 100, // NoteOn, channel 1
            0x0E, 0xE1, 0x00, 0x60, // pitch bend, channel 2
            0x09, 0x91, 62, 0, // NoteOn without velocity, channel 2
        ];
        assert_eq!(
            Operation::NoteChange | Operation::PitchBendChange,
            performance.update(&data)
        );
        assert_eq!(Some(6000), performance.target_cents(Channel::One));
        assert_eq!(None, performance.target_cents(Channel::Two));
    }
}
