//! Identifies one of the module's two CV/gate output pairs.

/// One of the two output channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Channel {
    /// The first CV/gate pair, fed by MIDI channel 1.
    One,
    /// The second CV/gate pair, fed by MIDI channel 2.
    Two,
}

impl Channel {
    /// Both channels, in order.
    pub const ALL: [Channel; 2] = [Channel::One, Channel::Two];

    /// Zero-based position of the channel, for indexing per-channel arrays.
    pub fn index(self) -> usize {
        match self {
            Self::One => 0,
            Self::Two => 1,
        }
    }

    /// One-based channel number as printed on the panel.
    pub fn number(self) -> u8 {
        self.index() as u8 + 1
    }
}
