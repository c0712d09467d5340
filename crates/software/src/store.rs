//! Persists calibration results across power cycles.
//!
//! Layout, in bytes from the start of the storage:
//!
//! | Offset | Size  | Contents                      |
//! |--------|-------|-------------------------------|
//! | 0      | 1     | Channel 1 [`GainOffset`]      |
//! | 1      | 1     | Channel 2 [`GainOffset`]      |
//! | 2      | 234   | Channel 1 [`CalibrationTable`] |
//! | 236    | 234   | Channel 2 [`CalibrationTable`] |

use crate::{
    channel::Channel,
    compensation::GainOffset,
    table::{CalibrationTable, ENCODED_LEN},
};
use embedded_storage::Storage;

const GAIN_OFFSET_ADDRESS: u32 = 0;
const TABLE_ADDRESS: u32 = 2;

/// Total bytes used by a [`CalibrationStore`].
pub const STORE_LEN: usize = TABLE_ADDRESS as usize + 2 * ENCODED_LEN;

/// Reads and writes calibration results in byte-addressable non-volatile storage.
pub struct CalibrationStore<S> {
    storage: S,
}

impl<S: Storage> CalibrationStore<S> {
    /// Wraps `storage`, which must hold at least [`STORE_LEN`] bytes.
    pub fn new(storage: S) -> Self {
        debug_assert!(storage.capacity() >= STORE_LEN);
        Self { storage }
    }

    /// Releases the underlying storage.
    pub fn into_inner(self) -> S {
        self.storage
    }

    fn gain_offset_address(channel: Channel) -> u32 {
        GAIN_OFFSET_ADDRESS + channel.index() as u32
    }

    fn table_address(channel: Channel) -> u32 {
        TABLE_ADDRESS + (channel.index() * ENCODED_LEN) as u32
    }

    /// Reads the gain offset of `channel`.
    pub fn load_gain_offset(&mut self, channel: Channel) -> Result<GainOffset, S::Error> {
        let mut byte = [0];
        self.storage
            .read(Self::gain_offset_address(channel), &mut byte)?;
        Ok(GainOffset::from_selector(byte[0]))
    }

    /// Writes the gain offset of `channel`.
    pub fn save_gain_offset(&mut self, channel: Channel, offset: GainOffset) -> Result<(), S::Error> {
        self.storage
            .write(Self::gain_offset_address(channel), &[offset.selector()])
    }

    /// Reads the calibration table of `channel`. The table may be invalid if the channel was never calibrated.
    pub fn load_table(&mut self, channel: Channel) -> Result<CalibrationTable, S::Error> {
        let mut bytes = [0; ENCODED_LEN];
        self.storage.read(Self::table_address(channel), &mut bytes)?;
        Ok(CalibrationTable::from_bytes(&bytes))
    }

    /// Writes the calibration tables of both channels.
    pub fn save_tables(&mut self, tables: &[CalibrationTable; 2]) -> Result<(), S::Error> {
        for channel in Channel::ALL {
            self.storage.write(
                Self::table_address(channel),
                &tables[channel.index()].to_bytes(),
            )?;
        }
        Ok(())
    }
}
