//! Emulates a small EEPROM in the last flash sector, where the calibration store lives.
//!
//! The sector is copied into RAM at boot. Reads are served from the copy; a write which changes the copy erases the
//! sector and programs the whole image back.

use duo_cv_lib::store::STORE_LEN;
use embedded_storage::{
    ReadStorage, Storage,
    nor_flash::{NorFlash, ReadNorFlash},
};

/// Offset of the last 256 KiB sector of the STM32F767ZI's flash in single-bank mode.
const SECTOR_OFFSET: u32 = 0x1C_0000;
const SECTOR_SIZE: u32 = 0x4_0000;

/// Bytes mirrored in RAM; a multiple of every flash write granularity of the F7 family.
const IMAGE_LEN: usize = 512;

const _: () = assert!(STORE_LEN <= IMAGE_LEN);

/// Errors raised by [`FlashEeprom`].
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EepromError<E> {
    /// The access reached past the emulated capacity.
    OutOfBounds,
    /// The flash itself refused the operation.
    Flash(E),
}

/// Byte-addressable storage backed by a single flash sector.
pub struct FlashEeprom<F> {
    flash: F,
    image: [u8; IMAGE_LEN],
}

impl<F: NorFlash> FlashEeprom<F> {
    /// Takes over `flash` and loads the stored image. An unreadable sector is treated as erased.
    pub fn new(mut flash: F) -> Self {
        let mut image = [0xFF; IMAGE_LEN];
        if flash.read(SECTOR_OFFSET, &mut image).is_err() {
            warn!("Could not read the calibration sector; treating it as erased");
            image = [0xFF; IMAGE_LEN];
        }
        Self { flash, image }
    }

    fn range(
        &self,
        offset: u32,
        len: usize,
    ) -> Result<core::ops::Range<usize>, EepromError<F::Error>> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= IMAGE_LEN => Ok(start..end),
            _ => Err(EepromError::OutOfBounds),
        }
    }
}

impl<F: NorFlash> ReadStorage for FlashEeprom<F> {
    type Error = EepromError<F::Error>;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.image[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        IMAGE_LEN
    }
}

impl<F: NorFlash> Storage for FlashEeprom<F> {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        if self.image[range.clone()] == *bytes {
            return Ok(());
        }
        self.image[range].copy_from_slice(bytes);

        debug!("Programming calibration sector");
        self.flash
            .erase(SECTOR_OFFSET, SECTOR_OFFSET + SECTOR_SIZE)
            .map_err(EepromError::Flash)?;
        self.flash
            .write(SECTOR_OFFSET, &self.image)
            .map_err(EepromError::Flash)
    }
}
