//! Flash memory access.
//!
//! Callers address flash by byte, the ISP instructions address it by 16 bit
//! word with the opcode selecting the low or high byte.

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use crate::protocol::{Instruction, ERASED};
use crate::{Error, Programmer};

/// Outcome of comparing flash contents against an image
#[derive(Copy, Clone, PartialEq, Debug)]
#[must_use]
pub enum Verification {
    Match,
    /// First differing byte
    Mismatch { offset: usize, expected: u8, found: u8 },
}

impl Verification {
    pub fn is_match(&self) -> bool {
        *self == Verification::Match
    }
}

impl<S, R, D> Programmer<S, R, D>
where
    S: Transfer<u8>,
    R: OutputPin,
    D: DelayMs<u32>,
{
    /// Erase flash (and EEPROM), required before `program`
    pub fn chip_erase(&mut self) -> Result<(), Error<S::Error, R::Error>> {
        debug!("Erasing chip");
        self.command_wait(Instruction::ChipErase)
    }

    /// Read one byte of flash
    pub fn read_byte(&mut self, address: usize) -> Result<u8, Error<S::Error, R::Error>> {
        let word = self.flash_word(address)?;
        self.command(Instruction::ReadFlash {
            high: address & 1 != 0,
            word,
        })
    }

    /// Read flash starting at `start` into `buff`
    pub fn read_flash(&mut self, start: usize, buff: &mut [u8]) -> Result<(), Error<S::Error, R::Error>> {
        self.check_flash_range(start, buff.len())?;

        for (i, b) in buff.iter_mut().enumerate() {
            *b = self.read_byte(start + i)?;
        }

        Ok(())
    }

    /// Stage one byte into the page buffer, committed by `write_page`
    pub fn load_page_byte(&mut self, address: usize, value: u8) -> Result<(), Error<S::Error, R::Error>> {
        let word = self.flash_word(address)?;
        self.command(Instruction::LoadPage {
            high: address & 1 != 0,
            word,
            value,
        })?;
        Ok(())
    }

    /// Commit the page buffer to the page containing `address`
    pub fn write_page(&mut self, address: usize) -> Result<(), Error<S::Error, R::Error>> {
        let word = self.flash_word(address)?;
        self.command_wait(Instruction::WritePage { word })
    }

    /// Program `data` into flash from address zero
    ///
    /// The chip must have been erased first. The last page is padded with 0xFF.
    pub fn program(&mut self, data: &[u8]) -> Result<(), Error<S::Error, R::Error>> {
        self.program_with_progress(data, |_, _| ())
    }

    /// Program `data`, calling `progress(done, total)` after each page
    pub fn program_with_progress<F>(&mut self, data: &[u8], mut progress: F) -> Result<(), Error<S::Error, R::Error>>
    where
        F: FnMut(usize, usize),
    {
        self.check_flash_range(0, data.len())?;
        self.ensure_enabled()?;

        let page_size = self.device.flash_page_size;
        let total = data.len();

        for (n, chunk) in data.chunks(page_size).enumerate() {
            let base = n * page_size;
            debug!("Programming page 0x{:04x}", base);

            let padding = page_size - chunk.len();
            let page = chunk.iter().copied().chain(std::iter::repeat(ERASED).take(padding));

            for (i, b) in page.enumerate() {
                self.load_page_byte(base + i, b)?;
            }
            self.write_page(base)?;

            progress(base + chunk.len(), total);
        }

        Ok(())
    }

    /// Compare flash contents against `data`, stopping at the first mismatch
    pub fn verify(&mut self, data: &[u8]) -> Result<Verification, Error<S::Error, R::Error>> {
        self.verify_with_progress(data, |_, _| ())
    }

    /// Verify `data`, calling `progress(done, total)` after each page worth of bytes
    pub fn verify_with_progress<F>(
        &mut self,
        data: &[u8],
        mut progress: F,
    ) -> Result<Verification, Error<S::Error, R::Error>>
    where
        F: FnMut(usize, usize),
    {
        self.check_flash_range(0, data.len())?;

        let page_size = self.device.flash_page_size;

        for (offset, expected) in data.iter().copied().enumerate() {
            let found = self.read_byte(offset)?;
            if found != expected {
                error!(
                    "Verify failed @ 0x{:04x}: expected 0x{:02x} found 0x{:02x}",
                    offset, expected, found
                );
                return Ok(Verification::Mismatch { offset, expected, found });
            }

            if (offset + 1) % page_size == 0 || offset + 1 == data.len() {
                progress(offset + 1, data.len());
            }
        }

        Ok(Verification::Match)
    }

    fn flash_word(&self, address: usize) -> Result<u16, Error<S::Error, R::Error>> {
        let word = address >> 1;
        let limit = self.device.flash_words();

        if word >= limit {
            error!("Flash address 0x{:04x} out of range for {}", address, self.device.name);
            return Err(Error::OutOfRange {
                address,
                limit: self.device.flash_capacity,
            });
        }

        Ok(word as u16)
    }

    fn check_flash_range(&self, start: usize, len: usize) -> Result<(), Error<S::Error, R::Error>> {
        let limit = self.device.flash_capacity;

        match start.checked_add(len) {
            Some(end) if end <= limit => Ok(()),
            _ => {
                error!(
                    "{} bytes at 0x{:04x} out of range for {}",
                    len, start, self.device.name
                );
                Err(Error::OutOfRange { address: start, limit })
            }
        }
    }
}
