//! Signature, calibration, lock bits, fuses and EEPROM.

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use crate::device::Eeprom;
use crate::protocol::{Instruction, CAPTURE_LAST, ECHO, LOCK_BITS_MASK, SIGNATURE_LEN};
use crate::{Error, Programmer};

impl<S, R, D> Programmer<S, R, D>
where
    S: Transfer<u8>,
    R: OutputPin,
    D: DelayMs<u32>,
{
    /// Read signature byte `index` (0..=2)
    pub fn read_signature_byte(&mut self, index: u8) -> Result<u8, Error<S::Error, R::Error>> {
        if index as usize >= SIGNATURE_LEN {
            return Err(Error::OutOfRange {
                address: index as usize,
                limit: SIGNATURE_LEN,
            });
        }
        self.command(Instruction::ReadSignature { index })
    }

    /// Read all three signature bytes
    pub fn read_signature(&mut self) -> Result<[u8; 3], Error<S::Error, R::Error>> {
        let mut sig = [0u8; SIGNATURE_LEN];
        for (i, s) in sig.iter_mut().enumerate() {
            *s = self.read_signature_byte(i as u8)?;
        }
        Ok(sig)
    }

    /// Check the attached device matches the descriptor signature
    pub fn check_signature(&mut self) -> Result<(), Error<S::Error, R::Error>> {
        let expected = self.device.signature.ok_or(Error::NoSignature)?;
        let found = self.read_signature()?;

        if found != expected {
            error!(
                "Signature mismatch for {}: expected {:02x?} found {:02x?}",
                self.device.name, expected, found
            );
            return Err(Error::SignatureMismatch { expected, found });
        }

        debug!("Signature {:02x?} matches {}", found, self.device.name);
        Ok(())
    }

    /// Read oscillator calibration byte `index` (only the low bit is used)
    pub fn read_calibration_byte(&mut self, index: u8) -> Result<u8, Error<S::Error, R::Error>> {
        self.command(Instruction::ReadCalibration { index })
    }

    /// Read the lock bits
    pub fn read_lock_bits(&mut self) -> Result<u8, Error<S::Error, R::Error>> {
        Ok(self.command(Instruction::ReadLock)? & LOCK_BITS_MASK)
    }

    /// Read fuse byte `index`
    pub fn read_fuse(&mut self, index: usize) -> Result<u8, Error<S::Error, R::Error>> {
        let frame = self.fuse_frame(index, |s| s.read_frame(index))?;
        self.ensure_enabled()?;

        let v = self.transact(frame, CAPTURE_LAST)?;
        Ok(v[0])
    }

    /// Write fuse byte `index` and wait for completion
    pub fn write_fuse(&mut self, index: usize, value: u8) -> Result<(), Error<S::Error, R::Error>> {
        let frame = self.fuse_frame(index, |s| s.write_frame(index, value))?;
        self.ensure_enabled()?;

        debug!(
            "Writing fuse {} = 0x{:02x}",
            self.device.fuse_labels[index], value
        );

        self.transact(frame, ECHO)?;
        self.wait_ready()
    }

    /// Read every fuse byte the device exposes, paired with its label
    pub fn read_fuses(&mut self) -> Result<Vec<(&'static str, u8)>, Error<S::Error, R::Error>> {
        let labels = self.device.fuse_labels;
        labels
            .iter()
            .enumerate()
            .map(|(i, l)| self.read_fuse(i).map(|v| (*l, v)))
            .collect()
    }

    /// Read one EEPROM byte
    pub fn read_eeprom(&mut self, address: usize) -> Result<u8, Error<S::Error, R::Error>> {
        let address = self.eeprom_address(address)?;
        self.command(Instruction::ReadEeprom { address })
    }

    /// Write one EEPROM byte and wait for completion
    pub fn write_eeprom(&mut self, address: usize, value: u8) -> Result<(), Error<S::Error, R::Error>> {
        let address = self.eeprom_address(address)?;
        self.command_wait(Instruction::WriteEeprom { address, value })
    }

    /// Read EEPROM starting at `start` into `buff`
    pub fn read_eeprom_into(&mut self, start: usize, buff: &mut [u8]) -> Result<(), Error<S::Error, R::Error>> {
        let eeprom = self.eeprom()?;
        check_eeprom_range(&eeprom, start, buff.len())?;

        for (i, b) in buff.iter_mut().enumerate() {
            *b = self.read_eeprom(start + i)?;
        }
        Ok(())
    }

    /// Write `data` to EEPROM starting at `start`
    pub fn write_eeprom_bytes(&mut self, start: usize, data: &[u8]) -> Result<(), Error<S::Error, R::Error>> {
        let eeprom = self.eeprom()?;
        check_eeprom_range(&eeprom, start, data.len())?;

        for (i, b) in data.iter().enumerate() {
            self.write_eeprom(start + i, *b)?;
        }
        Ok(())
    }

    fn fuse_frame<F>(&self, index: usize, encode: F) -> Result<[u8; 4], Error<S::Error, R::Error>>
    where
        F: FnOnce(crate::FuseScheme) -> Option<[u8; 4]>,
    {
        let count = self.device.fuse_count();
        let unsupported = Error::UnsupportedFuseIndex { index, count };

        if index >= count {
            error!("Fuse index {} not supported by {}", index, self.device.name);
            return Err(unsupported);
        }

        encode(self.device.fuse_scheme).ok_or(unsupported)
    }

    fn eeprom(&self) -> Result<Eeprom, Error<S::Error, R::Error>> {
        self.device.eeprom.ok_or(Error::NoEeprom)
    }

    fn eeprom_address(&self, address: usize) -> Result<u16, Error<S::Error, R::Error>> {
        let eeprom = self.eeprom()?;
        if address >= eeprom.capacity {
            error!("EEPROM address 0x{:04x} out of range for {}", address, self.device.name);
            return Err(Error::OutOfRange {
                address,
                limit: eeprom.capacity,
            });
        }
        Ok(address as u16)
    }
}

fn check_eeprom_range<S, P>(eeprom: &Eeprom, start: usize, len: usize) -> Result<(), Error<S, P>> {
    match start.checked_add(len) {
        Some(end) if end <= eeprom.capacity => Ok(()),
        _ => Err(Error::OutOfRange {
            address: start,
            limit: eeprom.capacity,
        }),
    }
}
