//! AVR In-System Programmer.
//!
//! Drives the AVR serial programming interface (an SPI bus plus the target
//! reset line) to erase, program, verify and inspect flash, EEPROM, fuses and
//! lock bits.

use std::time::{Duration, Instant};

#[macro_use]
extern crate log;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod device;
pub mod protocol;

mod flash;
mod registers;

pub use device::{Device, Eeprom, DEVICES};
pub use flash::Verification;
pub use protocol::{Expect, FuseScheme};

use protocol::{Instruction, BUSY_MASK, FRAME_LEN};

/// Time reset is held low before programming enable is sent
pub const RESET_SETTLE_MS: u32 = 30;

/// Time allowed for the device to leave programming mode after reset is released
pub const RESET_RELEASE_MS: u32 = 50;

/// Default deadline for erase and write operations to complete
pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 1000;

/// SPI clock presets, the ISP clock must stay below a quarter of the target clock
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum BusSpeed {
    Low,
    High,
}

impl BusSpeed {
    pub fn hz(&self) -> u32 {
        match self {
            BusSpeed::Low => 10_000,
            BusSpeed::High => 100_000,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// Reset released, target running
    Disabled,
    /// Reset asserted, programming enable not yet acknowledged
    Enabling,
    /// Target in serial programming mode
    Enabled,
}

#[derive(Debug, thiserror::Error)]
pub enum Error<SpiError, PinError> {
    #[error("SPI error: {0:?}")]
    Spi(SpiError),

    #[error("Reset pin error: {0:?}")]
    Pin(PinError),

    #[error("Out of sync (sent {sent:02x?}, received {received:02x?})")]
    Desync { sent: [u8; FRAME_LEN], received: Vec<u8> },

    #[error("Device still busy after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u128 },

    #[error("Address or length {address:#x} out of range (limit {limit:#x})")]
    OutOfRange { address: usize, limit: usize },

    #[error("Signature mismatch (expected {expected:02x?}, found {found:02x?})")]
    SignatureMismatch { expected: [u8; 3], found: [u8; 3] },

    #[error("Fuse index {index} not supported, device has {count} fuse bytes")]
    UnsupportedFuseIndex { index: usize, count: usize },

    #[error("Device has no EEPROM")]
    NoEeprom,

    #[error("Device has no known signature")]
    NoSignature,

    #[error("Programming mode not enabled")]
    NotEnabled,
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Use the low speed SPI clock, for targets running from slow clocks
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub low_speed: bool,

    /// Timeout to wait for erase and write operations to complete
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub busy_timeout_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            low_speed: false,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl Options {
    pub fn speed(&self) -> BusSpeed {
        if self.low_speed {
            BusSpeed::Low
        } else {
            BusSpeed::High
        }
    }
}

/// Programming session bound to one bus, reset line and device
///
/// Dropping the programmer releases reset, so the target always leaves
/// programming mode, after which the bus is closed along with it.
pub struct Programmer<S, R, D>
where
    S: Transfer<u8>,
    R: OutputPin,
    D: DelayMs<u32>,
{
    state: State,
    options: Options,
    device: Device,
    spi: S,
    reset: R,
    delay: D,
}

impl<S, R, D> Programmer<S, R, D>
where
    S: Transfer<u8>,
    R: OutputPin,
    D: DelayMs<u32>,
{
    /// Create a new programmer instance, holding the target in reset released (idle)
    pub fn new(
        spi: S,
        mut reset: R,
        delay: D,
        device: Device,
        options: Options,
    ) -> Result<Self, Error<S::Error, R::Error>> {
        reset.set_high().map_err(Error::Pin)?;

        Ok(Self {
            state: State::Disabled,
            options,
            device,
            spi,
            reset,
            delay,
        })
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    /// Fetch the bound device descriptor
    pub fn descriptor(&self) -> &Device {
        &self.device
    }

    /// Fetch the SPI clock preset the bus was opened with
    pub fn speed(&self) -> BusSpeed {
        self.options.speed()
    }

    /// Enter programming mode
    ///
    /// Asserts reset, waits for the device to settle and sends programming
    /// enable. Not retried here, on failure the caller may `disable` and try again.
    pub fn enable(&mut self) -> Result<(), Error<S::Error, R::Error>> {
        debug!("Asserting reset");

        self.reset.set_low().map_err(Error::Pin)?;
        self.state = State::Enabling;
        self.delay.delay_ms(RESET_SETTLE_MS);

        debug!("Sending programming enable");

        let i = Instruction::ProgrammingEnable;
        let resp = self.transact(i.frame(), i.expect())?;

        debug!("Programming enabled (response 0x{:02x})", resp[0]);
        self.state = State::Enabled;

        Ok(())
    }

    /// Leave programming mode by releasing reset
    pub fn disable(&mut self) -> Result<(), Error<S::Error, R::Error>> {
        debug!("Releasing reset");

        self.reset.set_high().map_err(Error::Pin)?;
        self.state = State::Disabled;
        self.delay.delay_ms(RESET_RELEASE_MS);

        Ok(())
    }

    /// Leave programming mode and release the bus
    pub fn close(mut self) -> Result<(), Error<S::Error, R::Error>> {
        self.disable()
    }

    /// Exchange one frame and check the response against `expect`
    ///
    /// Returns the captured bytes in order. Any `Exact` position that does not
    /// echo the byte sent fails with `Error::Desync`.
    pub fn transact(
        &mut self,
        frame: [u8; FRAME_LEN],
        expect: [Expect; FRAME_LEN],
    ) -> Result<Vec<u8>, Error<S::Error, R::Error>> {
        let mut buff = frame;
        let received = self.spi.transfer(&mut buff).map_err(Error::Spi)?;

        trace!("tx: {:02x?} rx: {:02x?}", frame, received);

        if received.len() != FRAME_LEN {
            error!("Short response, sent {:02x?} received {:02x?}", frame, received);
            return Err(Error::Desync {
                sent: frame,
                received: received.to_vec(),
            });
        }

        let mut captured = Vec::with_capacity(FRAME_LEN);

        for (i, (e, b)) in expect.iter().zip(received.iter()).enumerate() {
            match e {
                Expect::Exact if *b != frame[i] => {
                    error!("Out of sync, sent {:02x?} received {:02x?}", frame, received);
                    return Err(Error::Desync {
                        sent: frame,
                        received: received.to_vec(),
                    });
                }
                Expect::Capture => captured.push(*b),
                _ => (),
            }
        }

        Ok(captured)
    }

    /// Poll the RDY/BSY flag, returning true while the device is busy
    pub fn poll_busy(&mut self) -> Result<bool, Error<S::Error, R::Error>> {
        let v = self.command(Instruction::PollReady)?;
        Ok(v & BUSY_MASK != 0)
    }

    /// Wait for an erase or write operation to complete
    pub fn wait_ready(&mut self) -> Result<(), Error<S::Error, R::Error>> {
        let timeout = Duration::from_millis(self.options.busy_timeout_ms as u64);
        self.wait_ready_timeout(timeout)
    }

    /// Wait for completion with an explicit deadline
    ///
    /// Polls back to back, each poll is already a blocking bus exchange.
    pub fn wait_ready_timeout(&mut self, timeout: Duration) -> Result<(), Error<S::Error, R::Error>> {
        let start = Instant::now();

        while self.poll_busy()? {
            let elapsed = start.elapsed();
            if elapsed > timeout {
                error!("Timeout waiting for device ready");
                return Err(Error::Timeout {
                    elapsed_ms: elapsed.as_millis(),
                });
            }
        }

        Ok(())
    }

    /// Issue an instruction in programming mode, returning the captured byte
    /// (zero for instructions that capture nothing)
    pub(crate) fn command(&mut self, i: Instruction) -> Result<u8, Error<S::Error, R::Error>> {
        self.ensure_enabled()?;

        let captured = self.transact(i.frame(), i.expect())?;
        Ok(captured.first().copied().unwrap_or(0))
    }

    /// Issue an instruction and wait for the device to finish it
    pub(crate) fn command_wait(&mut self, i: Instruction) -> Result<(), Error<S::Error, R::Error>> {
        self.command(i)?;
        if i.needs_poll() {
            self.wait_ready()?;
        }
        Ok(())
    }

    pub(crate) fn ensure_enabled(&self) -> Result<(), Error<S::Error, R::Error>> {
        if self.state != State::Enabled {
            error!("Programming mode not enabled (state: {:?})", self.state);
            return Err(Error::NotEnabled);
        }
        Ok(())
    }
}

impl<S, R, D> Drop for Programmer<S, R, D>
where
    S: Transfer<u8>,
    R: OutputPin,
    D: DelayMs<u32>,
{
    fn drop(&mut self) {
        if self.reset.set_high().is_err() {
            warn!("Failed to release reset");
        }

        if self.state != State::Disabled {
            self.delay.delay_ms(RESET_RELEASE_MS);
            self.state = State::Disabled;
        }
    }
}
