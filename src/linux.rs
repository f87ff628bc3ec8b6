use std::io::Error as IoError;
use std::path::Path;

use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::sysfs_gpio::{Direction, Error as GpioError};
use linux_embedded_hal::{Delay, Spidev, SysfsPin};

use crate::{Device, Error, Options, Programmer};

/// Programmer using a Linux spidev bus and a sysfs GPIO for reset
pub type LinuxProgrammer = Programmer<Spidev, SysfsPin, Delay>;

/// Errors returned by the Linux programmer
pub type LinuxError = Error<IoError, GpioError>;

impl Programmer<Spidev, SysfsPin, Delay> {
    /// Create a new linux spidev programmer instance
    ///
    /// The bus is opened in mode 0, MSB first, with chip select disabled as
    /// the target is selected by its reset line.
    pub fn linux<P: AsRef<Path>>(
        spi: P,
        reset_gpio: u64,
        device: Device,
        options: Options,
    ) -> Result<Self, LinuxError> {
        let speed = options.speed();

        // Open bus
        let mut spi = Spidev::open(spi.as_ref()).map_err(Error::Spi)?;

        // Apply settings
        let settings = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(speed.hz())
            .lsb_first(false)
            .mode(SpiModeFlags::SPI_MODE_0 | SpiModeFlags::SPI_NO_CS)
            .build();

        spi.0.configure(&settings).map_err(Error::Spi)?;

        debug!("Opened SPI bus at {} Hz", speed.hz());

        // Export reset pin, starting high so the target keeps running
        let reset = SysfsPin::new(reset_gpio);
        reset.export().map_err(Error::Pin)?;
        reset.set_direction(Direction::High).map_err(Error::Pin)?;

        debug!("Using GPIO {} for reset", reset_gpio);

        // Return instance
        Self::new(spi, reset, Delay {}, device, options)
    }
}
