//! AVR serial programming instruction set.
//!
//! Every instruction is a fixed four byte frame, most of which the target
//! echoes back one byte delayed (so the response mirrors the request until
//! the final byte). See the "Serial Programming Instruction Set" table in
//! the device datasheets.

/// Length of every ISP instruction frame
pub const FRAME_LEN: usize = 4;

/// Synchronisation byte echoed back while entering programming mode
pub const SYNC_BYTE: u8 = 0x69;

/// Bit set in the poll response while the device is busy
pub const BUSY_MASK: u8 = 0x01;

/// Only the low six lock bits are defined
pub const LOCK_BITS_MASK: u8 = 0x3F;

/// Value of erased flash, also used to pad partial pages
pub const ERASED: u8 = 0xFF;

/// Number of signature bytes
pub const SIGNATURE_LEN: usize = 3;

/// Per-byte expectation applied to the response of a frame
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Expect {
    /// Response byte must equal the byte that was sent
    Exact,
    /// Response byte is discarded
    Ignore,
    /// Response byte is returned to the caller
    Capture,
}

/// Full echo check, the default for commands that return nothing
pub const ECHO: [Expect; FRAME_LEN] = [Expect::Exact; FRAME_LEN];

/// Echo check on the first three bytes, capture the last
pub const CAPTURE_LAST: [Expect; FRAME_LEN] =
    [Expect::Exact, Expect::Exact, Expect::Exact, Expect::Capture];

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Instruction {
    /// Enter serial programming mode, must follow reset by at least 20 ms
    ProgrammingEnable,

    /// Erase flash and EEPROM
    ChipErase,

    /// Read the low or high byte of a flash word
    ReadFlash { high: bool, word: u16 },

    /// Stage one byte into the flash page buffer
    LoadPage { high: bool, word: u16, value: u8 },

    /// Commit the page buffer to the flash page containing `word`
    WritePage { word: u16 },

    /// Read one of the three signature bytes
    ReadSignature { index: u8 },

    /// Read an oscillator calibration byte
    ReadCalibration { index: u8 },

    /// Read the lock bits
    ReadLock,

    /// Read one EEPROM byte
    ReadEeprom { address: u16 },

    /// Write one EEPROM byte
    WriteEeprom { address: u16, value: u8 },

    /// Check the RDY/BSY flag
    PollReady,
}

impl Instruction {
    /// Encode the instruction as it is sent on the bus
    pub fn frame(&self) -> [u8; FRAME_LEN] {
        use Instruction::*;

        match *self {
            ProgrammingEnable => [0xAC, 0x53, SYNC_BYTE, SYNC_BYTE],
            ChipErase => [0xAC, 0x80, 0x42, 0x42],
            ReadFlash { high, word } => [
                0x20 | high_bit(high),
                (word >> 8) as u8,
                word as u8,
                0x00,
            ],
            LoadPage { high, word, value } => [0x40 | high_bit(high), 0x00, word as u8, value],
            WritePage { word } => [0x4C, (word >> 8) as u8, word as u8, 0x00],
            ReadSignature { index } => [0x30, 0x12, index, 0x00],
            ReadCalibration { index } => [0x38, 0x12, index & 1, 0x00],
            ReadLock => [0x58, 0x00, 0x00, 0x00],
            ReadEeprom { address } => [0xA0, (address >> 8) as u8, address as u8, 0x00],
            WriteEeprom { address, value } => [0xC0, (address >> 8) as u8, address as u8, value],
            PollReady => [0xF0, 0x00, 0x12, 0x34],
        }
    }

    /// Response expectation for the instruction
    pub fn expect(&self) -> [Expect; FRAME_LEN] {
        use Instruction::*;

        match self {
            ProgrammingEnable | ReadFlash { .. } | ReadSignature { .. } | ReadCalibration { .. }
            | ReadLock | ReadEeprom { .. } | PollReady => CAPTURE_LAST,
            ChipErase | LoadPage { .. } | WritePage { .. } | WriteEeprom { .. } => ECHO,
        }
    }

    /// Whether the device goes busy after this instruction and must be polled
    pub fn needs_poll(&self) -> bool {
        matches!(
            self,
            Instruction::ChipErase | Instruction::WritePage { .. } | Instruction::WriteEeprom { .. }
        )
    }
}

// Opcode bit 3 selects the high byte of a flash word
fn high_bit(high: bool) -> u8 {
    if high {
        0x08
    } else {
        0x00
    }
}

/// Fuse command layout, fixed per device family
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum FuseScheme {
    /// Low and high fuse, selected by bit 3 of the opcode
    Legacy,
    /// Low, high and extended fuse with dedicated opcodes
    Extended,
}

impl FuseScheme {
    /// Select the scheme for a set of fuse labels
    pub const fn for_labels(labels: &[&str]) -> FuseScheme {
        if labels.len() > 2 {
            FuseScheme::Extended
        } else {
            FuseScheme::Legacy
        }
    }

    /// Frame reading fuse byte `index`
    ///
    /// Returns `None` when the scheme has no encoding for the index.
    pub fn read_frame(self, index: usize) -> Option<[u8; FRAME_LEN]> {
        match self {
            FuseScheme::Legacy => {
                let sel = legacy_selector(index)?;
                Some([0x50 | sel, sel, 0x21, 0x37])
            }
            FuseScheme::Extended => match index {
                0 => Some([0x50, 0x00, 0x21, 0x37]),
                1 => Some([0x58, 0x08, 0x21, 0x37]),
                2 => Some([0x50, 0x08, 0x21, 0x37]),
                _ => None,
            },
        }
    }

    /// Frame writing `value` to fuse byte `index`
    pub fn write_frame(self, index: usize, value: u8) -> Option<[u8; FRAME_LEN]> {
        match self {
            FuseScheme::Legacy => Some([0xAC, 0xA0 | legacy_selector(index)?, 0x00, value]),
            FuseScheme::Extended => match index {
                0 => Some([0xAC, 0xA0, 0x00, value]),
                1 => Some([0xAC, 0xA8, 0x00, value]),
                2 => Some([0xAC, 0xA4, 0x00, value]),
                _ => None,
            },
        }
    }
}

// Only low (0) and high (1) fuses exist, selected by bit 3
fn legacy_selector(index: usize) -> Option<u8> {
    if index > 1 {
        return None;
    }
    Some((index as u8) << 3)
}
