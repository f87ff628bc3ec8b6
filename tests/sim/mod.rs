//! Simulated AVR target for driving the programmer without hardware.
//!
//! Echoes every frame (the response mirrors the request until the final
//! byte) and models page buffered flash, EEPROM, fuses and the busy flag.

#![allow(dead_code)]

use std::cell::RefCell;
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use avr_isp::{Device, Eeprom, FuseScheme, Options, Programmer};

const FRAME_LOG_LIMIT: usize = 100_000;

/// Page commit as seen by the target
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Commit {
    pub base: usize,
    pub loads: usize,
}

pub struct Avr {
    pub device: Device,
    pub flash: Vec<u8>,
    pub eeprom: Vec<u8>,
    pub page_buffer: Vec<u8>,
    pub signature: [u8; 3],
    pub calibration: [u8; 2],
    pub fuses: [u8; 3],
    pub lock: u8,

    pub reset_low: bool,
    pub programming: bool,
    /// Target ignores the bus entirely (e.g. not powered)
    pub unresponsive: bool,
    /// XOR mask applied to the next response only
    pub corrupt_next: Option<[u8; 4]>,
    /// Next response is cut short to this many bytes
    pub truncate_next: Option<usize>,
    /// Reset line driver refuses to change level
    pub reset_fails: bool,

    /// Number of polls reporting busy after each erase or write
    pub busy_polls: u32,
    pub busy_remaining: u32,
    pub stuck_busy: bool,

    pub frames: Vec<[u8; 4]>,
    pub commits: Vec<Commit>,
    pub loads: usize,
    pub delays: Vec<u32>,
    pub reset_log: Vec<bool>,
}

impl Avr {
    pub fn new(device: Device) -> Self {
        let eeprom = device.eeprom.map(|e| e.capacity).unwrap_or(0);

        Self {
            device,
            // Flash starts out programmed with junk, only erase brings it to 0xFF
            flash: vec![0x00; device.flash_capacity],
            eeprom: vec![0x00; eeprom],
            page_buffer: vec![0xFF; device.flash_page_size],
            signature: device.signature.unwrap_or([0x1E, 0x00, 0x00]),
            calibration: [0x5A, 0x61],
            fuses: [0x6A, 0xFF, 0xFF],
            lock: 0x3F,
            reset_low: false,
            programming: false,
            unresponsive: false,
            corrupt_next: None,
            truncate_next: None,
            reset_fails: false,
            busy_polls: 2,
            busy_remaining: 0,
            stuck_busy: false,
            frames: Vec::new(),
            commits: Vec::new(),
            loads: 0,
            delays: Vec::new(),
            reset_log: Vec::new(),
        }
    }

    /// Frames sent with the given first byte
    pub fn count(&self, opcode: u8) -> usize {
        self.frames.iter().filter(|f| f[0] == opcode).count()
    }

    fn exchange(&mut self, f: [u8; 4]) -> [u8; 4] {
        // Bounded so busy polling for a full timeout stays cheap
        if self.frames.len() < FRAME_LOG_LIMIT {
            self.frames.push(f);
        }

        if self.unresponsive || !self.reset_low {
            return [0x00; 4];
        }

        let mut resp = f;
        let mut busy = false;

        match (f[0], f[1]) {
            (0xAC, 0x53) => {
                self.programming = true;
                resp[3] = 0x00;
            }
            _ if !self.programming => return [0x00; 4],

            (0xAC, 0x80) => {
                for b in self.flash.iter_mut().chain(self.eeprom.iter_mut()) {
                    *b = 0xFF;
                }
                busy = true;
            }
            (0x20, _) | (0x28, _) => {
                resp[3] = self.flash[flash_address(f)];
            }
            (0x40, _) | (0x48, _) => {
                let offset = (f[2] as usize * 2 + high(f)) % self.device.flash_page_size;
                self.page_buffer[offset] = f[3];
                self.loads += 1;
            }
            (0x4C, _) => {
                let page_size = self.device.flash_page_size;
                let base = (word_address(f) * 2) & !(page_size - 1);

                // Programming can only clear bits
                for (i, b) in self.page_buffer.iter_mut().enumerate() {
                    self.flash[base + i] &= *b;
                    *b = 0xFF;
                }

                self.commits.push(Commit {
                    base,
                    loads: self.loads,
                });
                self.loads = 0;
                busy = true;
            }
            (0x30, 0x12) => {
                resp[3] = *self.signature.get(f[2] as usize).unwrap_or(&0xFF);
            }
            (0x38, 0x12) => {
                resp[3] = self.calibration[(f[2] & 1) as usize];
            }
            (0x58, 0x00) => {
                // Undefined bits read as one
                resp[3] = self.lock | 0xC0;
            }
            (0x50, 0x00) => resp[3] = self.fuses[0],
            (0x58, 0x08) => resp[3] = self.fuses[1],
            (0x50, 0x08) => resp[3] = self.fuses[2],
            (0xAC, 0xA0) => {
                self.fuses[0] = f[3];
                busy = true;
            }
            (0xAC, 0xA8) => {
                self.fuses[1] = f[3];
                busy = true;
            }
            (0xAC, 0xA4) => {
                self.fuses[2] = f[3];
                busy = true;
            }
            (0xA0, _) => {
                resp[3] = self.eeprom[eeprom_address(f)];
            }
            (0xC0, _) => {
                let a = eeprom_address(f);
                self.eeprom[a] = f[3];
                busy = true;
            }
            (0xF0, _) => {
                // Only bit 0 is meaningful
                resp[3] = if self.stuck_busy || self.busy_remaining > 0 {
                    self.busy_remaining = self.busy_remaining.saturating_sub(1);
                    0xFF
                } else {
                    0xFE
                };
            }
            _ => return [0x00; 4],
        }

        if busy {
            self.busy_remaining = self.busy_polls;
        }

        if let Some(mask) = self.corrupt_next.take() {
            for (r, m) in resp.iter_mut().zip(mask.iter()) {
                *r ^= m;
            }
        }

        resp
    }
}

fn high(f: [u8; 4]) -> usize {
    ((f[0] >> 3) & 1) as usize
}

fn word_address(f: [u8; 4]) -> usize {
    (f[1] as usize) << 8 | f[2] as usize
}

fn flash_address(f: [u8; 4]) -> usize {
    word_address(f) * 2 + high(f)
}

fn eeprom_address(f: [u8; 4]) -> usize {
    (f[1] as usize) << 8 | f[2] as usize
}

pub type Shared = Rc<RefCell<Avr>>;

pub struct SimSpi(pub Shared);

impl Transfer<u8> for SimSpi {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let mut frame = [0u8; 4];
        frame.copy_from_slice(words);

        let mut avr = self.0.borrow_mut();
        let resp = avr.exchange(frame);
        words.copy_from_slice(&resp);

        match avr.truncate_next.take() {
            Some(n) => Ok(&words[..n]),
            None => Ok(words),
        }
    }
}

/// Reset driver failure
#[derive(Debug, PartialEq)]
pub struct PinFault;

pub struct SimReset(pub Shared);

impl OutputPin for SimReset {
    type Error = PinFault;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        let mut avr = self.0.borrow_mut();
        if avr.reset_fails {
            return Err(PinFault);
        }
        avr.reset_low = true;
        avr.reset_log.push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut avr = self.0.borrow_mut();
        if avr.reset_fails {
            return Err(PinFault);
        }
        avr.reset_low = false;
        avr.programming = false;
        avr.reset_log.push(true);
        Ok(())
    }
}

pub struct SimDelay(pub Shared);

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.0.borrow_mut().delays.push(ms);
    }
}

pub type SimProgrammer = Programmer<SimSpi, SimReset, SimDelay>;

/// Legacy two fuse part with EEPROM
pub const TINY: Device = Device {
    name: "tiny-test",
    flash_capacity: 1024,
    flash_page_size: 32,
    eeprom: Some(Eeprom {
        capacity: 64,
        page_size: 4,
    }),
    signature: Some([0x1E, 0x90, 0x07]),
    fuse_labels: &["L", "H"],
    fuse_scheme: FuseScheme::Legacy,
};

/// Minimal descriptor without EEPROM or signature
pub const BARE: Device = Device {
    name: "bare-test",
    flash_capacity: 1024,
    flash_page_size: 32,
    eeprom: None,
    signature: None,
    fuse_labels: &["L", "H"],
    fuse_scheme: FuseScheme::Legacy,
};

pub fn programmer(device: Device) -> (SimProgrammer, Shared) {
    let avr = Rc::new(RefCell::new(Avr::new(device)));

    let p = Programmer::new(
        SimSpi(avr.clone()),
        SimReset(avr.clone()),
        SimDelay(avr.clone()),
        device,
        Options::default(),
    )
    .unwrap();

    (p, avr)
}

/// Programmer already in programming mode, with the setup traffic cleared
pub fn enabled(device: Device) -> (SimProgrammer, Shared) {
    let (mut p, avr) = programmer(device);
    p.enable().unwrap();

    {
        let mut a = avr.borrow_mut();
        a.frames.clear();
        a.delays.clear();
        a.reset_log.clear();
    }

    (p, avr)
}
