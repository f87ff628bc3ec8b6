//! Supported microcontrollers and their memory geometry.

pub use crate::protocol::FuseScheme;

/// EEPROM geometry
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Eeprom {
    pub capacity: usize,
    pub page_size: usize,
}

/// Device descriptor
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Device {
    pub name: &'static str,

    /// Flash size in bytes, always even as flash is word addressed
    pub flash_capacity: usize,

    /// Flash page size in bytes
    pub flash_page_size: usize,

    pub eeprom: Option<Eeprom>,

    /// Expected signature bytes
    pub signature: Option<[u8; 3]>,

    /// Labels of the fuse bytes the device exposes, in index order
    pub fuse_labels: &'static [&'static str],

    pub fuse_scheme: FuseScheme,
}

const LH: &[&str] = &["L", "H"];
const LHE: &[&str] = &["L", "H", "EXT"];

/// Supported devices
pub const DEVICES: &[Device] = &[
    Device {
        name: "attiny13",
        flash_capacity: 1024,
        flash_page_size: 32,
        eeprom: Some(Eeprom { capacity: 64, page_size: 4 }),
        signature: Some([0x1E, 0x90, 0x07]),
        fuse_labels: LH,
        fuse_scheme: FuseScheme::for_labels(LH),
    },
    Device {
        name: "attiny25",
        flash_capacity: 2048,
        flash_page_size: 32,
        eeprom: Some(Eeprom { capacity: 128, page_size: 4 }),
        signature: Some([0x1E, 0x91, 0x08]),
        fuse_labels: LHE,
        fuse_scheme: FuseScheme::for_labels(LHE),
    },
    Device {
        name: "attiny45",
        flash_capacity: 4096,
        flash_page_size: 64,
        eeprom: Some(Eeprom { capacity: 256, page_size: 4 }),
        signature: Some([0x1E, 0x92, 0x06]),
        fuse_labels: LHE,
        fuse_scheme: FuseScheme::for_labels(LHE),
    },
    Device {
        name: "attiny85",
        flash_capacity: 8192,
        flash_page_size: 64,
        eeprom: Some(Eeprom { capacity: 512, page_size: 4 }),
        signature: Some([0x1E, 0x93, 0x0B]),
        fuse_labels: LHE,
        fuse_scheme: FuseScheme::for_labels(LHE),
    },
    Device {
        name: "atmega8",
        flash_capacity: 8192,
        flash_page_size: 64,
        eeprom: Some(Eeprom { capacity: 512, page_size: 4 }),
        signature: Some([0x1E, 0x93, 0x07]),
        fuse_labels: LH,
        fuse_scheme: FuseScheme::for_labels(LH),
    },
    Device {
        name: "atmega328p",
        flash_capacity: 32768,
        flash_page_size: 128,
        eeprom: Some(Eeprom { capacity: 1024, page_size: 4 }),
        signature: Some([0x1E, 0x95, 0x0F]),
        fuse_labels: LHE,
        fuse_scheme: FuseScheme::for_labels(LHE),
    },
];

impl Device {
    /// Look up a device by name (case insensitive)
    pub fn by_name(name: &str) -> Option<&'static Device> {
        DEVICES.iter().find(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// Number of addressable flash words
    pub fn flash_words(&self) -> usize {
        self.flash_capacity / 2
    }

    /// Number of fuse bytes
    pub fn fuse_count(&self) -> usize {
        self.fuse_labels.len()
    }

    /// Index of the fuse byte with the given label (case insensitive)
    pub fn fuse_index(&self, label: &str) -> Option<usize> {
        self.fuse_labels
            .iter()
            .position(|l| l.eq_ignore_ascii_case(label))
    }
}
