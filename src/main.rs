
#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use avr_isp::linux::LinuxProgrammer;
use avr_isp::{Device, Options, Verification, DEVICES};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// SPI device connected to the target
    #[structopt(long, default_value = "/dev/spidev0.0")]
    spi: PathBuf,

    /// GPIO number driving the target reset line
    #[structopt(long, default_value = "2")]
    reset_gpio: u64,

    /// Microcontroller model
    #[structopt(long, default_value = "attiny13")]
    mcu: String,

    /// Number of times to retry entering programming mode
    #[structopt(long, default_value = "0")]
    retries: u32,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// List supported microcontrollers
    ListMcus,

    /// Enter programming mode and check the signature only
    Nop,

    /// Erase flash and EEPROM
    Erase,

    /// Erase, program and verify flash from a binary file
    Write {
        /// Binary image
        bin: PathBuf,

        /// Number of bytes to write from the image
        #[structopt(long)]
        length: Option<usize>,

        /// Skip verification after programming
        #[structopt(long)]
        no_verify: bool,
    },

    /// Compare flash against a binary file
    Verify {
        /// Binary image
        bin: PathBuf,
    },

    /// Read flash
    Read {
        /// File to save flash contents to
        #[structopt(long)]
        output: Option<PathBuf>,

        /// Number of bytes to read
        #[structopt(long)]
        length: Option<usize>,

        /// Do not print memory contents
        #[structopt(long)]
        quiet: bool,
    },

    /// Read signature, calibration, lock and fuse bytes
    ReadFuses {
        /// File to save the summary to
        #[structopt(long)]
        output: Option<PathBuf>,

        /// Do not print the summary
        #[structopt(long)]
        quiet: bool,
    },

    /// Write a fuse byte
    WriteFuse {
        /// Fuse label (e.g. L, H, EXT)
        fuse: String,

        /// New value (decimal, 0x hex or 0b binary)
        #[structopt(parse(try_from_str = parse_u8))]
        value: u8,

        /// Do not ask for confirmation
        #[structopt(long)]
        yes: bool,
    },

    /// Read EEPROM
    ReadEeprom {
        /// File to save EEPROM contents to
        #[structopt(long)]
        output: Option<PathBuf>,

        /// Do not print memory contents
        #[structopt(long)]
        quiet: bool,
    },

    /// Write EEPROM from a binary file
    WriteEeprom {
        /// Binary image
        bin: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Command::ListMcus = o.command {
        list_mcus();
        return Ok(());
    }

    let device = *Device::by_name(&o.mcu)
        .ok_or_else(|| anyhow!("Unsupported microcontroller '{}' (see list-mcus)", o.mcu))?;

    info!("Connecting to {} via {}", device.name, o.spi.display());

    let mut p = LinuxProgrammer::linux(&o.spi, o.reset_gpio, device, o.options.clone())
        .context("Error opening programmer")?;

    enable(&mut p, o.retries)?;

    // Reset is released when the programmer is dropped, whatever happens here
    run(&mut p, &o.command)?;

    p.close().context("Error leaving programming mode")?;

    Ok(())
}

fn enable(p: &mut LinuxProgrammer, retries: u32) -> anyhow::Result<()> {
    let mut attempt = 0;

    loop {
        match p.enable() {
            Ok(_) => break,
            Err(e) if attempt < retries => {
                warn!("Error entering programming mode: {}, retrying", e);
                p.disable()?;
                attempt += 1;
            }
            Err(e) => return Err(e).context("Error entering programming mode"),
        }
    }

    if p.descriptor().signature.is_some() {
        p.check_signature().context("Wrong or unsupported device attached")?;
    }

    info!("Programming mode enabled");
    Ok(())
}

fn run(p: &mut LinuxProgrammer, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::ListMcus | Command::Nop => Ok(()),
        Command::Erase => {
            info!("Erasing...");
            p.chip_erase()?;
            Ok(())
        }
        Command::Write { bin, length, no_verify } => write_file(p, bin, *length, !*no_verify),
        Command::Verify { bin } => {
            let data = fs::read(bin).with_context(|| format!("Error reading {}", bin.display()))?;
            verify(p, &data)
        }
        Command::Read { output, length, quiet } => dump_flash(p, output.as_ref(), *length, *quiet),
        Command::ReadFuses { output, quiet } => dump_bits(p, output.as_ref(), *quiet),
        Command::WriteFuse { fuse, value, yes } => write_fuse(p, fuse, *value, *yes),
        Command::ReadEeprom { output, quiet } => dump_eeprom(p, output.as_ref(), *quiet),
        Command::WriteEeprom { bin } => {
            let data = fs::read(bin).with_context(|| format!("Error reading {}", bin.display()))?;
            info!("Writing {} bytes to EEPROM...", data.len());
            p.write_eeprom_bytes(0, &data)?;
            Ok(())
        }
    }
}

fn list_mcus() {
    for d in DEVICES {
        let eeprom = d
            .eeprom
            .map(|e| bytefmt::format(e.capacity as u64))
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<12} flash: {:<8} page: {:<4} eeprom: {:<8} fuses: {}",
            d.name,
            bytefmt::format(d.flash_capacity as u64),
            d.flash_page_size,
            eeprom,
            d.fuse_labels.join(","),
        );
    }
}

fn progress_bar(len: usize, message: &str) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:10} [{bar:40}] {bytes}/{total_bytes}")
            .progress_chars("=> "),
    );
    bar.set_message(message);
    bar
}

fn write_file(p: &mut LinuxProgrammer, bin: &PathBuf, length: Option<usize>, verify_after: bool) -> anyhow::Result<()> {
    if bin.extension().map(|e| e != "bin").unwrap_or(true) {
        warn!("File does not end with .bin extension, might be incorrect format");
    }

    let mut data = fs::read(bin).with_context(|| format!("Error reading {}", bin.display()))?;
    if let Some(l) = length {
        data.truncate(l);
    }

    info!("Loaded {} bytes from {}", data.len(), bin.display());

    if data.is_empty() {
        bail!("Empty image");
    }

    let capacity = p.descriptor().flash_capacity;
    if data.len() > capacity {
        bail!("Image too long ({} bytes, flash is {} bytes)", data.len(), capacity);
    }

    info!("Erasing...");
    p.chip_erase()?;

    info!("Programming...");
    let bar = progress_bar(data.len(), "Writing");
    p.program_with_progress(&data, |done, _| bar.set_position(done as u64))?;
    bar.finish();

    if verify_after {
        verify(p, &data)?;
    }

    Ok(())
}

fn verify(p: &mut LinuxProgrammer, data: &[u8]) -> anyhow::Result<()> {
    info!("Verifying...");

    let bar = progress_bar(data.len(), "Verifying");
    let v = p.verify_with_progress(data, |done, _| bar.set_position(done as u64))?;
    bar.finish();

    match v {
        Verification::Match => {
            info!("Verified {} bytes", data.len());
            Ok(())
        }
        Verification::Mismatch { offset, expected, found } => bail!(
            "Verify failed @ 0x{:04X}: expected 0x{:02X} found 0x{:02X}",
            offset,
            expected,
            found
        ),
    }
}

fn dump_flash(p: &mut LinuxProgrammer, output: Option<&PathBuf>, length: Option<usize>, quiet: bool) -> anyhow::Result<()> {
    let device = *p.descriptor();
    let length = length.unwrap_or(device.flash_capacity);

    if length > device.flash_capacity {
        bail!("Excessive length ({} bytes, flash is {} bytes)", length, device.flash_capacity);
    }

    info!("Reading {} bytes from {}...", length, device.name);

    let mut data = vec![0u8; length];
    let bar = progress_bar(length, "Reading");
    for (i, chunk) in data.chunks_mut(device.flash_page_size).enumerate() {
        let start = i * device.flash_page_size;
        p.read_flash(start, chunk)?;
        bar.set_position((start + chunk.len()) as u64);
    }
    bar.finish();

    save(output, &data)?;

    if !quiet {
        print_hex(&data, device.flash_page_size);
    }

    Ok(())
}

fn dump_eeprom(p: &mut LinuxProgrammer, output: Option<&PathBuf>, quiet: bool) -> anyhow::Result<()> {
    let eeprom = p
        .descriptor()
        .eeprom
        .ok_or_else(|| anyhow!("{} has no EEPROM", p.descriptor().name))?;

    info!("Reading {} bytes of EEPROM...", eeprom.capacity);

    let mut data = vec![0u8; eeprom.capacity];
    p.read_eeprom_into(0, &mut data)?;

    save(output, &data)?;

    if !quiet {
        print_hex(&data, 16);
    }

    Ok(())
}

fn save(output: Option<&PathBuf>, data: &[u8]) -> anyhow::Result<()> {
    if let Some(f) = output {
        info!("Saving binary data to {}...", f.display());
        fs::write(f, data).with_context(|| format!("Error writing {}", f.display()))?;
    }
    Ok(())
}

fn print_hex(data: &[u8], row: usize) {
    let header: Vec<String> = (0..row).map(|i| format!("{:02X}", i)).collect();
    println!("     | {}", header.join(" "));
    println!("-----|-{}", "-".repeat(row * 3));

    for (i, chunk) in data.chunks(row).enumerate() {
        println!(" {:03X} | {}", i * row, hex_row(chunk));
    }
}

/// Upper case hex bytes separated by spaces
fn hex_row(chunk: &[u8]) -> String {
    let encoded = hex::encode_upper(chunk);
    let bytes: Vec<&str> = (0..encoded.len()).step_by(2).map(|n| &encoded[n..n + 2]).collect();
    bytes.join(" ")
}

fn dump_bits(p: &mut LinuxProgrammer, output: Option<&PathBuf>, quiet: bool) -> anyhow::Result<()> {
    let sig = p.read_signature()?;
    let calib = [p.read_calibration_byte(0)?, p.read_calibration_byte(1)?];
    let lock = p.read_lock_bits()?;
    let fuses = p.read_fuses()?;

    let mut txt = String::new();
    txt += "Signature:\n";
    for (i, s) in sig.iter().enumerate() {
        txt += &format!("0x{:03X} : 0x{:02X}\n", i, s);
    }
    txt += &format!("\nCalibration(0, 1): 0x{:02X} 0x{:02X}\n", calib[0], calib[1]);
    txt += &format!("\nLock bits: 0x{:02X} (0b{:08b})\n", lock, lock);
    txt += "\nFuses:\n";
    for (label, v) in &fuses {
        txt += &format!("  {:<3}: 0x{:02X} (0b{:08b})\n", label, v, v);
    }

    if let Some(f) = output {
        info!("Saving read summary to {}...", f.display());
        fs::write(f, &txt).with_context(|| format!("Error writing {}", f.display()))?;
    }

    if !quiet {
        println!("{}", txt);
    }

    Ok(())
}

fn write_fuse(p: &mut LinuxProgrammer, fuse: &str, value: u8, yes: bool) -> anyhow::Result<()> {
    let index = p.descriptor().fuse_index(fuse).ok_or_else(|| {
        anyhow!(
            "Unknown fuse '{}' (available: {})",
            fuse,
            p.descriptor().fuse_labels.join(", ")
        )
    })?;

    let current = p.read_fuse(index)?;
    println!("Fuse {} now: 0x{:02X} (0b{:08b})", fuse, current, current);

    if !yes {
        print!("Proceed to write 0x{:02X} (0b{:08b}) to fuse {} (y/n)? ", value, value, fuse);
        io::stdout().flush()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        if line.trim().to_lowercase() != "y" {
            println!("Aborting");
            return Ok(());
        }
    }

    p.write_fuse(index, value)?;

    let readback = p.read_fuse(index)?;
    if readback != value {
        bail!("Fuse {} reads back 0x{:02X} after writing 0x{:02X}", fuse, readback, value);
    }

    println!("Done.");
    Ok(())
}

fn parse_u8(s: &str) -> Result<u8, std::num::ParseIntError> {
    if let Some(h) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(h, 16)
    } else if let Some(b) = s.strip_prefix("0b") {
        u8::from_str_radix(b, 2)
    } else {
        s.parse()
    }
}
