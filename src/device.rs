//! Device identification and geometry.
//!
//! Nothing is known about the attached part up front. The programmer is told
//! to expect an ATmega328P and asked for the signature; when that fails the
//! AT89S route is tried through the universal command instead.

use core::fmt;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{Command, ATMEL_VENDOR, DEVCODE_AT89S, DEVCODE_AVR};
use crate::{Error, Programmer, SerialPort, State};

/// Geometry declared while probing for AVR parts (ATmega328P)
const PROBE_AVR: (usize, usize) = (32768, 128);
/// Geometry declared while probing for AT89S parts (AT89S52)
const PROBE_AT89S: (usize, usize) = (8192, 256);

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Family {
    Avr,
    /// Legacy 8051 family, programmed byte by byte through universal commands
    At89s,
}

impl Family {
    pub fn from_signature(sig: u32) -> Self {
        match sig & 0xF000 {
            0x5000 | 0x7000 => Family::At89s,
            _ => Family::Avr,
        }
    }

    /// Device code used with SET_DEVICE
    pub fn device_code(self) -> u8 {
        match self {
            Family::Avr => DEVCODE_AVR,
            Family::At89s => DEVCODE_AT89S,
        }
    }
}

/// Flash size encoded in the second signature byte
pub fn flash_size(family: Family, sig: u32) -> usize {
    let n = ((sig >> 8) & 0xF) as usize;
    match family {
        Family::At89s => n * 4096,
        Family::Avr => 1024 << n,
    }
}

/// Page size for a part.
///
/// There is no rule behind the AVR brackets, they follow the datasheets of
/// the known parts.
pub fn page_size(sig: u32, flash_size: usize) -> usize {
    match sig & 0xF000 {
        0x5000 => return 256,
        0x7000 => return 64,
        _ => (),
    }

    match flash_size {
        0..=2048 => 32,
        2049..=8192 => 64,
        8193..=32768 => 128,
        _ => 256,
    }
}

/// Classify a signature into family, flash size and page size.
///
/// Returns `None` for anything that is not a recognisable Atmel part.
pub fn classify(sig: u32) -> Option<(Family, usize, usize)> {
    if sig >> 16 != ATMEL_VENDOR as u32 {
        return None;
    }

    let family = Family::from_signature(sig);
    let flash = flash_size(family, sig);
    if flash == 0 {
        return None;
    }

    Some((family, flash, page_size(sig, flash)))
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct DeviceProfile {
    pub signature: u32,
    pub family: Family,
    /// Firmware implements the universal command
    pub universal: bool,
    pub flash_size: usize,
    pub page_size: usize,
}

impl DeviceProfile {
    pub fn new(signature: u32, universal: bool) -> Option<Self> {
        let (family, flash_size, page_size) = classify(signature)?;

        Some(Self {
            signature,
            family,
            universal,
            flash_size,
            page_size,
        })
    }

    pub fn pages(&self) -> usize {
        self.flash_size / self.page_size
    }

    /// End of the flash reachable with 16-bit addresses, LOAD_ADDRESS takes
    /// a word address on AVR parts and AT89S byte commands a byte address
    pub fn addressable(&self) -> usize {
        let limit = match self.family {
            Family::Avr => 0x2_0000,
            Family::At89s => 0x1_0000,
        };
        self.flash_size.min(limit)
    }

    /// Fuses can only be reached on AVR parts with universal support
    pub fn supports_fuses(&self) -> bool {
        self.universal && self.family == Family::Avr
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device ID: 0x{:x}", self.signature)?;
        writeln!(
            f,
            "Flash Memory: {}KB,{}p,x{}",
            self.flash_size / 1024,
            self.pages(),
            self.page_size
        )?;
        write!(
            f,
            "STK_UNIVERSAL: {}",
            if self.universal { "yes" } else { "no" }
        )
    }
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Identify the attached device and enter programming mode with its
    /// real geometry.
    ///
    /// Requires a synchronized programmer. With `no_reset`, programming mode
    /// is left once in between, as bootloaders only restart the application
    /// when the session is over.
    pub fn probe(&mut self) -> Result<DeviceProfile, Error<E>> {
        self.expect_state(State::Synced)?;
        self.state = State::Probing;

        let (signature, universal) = self.guess()?;
        debug!("Probed signature 0x{:06x}, universal {}", signature, universal);

        if self.options.no_reset {
            self.command(Command::LeaveProgmode)?;
        }

        let profile = match DeviceProfile::new(signature, universal) {
            Some(p) => p,
            None => {
                error!("Undetermined device (signature 0x{:06x})", signature);
                return Err(Error::NoDevice);
            }
        };

        for line in profile.to_string().lines() {
            info!("{}", line);
        }
        if !profile.universal {
            warn!("Universal command not supported, fuse and lock access unavailable");
        }

        self.declare(profile.family, profile.flash_size, profile.page_size)?;
        self.command(Command::EnterProgmode)?;

        self.device = Some(profile);
        self.state = State::Ready;

        Ok(profile)
    }

    /// Probed profile, failing unless the session is ready for flash access
    pub(crate) fn profile(&self) -> Result<DeviceProfile, Error<E>> {
        self.expect_state(State::Ready)?;
        self.device.ok_or(Error::NoDevice)
    }

    /// Returns the signature (zero when undetermined) and universal support
    fn guess(&mut self) -> Result<(u32, bool), Error<E>> {
        self.declare(Family::Avr, PROBE_AVR.0, PROBE_AVR.1)?;
        self.command(Command::EnterProgmode)?;

        match self.read_signature() {
            Ok(sig) => {
                debug!("AVR signature 0x{:06x}", sig);
                let universal = self.universal_probe(0x30, 0)?;
                return Ok((sig, universal));
            }
            Err(Error::Response { op, status }) => {
                debug!("{} got response {}, trying AT89S", op, status);
            }
            Err(Error::NoSync) => debug!("READ_SIGN lost sync, trying AT89S"),
            Err(e) => return Err(e),
        }

        self.command(Command::LeaveProgmode)?;
        self.declare(Family::At89s, PROBE_AT89S.0, PROBE_AT89S.1)?;
        self.command(Command::EnterProgmode)?;

        if !self.universal_probe(0x28, 0)? {
            return Ok((0, false));
        }

        // Programmers such as ArduinoISP only serve READ_SIGN for AVR parts
        let sig1 = self.universal(0x28, 1, 0, 0)?;
        let sig2 = self.universal(0x28, 2, 0, 0)?;

        let sig = u32::from_be_bytes([0, ATMEL_VENDOR, sig1, sig2]);
        debug!("AT89S signature 0x{:06x}", sig);

        Ok((sig, true))
    }

    /// Ask for the vendor signature byte through the universal command
    fn universal_probe(&mut self, b1: u8, b2: u8) -> Result<bool, Error<E>> {
        match self.universal(b1, b2, 0, 0) {
            Ok(v) => Ok(v == ATMEL_VENDOR),
            Err(Error::Response { status, .. }) => {
                debug!("Universal probe got response {}", status);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// SET_DEVICE with the EEPROM size assumed to be 1/16 of the flash
    fn declare(&mut self, family: Family, flash: usize, page: usize) -> Result<(), Error<E>> {
        self.set_device(family.device_code(), page, flash / 16, flash)
    }
}
