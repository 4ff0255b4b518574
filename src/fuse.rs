//! Fuse and lock bytes.

use core::fmt;

use embedded_hal::blocking::delay::DelayMs;

use crate::device::{DeviceProfile, Family};
use crate::{Error, Programmer, SerialPort};

/// AT89S lock byte read
const AT89S_READ_LOCK: [u8; 4] = [0x24, 0, 0, 0];

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum FuseKind {
    Low = 0,
    High = 1,
    Extended = 2,
    Lock = 3,
}

impl FuseKind {
    pub const ALL: [FuseKind; 4] = [
        FuseKind::Low,
        FuseKind::High,
        FuseKind::Extended,
        FuseKind::Lock,
    ];

    /// Bit of this byte in a fuse mask
    pub fn bit(self) -> u8 {
        1 << self as u8
    }

    /// AVR serial programming instruction reading this byte
    fn read_instruction(self) -> [u8; 4] {
        match self {
            FuseKind::Low => [0x50, 0x00, 0, 0],
            FuseKind::High => [0x58, 0x08, 0, 0],
            FuseKind::Extended => [0x50, 0x08, 0, 0],
            FuseKind::Lock => [0x58, 0x00, 0, 0],
        }
    }

    /// AVR serial programming instruction writing `value` to this byte
    fn write_instruction(self, value: u8) -> [u8; 4] {
        let op = match self {
            FuseKind::Low => 0xA0,
            FuseKind::High => 0xA8,
            FuseKind::Extended => 0xA4,
            FuseKind::Lock => 0xE0,
        };
        [0xAC, op, 0, value]
    }
}

/// Fuse and lock byte values, `None` where unknown or not to be changed
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct Fuses {
    pub low: Option<u8>,
    pub high: Option<u8>,
    pub extended: Option<u8>,
    pub lock: Option<u8>,
}

impl Fuses {
    /// Build from a mask of [`FuseKind::bit`] and values in kind order
    pub fn from_mask(mask: u8, values: [u8; 4]) -> Self {
        let mut f = Self::default();
        for kind in FuseKind::ALL.iter() {
            if mask & kind.bit() != 0 {
                f.set(*kind, values[*kind as usize]);
            }
        }
        f
    }

    pub fn mask(&self) -> u8 {
        FuseKind::ALL
            .iter()
            .filter(|k| self.get(**k).is_some())
            .fold(0, |m, k| m | k.bit())
    }

    pub fn is_empty(&self) -> bool {
        self.mask() == 0
    }

    pub fn get(&self, kind: FuseKind) -> Option<u8> {
        match kind {
            FuseKind::Low => self.low,
            FuseKind::High => self.high,
            FuseKind::Extended => self.extended,
            FuseKind::Lock => self.lock,
        }
    }

    pub fn set(&mut self, kind: FuseKind, value: u8) {
        let v = Some(value);
        match kind {
            FuseKind::Low => self.low = v,
            FuseKind::High => self.high = v,
            FuseKind::Extended => self.extended = v,
            FuseKind::Lock => self.lock = v,
        }
    }
}

impl fmt::Display for Fuses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<u8>| v.map(|v| format!("{:x}", v)).unwrap_or_else(|| "-".into());

        if self.low.is_some() || self.high.is_some() || self.extended.is_some() {
            write!(
                f,
                "Fuse={}:{}:{}",
                show(self.low),
                show(self.high),
                show(self.extended)
            )?;
            if self.lock.is_some() {
                write!(f, " ")?;
            }
        }
        if self.lock.is_some() {
            write!(f, "Lock={}", show(self.lock))?;
        }
        Ok(())
    }
}

/// Check that fuses can be programmed on this device
pub fn check_programmable<E>(dev: &DeviceProfile) -> Result<(), Error<E>> {
    if dev.supports_fuses() {
        Ok(())
    } else if !dev.universal {
        Err(Error::Unsupported("fuse programming without universal command"))
    } else {
        Err(Error::Unsupported("AT89S fuse programming"))
    }
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Read the fuse and lock bytes the device exposes.
    ///
    /// AT89S parts only have a lock byte.
    pub fn read_fuses(&mut self) -> Result<Fuses, Error<E>> {
        let dev = self.profile()?;
        if !dev.universal {
            return Err(Error::Unsupported("fuse access without universal command"));
        }

        let mut fuses = Fuses::default();
        match dev.family {
            Family::At89s => {
                let [b1, b2, b3, b4] = AT89S_READ_LOCK;
                fuses.lock = Some(self.universal(b1, b2, b3, b4)?);
            }
            Family::Avr => {
                for kind in FuseKind::ALL.iter() {
                    let [b1, b2, b3, b4] = kind.read_instruction();
                    let v = self.universal(b1, b2, b3, b4)?;
                    fuses.set(*kind, v);
                }
            }
        }

        debug!("Read fuses {:?}", fuses);
        Ok(fuses)
    }

    /// Write every fuse and lock byte that is set
    pub fn program_fuses(&mut self, fuses: &Fuses) -> Result<(), Error<E>> {
        let dev = self.profile()?;
        check_programmable::<E>(&dev)?;

        info!("Programming fuses: {}", fuses);

        for kind in FuseKind::ALL.iter() {
            if let Some(v) = fuses.get(*kind) {
                let [b1, b2, b3, b4] = kind.write_instruction(v);
                self.universal(b1, b2, b3, b4)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{test_options, NoDelay, Target};

    fn ready(target: Target) -> Programmer<Target, NoDelay, crate::mock::MockError> {
        let mut p = Programmer::new(target, NoDelay, test_options());
        p.init().unwrap();
        p.probe().unwrap();
        p
    }

    #[test]
    fn mask_round_trip() {
        let f = Fuses::from_mask(0b1010, [0x11, 0x22, 0x33, 0x44]);

        assert_eq!(f.low, None);
        assert_eq!(f.high, Some(0x22));
        assert_eq!(f.extended, None);
        assert_eq!(f.lock, Some(0x44));
        assert_eq!(f.mask(), 0b1010);
        assert!(Fuses::default().is_empty());
    }

    #[test]
    fn display() {
        let avr = Fuses {
            low: Some(0xFF),
            high: Some(0xDE),
            extended: Some(0xFD),
            lock: Some(0x3F),
        };
        let at89s = Fuses {
            lock: Some(0xF3),
            ..Fuses::default()
        };

        assert_eq!(avr.to_string(), "Fuse=ff:de:fd Lock=3f");
        assert_eq!(at89s.to_string(), "Lock=f3");
    }

    #[test]
    fn read_avr_fuses() {
        let mut p = ready(Target::atmega328p());

        let f = p.read_fuses().unwrap();

        assert_eq!(f.to_string(), "Fuse=ff:de:fd Lock=3f");
    }

    #[test]
    fn read_at89s_lock() {
        let mut p = ready(Target::at89s52());

        let f = p.read_fuses().unwrap();

        assert_eq!(f.mask(), FuseKind::Lock.bit());
        assert_eq!(f.lock, Some(0xF3));
    }

    #[test]
    fn read_fuses_needs_universal() {
        let mut p = ready(Target::optiboot());

        assert!(matches!(p.read_fuses(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn program_selected_fuses() {
        let mut p = ready(Target::atmega328p());

        let fuses = Fuses {
            high: Some(0xDA),
            lock: Some(0x0F),
            ..Fuses::default()
        };
        p.program_fuses(&fuses).unwrap();

        assert_eq!(p.port().fuses, [0xFF, 0xDA, 0xFD, 0x0F]);
    }

    #[test]
    fn program_fuses_rejected_on_at89s() {
        let mut p = ready(Target::at89s52());
        let before = p.port().mutations();

        let fuses = Fuses {
            low: Some(0xE2),
            ..Fuses::default()
        };

        assert!(matches!(p.program_fuses(&fuses), Err(Error::Unsupported(_))));
        assert_eq!(p.port().mutations(), before);
    }
}
