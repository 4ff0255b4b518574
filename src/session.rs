//! Session plans and their execution against a probed device.

use embedded_hal::blocking::delay::DelayMs;

use crate::device::DeviceProfile;
use crate::flash::{self, Progress};
use crate::fuse::{self, Fuses};
use crate::image::FlashImage;
use crate::{Error, Programmer, SerialPort};

/// When to erase the chip
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum EraseMode {
    Always,
    Never,
    /// Erase before writing only
    Auto,
}

impl Default for EraseMode {
    fn default() -> Self {
        EraseMode::Auto
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum Action {
    /// Identify the device only
    Probe,
    Read,
    Write(FlashImage),
}

impl Default for Action {
    fn default() -> Self {
        Action::Probe
    }
}

/// Everything a session should do once the device is probed
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Plan {
    pub erase: EraseMode,
    /// Flash address override
    pub base: Option<usize>,
    /// Limit on the bytes read or written
    pub size: Option<usize>,
    /// Fuse and lock bytes to program after the flash operation
    pub fuses: Fuses,
    pub action: Action,
}

impl Plan {
    pub fn needs_erase(&self) -> bool {
        match self.erase {
            EraseMode::Always => true,
            EraseMode::Never => false,
            EraseMode::Auto => matches!(self.action, Action::Write(_)),
        }
    }
}

/// Outcome of a session
#[derive(Clone, PartialEq, Debug)]
pub struct Report {
    pub device: DeviceProfile,
    /// Fuses as read before any change, where readable
    pub fuses: Option<Fuses>,
    /// Flash contents for a read
    pub image: Option<FlashImage>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Check the plan can be carried out on the probed device
    pub fn validate(&self, plan: &Plan) -> Result<(), Error<E>> {
        let dev = self.profile()?;

        if !plan.fuses.is_empty() {
            fuse::check_programmable::<E>(&dev)?;
        }

        if let Action::Write(image) = &plan.action {
            flash::place::<E>(&dev, image, plan.base, plan.size)?;
        }

        Ok(())
    }

    /// Carry out a plan on the probed device.
    ///
    /// The plan is validated first so nothing is changed on the device
    /// unless every step is possible.
    pub fn execute(&mut self, plan: &Plan, progress: &mut dyn Progress) -> Result<Report, Error<E>> {
        self.validate(plan)?;
        let device = self.profile()?;

        let fuses = if device.universal {
            let f = self.read_fuses()?;
            info!("{}", f);
            Some(f)
        } else {
            None
        };

        if plan.needs_erase() {
            self.erase()?;
        }

        let image = match &plan.action {
            Action::Probe => None,
            Action::Read => Some(self.read_flash(plan.base, plan.size, progress)?),
            Action::Write(image) => {
                self.write_flash(image, plan.base, plan.size, progress)?;
                None
            }
        };

        if !plan.fuses.is_empty() {
            self.program_fuses(&plan.fuses)?;
        }

        Ok(Report {
            device,
            fuses,
            image,
        })
    }
}
