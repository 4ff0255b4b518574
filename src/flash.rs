//! Flash erase, read and write.
//!
//! AVR parts are accessed a page at a time through LOAD_ADDRESS and
//! READ_PAGE / PROG_PAGE. The protocol has no page commands for AT89S parts
//! so those go byte by byte through the universal command, still grouped in
//! pages for progress reporting.

use embedded_hal::blocking::delay::DelayMs;

use crate::device::{DeviceProfile, Family};
use crate::image::{align_down, align_up, FlashImage, ERASED};
use crate::protocol::Command;
use crate::{Error, Programmer, SerialPort};

/// Progress update callbacks
pub trait Progress {
    /// Start an operation of `total` bytes at `addr`
    fn init(&mut self, addr: usize, total: usize);
    /// Bytes completed so far
    fn update(&mut self, current: usize);
    fn finish(&mut self);
}

impl Progress for () {
    fn init(&mut self, _addr: usize, _total: usize) {}
    fn update(&mut self, _current: usize) {}
    fn finish(&mut self) {}
}

/// Fail unless every byte below `end` can be addressed by the protocol
fn check_reachable<E>(dev: &DeviceProfile, end: usize) -> Result<(), Error<E>> {
    let limit = dev.addressable();
    if end > limit {
        return Err(Error::Unreachable { end, limit });
    }
    Ok(())
}

/// Size limit rounded up to whole pages, limits beyond the flash are
/// left as they are
fn page_limit(dev: &DeviceProfile, size: usize) -> usize {
    if size < dev.flash_size {
        align_up(size, dev.page_size)
    } else {
        size
    }
}

/// Resolve the flash range to read.
///
/// The base defaults to zero when missing or outside the flash, and is page
/// aligned otherwise. The size is rounded up to whole pages and clamped to
/// the end of the flash. Ranges the protocol cannot address are rejected.
pub fn read_range<E>(
    dev: &DeviceProfile,
    base: Option<usize>,
    size: Option<usize>,
) -> Result<(usize, usize), Error<E>> {
    let base = match base {
        Some(b) if b < dev.flash_size => align_down(b, dev.page_size),
        _ => 0,
    };

    let avail = dev.flash_size - base;
    let len = match size {
        Some(s) => page_limit(dev, s).min(avail),
        None => avail,
    };

    check_reachable::<E>(dev, base + len)?;

    Ok((base, len))
}

/// Place an image on the device.
///
/// A base inside the flash replaces the image base and `size`, rounded up
/// to whole pages, limits the length. Fails if the result does not fit or
/// cannot be addressed, otherwise the image is extended down to a page
/// boundary with erased bytes.
pub fn place<E>(
    dev: &DeviceProfile,
    image: &FlashImage,
    base: Option<usize>,
    size: Option<usize>,
) -> Result<FlashImage, Error<E>> {
    let mut placed = image.clone();

    if let Some(b) = base.filter(|b| *b < dev.flash_size) {
        placed.base = b;
    }
    if let Some(s) = size {
        placed.truncate(page_limit(dev, s));
    }

    if placed.end() > dev.flash_size {
        return Err(Error::Capacity {
            end: placed.end(),
            flash_size: dev.flash_size,
        });
    }
    check_reachable::<E>(dev, placed.end())?;

    Ok(placed.align_down(dev.page_size, ERASED))
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Erase the whole chip
    pub fn erase(&mut self) -> Result<(), Error<E>> {
        let dev = self.profile()?;

        info!("Erasing chip");

        if dev.universal {
            self.universal(0xAC, 0x80, 0, 0)?;
        } else {
            self.command(Command::ChipErase)?;
        }

        // Erase completion is not acknowledged, AT89S parts need about 500ms
        let timeout = self.options.erase_timeout_ms;
        for _ in 0..2 {
            if let Some(v) = self.get_byte(timeout)? {
                trace!("Discarded 0x{:02x} while erasing", v);
            }
        }

        Ok(())
    }

    /// Read flash, see [`read_range`] for how `base` and `size` apply
    pub fn read_flash(
        &mut self,
        base: Option<usize>,
        size: Option<usize>,
        progress: &mut dyn Progress,
    ) -> Result<FlashImage, Error<E>> {
        let dev = self.profile()?;
        let (base, len) = read_range::<E>(&dev, base, size)?;

        info!("Reading {} bytes of flash at 0x{:04x}", len, base);

        let mut data = vec![0u8; len];
        progress.init(base, len);

        for (i, chunk) in data.chunks_mut(dev.page_size).enumerate() {
            let offset = i * dev.page_size;
            let addr = base + offset;

            match dev.family {
                Family::At89s => {
                    for (j, b) in chunk.iter_mut().enumerate() {
                        *b = self.read_byte(addr + j)?;
                    }
                }
                Family::Avr => {
                    self.load_address(addr)?;
                    self.read_page(chunk)?;
                }
            }

            progress.update(offset + chunk.len());
        }

        progress.finish();

        Ok(FlashImage::new(base, data))
    }

    /// Write an image to flash, see [`place`] for how `base` and `size`
    /// apply.
    ///
    /// Nothing is sent to the device unless the image fits.
    pub fn write_flash(
        &mut self,
        image: &FlashImage,
        base: Option<usize>,
        size: Option<usize>,
        progress: &mut dyn Progress,
    ) -> Result<(), Error<E>> {
        let dev = self.profile()?;
        let placed = place::<E>(&dev, image, base, size)?;

        info!("Writing {} bytes of flash at 0x{:04x}", placed.len(), placed.base);

        progress.init(placed.base, placed.len());

        for (i, chunk) in placed.data.chunks(dev.page_size).enumerate() {
            let offset = i * dev.page_size;
            let addr = placed.base + offset;

            match dev.family {
                Family::At89s => {
                    for (j, b) in chunk.iter().enumerate() {
                        self.write_byte(addr + j, *b)?;
                    }
                }
                Family::Avr => {
                    self.load_address(addr)?;
                    self.prog_page(chunk)?;
                }
            }

            progress.update(offset + chunk.len());
        }

        progress.finish();

        Ok(())
    }

    fn read_byte(&mut self, addr: usize) -> Result<u8, Error<E>> {
        self.universal(0x20, (addr >> 8) as u8, addr as u8, 0)
    }

    fn write_byte(&mut self, addr: usize, value: u8) -> Result<(), Error<E>> {
        self.universal(0x40, (addr >> 8) as u8, addr as u8, value)?;
        Ok(())
    }
}
