//! Flash images and the files they are loaded from or saved to.

use std::io::{BufRead, Read, Write};
use std::path::Path;

use crate::hexfile::{self, HexError};

/// Fill value of erased flash
pub const ERASED: u8 = 0xFF;

/// Round `addr` down to a page boundary, `page` is a power of two
pub fn align_down(addr: usize, page: usize) -> usize {
    addr & !(page - 1)
}

/// Round `len` up to a whole number of pages, `page` is a power of two
pub fn align_up(len: usize, page: usize) -> usize {
    (len + page - 1) & !(page - 1)
}

/// Contiguous memory contents starting at `base`
#[derive(Clone, PartialEq, Debug, Default)]
pub struct FlashImage {
    pub base: usize,
    pub data: Vec<u8>,
}

impl FlashImage {
    pub fn new(base: usize, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// First address past the image
    pub fn end(&self) -> usize {
        self.base + self.data.len()
    }

    /// Limit the image to at most `max` bytes
    pub fn truncate(&mut self, max: usize) {
        self.data.truncate(max);
    }

    /// Move the start down to a page boundary, padding with `fill` so every
    /// byte keeps its address
    pub fn align_down(self, page: usize, fill: u8) -> Self {
        let base = align_down(self.base, page);
        let pad = self.base - base;
        if pad == 0 {
            return self;
        }

        let mut data = vec![fill; pad];
        data.extend_from_slice(&self.data);

        Self { base, data }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum FileFormat {
    /// Intel HEX records
    Hex,
    /// Raw memory contents starting at address zero
    Binary,
}

impl FileFormat {
    /// `.bin` files are raw binary, anything else is treated as Intel HEX
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(e) if e.eq_ignore_ascii_case("bin") => FileFormat::Binary,
            _ => FileFormat::Hex,
        }
    }

    pub fn load<R: BufRead>(self, mut r: R) -> Result<FlashImage, HexError> {
        match self {
            FileFormat::Hex => Ok(hexfile::decode(r, ERASED)?.image),
            FileFormat::Binary => {
                let mut data = Vec::new();
                r.read_to_end(&mut data)?;
                Ok(FlashImage::new(0, data))
            }
        }
    }

    pub fn save<W: Write>(self, mut w: W, image: &FlashImage) -> Result<(), HexError> {
        match self {
            FileFormat::Hex => hexfile::encode(w, image, ERASED, None)?,
            FileFormat::Binary => w.write_all(&image.data)?,
        }
        Ok(())
    }
}
