//! Intel HEX files, mapped between records and contiguous images.

use std::io::{self, BufRead, Write};

use ihex::{ReaderError, Record, WriterError};

use crate::image::FlashImage;

/// Data bytes per record when encoding
const RECORD_LEN: usize = 16;

/// Largest address span accepted when decoding
pub const MAX_SPAN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HexError {
    #[error("line {line}: {source}")]
    Record { line: usize, source: ReaderError },

    #[error("missing end of file record")]
    MissingEof,

    #[error("data spans 0x{base:x}..0x{end:x}, over {} bytes", MAX_SPAN)]
    Span { base: usize, end: usize },

    #[error(transparent)]
    Encode(#[from] WriterError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Decoded file contents
#[derive(Clone, PartialEq, Debug)]
pub struct HexFile {
    pub image: FlashImage,
    /// Start address from a type 03 or 05 record
    pub entry: Option<u32>,
}

/// Decode an Intel HEX stream into one contiguous image.
///
/// Gaps between data records are filled with `fill`. An empty data record
/// still marks its address as part of the image.
pub fn decode<R: BufRead>(r: R, fill: u8) -> Result<HexFile, HexError> {
    let mut chunks: Vec<(usize, Vec<u8>)> = Vec::new();
    let mut upper = 0usize;
    let mut entry = None;
    let mut eof = false;

    for (i, line) in r.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record = Record::from_record_string(line)
            .map_err(|source| HexError::Record { line: i + 1, source })?;

        match record {
            Record::Data { offset, value } => chunks.push((upper + offset as usize, value)),
            Record::EndOfFile => {
                eof = true;
                break;
            }
            Record::ExtendedSegmentAddress(s) => upper = (s as usize) << 4,
            Record::ExtendedLinearAddress(u) => upper = (u as usize) << 16,
            Record::StartSegmentAddress { cs, ip } => {
                entry = Some(((cs as u32) << 4) + ip as u32);
            }
            Record::StartLinearAddress(a) => entry = Some(a),
        }
    }

    if !eof {
        return Err(HexError::MissingEof);
    }

    let base = chunks.iter().map(|(a, _)| *a).min().unwrap_or(0);
    let end = chunks
        .iter()
        .map(|(a, d)| a + d.len())
        .max()
        .unwrap_or(0);

    if end - base > MAX_SPAN {
        return Err(HexError::Span { base, end });
    }

    let mut data = vec![fill; end - base];
    for (a, d) in &chunks {
        data[a - base..a - base + d.len()].copy_from_slice(d);
    }

    debug!("Decoded {} bytes at 0x{:x} from {} records", data.len(), base, chunks.len());

    Ok(HexFile {
        image: FlashImage::new(base, data),
        entry,
    })
}

fn put<W: Write>(w: &mut W, record: Record) -> Result<(), HexError> {
    writeln!(w, "{}", record.to_record_string()?)?;
    Ok(())
}

/// Encode an image as Intel HEX, terminated by an end of file record.
///
/// Records made up only of `fill` are skipped, except for the first and
/// last ones so the decoded image spans the same range. An empty image is
/// written as a single empty data record at its base.
pub fn encode<W: Write>(
    mut w: W,
    image: &FlashImage,
    fill: u8,
    start: Option<u32>,
) -> Result<(), HexError> {
    let mut upper = 0usize;
    let mut pos = 0usize;

    loop {
        let addr = image.base + pos;

        if addr >> 16 != upper {
            upper = addr >> 16;
            put(&mut w, Record::ExtendedLinearAddress(upper as u16))?;
        }

        // Records never cross a 64k boundary
        let room = 0x1_0000 - (addr & 0xFFFF);
        let len = RECORD_LEN.min(room).min(image.len() - pos);
        let data = &image.data[pos..pos + len];

        let first = pos == 0;
        let last = pos + len == image.len();
        if first || last || data.iter().any(|b| *b != fill) {
            let record = Record::Data {
                offset: addr as u16,
                value: data.to_vec(),
            };
            put(&mut w, record)?;
        }

        pos += len;
        if last {
            break;
        }
    }

    if let Some(s) = start {
        put(&mut w, Record::StartLinearAddress(s))?;
    }

    put(&mut w, Record::EndOfFile)
}
