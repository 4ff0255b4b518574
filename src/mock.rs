//! Test doubles: a scripted serial port and an STK500v1 target simulator.

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::protocol::*;
use crate::{Options, SerialPort};

#[derive(Clone, PartialEq, Debug)]
pub struct MockError;

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

/// Options with short timeouts so missing responses resolve quickly
pub fn test_options() -> Options {
    Options {
        no_reset: false,
        response_timeout_ms: 3,
        erase_timeout_ms: 3,
        poll_delay_ms: 1,
        init_delay_ms: 0,
        sync_attempts: 0,
    }
}

/// Port replaying canned bytes and recording everything written
pub struct ScriptedPort {
    rx: VecDeque<u8>,
    pub tx: Vec<u8>,
}

impl ScriptedPort {
    pub fn new(rx: &[u8]) -> Self {
        Self {
            rx: rx.iter().copied().collect(),
            tx: Vec::new(),
        }
    }

    /// Bytes not yet consumed by the programmer
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Read<u8> for ScriptedPort {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, MockError> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for ScriptedPort {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), MockError> {
        self.tx.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), MockError> {
        Ok(())
    }
}

impl SerialPort<MockError> for ScriptedPort {
    fn set_rts(&mut self, _level: bool) -> Result<(), MockError> {
        Ok(())
    }
    fn set_dtr(&mut self, _level: bool) -> Result<(), MockError> {
        Ok(())
    }
}

/// Simulated programmer with an attached target.
///
/// Frames are decoded as they are written and the response is queued for
/// the programmer to read back, like ArduinoISP or optiboot would.
pub struct Target {
    pub signature: [u8; 3],
    /// Answers READ_SIGN
    pub native_signature: bool,
    /// Implements UNIVERSAL, otherwise it answers zero like optiboot
    pub universal: bool,
    /// Serves signature and flash the AT89S way
    pub at89s: bool,
    /// Number of frames to drop before answering anything
    pub boot_delay: usize,
    pub flash: Vec<u8>,
    /// Low, high, extended, lock
    pub fuses: [u8; 4],
    pub progmode: bool,
    pub erased: bool,
    /// Every complete frame received, without the end of packet marker
    pub frames: Vec<Vec<u8>>,
    pub lines: Vec<(&'static str, bool)>,
    address: usize,
    pending: Vec<u8>,
    rx: VecDeque<u8>,
}

impl Target {
    /// Universal capable programmer with an AVR part attached
    pub fn new(signature: [u8; 3], flash_size: usize) -> Self {
        Self {
            signature,
            native_signature: true,
            universal: true,
            at89s: false,
            boot_delay: 0,
            flash: vec![0xFF; flash_size],
            fuses: [0xFF, 0xDE, 0xFD, 0x3F],
            progmode: false,
            erased: false,
            frames: Vec::new(),
            lines: Vec::new(),
            address: 0,
            pending: Vec::new(),
            rx: VecDeque::new(),
        }
    }

    /// ArduinoISP with an ATmega328P attached
    pub fn atmega328p() -> Self {
        Self::new([0x1E, 0x95, 0x0F], 32 * 1024)
    }

    /// Optiboot on an ATmega328P, no universal command
    pub fn optiboot() -> Self {
        Self {
            universal: false,
            ..Self::atmega328p()
        }
    }

    /// ATmega2560 behind a bootloader with universal support
    pub fn atmega2560() -> Self {
        Self::new([0x1E, 0x98, 0x01], 256 * 1024)
    }

    /// AT89S52 behind a programmer that only knows AVR READ_SIGN
    pub fn at89s52() -> Self {
        Self {
            native_signature: false,
            at89s: true,
            fuses: [0, 0, 0, 0xF3],
            ..Self::new([0x1E, 0x52, 0x06], 8 * 1024)
        }
    }

    /// AT89S8253, the 64 byte page sub-family
    pub fn at89s8253() -> Self {
        Self {
            native_signature: false,
            at89s: true,
            ..Self::new([0x1E, 0x73, 0x25], 12 * 1024)
        }
    }

    /// Programmer with nothing attached
    pub fn absent() -> Self {
        Self::new([0, 0, 0], 0)
    }

    /// Number of frames received with the given opcode
    pub fn frames_of(&self, opcode: u8) -> usize {
        self.frames.iter().filter(|f| f[0] == opcode).count()
    }

    /// Frames that change target memory
    pub fn mutations(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| match f[0] {
                b'R' | b'd' => true,
                b'V' => f[1] == 0xAC || f[1] == 0x40,
                _ => false,
            })
            .count()
    }

    /// Expected frame length, excluding the end of packet marker
    fn frame_len(&self) -> Option<usize> {
        let len = match self.pending[0] {
            b'B' => 21,
            b'U' => 3,
            b'V' => 5,
            b't' => 4,
            b'd' => {
                if self.pending.len() < 3 {
                    return None;
                }
                4 + u16::from_be_bytes([self.pending[1], self.pending[2]]) as usize
            }
            _ => 1,
        };
        Some(len)
    }

    fn respond(&mut self, payload: &[u8]) {
        self.rx.push_back(STK_INSYNC);
        self.rx.extend(payload.iter());
        self.rx.push_back(STK_OK);
    }

    fn handle(&mut self, frame: Vec<u8>) {
        self.frames.push(frame.clone());

        if self.boot_delay > 0 {
            self.boot_delay -= 1;
            return;
        }

        match frame[0] {
            b'0' | b'B' => self.respond(&[]),
            b'P' => {
                self.progmode = true;
                self.respond(&[]);
            }
            b'Q' => {
                self.progmode = false;
                self.respond(&[]);
            }
            b'R' => {
                self.erase();
                self.respond(&[]);
            }
            b'U' => {
                self.address = u16::from_le_bytes([frame[1], frame[2]]) as usize * 2;
                self.respond(&[]);
            }
            b't' => {
                let len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
                let data = self.flash[self.address..self.address + len].to_vec();
                self.respond(&data);
            }
            b'd' => {
                let a = self.address;
                let data = &frame[4..];
                self.flash[a..a + data.len()].copy_from_slice(data);
                self.respond(&[]);
            }
            b'u' if self.native_signature => {
                let sig = self.signature;
                self.respond(&sig);
            }
            b'V' => {
                let v = if self.universal {
                    self.universal(frame[1], frame[2], frame[3], frame[4])
                } else {
                    0
                };
                self.respond(&[v]);
            }
            _ => self.rx.push_back(STK_UNKNOWN),
        }
    }

    fn erase(&mut self) {
        self.flash.iter_mut().for_each(|b| *b = 0xFF);
        self.erased = true;
    }

    fn universal(&mut self, b1: u8, b2: u8, b3: u8, b4: u8) -> u8 {
        let addr = u16::from_be_bytes([b2, b3]) as usize;

        match (b1, b2) {
            (0x30, 0) if !self.at89s => self.signature[b3 as usize % 3],
            (0x28, n) if self.at89s => self.signature[n as usize % 3],
            (0x20, _) if self.at89s => self.flash[addr],
            (0x40, _) if self.at89s => {
                self.flash[addr] = b4;
                b4
            }
            (0x24, _) if self.at89s => self.fuses[3],
            (0x50, 0) => self.fuses[0],
            (0x58, 8) => self.fuses[1],
            (0x50, 8) => self.fuses[2],
            (0x58, 0) => self.fuses[3],
            (0xAC, 0x80) => {
                self.erase();
                0
            }
            (0xAC, 0xA0) => self.set_fuse(0, b4),
            (0xAC, 0xA8) => self.set_fuse(1, b4),
            (0xAC, 0xA4) => self.set_fuse(2, b4),
            (0xAC, 0xE0) => self.set_fuse(3, b4),
            _ => 0,
        }
    }

    fn set_fuse(&mut self, i: usize, v: u8) -> u8 {
        self.fuses[i] = v;
        v
    }
}

impl Read<u8> for Target {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, MockError> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for Target {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), MockError> {
        self.pending.push(word);

        if let Some(len) = self.frame_len() {
            if self.pending.len() == len + 1 {
                let mut frame = core::mem::take(&mut self.pending);
                match frame.pop() {
                    Some(CRC_EOP) => self.handle(frame),
                    _ => self.rx.push_back(STK_NOSYNC),
                }
            }
        }

        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), MockError> {
        Ok(())
    }
}

impl SerialPort<MockError> for Target {
    fn set_rts(&mut self, level: bool) -> Result<(), MockError> {
        self.lines.push(("rts", level));
        Ok(())
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), MockError> {
        self.lines.push(("dtr", level));
        Ok(())
    }
}
