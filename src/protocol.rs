//! STK500v1 wire protocol constants and command framing.
//!
//! Based on Atmel AVR061 (STK500 communication protocol), restricted to the
//! subset spoken by AVRISP programmers and Arduino-style bootloaders.

use core::fmt;

/// End of packet marker, terminates every command
pub const CRC_EOP: u8 = 0x20;

pub const STK_OK: u8 = 0x10;
pub const STK_FAILED: u8 = 0x11;
pub const STK_UNKNOWN: u8 = 0x12;
pub const STK_NODEVICE: u8 = 0x13;
pub const STK_INSYNC: u8 = 0x14;
pub const STK_NOSYNC: u8 = 0x15;

/// Atmel vendor byte, first byte of every valid signature
pub const ATMEL_VENDOR: u8 = 0x1E;

/// Device code announced for AVR parts (ATmega328P)
pub const DEVCODE_AVR: u8 = 0x86;
/// Device code announced for AT89S parts (AT89S52)
pub const DEVCODE_AT89S: u8 = 0xE1;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// Regain synchronization with the programmer
    GetSync = 0x30,

    /// Declare the device parameters the programmer should assume
    SetDevice = 0x42,

    /// Enter programming mode
    EnterProgmode = 0x50,

    /// Leave programming mode, bootloaders usually start the application here
    LeaveProgmode = 0x51,

    /// Erase the whole chip
    ChipErase = 0x52,

    /// Load the word address used by the next page command
    LoadAddress = 0x55,

    /// Send four raw bytes to the target and return the last byte clocked out
    Universal = 0x56,

    /// Program a block of memory starting at the loaded address
    ProgPage = 0x64,

    /// Read a block of memory starting at the loaded address
    ReadPage = 0x74,

    /// Read the three signature bytes
    ReadSign = 0x75,
}

impl Command {
    /// Printable opcode, as it appears on the wire
    pub fn opcode(self) -> char {
        self as u8 as char
    }
}

/// Memory type selector for page commands
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Memory {
    Flash = 0x46,
}

/// Status byte returned by the programmer
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Status {
    Ok,
    Failed,
    Unknown,
    NoDevice,
    InSync,
    NoSync,
    Other(u8),
}

impl From<u8> for Status {
    fn from(v: u8) -> Self {
        match v {
            STK_OK => Status::Ok,
            STK_FAILED => Status::Failed,
            STK_UNKNOWN => Status::Unknown,
            STK_NODEVICE => Status::NoDevice,
            STK_INSYNC => Status::InSync,
            STK_NOSYNC => Status::NoSync,
            other => Status::Other(other),
        }
    }
}

impl From<Status> for u8 {
    fn from(s: Status) -> u8 {
        match s {
            Status::Ok => STK_OK,
            Status::Failed => STK_FAILED,
            Status::Unknown => STK_UNKNOWN,
            Status::NoDevice => STK_NODEVICE,
            Status::InSync => STK_INSYNC,
            Status::NoSync => STK_NOSYNC,
            Status::Other(v) => v,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Failed => write!(f, "FAILED"),
            Status::Unknown => write!(f, "UNKNOWN"),
            Status::NoDevice => write!(f, "NODEVICE"),
            Status::InSync => write!(f, "INSYNC"),
            Status::NoSync => write!(f, "NOSYNC"),
            Status::Other(v) => write!(f, "0x{:02x}", v),
        }
    }
}

/// Length of the SET_DEVICE frame, opcode plus 20 parameter bytes
pub const SET_DEVICE_LEN: usize = 21;

/// Build a SET_DEVICE frame.
///
/// Programming parameters other than the sizes are fixed: parallel mode,
/// polling, self timed, one lock byte, three fuse bytes, 0xFF poll values.
pub fn set_device_frame(
    device_code: u8,
    page_size: usize,
    eeprom_size: usize,
    flash_size: usize,
) -> [u8; SET_DEVICE_LEN] {
    let page = (page_size as u16).to_be_bytes();
    let eeprom = (eeprom_size as u16).to_be_bytes();
    let flash = (flash_size as u32).to_be_bytes();

    [
        Command::SetDevice as u8,
        device_code,
        0, // revision
        0, // progtype
        1, // parmode
        1, // polling
        1, // selftimed
        1, // lockbytes
        3, // fusebytes
        0xFF,
        0xFF,
        0xFF,
        0xFF,
        page[0],
        page[1],
        eeprom[0],
        eeprom[1],
        flash[0],
        flash[1],
        flash[2],
        flash[3],
    ]
}

/// Build a LOAD_ADDRESS frame, flash is addressed in 16-bit words
pub fn load_address_frame(byte_address: usize) -> [u8; 3] {
    let word = ((byte_address >> 1) as u16).to_le_bytes();
    [Command::LoadAddress as u8, word[0], word[1]]
}

/// Build the header of a READ_PAGE or PROG_PAGE frame
pub fn page_frame(command: Command, length: usize, memory: Memory) -> [u8; 4] {
    let len = (length as u16).to_be_bytes();
    [command as u8, len[0], len[1], memory as u8]
}

/// Build a UNIVERSAL frame
pub fn universal_frame(b1: u8, b2: u8, b3: u8, b4: u8) -> [u8; 5] {
    [Command::Universal as u8, b1, b2, b3, b4]
}
