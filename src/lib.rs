//! AVRISP (STK500v1) serial programmer.
//!
//! Programs AVR and AT89S flash through AVRISP programmers and Arduino-style
//! bootloaders. Based on Atmel AVR061.

use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod device;
pub mod flash;
pub mod fuse;
pub mod hexfile;
pub mod image;
pub mod protocol;
pub mod session;

#[cfg(test)]
mod mock;

pub use device::{DeviceProfile, Family};
pub use flash::Progress;
pub use fuse::Fuses;
pub use image::FlashImage;
pub use session::{Action, EraseMode, Plan, Report};

use protocol::{Command, Memory, Status, CRC_EOP, STK_INSYNC, STK_NOSYNC};

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

/// Session state, advanced by [`Programmer::init`], [`Programmer::probe`]
/// and [`Programmer::finish`]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Disconnected,
    Syncing,
    Synced,
    Probing,
    Ready,
    Closed,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial port error: {0:?}")]
    Serial(SerialError),

    #[error("lost synchronization with the programmer")]
    NoSync,

    #[error("{op} got response {status}")]
    Response { op: String, status: Status },

    #[error("no device detected")]
    NoDevice,

    #[error("{0} not supported by this device")]
    Unsupported(&'static str),

    #[error("image ends at 0x{end:x}, beyond flash size 0x{flash_size:x}")]
    Capacity { end: usize, flash_size: usize },

    #[error("flash range ends at 0x{end:x}, beyond 0x{limit:x} reachable by the protocol")]
    Unreachable { end: usize, limit: usize },

    #[error("synchronization cancelled")]
    SyncCancelled,

    #[error("programmer is {actual:?}, expected {expected:?}")]
    InvalidState { expected: State, actual: State },
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not toggle RTS/DTR on connection, leave programming mode straight after probing
    #[cfg_attr(feature = "structopt", structopt(short = "n", long))]
    pub no_reset: bool,

    /// Timeout to wait for each programmer response byte
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub response_timeout_ms: u32,

    /// Time to wait for a chip erase to complete, applied twice
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub erase_timeout_ms: u32,

    /// Period to poll for programmer responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait after resetting the target
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub init_delay_ms: u32,

    /// Synchronization attempts before giving up, 0 waits forever
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0"))]
    pub sync_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 500,
            erase_timeout_ms: 500,
            poll_delay_ms: 1,
            init_delay_ms: 50,
            sync_attempts: 0,
        }
    }
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    device: Option<DeviceProfile>,
    address: usize,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Disconnected,
            options,
            device: None,
            address: 0,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Profile of the attached device, once probed
    pub fn device(&self) -> Option<&DeviceProfile> {
        self.device.as_ref()
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Execute a whole session: connect, probe, run the plan and leave
    /// programming mode.
    ///
    /// Once the device is synchronized, programming mode is left on a best
    /// effort basis even when a later step fails.
    pub fn run(
        &mut self,
        plan: &Plan,
        progress: &mut dyn Progress,
    ) -> Result<Report, Error<E>> {
        self.init()?;

        let report = match self.probe().and_then(|_| self.execute(plan, progress)) {
            Ok(r) => r,
            Err(e) => {
                error!("Session failed: {}", e);
                if let Err(e) = self.finish() {
                    debug!("Teardown after failure also failed: {}", e);
                }
                return Err(e);
            }
        };

        self.finish()?;

        Ok(report)
    }

    /// Reset the target (unless disabled) and synchronize with the programmer
    pub fn init(&mut self) -> Result<(), Error<E>> {
        if !self.options.no_reset {
            self.reset()?;
        }

        let attempts = self.options.sync_attempts;
        self.sync_with(|n| attempts == 0 || n < attempts)
    }

    /// Pulse the reset lines, RTS is asserted first for nodemcu style circuits
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting device");

        self.port.set_rts(true)?;
        self.port.set_dtr(true)?;
        self.port.set_rts(false)?;
        self.port.set_dtr(false)?;

        self.delay.delay_ms(self.options.init_delay_ms);

        Ok(())
    }

    /// Wait for the programmer to synchronize, for as long as `keep_going`
    /// returns true for the number of attempts made so far
    pub fn sync_with<F>(&mut self, mut keep_going: F) -> Result<(), Error<E>>
    where
        F: FnMut(u32) -> bool,
    {
        info!("Waiting for programmer");

        let mut attempts = 0;
        loop {
            if !keep_going(attempts) {
                warn!("Giving up synchronization after {} attempts", attempts);
                self.state = State::Disconnected;
                return Err(Error::SyncCancelled);
            }
            attempts += 1;

            if self.try_sync()? {
                info!("Programmer synchronized after {} attempts", attempts);
                return Ok(());
            }
        }
    }

    /// Wait for the programmer to synchronize, forever
    pub fn sync(&mut self) -> Result<(), Error<E>> {
        self.sync_with(|_| true)
    }

    /// Single synchronization attempt
    pub fn try_sync(&mut self) -> Result<bool, Error<E>> {
        self.state = State::Syncing;
        self.device = None;

        // Discard stale bytes, doubles as the delay between attempts
        let timeout = self.options.response_timeout_ms;
        if let Some(v) = self.get_byte(timeout)? {
            trace!("Discarded 0x{:02x}", v);
        }

        match self.simple_command(Command::GetSync)? {
            Status::Ok => {
                self.purge()?;
                self.state = State::Synced;
                Ok(true)
            }
            s => {
                debug!("GET_SYNC got response {}", s);
                Ok(false)
            }
        }
    }

    /// Leave programming mode and close the session
    pub fn finish(&mut self) -> Result<(), Error<E>> {
        match self.state {
            State::Disconnected | State::Syncing | State::Closed => (),
            _ => self.command(Command::LeaveProgmode)?,
        }

        self.state = State::Closed;
        Ok(())
    }

    /// Execute one transaction.
    ///
    /// Writes `frame` and `data` followed by the end of packet marker, then
    /// reads the response envelope. Returns the final status byte; when the
    /// first byte is not INSYNC it is returned without reading any payload.
    /// A payload cut short by a timeout results in NOSYNC.
    pub fn transact(
        &mut self,
        frame: &[u8],
        data: &[u8],
        response: &mut [u8],
    ) -> Result<Status, Error<E>> {
        trace!("Command {:02x?} ({} data bytes)", frame, data.len());

        self.put(frame)?;
        self.put(data)?;
        self.put(&[CRC_EOP])?;
        block!(self.port.flush())?;

        let timeout = self.options.response_timeout_ms;

        match self.get_byte(timeout)? {
            Some(STK_INSYNC) => (),
            Some(v) => return Ok(Status::from(v)),
            None => return Ok(Status::NoSync),
        }

        let n = self.get_bytes(response, timeout)?;
        if n != response.len() {
            debug!("Short response, {} of {} bytes", n, response.len());
            return Ok(Status::NoSync);
        }

        Ok(Status::from(self.get_byte(timeout)?.unwrap_or(STK_NOSYNC)))
    }

    /// Issue a command without parameters, returning the raw status
    pub fn simple_command(&mut self, command: Command) -> Result<Status, Error<E>> {
        self.transact(&[command as u8], &[], &mut [])
    }

    /// Issue a command without parameters, failing unless acknowledged
    pub fn command(&mut self, command: Command) -> Result<(), Error<E>> {
        let status = self.simple_command(command)?;
        check(status, || format!("'{}'", command.opcode()))
    }

    /// Declare the device geometry the programmer should assume
    pub fn set_device(
        &mut self,
        device_code: u8,
        page_size: usize,
        eeprom_size: usize,
        flash_size: usize,
    ) -> Result<(), Error<E>> {
        let frame = protocol::set_device_frame(device_code, page_size, eeprom_size, flash_size);
        let status = self.transact(&frame, &[], &mut [])?;
        check(status, || format!("SET_DEVICE 0x{:02x}", device_code))
    }

    /// Load the byte address for the next page command
    pub fn load_address(&mut self, address: usize) -> Result<(), Error<E>> {
        let status = self.transact(&protocol::load_address_frame(address), &[], &mut [])?;
        check(status, || format!("LOAD_ADDRESS 0x{:x}", address))?;

        self.address = address;
        Ok(())
    }

    /// Read `buff.len()` bytes of flash from the loaded address
    pub fn read_page(&mut self, buff: &mut [u8]) -> Result<(), Error<E>> {
        let frame = protocol::page_frame(Command::ReadPage, buff.len(), Memory::Flash);
        let status = self.transact(&frame, &[], buff)?;
        check(status, || format!("READ_PAGE 0x{:x}", self.address))
    }

    /// Program `data` into flash at the loaded address
    pub fn prog_page(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        let frame = protocol::page_frame(Command::ProgPage, data.len(), Memory::Flash);
        let status = self.transact(&frame, data, &mut [])?;
        check(status, || format!("PROG_PAGE 0x{:x}", self.address))
    }

    /// Send a raw four byte instruction to the target
    pub fn universal(&mut self, b1: u8, b2: u8, b3: u8, b4: u8) -> Result<u8, Error<E>> {
        let mut out = [0u8; 1];
        let status = self.transact(&protocol::universal_frame(b1, b2, b3, b4), &[], &mut out)?;
        check(status, || {
            format!("V 0x{:x} 0x{:x} 0x{:x} 0x{:x}", b1, b2, b3, b4)
        })?;

        Ok(out[0])
    }

    /// Read the signature with the native command.
    ///
    /// An all zeros or all ones signature means nothing answered and is
    /// reported as FAILED.
    pub fn read_signature(&mut self) -> Result<u32, Error<E>> {
        let mut sig = [0u8; 3];
        let status = self.transact(&[Command::ReadSign as u8], &[], &mut sig)?;
        check(status, || "READ_SIGN".to_string())?;

        let sig = u32::from_be_bytes([0, sig[0], sig[1], sig[2]]);
        if sig == 0 || sig == 0x00FF_FFFF {
            return Err(Error::Response {
                op: format!("READ_SIGN 0x{:06x}", sig),
                status: Status::Failed,
            });
        }

        Ok(sig)
    }

    fn expect_state(&self, expected: State) -> Result<(), Error<E>> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn put(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        Ok(())
    }

    /// Read one byte, or `None` when nothing arrived within `timeout_ms`
    fn get_byte(&mut self, timeout_ms: u32) -> Result<Option<u8>, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut t = 0;

        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(Some(v)),
            };

            self.delay.delay_ms(poll);
            t += poll;

            if t > timeout_ms {
                return Ok(None);
            }
        }
    }

    /// Fill `buff`, returning the number of bytes read before a timeout
    fn get_bytes(&mut self, buff: &mut [u8], timeout_ms: u32) -> Result<usize, Error<E>> {
        for (i, b) in buff.iter_mut().enumerate() {
            match self.get_byte(timeout_ms)? {
                Some(v) => *b = v,
                None => return Ok(i),
            }
        }
        Ok(buff.len())
    }

    /// Drop any pending input
    fn purge(&mut self) -> Result<(), Error<E>> {
        let mut n = 0;
        loop {
            match self.port.read() {
                Ok(_) => n += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }

        if n > 0 {
            debug!("Purged {} bytes", n);
        }
        Ok(())
    }
}

/// Map a final status to a result, NOSYNC means the link is unusable
fn check<E, F>(status: Status, op: F) -> Result<(), Error<E>>
where
    F: FnOnce() -> String,
{
    match status {
        Status::Ok => Ok(()),
        Status::NoSync => Err(Error::NoSync),
        status => Err(Error::Response { op: op(), status }),
    }
}
