//! pigpiod socket protocol for packetlights
//!
//! The pigpio daemon listens on TCP port 8888 and speaks fixed-size binary
//! frames. This crate provides the frame codec, a small blocking client and
//! [`SimulatedGpio`], an in-process model of the daemon used by the mock
//! server and by tests.
//!
//! # Frame Layout
//!
//! Every request and every response is 16 bytes, all fields little-endian:
//!
//! | Offset | Size | Request | Response |
//! |--------|------|---------|----------|
//! | 0  | 4 | `cmd` (u32) | `cmd` echoed |
//! | 4  | 4 | `p1` (u32)  | `p1` echoed  |
//! | 8  | 4 | `p2` (u32)  | `p2` echoed  |
//! | 12 | 4 | `p3` (u32, extension length, always 0 here) | `res` (i32) |
//!
//! A negative `res` is a daemon error code, see [`error_name`].

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use deku::prelude::*;
use derive_more::{Display, Error};
use log::{debug, info};

/// Default pigpiod TCP port
pub const DEFAULT_PORT: u16 = 8888;

/// Size of every request and response frame
pub const FRAME_SIZE: usize = 16;

/// Highest GPIO number on the BCM2835 family
pub const MAX_GPIO: u32 = 53;

/// Highest GPIO a user may write
pub const MAX_USER_GPIO: u32 = 31;

pub const MODE_INPUT: u32 = 0;
pub const MODE_OUTPUT: u32 = 1;
/// Highest valid mode (ALT3)
const MAX_MODE: u32 = 7;

pub const PI_BAD_USER_GPIO: i32 = -2;
pub const PI_BAD_GPIO: i32 = -3;
pub const PI_BAD_MODE: i32 = -4;
pub const PI_BAD_LEVEL: i32 = -5;
pub const PI_NOT_PERMITTED: i32 = -41;
pub const PI_UNKNOWN_COMMAND: i32 = -88;

/// Symbolic name of a pigpiod error code
#[must_use]
pub fn error_name(code: i32) -> &'static str {
    match code {
        PI_BAD_USER_GPIO => "PI_BAD_USER_GPIO",
        PI_BAD_GPIO => "PI_BAD_GPIO",
        PI_BAD_MODE => "PI_BAD_MODE",
        PI_BAD_LEVEL => "PI_BAD_LEVEL",
        PI_NOT_PERMITTED => "PI_NOT_PERMITTED",
        PI_UNKNOWN_COMMAND => "PI_UNKNOWN_COMMAND",
        _ => "PI_UNKNOWN_ERROR",
    }
}

/// The subset of pigpiod commands packetlights uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Set GPIO mode (`MODES`)
    SetMode = 0,
    /// Get GPIO mode (`MODEG`)
    GetMode = 1,
    /// Read GPIO level (`READ`)
    Read = 3,
    /// Write GPIO level (`WRITE`)
    Write = 4,
    /// Hardware revision (`HWVER`)
    HardwareRevision = 17,
}

impl Command {
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::SetMode),
            1 => Some(Self::GetMode),
            3 => Some(Self::Read),
            4 => Some(Self::Write),
            17 => Some(Self::HardwareRevision),
            _ => None,
        }
    }

    /// Name used by the pigpio documentation
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::SetMode => "MODES",
            Self::GetMode => "MODEG",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::HardwareRevision => "HWVER",
        }
    }
}

/// Errors from the codec and the client
#[derive(Debug, Display, Error)]
pub enum PigpioError {
    #[display("pigpiod I/O error: {_0}")]
    Io(std::io::Error),
    #[display("malformed pigpiod frame: {reason}")]
    Frame { reason: String },
    #[display("pigpiod {command} failed: {code} ({})", error_name(*code))]
    Daemon { command: &'static str, code: i32 },
    #[display("pigpiod answered command {got}, expected {expected}")]
    Mismatch { expected: u32, got: u32 },
}

impl From<std::io::Error> for PigpioError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<DekuError> for PigpioError {
    fn from(e: DekuError) -> Self {
        Self::Frame {
            reason: e.to_string(),
        }
    }
}

/// Request frame sent to the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Request {
    pub cmd: u32,
    pub p1: u32,
    pub p2: u32,
    /// Length of trailing extension data; none of our commands send any
    pub p3: u32,
}

impl Request {
    #[must_use]
    pub const fn new(command: Command, p1: u32, p2: u32) -> Self {
        Self {
            cmd: command as u32,
            p1,
            p2,
            p3: 0,
        }
    }

    #[must_use]
    pub const fn set_mode(gpio: u8, mode: u32) -> Self {
        Self::new(Command::SetMode, gpio as u32, mode)
    }

    #[must_use]
    pub const fn get_mode(gpio: u8) -> Self {
        Self::new(Command::GetMode, gpio as u32, 0)
    }

    #[must_use]
    pub const fn read(gpio: u8) -> Self {
        Self::new(Command::Read, gpio as u32, 0)
    }

    #[must_use]
    pub const fn write(gpio: u8, high: bool) -> Self {
        Self::new(Command::Write, gpio as u32, high as u32)
    }

    #[must_use]
    pub const fn hardware_revision() -> Self {
        Self::new(Command::HardwareRevision, 0, 0)
    }

    #[must_use]
    pub fn command(&self) -> Option<Command> {
        Command::from_u32(self.cmd)
    }

    /// Human-readable command name for logs and errors
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.command().map_or("UNKNOWN", Command::label)
    }

    /// Encode to the 16-byte wire format
    ///
    /// # Errors
    ///
    /// Returns [`PigpioError::Frame`] if the codec fails.
    pub fn encode(&self) -> Result<[u8; FRAME_SIZE], PigpioError> {
        to_frame(&self.to_bytes()?)
    }

    /// Decode from the 16-byte wire format
    ///
    /// # Errors
    ///
    /// Returns [`PigpioError::Frame`] if `bytes` is not a whole frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, PigpioError> {
        check_len(bytes)?;
        let (_, request) = Self::from_bytes((bytes, 0))?;
        Ok(request)
    }
}

/// Response frame sent by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Response {
    pub cmd: u32,
    pub p1: u32,
    pub p2: u32,
    pub res: i32,
}

impl Response {
    /// Response echoing `request` with result `res`
    #[must_use]
    pub const fn for_request(request: &Request, res: i32) -> Self {
        Self {
            cmd: request.cmd,
            p1: request.p1,
            p2: request.p2,
            res,
        }
    }

    /// # Errors
    ///
    /// Returns [`PigpioError::Frame`] if the codec fails.
    pub fn encode(&self) -> Result<[u8; FRAME_SIZE], PigpioError> {
        to_frame(&self.to_bytes()?)
    }

    /// # Errors
    ///
    /// Returns [`PigpioError::Frame`] if `bytes` is not a whole frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, PigpioError> {
        check_len(bytes)?;
        let (_, response) = Self::from_bytes((bytes, 0))?;
        Ok(response)
    }

    /// Non-negative result as `Ok`, daemon error code as `Err`
    ///
    /// # Errors
    ///
    /// Returns [`PigpioError::Daemon`] when `res` is negative.
    pub fn into_result(self) -> Result<u32, PigpioError> {
        u32::try_from(self.res).map_err(|_| PigpioError::Daemon {
            command: Command::from_u32(self.cmd).map_or("UNKNOWN", Command::label),
            code: self.res,
        })
    }
}

fn check_len(bytes: &[u8]) -> Result<(), PigpioError> {
    if bytes.len() == FRAME_SIZE {
        Ok(())
    } else {
        Err(PigpioError::Frame {
            reason: format!("expected {FRAME_SIZE} bytes, got {}", bytes.len()),
        })
    }
}

fn to_frame(bytes: &[u8]) -> Result<[u8; FRAME_SIZE], PigpioError> {
    <[u8; FRAME_SIZE]>::try_from(bytes).map_err(|_| PigpioError::Frame {
        reason: format!("encoded {} bytes, expected {FRAME_SIZE}", bytes.len()),
    })
}

/// Blocking connection to a pigpio daemon
#[derive(Debug)]
pub struct PigpioClient {
    stream: TcpStream,
    peer: SocketAddr,
}

impl PigpioClient {
    /// Connect to `addr` (`host:port`), trying every resolved address
    ///
    /// `timeout` bounds the connect and every later read/write.
    ///
    /// # Errors
    ///
    /// Returns [`PigpioError::Io`] if no address accepts the connection.
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, PigpioError> {
        let mut last_err = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    info!("Connected to pigpiod at {candidate}");
                    return Ok(Self {
                        stream,
                        peer: candidate,
                    });
                }
                Err(e) => {
                    debug!("pigpiod connect to {candidate} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(PigpioError::Io(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("{addr} did not resolve"),
            )
        })))
    }

    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one request and wait for its response
    ///
    /// # Errors
    ///
    /// I/O and codec failures, a response for a different command, or a
    /// negative daemon result.
    pub fn execute(&mut self, request: &Request) -> Result<u32, PigpioError> {
        self.stream.write_all(&request.encode()?)?;
        let mut buf = [0u8; FRAME_SIZE];
        self.stream.read_exact(&mut buf)?;
        let response = Response::decode(&buf)?;
        if response.cmd != request.cmd {
            return Err(PigpioError::Mismatch {
                expected: request.cmd,
                got: response.cmd,
            });
        }
        response.into_result()
    }

    /// # Errors
    ///
    /// See [`Self::execute`].
    pub fn set_mode(&mut self, gpio: u8, mode: u32) -> Result<(), PigpioError> {
        self.execute(&Request::set_mode(gpio, mode)).map(|_| ())
    }

    /// # Errors
    ///
    /// See [`Self::execute`].
    pub fn get_mode(&mut self, gpio: u8) -> Result<u32, PigpioError> {
        self.execute(&Request::get_mode(gpio))
    }

    /// # Errors
    ///
    /// See [`Self::execute`].
    pub fn read(&mut self, gpio: u8) -> Result<bool, PigpioError> {
        self.execute(&Request::read(gpio)).map(|level| level != 0)
    }

    /// # Errors
    ///
    /// See [`Self::execute`].
    pub fn write(&mut self, gpio: u8, high: bool) -> Result<(), PigpioError> {
        self.execute(&Request::write(gpio, high)).map(|_| ())
    }

    /// # Errors
    ///
    /// See [`Self::execute`].
    pub fn hardware_revision(&mut self) -> Result<u32, PigpioError> {
        self.execute(&Request::hardware_revision())
    }
}

const GPIO_COUNT: usize = MAX_GPIO as usize + 1;

/// In-process model of the daemon's GPIO bank
#[derive(Debug, Clone)]
pub struct SimulatedGpio {
    modes: [u32; GPIO_COUNT],
    levels: [bool; GPIO_COUNT],
    /// Lines the daemon refuses to touch (e.g. claimed by the UART)
    reserved: Vec<u8>,
    revision: u32,
}

impl Default for SimulatedGpio {
    fn default() -> Self {
        Self {
            modes: [MODE_INPUT; GPIO_COUNT],
            levels: [false; GPIO_COUNT],
            reserved: Vec::new(),
            // Pi 3 Model B
            revision: 0x00a0_2082,
        }
    }
}

impl SimulatedGpio {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_reserved(lines: &[u8]) -> Self {
        Self {
            reserved: lines.to_vec(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn mode(&self, gpio: u8) -> Option<u32> {
        self.modes.get(usize::from(gpio)).copied()
    }

    #[must_use]
    pub fn level(&self, gpio: u8) -> Option<bool> {
        self.levels.get(usize::from(gpio)).copied()
    }

    fn is_reserved(&self, gpio: u32) -> bool {
        u8::try_from(gpio).is_ok_and(|g| self.reserved.contains(&g))
    }

    /// Apply one request and build the daemon's response
    pub fn handle(&mut self, request: &Request) -> Response {
        let res = match request.command() {
            Some(command) => self.apply(command, request.p1, request.p2),
            None => PI_UNKNOWN_COMMAND,
        };
        Response::for_request(request, res)
    }

    #[allow(clippy::cast_possible_truncation)] // gpio checked against MAX_GPIO
    fn apply(&mut self, command: Command, gpio: u32, arg: u32) -> i32 {
        match command {
            Command::HardwareRevision => i32::try_from(self.revision).unwrap_or(i32::MAX),
            _ if gpio > MAX_GPIO => PI_BAD_GPIO,
            Command::SetMode => {
                if arg > MAX_MODE {
                    PI_BAD_MODE
                } else if self.is_reserved(gpio) {
                    PI_NOT_PERMITTED
                } else {
                    self.modes[gpio as usize] = arg;
                    0
                }
            }
            Command::GetMode => self.modes[gpio as usize] as i32,
            Command::Read => i32::from(self.levels[gpio as usize]),
            Command::Write => {
                if gpio > MAX_USER_GPIO {
                    PI_BAD_USER_GPIO
                } else if arg > 1 {
                    PI_BAD_LEVEL
                } else if self.is_reserved(gpio) {
                    PI_NOT_PERMITTED
                } else {
                    // pigpio switches the line to output on write
                    self.modes[gpio as usize] = MODE_OUTPUT;
                    self.levels[gpio as usize] = arg == 1;
                    0
                }
            }
        }
    }
}

/// Serve one client connection against a shared simulated bank until EOF
///
/// # Errors
///
/// Socket errors other than a clean disconnect.
pub fn serve_connection(mut stream: TcpStream, gpio: &Mutex<SimulatedGpio>) -> Result<(), PigpioError> {
    let mut buf = [0u8; FRAME_SIZE];
    loop {
        match stream.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let request = Request::decode(&buf)?;
        let response = gpio
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handle(&request);
        debug!(
            "{} p1={} p2={} -> {}",
            request.label(),
            request.p1,
            request.p2,
            response.res
        );
        stream.write_all(&response.encode()?)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Arc;

    #[test]
    fn request_layout_is_little_endian() {
        let bytes = Request::write(17, true).encode().unwrap();
        assert_eq!(
            bytes,
            [4, 0, 0, 0, 17, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn negative_result_decodes() {
        let mut bytes = [0u8; FRAME_SIZE];
        bytes[0] = 0;
        bytes[4] = 14;
        bytes[8] = 1;
        bytes[12..16].copy_from_slice(&PI_NOT_PERMITTED.to_le_bytes());
        let response = Response::decode(&bytes).unwrap();
        assert_eq!(response.res, -41);
        let err = response.into_result().unwrap_err();
        assert!(matches!(
            err,
            PigpioError::Daemon {
                command: "MODES",
                code: PI_NOT_PERMITTED
            }
        ));
        assert_eq!(err.to_string(), "pigpiod MODES failed: -41 (PI_NOT_PERMITTED)");
    }

    #[test]
    fn short_frame_rejected() {
        assert!(matches!(
            Request::decode(&[0u8; 10]),
            Err(PigpioError::Frame { .. })
        ));
    }

    #[test]
    fn simulated_rejects_reserved_line() {
        let mut gpio = SimulatedGpio::with_reserved(&[14]);
        let res = gpio.handle(&Request::set_mode(14, MODE_OUTPUT)).res;
        assert_eq!(res, PI_NOT_PERMITTED);
        let res = gpio.handle(&Request::write(14, true)).res;
        assert_eq!(res, PI_NOT_PERMITTED);
        assert_eq!(gpio.level(14), Some(false));
    }

    #[test]
    fn simulated_validates_arguments() {
        let mut gpio = SimulatedGpio::new();
        assert_eq!(gpio.handle(&Request::set_mode(60, MODE_OUTPUT)).res, PI_BAD_GPIO);
        assert_eq!(gpio.handle(&Request::set_mode(4, 9)).res, PI_BAD_MODE);
        assert_eq!(gpio.handle(&Request::write(40, true)).res, PI_BAD_USER_GPIO);
        assert_eq!(gpio.handle(&Request::new(Command::Write, 4, 2)).res, PI_BAD_LEVEL);
        let unknown = Request {
            cmd: 99,
            p1: 0,
            p2: 0,
            p3: 0,
        };
        assert_eq!(gpio.handle(&unknown).res, PI_UNKNOWN_COMMAND);
    }

    #[test]
    fn simulated_write_then_read() {
        let mut gpio = SimulatedGpio::new();
        assert_eq!(gpio.handle(&Request::set_mode(27, MODE_OUTPUT)).res, 0);
        assert_eq!(gpio.handle(&Request::write(27, true)).res, 0);
        assert_eq!(gpio.handle(&Request::read(27)).res, 1);
        assert_eq!(gpio.handle(&Request::get_mode(27)).res, 1);
    }

    #[test]
    fn client_talks_to_simulated_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let gpio = Arc::new(Mutex::new(SimulatedGpio::with_reserved(&[14])));
        let server_gpio = gpio.clone();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve_connection(stream, &server_gpio).unwrap();
        });

        let mut client =
            PigpioClient::connect(&addr.to_string(), Duration::from_secs(2)).unwrap();
        client.set_mode(17, MODE_OUTPUT).unwrap();
        client.write(17, true).unwrap();
        assert!(client.read(17).unwrap());
        assert_eq!(client.get_mode(17).unwrap(), MODE_OUTPUT);
        assert_eq!(client.hardware_revision().unwrap(), 0x00a0_2082);
        assert!(matches!(
            client.set_mode(14, MODE_OUTPUT),
            Err(PigpioError::Daemon {
                code: PI_NOT_PERMITTED,
                ..
            })
        ));

        drop(client);
        server.join().unwrap();
        assert_eq!(gpio.lock().unwrap().level(17), Some(true));
    }
}
