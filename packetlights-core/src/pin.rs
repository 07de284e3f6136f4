//! Pin driver: logical LED index → physical GPIO line and polarity
//!
//! The driver owns the LED bank state. Every write goes through the bank
//! lock, so a frame is always applied as a whole and never interleaved with
//! another frame.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use derive_more::{Display, Error};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::controller::CancelToken;

/// Banks up to this size keep their frames inline (no heap allocation)
pub const MAX_INLINE_PINS: usize = 16;

/// One on/off value per configured pin; `true` means the LED emits light.
pub type Frame = SmallVec<[bool; MAX_INLINE_PINS]>;

/// Physical signal level on a GPIO line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Level {
    Low = 0,
    High = 1,
}

impl Level {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Which physical level lights the LED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    #[default]
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    /// Physical level that produces the requested light state
    #[must_use]
    pub const fn level(self, on: bool) -> Level {
        match (self, on) {
            (Self::ActiveHigh, true) | (Self::ActiveLow, false) => Level::High,
            (Self::ActiveHigh, false) | (Self::ActiveLow, true) => Level::Low,
        }
    }
}

/// A configured LED output. Its logical index is its position in the bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    /// BCM line number
    pub line: u8,
    #[serde(default)]
    pub polarity: Polarity,
}

impl Pin {
    #[must_use]
    pub const fn active_high(line: u8) -> Self {
        Self {
            line,
            polarity: Polarity::ActiveHigh,
        }
    }

    #[must_use]
    pub const fn active_low(line: u8) -> Self {
        Self {
            line,
            polarity: Polarity::ActiveLow,
        }
    }
}

/// Errors reported by an [`OutputBackend`]
#[derive(Debug, Display, Error)]
pub enum BackendError {
    /// The backend refused to operate on the line (reserved, bad GPIO, ...)
    #[display("GPIO {line} refused: {reason}")]
    Refused { line: u8, reason: String },
    /// Transport failure talking to the GPIO daemon
    #[display("GPIO backend I/O error: {_0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Hardware seam: something that can switch GPIO lines
pub trait OutputBackend: Send + Sync {
    /// Put `line` into output mode
    fn set_output(&self, line: u8) -> Result<(), BackendError>;

    /// Drive `line` to `level`
    fn write(&self, line: u8, level: Level) -> Result<(), BackendError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    reserved: Vec<u8>,
    outputs: Vec<u8>,
    levels: BTreeMap<u8, Level>,
    write_count: usize,
}

/// In-memory backend: records levels and counts writes instead of touching hardware.
///
/// Used by the tests and by the server's `--dry-run` mode.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that refuses to configure the given lines
    #[must_use]
    pub fn with_reserved(lines: &[u8]) -> Self {
        let backend = Self::default();
        backend.lock().reserved = lines.to_vec();
        backend
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last level written to `line`, if any
    #[must_use]
    pub fn level(&self, line: u8) -> Option<Level> {
        self.lock().levels.get(&line).copied()
    }

    #[must_use]
    pub fn is_output(&self, line: u8) -> bool {
        self.lock().outputs.contains(&line)
    }

    /// Total writes since creation
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.lock().write_count
    }
}

impl OutputBackend for MemoryBackend {
    fn set_output(&self, line: u8) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.reserved.contains(&line) {
            return Err(BackendError::Refused {
                line,
                reason: "reserved".to_string(),
            });
        }
        if !state.outputs.contains(&line) {
            state.outputs.push(line);
        }
        Ok(())
    }

    fn write(&self, line: u8, level: Level) -> Result<(), BackendError> {
        let mut state = self.lock();
        if !state.outputs.contains(&line) {
            return Err(BackendError::Refused {
                line,
                reason: "not an output".to_string(),
            });
        }
        state.levels.insert(line, level);
        state.write_count += 1;
        Ok(())
    }
}

/// Drives the LED bank through an [`OutputBackend`]
pub struct PinDriver {
    backend: Arc<dyn OutputBackend>,
    pins: Vec<Pin>,
    /// Lines that accepted output mode; the others are never written
    claimed: Vec<bool>,
    bank: Mutex<Frame>,
}

impl std::fmt::Debug for PinDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinDriver")
            .field("pins", &self.pins)
            .field("claimed", &self.claimed)
            .finish_non_exhaustive()
    }
}

impl PinDriver {
    /// Claim every pin as an output and blank the bank.
    ///
    /// A line that cannot be claimed is logged and skipped; it stays dark for
    /// the lifetime of the driver.
    pub fn configure(backend: Arc<dyn OutputBackend>, pins: Vec<Pin>) -> Self {
        let claimed: Vec<bool> = pins
            .iter()
            .map(|pin| match backend.set_output(pin.line) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Cannot control GPIO {} (reserved?): {e}", pin.line);
                    false
                }
            })
            .collect();

        let usable = claimed.iter().filter(|c| **c).count();
        info!("Pin driver configured: {usable}/{} lines usable", pins.len());

        let driver = Self {
            backend,
            bank: Mutex::new(smallvec::smallvec![false; pins.len()]),
            pins,
            claimed,
        };
        driver.all_off();
        driver
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    #[must_use]
    pub fn pins(&self) -> &[Pin] {
        &self.pins
    }

    #[must_use]
    pub fn is_claimed(&self, index: usize) -> bool {
        self.claimed.get(index).copied().unwrap_or(false)
    }

    /// Logical index of the pin wired to `line`
    #[must_use]
    pub fn index_of_line(&self, line: u8) -> Option<usize> {
        self.pins.iter().position(|pin| pin.line == line)
    }

    // A task that panicked mid-write must not wedge the bank
    fn lock_bank(&self) -> MutexGuard<'_, Frame> {
        self.bank.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drive(&self, index: usize, on: bool) {
        if !self.claimed[index] {
            return;
        }
        let pin = self.pins[index];
        if let Err(e) = self.backend.write(pin.line, pin.polarity.level(on)) {
            debug!("GPIO {} write failed: {e}", pin.line);
        }
    }

    /// Switch one LED. Returns `false` if `index` is outside the bank.
    pub fn set(&self, index: usize, on: bool) -> bool {
        let mut bank = self.lock_bank();
        if index >= bank.len() {
            return false;
        }
        self.drive(index, on);
        bank[index] = on && self.claimed[index];
        true
    }

    /// Drive every pin to its "off" level
    pub fn all_off(&self) {
        let mut bank = self.lock_bank();
        for (index, slot) in bank.iter_mut().enumerate() {
            self.drive(index, false);
            *slot = false;
        }
    }

    /// Apply a whole frame. Missing entries count as off.
    pub fn apply(&self, frame: &[bool]) {
        let mut bank = self.lock_bank();
        self.apply_locked(&mut bank, frame);
    }

    fn apply_locked(&self, bank: &mut Frame, frame: &[bool]) {
        for (index, slot) in bank.iter_mut().enumerate() {
            let on = frame.get(index).copied().unwrap_or(false) && self.claimed[index];
            if *slot != on {
                self.drive(index, on);
                *slot = on;
            }
        }
    }

    /// Apply `frame` only while `token` is live.
    ///
    /// The token is checked under the bank lock, so once the controller has
    /// cancelled a run and blanked the bank, that run cannot write again.
    pub(crate) fn apply_unless_cancelled(&self, frame: &[bool], token: &CancelToken) -> bool {
        let mut bank = self.lock_bank();
        if token.is_cancelled() {
            return false;
        }
        self.apply_locked(&mut bank, frame);
        true
    }

    /// Current logical LED states
    #[must_use]
    pub fn snapshot(&self) -> Frame {
        self.lock_bank().clone()
    }

    /// Current physical levels, derived from the logical state and polarity
    #[must_use]
    pub fn levels(&self) -> Vec<Level> {
        self.lock_bank()
            .iter()
            .zip(&self.pins)
            .map(|(on, pin)| pin.polarity.level(*on))
            .collect()
    }
}
