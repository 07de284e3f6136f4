//! `OutputBackend` on top of a pigpiod socket connection

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{info, warn};
use packetlights_core::{BackendError, Level, OutputBackend};
use packetlights_pigpio_lib::{PigpioClient, PigpioError, MODE_OUTPUT};

/// Drives GPIO lines through the pigpio daemon.
///
/// The connection is dropped on I/O errors and re-established on the next
/// call, so a daemon restart only costs the writes made while it was down.
pub struct PigpioBackend {
    address: String,
    timeout: Duration,
    client: Mutex<Option<PigpioClient>>,
}

impl PigpioBackend {
    /// Connect eagerly so startup fails fast when the daemon is missing
    pub fn connect(address: &str, timeout: Duration) -> Result<Self, PigpioError> {
        let mut client = PigpioClient::connect(address, timeout)?;
        match client.hardware_revision() {
            Ok(rev) => info!("pigpiod at {} reports hardware revision {rev:#x}", client.peer()),
            Err(e) => warn!("pigpiod hardware revision query failed: {e}"),
        }
        Ok(Self {
            address: address.to_string(),
            timeout,
            client: Mutex::new(Some(client)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<PigpioClient>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_client<T>(
        &self,
        line: u8,
        op: impl FnOnce(&mut PigpioClient) -> Result<T, PigpioError>,
    ) -> Result<T, BackendError> {
        let mut slot = self.lock();
        if slot.is_none() {
            info!("Reconnecting to pigpiod at {}", self.address);
            let client = PigpioClient::connect(&self.address, self.timeout)
                .map_err(|e| to_backend_error(line, e))?;
            *slot = Some(client);
        }
        let Some(client) = slot.as_mut() else {
            return Err(BackendError::Refused {
                line,
                reason: "no pigpiod connection".to_string(),
            });
        };
        match op(client) {
            Ok(value) => Ok(value),
            Err(PigpioError::Io(e)) => {
                warn!("pigpiod connection to {} lost: {e}", client.peer());
                *slot = None;
                Err(BackendError::Io(e))
            }
            Err(e) => Err(to_backend_error(line, e)),
        }
    }
}

fn to_backend_error(line: u8, e: PigpioError) -> BackendError {
    match e {
        PigpioError::Io(io) => BackendError::Io(io),
        other => BackendError::Refused {
            line,
            reason: other.to_string(),
        },
    }
}

impl OutputBackend for PigpioBackend {
    fn set_output(&self, line: u8) -> Result<(), BackendError> {
        self.with_client(line, |client| client.set_mode(line, MODE_OUTPUT))
    }

    fn write(&self, line: u8, level: Level) -> Result<(), BackendError> {
        self.with_client(line, |client| client.write(line, level == Level::High))
    }
}
