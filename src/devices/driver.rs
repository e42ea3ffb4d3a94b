//! Device driver seam
//!
//! The bridge never speaks the blinds' radio protocol itself. A driver
//! resolves an address to a [`BlindHandle`] and the handle performs blocking
//! reads and moves. Hardware drivers implement [`DeviceDriver`]; the
//! [`SimulatedDriver`] keeps blinds in memory for dry runs and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

/// Driver-specific failures, normalized by the proxy
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("no device found at {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("device did not answer in time")]
    Timeout,

    #[error("position {0} rejected by the device")]
    OutOfRange(u8),
}

/// Physical state reported by a blind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlindState {
    /// 0 = fully open, 100 = fully closed
    pub position: u8,
}

/// Connected blind. Calls block until the device answers.
pub trait BlindHandle: Send {
    fn read_state(&mut self) -> Result<BlindState, DriverError>;
    fn set_position(&mut self, percent: u8) -> Result<(), DriverError>;
}

pub trait DeviceDriver: Send + Sync {
    /// Looks up the device at `address` and opens a handle to it
    fn search(&self, address: &str) -> Result<Box<dyn BlindHandle>, DriverError>;
}

#[derive(Debug, Clone)]
struct SimulatedBlind {
    position: u8,
    reachable: bool,
}

#[derive(Debug, Default)]
struct SimulatedFleet {
    blinds: HashMap<String, SimulatedBlind>,
    commands: Vec<(String, u8)>,
}

/// In-memory blinds that move instantly to their target position
#[derive(Debug, Clone, Default)]
pub struct SimulatedDriver {
    fleet: Arc<Mutex<SimulatedFleet>>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or resets) a reachable blind at `address`
    pub fn add_blind(&self, address: &str, position: u8) {
        self.fleet().blinds.insert(
            address.to_string(),
            SimulatedBlind {
                position,
                reachable: true,
            },
        );
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if let Some(blind) = self.fleet().blinds.get_mut(address) {
            blind.reachable = reachable;
        }
    }

    /// Moves a blind without going through a command, e.g. someone pulled the cord
    pub fn set_position(&self, address: &str, position: u8) {
        if let Some(blind) = self.fleet().blinds.get_mut(address) {
            blind.position = position;
        }
    }

    pub fn position(&self, address: &str) -> Option<u8> {
        self.fleet().blinds.get(address).map(|b| b.position)
    }

    /// Every `set_position` issued through a handle, oldest first
    pub fn commands(&self) -> Vec<(String, u8)> {
        self.fleet().commands.clone()
    }

    fn fleet(&self) -> MutexGuard<'_, SimulatedFleet> {
        // a panicked test thread must not take the whole fleet down
        self.fleet.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DeviceDriver for SimulatedDriver {
    fn search(&self, address: &str) -> Result<Box<dyn BlindHandle>, DriverError> {
        match self.fleet().blinds.get(address) {
            Some(blind) if blind.reachable => Ok(Box::new(SimulatedHandle {
                address: address.to_string(),
                driver: self.clone(),
            })),
            Some(_) => Err(DriverError::Timeout),
            None => Err(DriverError::NotFound(address.to_string())),
        }
    }
}

struct SimulatedHandle {
    address: String,
    driver: SimulatedDriver,
}

impl SimulatedHandle {
    fn with_blind<T>(
        &self,
        f: impl FnOnce(&mut SimulatedBlind) -> T,
    ) -> Result<T, DriverError> {
        let mut fleet = self.driver.fleet();
        match fleet.blinds.get_mut(&self.address) {
            Some(blind) if blind.reachable => Ok(f(blind)),
            Some(_) => Err(DriverError::Timeout),
            None => Err(DriverError::NotFound(self.address.clone())),
        }
    }
}

impl BlindHandle for SimulatedHandle {
    fn read_state(&mut self) -> Result<BlindState, DriverError> {
        let position = self.with_blind(|blind| blind.position)?;
        debug!(address = %self.address, position, "Simulated read");
        Ok(BlindState { position })
    }

    fn set_position(&mut self, percent: u8) -> Result<(), DriverError> {
        if percent > 100 {
            return Err(DriverError::OutOfRange(percent));
        }
        self.with_blind(|blind| blind.position = percent)?;
        self.driver
            .fleet()
            .commands
            .push((self.address.clone(), percent));
        debug!(address = %self.address, percent, "Simulated move");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_address_is_not_found() {
        let driver = SimulatedDriver::new();
        assert!(matches!(
            driver.search("AA:01"),
            Err(DriverError::NotFound(addr)) if addr == "AA:01"
        ));
    }

    #[test]
    fn handle_reads_and_moves() {
        let driver = SimulatedDriver::new();
        driver.add_blind("AA:01", 42);

        let mut handle = driver.search("AA:01").unwrap();
        assert_eq!(handle.read_state().unwrap(), BlindState { position: 42 });

        handle.set_position(100).unwrap();
        assert_eq!(driver.position("AA:01"), Some(100));
        assert_eq!(driver.commands(), vec![("AA:01".to_string(), 100)]);
    }

    #[test]
    fn unreachable_blind_times_out() {
        let driver = SimulatedDriver::new();
        driver.add_blind("AA:01", 0);
        let mut handle = driver.search("AA:01").unwrap();

        driver.set_reachable("AA:01", false);
        assert_eq!(handle.read_state(), Err(DriverError::Timeout));
        assert!(matches!(driver.search("AA:01"), Err(DriverError::Timeout)));
    }

    #[test]
    fn out_of_range_move_is_rejected() {
        let driver = SimulatedDriver::new();
        driver.add_blind("AA:01", 0);
        let mut handle = driver.search("AA:01").unwrap();

        assert_eq!(handle.set_position(101), Err(DriverError::OutOfRange(101)));
        assert!(driver.commands().is_empty());
    }
}
