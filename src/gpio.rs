//! Output pin abstraction for the motor driver.
//!
//! The motion engine only needs four digital outputs. On the real unit these
//! map to driver-board GPIOs; the host build drives [`SimulatedPin`]s, and
//! tests use [`RecordingPin`]s to capture the coil sequence.

#[cfg(test)]
use std::sync::{Arc, Mutex};
use tracing::trace;

/// One digital output. Implementations own their pin exclusively.
pub trait OutputPin: Send {
    fn set_high(&mut self);
    fn set_low(&mut self);
    fn is_high(&self) -> bool;
}

/// Host-side stand-in for a driver GPIO. Level changes are traced so a
/// bench run can be followed in the logs.
pub struct SimulatedPin {
    pin: u8,
    state: bool,
}

impl SimulatedPin {
    pub fn new(pin: u8) -> Self {
        Self { pin, state: false }
    }
}

impl OutputPin for SimulatedPin {
    fn set_high(&mut self) {
        if !self.state {
            trace!(pin = self.pin, "gpio high");
        }
        self.state = true;
    }

    fn set_low(&mut self) {
        if self.state {
            trace!(pin = self.pin, "gpio low");
        }
        self.state = false;
    }

    fn is_high(&self) -> bool {
        self.state
    }
}

/// Shared log of `(coil index, level)` writes, in order.
#[cfg(test)]
pub type PinLog = Arc<Mutex<Vec<(usize, bool)>>>;

/// Test pin recording every write into a shared log.
#[cfg(test)]
pub struct RecordingPin {
    coil: usize,
    state: bool,
    log: PinLog,
}

#[cfg(test)]
impl RecordingPin {
    pub fn new(coil: usize, log: PinLog) -> Self {
        Self {
            coil,
            state: false,
            log,
        }
    }
}

#[cfg(test)]
impl OutputPin for RecordingPin {
    fn set_high(&mut self) {
        self.state = true;
        self.log.lock().unwrap().push((self.coil, true));
    }

    fn set_low(&mut self) {
        self.state = false;
        self.log.lock().unwrap().push((self.coil, false));
    }

    fn is_high(&self) -> bool {
        self.state
    }
}
