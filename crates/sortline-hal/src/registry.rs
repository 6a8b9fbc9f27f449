//! [`HardwareRegistry`] – one driver per configured actuator.
//!
//! The registry is populated once at startup from the validated
//! [`ActuatorTable`] and then drained by the runtime, which moves each
//! driver into its owning task.  After that nothing but that task can reach
//! the hardware channel.

use std::collections::HashMap;

use sortline_types::{ActuatorProfile, ActuatorTable, DriverSettings, SorterError};

use crate::driver::ActuatorDriver;
use crate::output::OutputChannel;
use crate::servo::ServoDriver;
use crate::sim::{SimChannel, SimProbe};
use crate::stepper::StepperDriver;

/// Build the driver variant the profile asks for.
pub fn driver_for(profile: &ActuatorProfile, channel: Box<dyn OutputChannel>) -> Box<dyn ActuatorDriver> {
    match &profile.driver {
        DriverSettings::Servo(settings) => {
            Box::new(ServoDriver::new(profile, settings.clone(), channel))
        }
        DriverSettings::Stepper(settings) => {
            Box::new(StepperDriver::new(profile, settings.clone(), channel))
        }
    }
}

#[derive(Default)]
pub struct HardwareRegistry {
    drivers: HashMap<String, Box<dyn ActuatorDriver>>,
}

impl HardwareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a driver for every profile, asking `open` for its output channel.
    pub fn from_table<F>(table: &ActuatorTable, mut open: F) -> Self
    where
        F: FnMut(&ActuatorProfile) -> Box<dyn OutputChannel>,
    {
        let mut registry = Self::new();
        for profile in table.iter() {
            registry.register(driver_for(profile, open(profile)));
        }
        registry
    }

    /// Registry backed entirely by [`SimChannel`]s, plus a probe per actuator.
    pub fn simulated(table: &ActuatorTable) -> (Self, HashMap<String, SimProbe>) {
        let mut probes = HashMap::new();
        let registry = Self::from_table(table, |profile| {
            let (channel, probe) = SimChannel::for_profile(profile);
            probes.insert(profile.id.clone(), probe);
            Box::new(channel)
        });
        (registry, probes)
    }

    /// Register a driver.  Any previously registered driver with the same id
    /// is replaced.
    pub fn register(&mut self, driver: Box<dyn ActuatorDriver>) {
        self.drivers.insert(driver.id().to_string(), driver);
    }

    /// Remove and return the driver for `id`.
    ///
    /// # Errors
    ///
    /// [`SorterError::UnknownActuator`] when no driver is registered.
    pub fn take(&mut self, id: &str) -> Result<Box<dyn ActuatorDriver>, SorterError> {
        self.drivers
            .remove(id)
            .ok_or_else(|| SorterError::UnknownActuator(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.drivers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}
