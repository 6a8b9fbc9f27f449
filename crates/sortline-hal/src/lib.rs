//! `sortline-hal` – actuator drivers and the output capability they talk to.
//!
//! - [`output`] – the opaque per-channel [`OutputChannel`] capability
//!   (PWM pulse width or step-pulse train) plus position/temperature
//!   [`Feedback`].
//! - [`driver`] – the [`ActuatorDriver`] trait every concrete driver
//!   implements.
//! - [`servo`] / [`stepper`] – diverter servos (absolute angles) and the
//!   labeling-head stepper (relative feed distance).
//! - [`sim`] – in-process output channel with fault injection.
//! - [`registry`] – builds one driver per configured actuator.

pub mod driver;
pub mod output;
pub mod registry;
pub mod servo;
pub mod sim;
pub mod stepper;

pub use driver::ActuatorDriver;
pub use output::{Feedback, OutputChannel, OutputSignal};
pub use registry::HardwareRegistry;
pub use servo::ServoDriver;
pub use sim::{SimChannel, SimProbe, SignalRecord};
pub use stepper::StepperDriver;
