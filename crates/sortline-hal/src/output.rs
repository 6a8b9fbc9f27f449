//! Opaque output capability.
//!
//! The register-level GPIO/PWM work lives in an external daemon; the core
//! only knows how to hand it a logical signal for one channel and how to
//! read back feedback.  The daemon may be temporarily unreachable, which
//! surfaces as [`DriverError::Unavailable`].

use async_trait::async_trait;
use sortline_types::DriverError;

/// Logical command written to one output channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputSignal {
    /// Hold a servo pulse of `micros` microseconds at 50 Hz.
    PulseWidth { micros: u32 },
    /// Emit `steps` step pulses at `rate_hz` in the given direction.
    StepTrain {
        forward: bool,
        steps: u32,
        rate_hz: f32,
    },
    /// De-energise the output.
    Release,
}

/// Raw readback from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Feedback {
    /// Encoder / pulse readback in channel units, `None` when the controller
    /// did not report a position.
    pub position_raw: Option<i64>,
    pub temperature_c: f32,
}

/// Exclusive write handle to one physical output.
#[async_trait]
pub trait OutputChannel: Send + Sync {
    /// Controller pin or PWM index.
    fn channel(&self) -> u8;

    /// Send `signal` to the output.
    ///
    /// # Errors
    ///
    /// [`DriverError::Unavailable`] when the output daemon cannot be reached.
    async fn write(&self, signal: OutputSignal) -> Result<(), DriverError>;

    /// Read back the latest position and temperature.
    async fn feedback(&self) -> Result<Feedback, DriverError>;
}
