//! Physical I/O Backend
//!
//! Capability surface over digital channels and environmental sensors. The
//! sync engine is the only caller of [`IoBackend::configure_channel`] and
//! [`IoBackend::write_digital`] after startup.
//!
//! Two backends are provided:
//! - [`SysfsBackend`]: Linux sysfs GPIO plus the kernel DHT11 IIO driver
//! - [`SimulatedBackend`]: in-memory channels for tests and `--simulate` runs

mod simulated;
mod sysfs;

pub use simulated::SimulatedBackend;
pub use sysfs::SysfsBackend;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{BackendKind, HardwareSettings};
use crate::point::{Direction, SensorId};

/// Errors raised by channel operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HardwareError {
    #[error("Failed to read pin {pin}: {reason}")]
    Read { pin: u8, reason: String },

    #[error("Failed to write pin {pin}: {reason}")]
    Write { pin: u8, reason: String },

    #[error("Failed to configure pin {pin}: {reason}")]
    Configure { pin: u8, reason: String },

    #[error("Hardware unavailable: {0}")]
    Unavailable(String),
}

/// Environmental sensor models
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorModel {
    #[default]
    Dht11,
    Dht22,
}

/// One environmental sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Name referenced by analog points
    pub name: String,
    #[serde(default)]
    pub model: SensorModel,
    /// Data pin the sensor is wired to
    pub pin: u8,
    /// IIO device directory exposed by the kernel driver
    #[serde(default)]
    pub iio_device: Option<String>,
    /// Read attempts per sample
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Delay between attempts (ms)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_retries() -> u32 {
    15
}

fn default_retry_delay_ms() -> u64 {
    2000
}

impl SensorConfig {
    pub fn new(name: impl Into<String>, model: SensorModel, pin: u8) -> Self {
        Self {
            name: name.into(),
            model,
            pin,
            iio_device: None,
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Hardware capability surface
///
/// Implementations must be cheap to call for digital operations.
/// `read_environmental` may block for its retry budget but must never panic
/// or surface an error to the caller.
pub trait IoBackend: Send + Sync + 'static {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Set the direction of a pin
    fn configure_channel(&self, pin: u8, direction: Direction) -> Result<(), HardwareError>;

    fn read_digital(&self, pin: u8) -> Result<bool, HardwareError>;

    fn write_digital(&self, pin: u8, level: bool) -> Result<(), HardwareError>;

    /// Read one sensor quantity, `None` when no valid sample was obtained
    fn read_environmental(&self, sensor: &SensorId) -> Option<f32>;

    /// Return every claimed channel to a safe state. Idempotent.
    fn release(&self);
}

/// Acquire the backend selected in the settings
pub fn open_backend(
    settings: &HardwareSettings,
    sensors: &[SensorConfig],
) -> Result<Arc<dyn IoBackend>, HardwareError> {
    let backend: Arc<dyn IoBackend> = match settings.backend {
        BackendKind::Sysfs => {
            Arc::new(SysfsBackend::open(settings.pin_offset, sensors)?)
        }
        BackendKind::Simulated => Arc::new(SimulatedBackend::new()),
    };
    tracing::info!("Hardware backend '{}' acquired", backend.name());
    Ok(backend)
}

/// Releases every channel when dropped, whichever way the process leaves scope
pub struct ReleaseGuard {
    backend: Arc<dyn IoBackend>,
}

impl ReleaseGuard {
    pub fn new(backend: Arc<dyn IoBackend>) -> Self {
        Self { backend }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        tracing::info!("Releasing hardware channels ({})", self.backend.name());
        self.backend.release();
    }
}
