//! Linux sysfs backend
//!
//! Digital channels go through the legacy `/sys/class/gpio` interface.
//! Environmental sensors are read from the IIO device the kernel `dht11`
//! driver exposes (`dtoverlay=dht11,gpiopin=N`), which reports milli-units.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::{HardwareError, IoBackend, SensorConfig, SensorModel};
use crate::point::{Direction, Quantity, SensorId};

const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";
const DEFAULT_IIO_DEVICE: &str = "/sys/bus/iio/devices/iio:device0";

/// sysfs GPIO + IIO sensor backend
pub struct SysfsBackend {
    gpio_root: PathBuf,
    /// Added to BCM pin numbers (newer kernels number the header from 512)
    pin_offset: u32,
    sensors: HashMap<String, SensorConfig>,
    exported: Mutex<HashSet<u8>>,
}

impl SysfsBackend {
    /// Open the default sysfs GPIO tree
    pub fn open(pin_offset: u32, sensors: &[SensorConfig]) -> Result<Self, HardwareError> {
        Self::open_at(DEFAULT_GPIO_ROOT, pin_offset, sensors)
    }

    /// Open a GPIO tree rooted at `gpio_root`
    pub fn open_at(
        gpio_root: impl AsRef<Path>,
        pin_offset: u32,
        sensors: &[SensorConfig],
    ) -> Result<Self, HardwareError> {
        let gpio_root = gpio_root.as_ref().to_path_buf();
        if !gpio_root.join("export").exists() {
            return Err(HardwareError::Unavailable(format!(
                "{} has no export interface",
                gpio_root.display()
            )));
        }

        info!(
            "Opened sysfs GPIO at {} ({} sensors)",
            gpio_root.display(),
            sensors.len()
        );

        Ok(Self {
            gpio_root,
            pin_offset,
            sensors: sensors.iter().map(|s| (s.name.clone(), s.clone())).collect(),
            exported: Mutex::new(HashSet::new()),
        })
    }

    fn line(&self, pin: u8) -> u32 {
        u32::from(pin) + self.pin_offset
    }

    fn pin_dir(&self, pin: u8) -> PathBuf {
        self.gpio_root.join(format!("gpio{}", self.line(pin)))
    }

    fn export(&self, pin: u8) -> io::Result<()> {
        if !self.pin_dir(pin).exists() {
            fs::write(self.gpio_root.join("export"), self.line(pin).to_string())?;
            debug!(pin, "Exported GPIO line {}", self.line(pin));
        }
        self.exported.lock().insert(pin);
        Ok(())
    }

    fn read_sample(path: &Path, model: SensorModel, quantity: Quantity) -> io::Result<f32> {
        let raw = fs::read_to_string(path)?;
        let milli: i64 = raw
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let value = milli as f32 / 1000.0;

        let (lo, hi) = match (model, quantity) {
            (SensorModel::Dht11, Quantity::Temperature) => (0.0, 50.0),
            (SensorModel::Dht22, Quantity::Temperature) => (-40.0, 80.0),
            (_, Quantity::Humidity) => (0.0, 100.0),
        };
        if !(lo..=hi).contains(&value) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("sample {value} outside {lo}..={hi}"),
            ));
        }
        Ok(value)
    }
}

impl IoBackend for SysfsBackend {
    fn name(&self) -> &str {
        "sysfs"
    }

    fn configure_channel(&self, pin: u8, direction: Direction) -> Result<(), HardwareError> {
        let configure = || -> io::Result<()> {
            self.export(pin)?;
            let value = match direction {
                Direction::Input => "in",
                Direction::Output => "out",
            };
            fs::write(self.pin_dir(pin).join("direction"), value)
        };

        configure().map_err(|e| HardwareError::Configure {
            pin,
            reason: e.to_string(),
        })
    }

    fn read_digital(&self, pin: u8) -> Result<bool, HardwareError> {
        let raw = fs::read_to_string(self.pin_dir(pin).join("value")).map_err(|e| {
            HardwareError::Read {
                pin,
                reason: e.to_string(),
            }
        })?;

        match raw.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(HardwareError::Read {
                pin,
                reason: format!("unexpected value {other:?}"),
            }),
        }
    }

    fn write_digital(&self, pin: u8, level: bool) -> Result<(), HardwareError> {
        let value = if level { "1" } else { "0" };
        fs::write(self.pin_dir(pin).join("value"), value).map_err(|e| HardwareError::Write {
            pin,
            reason: e.to_string(),
        })
    }

    fn read_environmental(&self, sensor: &SensorId) -> Option<f32> {
        let Some(config) = self.sensors.get(&sensor.sensor) else {
            warn!("Unknown sensor: {}", sensor.sensor);
            return None;
        };

        let device = config.iio_device.as_deref().unwrap_or(DEFAULT_IIO_DEVICE);
        let file = match sensor.quantity {
            Quantity::Temperature => "in_temp_input",
            Quantity::Humidity => "in_humidityrelative_input",
        };
        let path = Path::new(device).join(file);

        let attempts = config.retries.max(1);
        for attempt in 1..=attempts {
            match Self::read_sample(&path, config.model, sensor.quantity) {
                Ok(value) => return Some(value),
                Err(e) => {
                    trace!(sensor = %sensor, attempt, "Sensor read failed: {}", e);
                    if attempt < attempts {
                        thread::sleep(Duration::from_millis(config.retry_delay_ms));
                    }
                }
            }
        }

        debug!(sensor = %sensor, "No valid sample after {} attempts", attempts);
        None
    }

    fn release(&self) {
        let pins: Vec<u8> = self.exported.lock().drain().collect();
        for pin in pins {
            let dir = self.pin_dir(pin);
            if let Err(e) = fs::write(dir.join("direction"), "in") {
                warn!(pin, "Failed to reset direction: {}", e);
            }
            if let Err(e) = fs::write(self.gpio_root.join("unexport"), self.line(pin).to_string()) {
                warn!(pin, "Failed to unexport: {}", e);
            }
        }
        info!("Released sysfs GPIO channels");
    }
}

impl Drop for SysfsBackend {
    fn drop(&mut self) {
        if !self.exported.lock().is_empty() {
            self.release();
        }
    }
}
