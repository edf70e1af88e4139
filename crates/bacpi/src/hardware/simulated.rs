//! In-memory backend
//!
//! Channels behave like real GPIO lines: writes require the pin to be an
//! output and are read back as the pin's level. Faults can be injected per pin.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use super::{HardwareError, IoBackend};
use crate::point::{Direction, SensorId};

#[derive(Debug, Default)]
struct SimState {
    directions: HashMap<u8, Direction>,
    levels: HashMap<u8, bool>,
    sensors: HashMap<SensorId, f32>,
    read_faults: HashSet<u8>,
    write_faults: HashSet<u8>,
    configure_faults: HashSet<u8>,
    writes: Vec<(u8, bool)>,
    configures: Vec<(u8, Direction)>,
    released: bool,
}

/// Simulated channels and sensors
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive the level seen on an input pin
    pub fn set_input(&self, pin: u8, level: bool) {
        self.state.lock().levels.insert(pin, level);
    }

    /// Set the next sensor reading; `None` makes the sensor unreadable
    pub fn set_sensor(&self, sensor: &SensorId, value: Option<f32>) {
        let mut state = self.state.lock();
        match value {
            Some(v) => state.sensors.insert(sensor.clone(), v),
            None => state.sensors.remove(sensor),
        };
    }

    pub fn fail_reads(&self, pin: u8, fail: bool) {
        toggle(&mut self.state.lock().read_faults, pin, fail);
    }

    pub fn fail_writes(&self, pin: u8, fail: bool) {
        toggle(&mut self.state.lock().write_faults, pin, fail);
    }

    pub fn fail_configure(&self, pin: u8, fail: bool) {
        toggle(&mut self.state.lock().configure_faults, pin, fail);
    }

    pub fn direction(&self, pin: u8) -> Option<Direction> {
        self.state.lock().directions.get(&pin).copied()
    }

    pub fn level(&self, pin: u8) -> Option<bool> {
        self.state.lock().levels.get(&pin).copied()
    }

    /// Every successful write, oldest first
    pub fn writes(&self) -> Vec<(u8, bool)> {
        self.state.lock().writes.clone()
    }

    /// Every successful reconfiguration, oldest first
    pub fn configures(&self) -> Vec<(u8, Direction)> {
        self.state.lock().configures.clone()
    }

    pub fn clear_history(&self) {
        let mut state = self.state.lock();
        state.writes.clear();
        state.configures.clear();
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }
}

fn toggle(set: &mut HashSet<u8>, pin: u8, on: bool) {
    if on {
        set.insert(pin);
    } else {
        set.remove(&pin);
    }
}

impl IoBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn configure_channel(&self, pin: u8, direction: Direction) -> Result<(), HardwareError> {
        let mut state = self.state.lock();
        if state.configure_faults.contains(&pin) {
            return Err(HardwareError::Configure {
                pin,
                reason: "injected fault".into(),
            });
        }
        state.directions.insert(pin, direction);
        state.configures.push((pin, direction));
        Ok(())
    }

    fn read_digital(&self, pin: u8) -> Result<bool, HardwareError> {
        let state = self.state.lock();
        if state.read_faults.contains(&pin) {
            return Err(HardwareError::Read {
                pin,
                reason: "injected fault".into(),
            });
        }
        Ok(state.levels.get(&pin).copied().unwrap_or(false))
    }

    fn write_digital(&self, pin: u8, level: bool) -> Result<(), HardwareError> {
        let mut state = self.state.lock();
        if state.write_faults.contains(&pin) {
            return Err(HardwareError::Write {
                pin,
                reason: "injected fault".into(),
            });
        }
        if state.directions.get(&pin) != Some(&Direction::Output) {
            return Err(HardwareError::Write {
                pin,
                reason: "pin is not configured as output".into(),
            });
        }
        state.levels.insert(pin, level);
        state.writes.push((pin, level));
        Ok(())
    }

    fn read_environmental(&self, sensor: &SensorId) -> Option<f32> {
        self.state.lock().sensors.get(sensor).copied()
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.directions.clear();
        state.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Quantity;

    #[test]
    fn test_write_requires_output_direction() {
        let backend = SimulatedBackend::new();
        assert!(matches!(
            backend.write_digital(27, true),
            Err(HardwareError::Write { pin: 27, .. })
        ));

        backend.configure_channel(27, Direction::Output).unwrap();
        backend.write_digital(27, true).unwrap();
        assert_eq!(backend.level(27), Some(true));
        assert_eq!(backend.writes(), vec![(27, true)]);
    }

    #[test]
    fn test_injected_faults() {
        let backend = SimulatedBackend::new();
        backend.set_input(17, true);
        assert_eq!(backend.read_digital(17), Ok(true));

        backend.fail_reads(17, true);
        assert!(backend.read_digital(17).is_err());
        backend.fail_reads(17, false);
        assert_eq!(backend.read_digital(17), Ok(true));
    }

    #[test]
    fn test_sensor_readings() {
        let backend = SimulatedBackend::new();
        let dht = SensorId {
            sensor: "dht".into(),
            quantity: Quantity::Temperature,
        };
        assert_eq!(backend.read_environmental(&dht), None);
        backend.set_sensor(&dht, Some(21.5));
        assert_eq!(backend.read_environmental(&dht), Some(21.5));
        backend.set_sensor(&dht, None);
        assert_eq!(backend.read_environmental(&dht), None);
    }

    #[test]
    fn test_release() {
        let backend = SimulatedBackend::new();
        backend.configure_channel(27, Direction::Output).unwrap();
        backend.release();
        assert!(backend.is_released());
        assert_eq!(backend.direction(27), None);
    }
}
