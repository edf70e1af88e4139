//! Gateway Configuration
//!
//! Settings are layered with figment: built-in defaults, then the optional
//! `gateway.toml`, then `BACPI_*` environment variables (`__` separates
//! nesting levels), then command line overrides.

mod address;

pub use address::*;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::hardware::{SensorConfig, SensorModel};
use crate::point::{Direction, MAX_INSTANCE, Polarity, Quantity, SensorId};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("Invalid settings: {0}")]
    Invalid(String),

    #[error("Failed to render settings: {0}")]
    Render(#[from] toml::ser::Error),
}

/// Device object identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub instance: u32,
    pub name: String,
    pub vendor_name: String,
    pub vendor_id: u16,
    pub model_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// File holding the software/firmware version string
    pub version_file: PathBuf,
    pub max_apdu: u16,
    pub segmentation: String,
    pub database_revision: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            instance: 110,
            name: "GardenPi".to_string(),
            vendor_name: "Nenad Stankovic".to_string(),
            vendor_id: 15,
            model_name: "Raspberry Pi 4 B".to_string(),
            description: None,
            location: None,
            version_file: PathBuf::from("VERSION"),
            max_apdu: 1024,
            segmentation: "segmentedBoth".to_string(),
            database_revision: 0,
        }
    }
}

/// BACnet/IP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// `ip/prefix:port`
    pub address: String,
    /// Broadcast management device to register with as a foreign device
    #[serde(default)]
    pub bbmd: Option<String>,
    /// Foreign device registration lifetime (seconds)
    pub bbmd_ttl: u16,
    /// Explicit broadcast address, overriding the derived one
    #[serde(default)]
    pub broadcast: Option<String>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0/{DEFAULT_PREFIX}:{DEFAULT_PORT}"),
            bbmd: None,
            bbmd_ttl: 900,
            broadcast: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sysfs,
    Simulated,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareSettings {
    pub backend: BackendKind,
    /// Offset added to BCM pin numbers for sysfs line numbers
    #[serde(default)]
    pub pin_offset: u32,
}

/// Role of a configured channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    /// Exposed as a binary input
    Input,
    /// Exposed as a binary output
    Output,
}

/// One entry of the channel map: a pin and the point exposing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub pin: u8,
    pub role: ChannelRole,
    /// Initial direction; follows the role when omitted
    #[serde(default)]
    pub direction: Option<Direction>,
    pub instance: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Outputs only
    #[serde(default)]
    pub polarity: Polarity,
}

impl ChannelConfig {
    pub fn initial_direction(&self) -> Direction {
        self.direction.unwrap_or(match self.role {
            ChannelRole::Input => Direction::Input,
            ChannelRole::Output => Direction::Output,
        })
    }

    pub fn object_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| match self.role {
            ChannelRole::Input => format!("GPIO_{}_Input", self.pin),
            ChannelRole::Output => format!("GPIO_{}_Output", self.pin),
        })
    }
}

/// Bootstrap analog value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalogConfig {
    pub instance: u32,
    pub name: String,
    /// Sensor feeding the value; manual when absent
    #[serde(default)]
    pub sensor: Option<SensorId>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Mode point governing the direction of a set of channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    pub instance: u32,
    pub name: String,
    pub states: Vec<String>,
    /// Channel direction for each state, same length as `states`
    pub directions: Vec<Direction>,
    #[serde(default = "default_initial_state")]
    pub initial: u32,
    pub pins: Vec<u8>,
}

fn default_initial_state() -> u32 {
    1
}

/// Command line values that take precedence over every other layer
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub address: Option<String>,
    pub extension_file: Option<PathBuf>,
    pub bbmd: Option<String>,
    pub broadcast: Option<String>,
    pub device_id: Option<u32>,
    pub simulate: bool,
}

/// Complete gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub device: DeviceSettings,
    pub network: NetworkSettings,
    pub hardware: HardwareSettings,
    /// Seconds between sync ticks
    pub sync_period_secs: u64,
    /// Declarative point extensions
    pub extension_file: PathBuf,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub analog: Vec<AnalogConfig>,
    #[serde(default)]
    pub mode: Option<ModeConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            device: DeviceSettings::default(),
            network: NetworkSettings::default(),
            hardware: HardwareSettings::default(),
            sync_period_secs: 5,
            extension_file: PathBuf::from("objects.json"),
            channels: vec![
                ChannelConfig {
                    pin: 17,
                    role: ChannelRole::Input,
                    direction: None,
                    instance: 1,
                    name: None,
                    description: None,
                    polarity: Polarity::Normal,
                },
                ChannelConfig {
                    pin: 27,
                    role: ChannelRole::Output,
                    direction: None,
                    instance: 1,
                    name: None,
                    description: None,
                    polarity: Polarity::Normal,
                },
            ],
            sensors: vec![SensorConfig::new("dht11", SensorModel::Dht11, 4)],
            analog: vec![AnalogConfig {
                instance: 1,
                name: "Temperature_AV".to_string(),
                sensor: Some(SensorId {
                    sensor: "dht11".to_string(),
                    quantity: Quantity::Temperature,
                }),
                units: Some("degreesCelsius".to_string()),
                description: None,
            }],
            mode: None,
        }
    }
}

impl GatewayConfig {
    /// Layer defaults, the optional settings file and the environment
    pub fn load(settings: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = settings {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed("BACPI_").split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse settings from a TOML string on top of the defaults
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(content))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command line values
    pub fn apply(&mut self, overrides: Overrides) -> Result<(), ConfigError> {
        if let Some(address) = overrides.address {
            self.network.address = address;
        }
        if let Some(path) = overrides.extension_file {
            self.extension_file = path;
        }
        if overrides.bbmd.is_some() {
            self.network.bbmd = overrides.bbmd;
        }
        if overrides.broadcast.is_some() {
            self.network.broadcast = overrides.broadcast;
        }
        if let Some(id) = overrides.device_id {
            self.device.instance = id;
        }
        if overrides.simulate {
            self.hardware.backend = BackendKind::Simulated;
        }
        self.validate()
    }

    /// Effective settings as TOML, in the format `load` accepts
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn bind_address(&self) -> Result<BindAddress, AddressError> {
        self.network.address.parse()
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_address()?;

        if self.sync_period_secs == 0 {
            return Err(ConfigError::Invalid("sync_period_secs must be positive".into()));
        }

        check_instance("device", self.device.instance)?;
        for channel in &self.channels {
            check_instance(&format!("pin {} channel", channel.pin), channel.instance)?;
        }
        for analog in &self.analog {
            check_instance(&analog.name, analog.instance)?;
        }
        if let Some(mode) = &self.mode {
            check_instance(&mode.name, mode.instance)?;
        }

        let mut pins = HashSet::new();
        for channel in &self.channels {
            if !pins.insert((channel.pin, channel.role)) {
                return Err(ConfigError::Invalid(format!(
                    "pin {} has more than one {:?} channel",
                    channel.pin, channel.role
                )));
            }
            if channel.role == ChannelRole::Input && channel.polarity == Polarity::Reverse {
                return Err(ConfigError::Invalid(format!(
                    "pin {}: polarity applies to outputs only",
                    channel.pin
                )));
            }
        }

        let sensors: HashSet<&str> = self.sensors.iter().map(|s| s.name.as_str()).collect();
        for analog in &self.analog {
            if let Some(sensor) = &analog.sensor {
                if !sensors.contains(sensor.sensor.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "analogValue {} references unknown sensor {}",
                        analog.instance, sensor.sensor
                    )));
                }
            }
        }

        if let Some(mode) = &self.mode {
            if mode.states.is_empty() || mode.states.len() != mode.directions.len() {
                return Err(ConfigError::Invalid(
                    "mode needs one direction per state".into(),
                ));
            }
            if mode.initial == 0 || mode.initial as usize > mode.states.len() {
                return Err(ConfigError::Invalid(format!(
                    "mode initial state {} outside 1..={}",
                    mode.initial,
                    mode.states.len()
                )));
            }
            for pin in &mode.pins {
                if !self.channels.iter().any(|c| c.pin == *pin) {
                    return Err(ConfigError::Invalid(format!(
                        "mode governs pin {pin} which is not in the channel map"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Instances must fit the 22-bit field of an object identifier
fn check_instance(what: &str, instance: u32) -> Result<(), ConfigError> {
    if instance > MAX_INSTANCE {
        return Err(ConfigError::Invalid(format!(
            "{what}: instance {instance} exceeds {MAX_INSTANCE}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_single_board_layout() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.device.instance, 110);
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].object_name(), "GPIO_17_Input");
        assert_eq!(config.channels[1].initial_direction(), Direction::Output);
        assert_eq!(config.sync_period(), Duration::from_secs(5));
        assert_eq!(config.extension_file, PathBuf::from("objects.json"));
    }

    #[test]
    fn test_toml_layer() {
        let config = GatewayConfig::from_toml_str(
            r#"
sync_period_secs = 2

[device]
instance = 4001
name = "Greenhouse"

[network]
address = "192.168.1.10/24:47808"
bbmd = "192.168.10.1"

[[channels]]
pin = 5
role = "input"
instance = 1

[[channels]]
pin = 5
role = "output"
instance = 1
polarity = "reverse"

[[channels]]
pin = 6
role = "output"
instance = 2

[mode]
instance = 1
name = "IO_Mode"
states = ["read", "write"]
directions = ["input", "output"]
pins = [5]
"#,
        )
        .unwrap();

        assert_eq!(config.device.instance, 4001);
        assert_eq!(config.device.name, "Greenhouse");
        assert_eq!(config.device.vendor_id, 15);
        assert_eq!(config.sync_period_secs, 2);
        assert_eq!(config.channels.len(), 3);
        assert_eq!(config.channels[1].polarity, Polarity::Reverse);
        let mode = config.mode.unwrap();
        assert_eq!(mode.initial, 1);
        assert_eq!(mode.pins, vec![5]);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let result = GatewayConfig::from_toml_str(
            r#"
[mode]
instance = 1
name = "IO_Mode"
states = ["read", "write"]
directions = ["input"]
pins = [17]
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_input_polarity_rejected() {
        let result = GatewayConfig::from_toml_str(
            r#"
[[channels]]
pin = 17
role = "input"
instance = 1
polarity = "reverse"
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_channel_role_rejected() {
        let result = GatewayConfig::from_toml_str(
            r#"
[[channels]]
pin = 17
role = "input"
instance = 1

[[channels]]
pin = 17
role = "input"
instance = 2
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        // Same pin in both roles is how a mode-switched pin is declared
        let config = GatewayConfig::from_toml_str(
            r#"
[[channels]]
pin = 17
role = "input"
instance = 1

[[channels]]
pin = 17
role = "output"
instance = 1
"#,
        )
        .unwrap();
        assert_eq!(config.channels.len(), 2);
    }

    #[test]
    fn test_channel_instance_out_of_range() {
        let mut config = GatewayConfig::default();
        config.channels[0].instance = MAX_INSTANCE + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.channels[0].instance = MAX_INSTANCE;
        config.validate().unwrap();
    }

    #[test]
    fn test_device_id_override_out_of_range() {
        let mut config = GatewayConfig::default();
        let result = config.apply(Overrides {
            device_id: Some(u32::MAX),
            ..Default::default()
        });
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        config
            .apply(Overrides {
                device_id: Some(MAX_INSTANCE),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(config.device.instance, MAX_INSTANCE);
    }

    #[test]
    fn test_unknown_sensor_rejected() {
        let result = GatewayConfig::from_toml_str(
            r#"
[[analog]]
instance = 2
name = "Humidity_AV"
sensor = { sensor = "bme280", quantity = "humidity" }
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_overrides_win() {
        let mut config = GatewayConfig::default();
        config
            .apply(Overrides {
                address: Some("10.1.2.3/16:47809".into()),
                extension_file: Some("/etc/bacpi/objects.json".into()),
                bbmd: Some("10.1.0.1".into()),
                broadcast: None,
                device_id: Some(2001),
                simulate: true,
            })
            .unwrap();

        assert_eq!(config.bind_address().unwrap().port, 47809);
        assert_eq!(config.device.instance, 2001);
        assert_eq!(config.network.bbmd.as_deref(), Some("10.1.0.1"));
        assert_eq!(config.network.broadcast, None);
        assert_eq!(config.hardware.backend, BackendKind::Simulated);
    }

    #[test]
    fn test_bad_address_override_rejected() {
        let mut config = GatewayConfig::default();
        let result = config.apply(Overrides {
            address: Some("not-an-ip".into()),
            ..Default::default()
        });
        assert!(matches!(result, Err(ConfigError::Address(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "sync_period_secs = 10\n").unwrap();

        let config = GatewayConfig::load(Some(&path)).unwrap();
        assert_eq!(config.sync_period_secs, 10);
        assert_eq!(config.device.name, "GardenPi");
    }

    #[test]
    fn test_rendered_settings_load_back() {
        let mut config = GatewayConfig::default();
        config.network.bbmd = Some("10.0.0.1".into());
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[[channels]]"));

        let reloaded = GatewayConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reloaded.network.bbmd.as_deref(), Some("10.0.0.1"));
        assert_eq!(reloaded.channels.len(), config.channels.len());
        assert_eq!(reloaded.analog[0].sensor, config.analog[0].sensor);
    }
}
