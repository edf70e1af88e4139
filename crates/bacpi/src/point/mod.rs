//! Point model
//!
//! A [`Point`] is one protocol-visible object backed either by a physical
//! channel, an environmental sensor, or nothing at all (values owned by the
//! network). Common metadata lives on `Point`; the variant-specific state lives
//! in [`PointKind`].

mod identifier;
mod value;

pub use identifier::*;
pub use value::*;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Value an analog point falls back to when its sensor cannot be read
pub const SENSOR_FALLBACK: f32 = 0.0;

/// Direction of a physical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// A physical I/O line. Only the sync engine and startup bootstrap change `direction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub pin: u8,
    pub direction: Direction,
}

/// Output polarity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    #[default]
    Normal,
    Reverse,
}

impl Polarity {
    /// Electrical level for a logical value
    pub fn apply(&self, active: bool) -> bool {
        match self {
            Polarity::Normal => active,
            Polarity::Reverse => !active,
        }
    }
}

/// Which quantity of an environmental sensor an analog point tracks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    #[default]
    Temperature,
    Humidity,
}

/// Reference to one reading of one environmental sensor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorId {
    /// Sensor name as declared in the gateway settings
    pub sensor: String,
    #[serde(default)]
    pub quantity: Quantity,
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = match self.quantity {
            Quantity::Temperature => "temperature",
            Quantity::Humidity => "humidity",
        };
        write!(f, "{}/{}", self.sensor, q)
    }
}

/// Where an analog point's present value comes from
#[derive(Debug, Clone, PartialEq)]
pub enum AnalogSource {
    Sensor(SensorId),
    Manual,
}

/// Role a point plays in the per-tick passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Read from a channel every tick
    Input,
    /// Written to a channel every tick
    Output,
    /// Refreshed from an environmental sensor every tick
    Sensor,
    /// Governs the direction of a set of channels
    Mode,
    /// Network-owned, never touched by the engine
    Passive,
}

/// `[in_alarm, fault, overridden, out_of_service]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[bool; 4]", into = "[bool; 4]")]
pub struct StatusFlags {
    pub in_alarm: bool,
    pub fault: bool,
    pub overridden: bool,
    pub out_of_service: bool,
}

impl From<[bool; 4]> for StatusFlags {
    fn from(v: [bool; 4]) -> Self {
        Self {
            in_alarm: v[0],
            fault: v[1],
            overridden: v[2],
            out_of_service: v[3],
        }
    }
}

impl From<StatusFlags> for [bool; 4] {
    fn from(s: StatusFlags) -> Self {
        [s.in_alarm, s.fault, s.overridden, s.out_of_service]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventState {
    #[default]
    Normal,
    Fault,
    Offnormal,
}

/// Binary present value as carried by binary output objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryPv {
    Inactive,
    Active,
}

impl From<bool> for BinaryPv {
    fn from(active: bool) -> Self {
        if active {
            BinaryPv::Active
        } else {
            BinaryPv::Inactive
        }
    }
}

/// Present value in the encoding the owning object type uses on the wire
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PresentValue {
    /// Binary inputs report `0`/`1`
    Enumerated(u32),
    /// Binary outputs report `active`/`inactive`
    Binary(BinaryPv),
    Real(f32),
    Unsigned(u32),
}

/// Mode control attached to a multi-state point.
///
/// State `n` (1-based) puts every governed channel in `directions[n - 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeControl {
    pub pins: Vec<u8>,
    pub directions: Vec<Direction>,
}

impl ModeControl {
    pub fn direction_for(&self, state: u32) -> Option<Direction> {
        let index = usize::try_from(state).ok()?.checked_sub(1)?;
        self.directions.get(index).copied()
    }

    pub fn governs(&self, pin: u8) -> bool {
        self.pins.contains(&pin)
    }
}

/// Variant-specific point state
#[derive(Debug, Clone, PartialEq)]
pub enum PointKind {
    BinaryInput {
        present_value: bool,
        pin: Option<u8>,
    },
    BinaryOutput {
        present_value: bool,
        pin: Option<u8>,
        polarity: Polarity,
    },
    AnalogValue {
        present_value: f32,
        source: AnalogSource,
        units: Option<String>,
    },
    MultiState {
        /// Always in `1..=state_labels.len()`
        present_value: u32,
        state_labels: Vec<String>,
        mode: Option<ModeControl>,
    },
}

/// One addressable object
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub id: PointIdentifier,
    pub name: String,
    pub description: Option<String>,
    pub status: StatusFlags,
    pub event_state: EventState,
    pub last_update: DateTime<Utc>,
    pub kind: PointKind,
}

impl Point {
    fn with_kind(id: PointIdentifier, name: impl Into<String>, kind: PointKind) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            status: StatusFlags::default(),
            event_state: EventState::Normal,
            last_update: Utc::now(),
            kind,
        }
    }

    pub fn binary_input(instance: u32, name: impl Into<String>, pin: Option<u8>) -> Self {
        Self::with_kind(
            PointIdentifier::new(ObjectType::BinaryInput, instance),
            name,
            PointKind::BinaryInput {
                present_value: false,
                pin,
            },
        )
    }

    pub fn binary_output(
        instance: u32,
        name: impl Into<String>,
        pin: Option<u8>,
        polarity: Polarity,
    ) -> Self {
        Self::with_kind(
            PointIdentifier::new(ObjectType::BinaryOutput, instance),
            name,
            PointKind::BinaryOutput {
                present_value: false,
                pin,
                polarity,
            },
        )
    }

    pub fn analog_value(instance: u32, name: impl Into<String>, source: AnalogSource) -> Self {
        Self::with_kind(
            PointIdentifier::new(ObjectType::AnalogValue, instance),
            name,
            PointKind::AnalogValue {
                present_value: SENSOR_FALLBACK,
                source,
                units: None,
            },
        )
    }

    /// Multi-state value starting in state 1. `state_labels` must not be empty.
    pub fn multi_state(
        instance: u32,
        name: impl Into<String>,
        state_labels: Vec<String>,
        mode: Option<ModeControl>,
    ) -> Self {
        Self::with_kind(
            PointIdentifier::new(ObjectType::MultiStateValue, instance),
            name,
            PointKind::MultiState {
                present_value: 1,
                state_labels,
                mode,
            },
        )
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn role(&self) -> Role {
        match &self.kind {
            PointKind::BinaryInput { pin: Some(_), .. } => Role::Input,
            PointKind::BinaryOutput { pin: Some(_), .. } => Role::Output,
            PointKind::AnalogValue {
                source: AnalogSource::Sensor(_),
                ..
            } => Role::Sensor,
            PointKind::MultiState { mode: Some(_), .. } => Role::Mode,
            _ => Role::Passive,
        }
    }

    /// Pin of the channel this point is bound to, if any
    pub fn pin(&self) -> Option<u8> {
        match &self.kind {
            PointKind::BinaryInput { pin, .. } | PointKind::BinaryOutput { pin, .. } => *pin,
            _ => None,
        }
    }

    pub fn out_of_service(&self) -> bool {
        self.status.out_of_service
    }

    pub fn present_value(&self) -> PresentValue {
        match &self.kind {
            PointKind::BinaryInput { present_value, .. } => {
                PresentValue::Enumerated(u32::from(*present_value))
            }
            PointKind::BinaryOutput { present_value, .. } => {
                PresentValue::Binary((*present_value).into())
            }
            PointKind::AnalogValue { present_value, .. } => PresentValue::Real(*present_value),
            PointKind::MultiState { present_value, .. } => PresentValue::Unsigned(*present_value),
        }
    }

    pub fn set_fault(&mut self, fault: bool) {
        self.status.fault = fault;
        self.event_state = if fault {
            EventState::Fault
        } else {
            EventState::Normal
        };
    }

    pub(crate) fn touch(&mut self) {
        self.last_update = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_follow_binding() {
        assert_eq!(Point::binary_input(1, "bi", Some(17)).role(), Role::Input);
        assert_eq!(Point::binary_input(2, "bi", None).role(), Role::Passive);
        assert_eq!(
            Point::binary_output(1, "bo", Some(27), Polarity::Normal).role(),
            Role::Output
        );
        let sensor = SensorId {
            sensor: "dht".into(),
            quantity: Quantity::Temperature,
        };
        assert_eq!(
            Point::analog_value(1, "av", AnalogSource::Sensor(sensor)).role(),
            Role::Sensor
        );
        assert_eq!(
            Point::analog_value(2, "av", AnalogSource::Manual).role(),
            Role::Passive
        );
        let mode = ModeControl {
            pins: vec![17],
            directions: vec![Direction::Input, Direction::Output],
        };
        assert_eq!(
            Point::multi_state(1, "mode", vec!["read".into(), "write".into()], Some(mode)).role(),
            Role::Mode
        );
    }

    #[test]
    fn test_binary_encodings_differ_by_type() {
        let mut bi = Point::binary_input(1, "bi", Some(17));
        let mut bo = Point::binary_output(1, "bo", Some(27), Polarity::Normal);
        if let PointKind::BinaryInput { present_value, .. } = &mut bi.kind {
            *present_value = true;
        }
        if let PointKind::BinaryOutput { present_value, .. } = &mut bo.kind {
            *present_value = true;
        }
        assert_eq!(bi.present_value(), PresentValue::Enumerated(1));
        assert_eq!(bo.present_value(), PresentValue::Binary(BinaryPv::Active));
        assert_eq!(
            serde_json::to_value(bo.present_value()).unwrap(),
            serde_json::json!("active")
        );
    }

    #[test]
    fn test_polarity() {
        assert!(Polarity::Normal.apply(true));
        assert!(!Polarity::Reverse.apply(true));
        assert!(Polarity::Reverse.apply(false));
    }

    #[test]
    fn test_mode_direction_lookup() {
        let mode = ModeControl {
            pins: vec![5, 6],
            directions: vec![Direction::Input, Direction::Output],
        };
        assert_eq!(mode.direction_for(1), Some(Direction::Input));
        assert_eq!(mode.direction_for(2), Some(Direction::Output));
        assert_eq!(mode.direction_for(0), None);
        assert_eq!(mode.direction_for(3), None);
        assert!(mode.governs(6));
        assert!(!mode.governs(7));
    }

    #[test]
    fn test_status_flags_roundtrip_array() {
        let flags: StatusFlags = serde_json::from_str("[false, true, false, true]").unwrap();
        assert!(flags.fault);
        assert!(flags.out_of_service);
        assert_eq!(<[bool; 4]>::from(flags), [false, true, false, true]);
    }
}
