use serde::Deserialize;
use serde_json::Value;

use super::LoadError;
use crate::point::{ObjectType, PointIdentifier, Polarity, SensorId};

/// Parameters of an extension entry. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryParams {
    pub object_identifier: Option<Value>,
    pub object_name: Option<String>,
    pub present_value: Option<Value>,
    pub status_flags: Option<Vec<bool>>,
    pub out_of_service: Option<bool>,
    pub description: Option<String>,
    pub units: Option<String>,
    pub pin: Option<u8>,
    pub polarity: Option<Polarity>,
    pub sensor: Option<SensorRef>,
    pub state_text: Option<Vec<String>>,
    pub number_of_states: Option<u32>,
}

/// `"dht11"` or `{"sensor": "dht11", "quantity": "humidity"}`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SensorRef {
    Name(String),
    Reading(SensorId),
}

impl SensorRef {
    pub fn into_sensor_id(self) -> SensorId {
        match self {
            SensorRef::Name(sensor) => SensorId {
                sensor,
                quantity: Default::default(),
            },
            SensorRef::Reading(id) => id,
        }
    }
}

/// Canonical identifier from `["type", n]`, `{"type": .., "instance": n}` or `"type:n"`
pub fn normalize_identifier(value: &Value) -> Result<PointIdentifier, LoadError> {
    let malformed = |reason: String| LoadError::Malformed(format!("objectIdentifier {value}: {reason}"));

    let (type_name, instance) = match value {
        Value::Array(parts) => match parts.as_slice() {
            [ty, n] => (ty, n),
            _ => return Err(malformed(format!("expected 2 elements, got {}", parts.len()))),
        },
        Value::Object(fields) => match (fields.get("type"), fields.get("instance")) {
            (Some(ty), Some(n)) => (ty, n),
            _ => return Err(malformed("expected type and instance".into())),
        },
        Value::String(s) => return s.parse().map_err(|e| malformed(format!("{e}"))),
        _ => return Err(malformed("unsupported form".into())),
    };

    let object_type: ObjectType = type_name
        .as_str()
        .ok_or_else(|| malformed("type must be a string".into()))?
        .parse()
        .map_err(|e| malformed(format!("{e}")))?;
    let instance = instance
        .as_u64()
        .ok_or_else(|| malformed("instance must be a non-negative integer".into()))?;

    PointIdentifier::checked(object_type, instance).map_err(|e| malformed(format!("{e}")))
}
