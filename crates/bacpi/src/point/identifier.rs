//! Object identifiers
//!
//! A point is addressed on the network by its object type and instance number.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Largest instance number an object identifier can carry (22 bits).
pub const MAX_INSTANCE: u32 = 0x3F_FFFF;

/// Errors produced while parsing identifiers from configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("Unknown object type: {0}")]
    UnknownType(String),

    #[error("Instance {0} out of range (max {MAX_INSTANCE})")]
    InstanceOutOfRange(u64),

    #[error("Malformed identifier: {0}")]
    Malformed(String),
}

/// Object types the gateway can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectType {
    Device,
    BinaryInput,
    BinaryOutput,
    AnalogValue,
    MultiStateValue,
}

impl ObjectType {
    /// Canonical camelCase name, as used in identifier sequences
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Device => "device",
            ObjectType::BinaryInput => "binaryInput",
            ObjectType::BinaryOutput => "binaryOutput",
            ObjectType::AnalogValue => "analogValue",
            ObjectType::MultiStateValue => "multiStateValue",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = IdentifierError;

    /// Accepts `binaryInput`, `binary-input`, `binary_input` and any casing thereof.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "device" => Ok(Self::Device),
            "binaryinput" => Ok(Self::BinaryInput),
            "binaryoutput" => Ok(Self::BinaryOutput),
            "analogvalue" => Ok(Self::AnalogValue),
            "multistatevalue" => Ok(Self::MultiStateValue),
            _ => Err(IdentifierError::UnknownType(s.to_string())),
        }
    }
}

/// (object type, instance) pair, unique across the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PointIdentifier {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl PointIdentifier {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    /// Build an identifier, checking the instance fits in 22 bits
    pub fn checked(object_type: ObjectType, instance: u64) -> Result<Self, IdentifierError> {
        if instance > MAX_INSTANCE as u64 {
            return Err(IdentifierError::InstanceOutOfRange(instance));
        }
        Ok(Self::new(object_type, instance as u32))
    }

    pub fn device(instance: u32) -> Self {
        Self::new(ObjectType::Device, instance)
    }
}

impl fmt::Display for PointIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

impl FromStr for PointIdentifier {
    type Err = IdentifierError;

    /// Parses the `type:instance` form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, instance) = s
            .split_once(':')
            .ok_or_else(|| IdentifierError::Malformed(s.to_string()))?;
        let instance: u64 = instance
            .trim()
            .parse()
            .map_err(|_| IdentifierError::Malformed(s.to_string()))?;
        Self::checked(ty.trim().parse()?, instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_spellings() {
        assert_eq!("binaryInput".parse::<ObjectType>().unwrap(), ObjectType::BinaryInput);
        assert_eq!("binary-output".parse::<ObjectType>().unwrap(), ObjectType::BinaryOutput);
        assert_eq!("ANALOG_VALUE".parse::<ObjectType>().unwrap(), ObjectType::AnalogValue);
        assert!(matches!(
            "trendLog".parse::<ObjectType>(),
            Err(IdentifierError::UnknownType(_))
        ));
    }

    #[test]
    fn test_identifier_display_and_parse() {
        let id = PointIdentifier::new(ObjectType::MultiStateValue, 3);
        assert_eq!(id.to_string(), "multiStateValue:3");
        assert_eq!("multiStateValue:3".parse::<PointIdentifier>().unwrap(), id);
    }

    #[test]
    fn test_instance_range() {
        assert!(PointIdentifier::checked(ObjectType::AnalogValue, MAX_INSTANCE as u64).is_ok());
        assert_eq!(
            PointIdentifier::checked(ObjectType::AnalogValue, MAX_INSTANCE as u64 + 1),
            Err(IdentifierError::InstanceOutOfRange(MAX_INSTANCE as u64 + 1))
        );
    }
}
