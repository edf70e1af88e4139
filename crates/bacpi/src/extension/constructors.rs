//! Closed table of constructible point kinds

use super::{EntryParams, LoadContext, LoadError};
use crate::point::{
    AnalogSource, ObjectType, Point, PointIdentifier, PointKind, Polarity, StatusFlags,
    coerce_binary, coerce_real, coerce_state,
};

type Build = fn(PointIdentifier, &EntryParams, &LoadContext) -> Result<Point, LoadError>;

/// One constructible kind and the names that select it
pub struct KindEntry {
    pub names: &'static [&'static str],
    pub object_type: ObjectType,
    build: Build,
}

impl KindEntry {
    /// Construct the point and apply the parameters shared by every kind
    pub fn build(
        &self,
        id: PointIdentifier,
        params: &EntryParams,
        ctx: &LoadContext,
    ) -> Result<Point, LoadError> {
        let mut point = (self.build)(id, params, ctx)?;

        if let Some(description) = &params.description {
            point.description = Some(description.clone());
        }
        if let Some(flags) = &params.status_flags {
            let flags: [bool; 4] = flags.as_slice().try_into().map_err(|_| {
                LoadError::Malformed(format!(
                    "statusFlags needs 4 booleans, got {}",
                    flags.len()
                ))
            })?;
            point.status = StatusFlags::from(flags);
            point.set_fault(point.status.fault);
        }
        if let Some(out_of_service) = params.out_of_service {
            point.status.out_of_service = out_of_service;
        }
        Ok(point)
    }
}

pub static KINDS: &[KindEntry] = &[
    KindEntry {
        names: &["BinaryInputObject", "binaryInput"],
        object_type: ObjectType::BinaryInput,
        build: build_binary_input,
    },
    KindEntry {
        names: &["BinaryOutputObject", "binaryOutput"],
        object_type: ObjectType::BinaryOutput,
        build: build_binary_output,
    },
    KindEntry {
        names: &["AnalogValueObject", "analogValue"],
        object_type: ObjectType::AnalogValue,
        build: build_analog_value,
    },
    KindEntry {
        names: &["MultiStateValueObject", "multiStateValue"],
        object_type: ObjectType::MultiStateValue,
        build: build_multi_state,
    },
];

pub fn resolve_kind(kind: &str) -> Option<&'static KindEntry> {
    KINDS.iter().find(|entry| entry.names.contains(&kind))
}

fn object_name(id: PointIdentifier, params: &EntryParams) -> String {
    params
        .object_name
        .clone()
        .unwrap_or_else(|| format!("{}_{}", id.object_type, id.instance))
}

fn bound_pin(params: &EntryParams, ctx: &LoadContext) -> Result<Option<u8>, LoadError> {
    match params.pin {
        Some(pin) if !ctx.pins.contains(&pin) => Err(LoadError::Malformed(format!(
            "pin {pin} is not in the channel map"
        ))),
        pin => Ok(pin),
    }
}

fn malformed(e: impl std::fmt::Display) -> LoadError {
    LoadError::Malformed(format!("presentValue: {e}"))
}

fn build_binary_input(
    id: PointIdentifier,
    params: &EntryParams,
    ctx: &LoadContext,
) -> Result<Point, LoadError> {
    if params.polarity == Some(Polarity::Reverse) {
        return Err(LoadError::Malformed("polarity applies to outputs only".into()));
    }
    let mut point = Point::binary_input(id.instance, object_name(id, params), bound_pin(params, ctx)?);
    if let (Some(value), PointKind::BinaryInput { present_value, .. }) =
        (&params.present_value, &mut point.kind)
    {
        *present_value = coerce_binary(value).map_err(malformed)?;
    }
    Ok(point)
}

fn build_binary_output(
    id: PointIdentifier,
    params: &EntryParams,
    ctx: &LoadContext,
) -> Result<Point, LoadError> {
    let mut point = Point::binary_output(
        id.instance,
        object_name(id, params),
        bound_pin(params, ctx)?,
        params.polarity.unwrap_or_default(),
    );
    if let (Some(value), PointKind::BinaryOutput { present_value, .. }) =
        (&params.present_value, &mut point.kind)
    {
        *present_value = coerce_binary(value).map_err(malformed)?;
    }
    Ok(point)
}

fn build_analog_value(
    id: PointIdentifier,
    params: &EntryParams,
    ctx: &LoadContext,
) -> Result<Point, LoadError> {
    let source = match &params.sensor {
        Some(sensor) => {
            let sensor = sensor.clone().into_sensor_id();
            if !ctx.sensors.contains(&sensor.sensor) {
                return Err(LoadError::Malformed(format!(
                    "unknown sensor '{}'",
                    sensor.sensor
                )));
            }
            AnalogSource::Sensor(sensor)
        }
        None => AnalogSource::Manual,
    };

    let mut point = Point::analog_value(id.instance, object_name(id, params), source);
    if let PointKind::AnalogValue {
        present_value,
        units,
        ..
    } = &mut point.kind
    {
        if let Some(value) = &params.present_value {
            *present_value = coerce_real(value).map_err(malformed)?;
        }
        units.clone_from(&params.units);
    }
    Ok(point)
}

fn build_multi_state(
    id: PointIdentifier,
    params: &EntryParams,
    _ctx: &LoadContext,
) -> Result<Point, LoadError> {
    let labels = match (&params.state_text, params.number_of_states) {
        (Some(text), Some(n)) if text.len() != n as usize => {
            return Err(LoadError::Malformed(format!(
                "numberOfStates {n} does not match {} stateText entries",
                text.len()
            )));
        }
        (Some(text), _) => text.clone(),
        (None, Some(n)) => (1..=n).map(|i| format!("State {i}")).collect(),
        (None, None) => {
            return Err(LoadError::Malformed(
                "multiStateValue needs stateText or numberOfStates".into(),
            ));
        }
    };
    if labels.is_empty() {
        return Err(LoadError::Malformed("multiStateValue needs at least one state".into()));
    }

    let mut point = Point::multi_state(id.instance, object_name(id, params), labels, None);
    if let (
        Some(value),
        PointKind::MultiState {
            present_value,
            state_labels,
            ..
        },
    ) = (&params.present_value, &mut point.kind)
    {
        *present_value = coerce_state(value, state_labels.len()).map_err(malformed)?;
    }
    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::{Quantity, Role};
    use serde_json::json;

    fn params(value: serde_json::Value) -> EntryParams {
        serde_json::from_value(value).unwrap()
    }

    fn ctx() -> LoadContext {
        LoadContext {
            pins: [5, 27].into_iter().collect(),
            sensors: ["dht11".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_kind_names() {
        for name in ["BinaryInputObject", "binaryInput"] {
            assert_eq!(resolve_kind(name).unwrap().object_type, ObjectType::BinaryInput);
        }
        assert_eq!(
            resolve_kind("MultiStateValueObject").unwrap().object_type,
            ObjectType::MultiStateValue
        );
        assert!(resolve_kind("BinaryValueObject").is_none());
        assert!(resolve_kind("device").is_none());
    }

    #[test]
    fn test_binary_output_with_polarity() {
        let id = PointIdentifier::new(ObjectType::BinaryOutput, 3);
        let entry = resolve_kind("binaryOutput").unwrap();
        let point = entry
            .build(
                id,
                &params(json!({"pin": 5, "polarity": "reverse", "presentValue": "active"})),
                &ctx(),
            )
            .unwrap();

        assert_eq!(point.name, "binaryOutput_3");
        assert_eq!(point.role(), Role::Output);
        assert_eq!(
            point.kind,
            PointKind::BinaryOutput {
                present_value: true,
                pin: Some(5),
                polarity: Polarity::Reverse,
            }
        );
    }

    #[test]
    fn test_unknown_bindings_rejected() {
        let entry = resolve_kind("binaryInput").unwrap();
        let id = PointIdentifier::new(ObjectType::BinaryInput, 9);
        assert!(entry.build(id, &params(json!({"pin": 6})), &ctx()).is_err());
        assert!(
            entry
                .build(id, &params(json!({"pin": 5, "polarity": "reverse"})), &ctx())
                .is_err()
        );

        let entry = resolve_kind("analogValue").unwrap();
        let id = PointIdentifier::new(ObjectType::AnalogValue, 9);
        assert!(entry.build(id, &params(json!({"sensor": "bme280"})), &ctx()).is_err());
    }

    #[test]
    fn test_sensor_backed_analog() {
        let entry = resolve_kind("AnalogValueObject").unwrap();
        let id = PointIdentifier::new(ObjectType::AnalogValue, 2);
        let point = entry
            .build(
                id,
                &params(json!({
                    "sensor": {"sensor": "dht11", "quantity": "humidity"},
                    "units": "percentRelativeHumidity"
                })),
                &ctx(),
            )
            .unwrap();

        assert_eq!(point.role(), Role::Sensor);
        match point.kind {
            PointKind::AnalogValue { source, units, .. } => {
                assert!(matches!(
                    source,
                    AnalogSource::Sensor(ref s) if s.quantity == Quantity::Humidity
                ));
                assert_eq!(units.as_deref(), Some("percentRelativeHumidity"));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_multi_state_labels() {
        let entry = resolve_kind("multiStateValue").unwrap();
        let id = PointIdentifier::new(ObjectType::MultiStateValue, 1);

        let point = entry
            .build(id, &params(json!({"numberOfStates": 3, "presentValue": 2})), &ctx())
            .unwrap();
        match &point.kind {
            PointKind::MultiState {
                present_value,
                state_labels,
                ..
            } => {
                assert_eq!(*present_value, 2);
                assert_eq!(state_labels, &["State 1", "State 2", "State 3"]);
            }
            other => panic!("unexpected kind {other:?}"),
        }

        assert!(entry.build(id, &params(json!({})), &ctx()).is_err());
        assert!(
            entry
                .build(id, &params(json!({"stateText": ["a", "b"], "numberOfStates": 3})), &ctx())
                .is_err()
        );
        assert!(
            entry
                .build(id, &params(json!({"stateText": ["a", "b"], "presentValue": 3})), &ctx())
                .is_err()
        );
    }

    #[test]
    fn test_status_flags_and_out_of_service() {
        let entry = resolve_kind("analogValue").unwrap();
        let id = PointIdentifier::new(ObjectType::AnalogValue, 4);

        let point = entry
            .build(
                id,
                &params(json!({"statusFlags": [false, true, false, false], "outOfService": true})),
                &ctx(),
            )
            .unwrap();
        assert!(point.status.fault);
        assert!(point.out_of_service());

        let err = entry
            .build(id, &params(json!({"statusFlags": [false, false, false]})), &ctx())
            .unwrap_err();
        assert!(matches!(err, LoadError::Malformed(_)));
    }
}
