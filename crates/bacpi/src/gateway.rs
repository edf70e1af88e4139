//! Gateway context
//!
//! [`Gateway`] is the one value shared by the sync engine, the extension loader
//! and the protocol server. It owns the registry behind a single lock and the
//! hardware handle. The lock is held only for in-memory updates, never across
//! a hardware call.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{ChannelRole, GatewayConfig};
use crate::extension::{ExtensionLoader, LoadContext, LoadReport};
use crate::hardware::{HardwareError, IoBackend};
use crate::point::{
    AnalogSource, Channel, ModeControl, Point, PointIdentifier, PointKind, PresentValue,
    ValueError, coerce_binary, coerce_real, coerce_state,
};
use crate::protocol::{ObjectDescriptor, ObjectServer};
use crate::registry::Registry;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Reasons an inbound write is refused
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WriteError {
    #[error("Unknown object: {0}")]
    UnknownObject(PointIdentifier),

    #[error("{0} is not writable while in service")]
    NotWritable(PointIdentifier),

    #[error("Invalid value for {id}: {source}")]
    InvalidValue {
        id: PointIdentifier,
        #[source]
        source: ValueError,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Bootstrap
// ─────────────────────────────────────────────────────────────────────────────

/// Points and channels built from the settings at startup
#[derive(Debug)]
pub struct Bootstrap {
    pub registry: Registry,
    pub channels: Vec<Channel>,
    pub load_context: LoadContext,
}

impl Bootstrap {
    /// Build the static points and the channel map.
    ///
    /// A pin listed more than once takes the direction of its first entry.
    /// Pins governed by the mode point start in the direction of its initial
    /// state.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut registry = Registry::new(config.device.instance);
        let mut channels: BTreeMap<u8, Channel> = BTreeMap::new();

        for channel in &config.channels {
            channels.entry(channel.pin).or_insert(Channel {
                pin: channel.pin,
                direction: channel.initial_direction(),
            });

            let point = match channel.role {
                ChannelRole::Input => {
                    Point::binary_input(channel.instance, channel.object_name(), Some(channel.pin))
                }
                ChannelRole::Output => Point::binary_output(
                    channel.instance,
                    channel.object_name(),
                    Some(channel.pin),
                    channel.polarity,
                ),
            };
            add_bootstrap(&mut registry, with_description(point, &channel.description));
        }

        for analog in &config.analog {
            let source = match &analog.sensor {
                Some(sensor) => AnalogSource::Sensor(sensor.clone()),
                None => AnalogSource::Manual,
            };
            let mut point = Point::analog_value(analog.instance, analog.name.as_str(), source);
            if let PointKind::AnalogValue { units, .. } = &mut point.kind {
                units.clone_from(&analog.units);
            }
            add_bootstrap(&mut registry, with_description(point, &analog.description));
        }

        if let Some(mode) = &config.mode {
            let control = ModeControl {
                pins: mode.pins.clone(),
                directions: mode.directions.clone(),
            };
            if let Some(direction) = control.direction_for(mode.initial) {
                for pin in &control.pins {
                    if let Some(channel) = channels.get_mut(pin) {
                        channel.direction = direction;
                    }
                }
            }

            let mut point =
                Point::multi_state(mode.instance, mode.name.as_str(), mode.states.clone(), Some(control));
            if let PointKind::MultiState { present_value, .. } = &mut point.kind {
                *present_value = mode.initial;
            }
            add_bootstrap(&mut registry, point);
        }

        let load_context = LoadContext {
            pins: channels.keys().copied().collect(),
            sensors: config.sensors.iter().map(|s| s.name.clone()).collect(),
        };

        info!(
            "Bootstrap: {} points on {} channels",
            registry.len(),
            channels.len()
        );

        Self {
            registry,
            channels: channels.into_values().collect(),
            load_context,
        }
    }

    /// Put every channel in its initial direction
    pub fn configure_channels(&self, backend: &dyn IoBackend) -> Result<(), HardwareError> {
        for channel in &self.channels {
            backend.configure_channel(channel.pin, channel.direction)?;
            debug!(pin = channel.pin, direction = %channel.direction, "Channel configured");
        }
        Ok(())
    }
}

fn with_description(point: Point, description: &Option<String>) -> Point {
    match description {
        Some(d) => point.with_description(d.as_str()),
        None => point,
    }
}

fn add_bootstrap(registry: &mut Registry, point: Point) {
    if let Err(e) = registry.add(point) {
        warn!("Skipping bootstrap point: {}", e);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────────────────────────

struct GatewayInner {
    registry: Mutex<Registry>,
    backend: Arc<dyn IoBackend>,
    load_context: LoadContext,
}

/// Shared gateway context (cheap to clone)
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(registry: Registry, backend: Arc<dyn IoBackend>, load_context: LoadContext) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                registry: Mutex::new(registry),
                backend,
                load_context,
            }),
        }
    }

    pub fn backend(&self) -> Arc<dyn IoBackend> {
        Arc::clone(&self.inner.backend)
    }

    /// Run `f` with the registry locked. `f` must not block.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        f(&mut self.inner.registry.lock())
    }

    /// Snapshot of one point
    pub fn point(&self, id: &PointIdentifier) -> Option<Point> {
        self.with_registry(|r| r.lookup(id).cloned())
    }

    pub fn point_count(&self) -> usize {
        self.with_registry(|r| r.len())
    }

    /// Run one loader pass over the extension file
    pub async fn load_extensions(&self, path: impl AsRef<Path>) -> LoadReport {
        let entries = match ExtensionLoader::read_entries(path.as_ref()).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("{}; continuing with bootstrap points only", e);
                return LoadReport::default();
            }
        };
        self.with_registry(|r| ExtensionLoader::load_entries(&entries, r, &self.inner.load_context))
    }

    /// Register points with the protocol server, all of them when `ids` is `None`.
    ///
    /// Returns the number of accepted registrations.
    pub fn publish(&self, server: &dyn ObjectServer, ids: Option<&[PointIdentifier]>) -> usize {
        let descriptors: Vec<ObjectDescriptor> = self.with_registry(|r| match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| r.lookup(id))
                .map(ObjectDescriptor::from)
                .collect(),
            None => {
                let mut all: Vec<_> = r.iter().map(ObjectDescriptor::from).collect();
                all.sort_by_key(|d| d.object_identifier);
                all
            }
        });

        let mut accepted = 0;
        for descriptor in descriptors {
            let id = descriptor.object_identifier;
            match server.add_object(descriptor) {
                Ok(()) => accepted += 1,
                Err(e) => warn!(object = %id, "Protocol server rejected object: {}", e),
            }
        }
        accepted
    }

    pub fn read_present_value(&self, id: &PointIdentifier) -> Option<PresentValue> {
        self.with_registry(|r| r.lookup(id).map(Point::present_value))
    }

    /// Apply an inbound protocol write. Seen by the sync engine on its next tick.
    pub fn write_present_value(&self, id: &PointIdentifier, value: &Value) -> Result<(), WriteError> {
        let result = self.with_registry(|r| {
            let point = r.lookup_mut(id).ok_or(WriteError::UnknownObject(*id))?;
            apply_write(point, value)?;
            point.touch();
            Ok(())
        });

        match &result {
            Ok(()) => debug!(object = %id, value = %value, "Present value written"),
            Err(e) => warn!(object = %id, "Write rejected: {}", e),
        }
        result
    }

    /// Take a point out of service, or return it to service
    pub fn set_out_of_service(&self, id: &PointIdentifier, out_of_service: bool) -> Result<(), WriteError> {
        self.with_registry(|r| {
            let point = r.lookup_mut(id).ok_or(WriteError::UnknownObject(*id))?;
            point.status.out_of_service = out_of_service;
            Ok(())
        })
    }
}

fn apply_write(point: &mut Point, value: &Value) -> Result<(), WriteError> {
    let id = point.id;
    let out_of_service = point.out_of_service();
    let invalid = |source| WriteError::InvalidValue { id, source };

    match &mut point.kind {
        PointKind::BinaryInput { present_value, .. } => {
            if !out_of_service {
                return Err(WriteError::NotWritable(id));
            }
            *present_value = coerce_binary(value).map_err(invalid)?;
        }
        PointKind::BinaryOutput { present_value, .. } => {
            *present_value = coerce_binary(value).map_err(invalid)?;
        }
        PointKind::AnalogValue {
            present_value,
            source,
            ..
        } => {
            if matches!(source, AnalogSource::Sensor(_)) && !out_of_service {
                return Err(WriteError::NotWritable(id));
            }
            *present_value = coerce_real(value).map_err(invalid)?;
        }
        PointKind::MultiState {
            present_value,
            state_labels,
            ..
        } => {
            *present_value = coerce_state(value, state_labels.len()).map_err(invalid)?;
        }
    }
    Ok(())
}
