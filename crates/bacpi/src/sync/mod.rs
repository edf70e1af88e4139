//! Synchronization Engine
//!
//! Each tick reconciles the registry with the hardware, in order:
//!
//! 1. Mode: if the mode point changed since the last applied value, move the
//!    channels it governs to the direction of the new state.
//! 2. Inputs: read every in-service input point whose channel is an input.
//! 3. Outputs: write every output point whose channel is an output, applying
//!    polarity.
//! 4. Sensors: refresh every in-service sensor-backed analog point, falling
//!    back to [`SENSOR_FALLBACK`] when no reading is available.
//!
//! Failures are recovered per point. The registry lock is taken only to
//! snapshot targets and to apply results.

mod service;

pub use service::*;

use std::collections::BTreeMap;

use tracing::{error, info, trace, warn};

use crate::gateway::Gateway;
use crate::hardware::HardwareError;
use crate::point::{
    AnalogSource, Channel, Direction, ModeControl, PointIdentifier, PointKind, Polarity, Role,
    SENSOR_FALLBACK, SensorId,
};

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Pins whose direction changed
    pub reconfigured: Vec<u8>,
    pub inputs_read: usize,
    pub outputs_written: usize,
    pub sensors_refreshed: usize,
    /// Sensor points that received the fallback value
    pub fallbacks: usize,
    /// Hardware operations that failed
    pub errors: usize,
}

pub struct SyncEngine {
    gateway: Gateway,
    channels: BTreeMap<u8, Channel>,
    /// Mode value whose directions are applied to the hardware
    applied_mode: Option<u32>,
}

impl SyncEngine {
    /// `channels` must reflect the directions already configured on the hardware
    pub fn new(gateway: Gateway, channels: impl IntoIterator<Item = Channel>) -> Self {
        let applied_mode = gateway.with_registry(|r| {
            r.mode_point().and_then(|p| match p.kind {
                PointKind::MultiState { present_value, .. } => Some(present_value),
                _ => None,
            })
        });

        Self {
            gateway,
            channels: channels.into_iter().map(|c| (c.pin, c)).collect(),
            applied_mode,
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn direction(&self, pin: u8) -> Option<Direction> {
        self.channels.get(&pin).map(|c| c.direction)
    }

    pub fn applied_mode(&self) -> Option<u32> {
        self.applied_mode
    }

    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        self.apply_mode(&mut report);
        self.sync_inputs(&mut report);
        self.sync_outputs(&mut report);
        self.sync_sensors(&mut report).await;
        trace!(?report, "Tick complete");
        report
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mode
    // ─────────────────────────────────────────────────────────────────────────

    fn apply_mode(&mut self, report: &mut TickReport) {
        let Some((id, state, control)) = self.gateway.with_registry(|r| {
            r.mode_point().and_then(|p| match &p.kind {
                PointKind::MultiState {
                    present_value,
                    mode: Some(control),
                    ..
                } => Some((p.id, *present_value, control.clone())),
                _ => None,
            })
        }) else {
            return;
        };

        if self.applied_mode == Some(state) {
            return;
        }

        let Some(target) = control.direction_for(state) else {
            warn!(object = %id, state, "Mode state has no direction");
            self.applied_mode = Some(state);
            return;
        };

        if self.reconfigure(&control, target, report) {
            info!(
                object = %id,
                "Mode changed {} -> {} ({})",
                self.applied_mode.map_or_else(|| "-".to_string(), |m| m.to_string()),
                state,
                target
            );
            self.applied_mode = Some(state);
        }
    }

    /// Move governed channels to `target`. Returns false if any failed, so the
    /// change is retried next tick.
    fn reconfigure(&mut self, control: &ModeControl, target: Direction, report: &mut TickReport) -> bool {
        let backend = self.gateway.backend();
        let mut complete = true;

        for pin in &control.pins {
            let Some(channel) = self.channels.get_mut(pin) else {
                warn!(pin, "Mode governs a pin outside the channel map");
                continue;
            };
            if channel.direction == target {
                continue;
            }
            match backend.configure_channel(*pin, target) {
                Ok(()) => {
                    channel.direction = target;
                    report.reconfigured.push(*pin);
                }
                Err(e) => {
                    error!(pin, "{}", e);
                    report.errors += 1;
                    complete = false;
                }
            }
        }
        complete
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Digital channels
    // ─────────────────────────────────────────────────────────────────────────

    fn sync_inputs(&mut self, report: &mut TickReport) {
        let targets: Vec<(PointIdentifier, u8)> = self.gateway.with_registry(|r| {
            r.iter_by_role(Role::Input)
                .filter(|p| !p.out_of_service())
                .filter_map(|p| p.pin().map(|pin| (p.id, pin)))
                .collect()
        });

        let backend = self.gateway.backend();
        for (id, pin) in targets {
            if self.direction(pin) != Some(Direction::Input) {
                trace!(object = %id, pin, "Channel not in input direction, skipping read");
                continue;
            }

            let result = backend.read_digital(pin);
            if result.is_ok() {
                report.inputs_read += 1;
            }
            self.apply_digital(id, pin, result.map(Some), report);
        }
    }

    fn sync_outputs(&mut self, report: &mut TickReport) {
        let targets: Vec<(PointIdentifier, u8, bool, Polarity)> = self.gateway.with_registry(|r| {
            r.iter_by_role(Role::Output)
                .filter(|p| !p.out_of_service())
                .filter_map(|p| match &p.kind {
                    PointKind::BinaryOutput {
                        present_value,
                        pin: Some(pin),
                        polarity,
                    } => Some((p.id, *pin, *present_value, *polarity)),
                    _ => None,
                })
                .collect()
        });

        let backend = self.gateway.backend();
        for (id, pin, value, polarity) in targets {
            // The mode decides whether the channel may be driven
            if self.direction(pin) != Some(Direction::Output) {
                trace!(object = %id, pin, "Channel not in output direction, skipping write");
                continue;
            }

            let result = backend.write_digital(pin, polarity.apply(value));
            if result.is_ok() {
                report.outputs_written += 1;
            }
            self.apply_digital(id, pin, result.map(|()| None), report);
        }
    }

    /// Record the outcome of a channel operation on its point. A read level
    /// becomes the present value; a failure keeps the value and sets `fault`.
    fn apply_digital(
        &self,
        id: PointIdentifier,
        pin: u8,
        result: Result<Option<bool>, HardwareError>,
        report: &mut TickReport,
    ) {
        if let Err(e) = &result {
            error!(object = %id, pin, "{}", e);
            report.errors += 1;
        }

        self.gateway.with_registry(|r| {
            let Some(point) = r.lookup_mut(&id) else {
                return;
            };
            match result {
                Ok(level) => {
                    if let (Some(level), PointKind::BinaryInput { present_value, .. }) =
                        (level, &mut point.kind)
                    {
                        *present_value = level;
                    }
                    point.set_fault(false);
                    point.touch();
                }
                Err(_) => point.set_fault(true),
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sensors
    // ─────────────────────────────────────────────────────────────────────────

    async fn sync_sensors(&mut self, report: &mut TickReport) {
        let targets: Vec<(PointIdentifier, SensorId)> = self.gateway.with_registry(|r| {
            r.iter_by_role(Role::Sensor)
                .filter(|p| !p.out_of_service())
                .filter_map(|p| match &p.kind {
                    PointKind::AnalogValue {
                        source: AnalogSource::Sensor(sensor),
                        ..
                    } => Some((p.id, sensor.clone())),
                    _ => None,
                })
                .collect()
        });

        for (id, sensor) in targets {
            let reading = self.read_sensor(&sensor).await;

            match reading {
                Some(_) => report.sensors_refreshed += 1,
                None => {
                    warn!(object = %id, %sensor, "No sensor reading, using fallback {}", SENSOR_FALLBACK);
                    report.fallbacks += 1;
                }
            }

            self.gateway.with_registry(|r| {
                let Some(point) = r.lookup_mut(&id) else {
                    return;
                };
                if let PointKind::AnalogValue { present_value, .. } = &mut point.kind {
                    *present_value = reading.unwrap_or(SENSOR_FALLBACK);
                }
                point.set_fault(reading.is_none());
                point.touch();
            });
        }
    }

    /// Sensor reads may block for their retry budget
    async fn read_sensor(&self, sensor: &SensorId) -> Option<f32> {
        let backend = self.gateway.backend();
        let sensor = sensor.clone();
        match tokio::task::spawn_blocking(move || backend.read_environmental(&sensor)).await {
            Ok(reading) => reading,
            Err(e) => {
                error!("Sensor read task failed: {}", e);
                None
            }
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("channels", &self.channels)
            .field("applied_mode", &self.applied_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, ChannelRole, GatewayConfig, ModeConfig};
    use crate::gateway::Bootstrap;
    use crate::hardware::SimulatedBackend;
    use crate::point::{ObjectType, PresentValue, Quantity};
    use serde_json::json;
    use std::sync::Arc;

    fn engine(config: &GatewayConfig) -> (SyncEngine, Arc<SimulatedBackend>) {
        let backend = Arc::new(SimulatedBackend::new());
        let bootstrap = Bootstrap::from_config(config);
        bootstrap.configure_channels(backend.as_ref()).unwrap();
        backend.clear_history();
        let gateway = Gateway::new(bootstrap.registry, backend.clone(), bootstrap.load_context);
        (SyncEngine::new(gateway, bootstrap.channels), backend)
    }

    fn dht11() -> SensorId {
        SensorId {
            sensor: "dht11".into(),
            quantity: Quantity::Temperature,
        }
    }

    fn channel(pin: u8, role: ChannelRole, instance: u32, polarity: Polarity) -> ChannelConfig {
        ChannelConfig {
            pin,
            role,
            direction: None,
            instance,
            name: None,
            description: None,
            polarity,
        }
    }

    /// Two read/write pins governed by a mode point, plus a fixed output on 27
    fn mode_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.channels = vec![
            channel(5, ChannelRole::Input, 1, Polarity::Normal),
            channel(5, ChannelRole::Output, 1, Polarity::Normal),
            channel(6, ChannelRole::Input, 2, Polarity::Normal),
            channel(6, ChannelRole::Output, 2, Polarity::Normal),
            channel(27, ChannelRole::Output, 3, Polarity::Normal),
        ];
        config.mode = Some(ModeConfig {
            instance: 1,
            name: "IO_Mode".into(),
            states: vec!["Read".into(), "Write".into()],
            directions: vec![Direction::Input, Direction::Output],
            initial: 1,
            pins: vec![5, 6],
        });
        config
    }

    fn bi(instance: u32) -> PointIdentifier {
        PointIdentifier::new(ObjectType::BinaryInput, instance)
    }

    fn bo(instance: u32) -> PointIdentifier {
        PointIdentifier::new(ObjectType::BinaryOutput, instance)
    }

    fn av1() -> PointIdentifier {
        PointIdentifier::new(ObjectType::AnalogValue, 1)
    }

    fn msv1() -> PointIdentifier {
        PointIdentifier::new(ObjectType::MultiStateValue, 1)
    }

    #[tokio::test]
    async fn test_input_tick_is_idempotent() {
        let (mut engine, backend) = engine(&GatewayConfig::default());
        backend.set_input(17, true);

        engine.tick().await;
        let first = engine.gateway().read_present_value(&bi(1));
        engine.tick().await;
        let second = engine.gateway().read_present_value(&bi(1));

        assert_eq!(first, Some(PresentValue::Enumerated(1)));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_output_polarity() {
        for (polarity, expected) in [(Polarity::Normal, true), (Polarity::Reverse, false)] {
            let mut config = GatewayConfig::default();
            config.channels[1].polarity = polarity;
            let (mut engine, backend) = engine(&config);

            engine
                .gateway()
                .write_present_value(&bo(1), &json!("active"))
                .unwrap();
            let report = engine.tick().await;

            assert_eq!(report.outputs_written, 1);
            assert_eq!(backend.writes(), vec![(27, expected)], "{polarity:?}");
        }
    }

    #[tokio::test]
    async fn test_mode_switch_reconfigures_governed_channels_only() {
        let (mut engine, backend) = engine(&mode_config());
        assert_eq!(engine.direction(5), Some(Direction::Input));
        assert_eq!(engine.direction(27), Some(Direction::Output));

        // Unchanged mode: no reconfiguration, governed outputs are not driven
        let report = engine.tick().await;
        assert!(report.reconfigured.is_empty());
        assert!(backend.configures().is_empty());
        assert_eq!(backend.writes(), vec![(27, false)]);

        engine.gateway().write_present_value(&msv1(), &json!(2)).unwrap();
        backend.clear_history();
        let report = engine.tick().await;

        assert_eq!(report.reconfigured, vec![5, 6]);
        assert_eq!(
            backend.configures(),
            vec![(5, Direction::Output), (6, Direction::Output)]
        );
        assert_eq!(engine.direction(27), Some(Direction::Output));
        assert_eq!(engine.applied_mode(), Some(2));

        // Governed pins now take writes; reads stop
        let mut written: Vec<u8> = backend.writes().iter().map(|(pin, _)| *pin).collect();
        written.sort_unstable();
        assert_eq!(written, vec![5, 6, 27]);

        backend.clear_history();
        let report = engine.tick().await;
        assert!(report.reconfigured.is_empty());
        assert_eq!(report.inputs_read, 0);
    }

    #[tokio::test]
    async fn test_failed_mode_change_retries() {
        let (mut engine, backend) = engine(&mode_config());
        engine.gateway().write_present_value(&msv1(), &json!(2)).unwrap();

        backend.fail_configure(6, true);
        let report = engine.tick().await;
        assert_eq!(report.reconfigured, vec![5]);
        assert_eq!(engine.applied_mode(), Some(1));

        backend.fail_configure(6, false);
        let report = engine.tick().await;
        assert_eq!(report.reconfigured, vec![6]);
        assert_eq!(engine.applied_mode(), Some(2));
    }

    #[tokio::test]
    async fn test_sensor_fallback_and_recovery() {
        let (mut engine, backend) = engine(&GatewayConfig::default());

        backend.set_sensor(&dht11(), Some(22.5));
        engine.tick().await;
        assert_eq!(engine.gateway().read_present_value(&av1()), Some(PresentValue::Real(22.5)));

        backend.set_sensor(&dht11(), None);
        for _ in 0..3 {
            let report = engine.tick().await;
            assert_eq!(report.fallbacks, 1);
            assert_eq!(
                engine.gateway().read_present_value(&av1()),
                Some(PresentValue::Real(SENSOR_FALLBACK))
            );
            assert!(engine.gateway().point(&av1()).unwrap().status.fault);
        }

        backend.set_sensor(&dht11(), Some(23.0));
        engine.tick().await;
        assert_eq!(engine.gateway().read_present_value(&av1()), Some(PresentValue::Real(23.0)));
        assert!(!engine.gateway().point(&av1()).unwrap().status.fault);
    }

    #[tokio::test]
    async fn test_read_error_keeps_value_and_sets_fault() {
        let (mut engine, backend) = engine(&GatewayConfig::default());
        backend.set_input(17, true);
        backend.set_sensor(&dht11(), Some(20.0));
        engine.tick().await;

        backend.fail_reads(17, true);
        backend.set_input(17, false);
        let report = engine.tick().await;

        assert_eq!(report.errors, 1);
        let point = engine.gateway().point(&bi(1)).unwrap();
        assert_eq!(point.present_value(), PresentValue::Enumerated(1));
        assert!(point.status.fault);

        // Other points are still processed in the same tick
        assert_eq!(report.outputs_written, 1);
        assert_eq!(report.sensors_refreshed, 1);

        backend.fail_reads(17, false);
        engine.tick().await;
        let point = engine.gateway().point(&bi(1)).unwrap();
        assert_eq!(point.present_value(), PresentValue::Enumerated(0));
        assert!(!point.status.fault);
    }

    #[tokio::test]
    async fn test_write_error_sets_fault() {
        let (mut engine, backend) = engine(&GatewayConfig::default());
        backend.fail_writes(27, true);
        let report = engine.tick().await;
        assert_eq!(report.errors, 1);
        assert!(engine.gateway().point(&bo(1)).unwrap().status.fault);
    }

    #[tokio::test]
    async fn test_out_of_service_points_skipped() {
        let (mut engine, backend) = engine(&GatewayConfig::default());
        engine.gateway().set_out_of_service(&bi(1), true).unwrap();
        engine.gateway().set_out_of_service(&av1(), true).unwrap();
        engine.gateway().set_out_of_service(&bo(1), true).unwrap();
        engine.gateway().write_present_value(&bo(1), &json!(1)).unwrap();
        engine
            .gateway()
            .write_present_value(&av1(), &json!(18.0))
            .unwrap();

        backend.set_input(17, true);
        backend.set_sensor(&dht11(), Some(30.0));
        let report = engine.tick().await;

        assert_eq!(report.inputs_read, 0);
        assert_eq!(report.sensors_refreshed, 0);
        assert_eq!(report.outputs_written, 0);
        assert!(backend.writes().is_empty());
        assert_eq!(engine.gateway().read_present_value(&bi(1)), Some(PresentValue::Enumerated(0)));
        assert_eq!(engine.gateway().read_present_value(&av1()), Some(PresentValue::Real(18.0)));
    }
}
