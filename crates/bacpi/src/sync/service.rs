//! Sync service
//!
//! Drives [`SyncEngine::tick`] from the service manager's fixed-period timer.
//! The timer re-arms only after a tick returns, so ticks never overlap.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::SyncEngine;
use crate::service::{Service, ServiceContext, ServiceResult, ServiceSpec};

pub const SYNC_SERVICE_ID: &str = "sync";

pub struct SyncService {
    engine: SyncEngine,
    period: Duration,
}

impl SyncService {
    pub fn new(engine: SyncEngine, period: Duration) -> Self {
        Self { engine, period }
    }
}

#[async_trait]
impl Service for SyncService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new(SYNC_SERVICE_ID, "Synchronization Engine")
            .with_tick_interval(self.period)
            .with_description("Reconciles points with physical channels")
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        info!(
            "Sync engine starting: {} points, period {:?}",
            self.engine.gateway().point_count(),
            self.period
        );
        Ok(())
    }

    async fn on_stop(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        info!(
            "Sync engine stopped after {} ticks ({}s uptime)",
            ctx.ticks,
            ctx.uptime().as_secs()
        );
        Ok(())
    }

    async fn on_tick(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let report = self.engine.tick().await;
        debug!(
            tick = ctx.ticks,
            inputs = report.inputs_read,
            outputs = report.outputs_written,
            sensors = report.sensors_refreshed,
            fallbacks = report.fallbacks,
            errors = report.errors,
            "Tick"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::{Bootstrap, Gateway};
    use crate::hardware::SimulatedBackend;
    use crate::point::{ObjectType, PointIdentifier, PresentValue};
    use crate::service::{ServiceManager, ServiceState};
    use serde_json::json;
    use std::sync::Arc;

    fn service(period: Duration) -> (SyncService, Gateway, Arc<SimulatedBackend>) {
        let backend = Arc::new(SimulatedBackend::new());
        let bootstrap = Bootstrap::from_config(&GatewayConfig::default());
        bootstrap.configure_channels(backend.as_ref()).unwrap();
        let gateway = Gateway::new(bootstrap.registry, backend.clone(), bootstrap.load_context);
        let engine = SyncEngine::new(gateway.clone(), bootstrap.channels);
        (SyncService::new(engine, period), gateway, backend)
    }

    #[tokio::test]
    async fn test_force_tick_applies_network_write() {
        let (service, gateway, backend) = service(Duration::from_secs(3600));
        let manager = ServiceManager::new();
        let handle = manager.spawn(service).await.unwrap();

        let bo1 = PointIdentifier::new(ObjectType::BinaryOutput, 1);
        gateway.write_present_value(&bo1, &json!(1)).unwrap();
        handle.force_tick().await.unwrap();
        assert_eq!(backend.writes().last(), Some(&(27, true)));

        manager.stop(SYNC_SERVICE_ID).await.unwrap();
        assert_eq!(handle.state(), ServiceState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_follow_period() {
        let (service, gateway, backend) = service(Duration::from_secs(5));
        let manager = ServiceManager::new();
        manager.spawn(service).await.unwrap();

        backend.set_input(17, true);
        tokio::time::sleep(Duration::from_millis(12_500)).await;

        let bi1 = PointIdentifier::new(ObjectType::BinaryInput, 1);
        assert_eq!(
            gateway.read_present_value(&bi1),
            Some(PresentValue::Enumerated(1))
        );
        // Ticks at 0 s, 5 s and 10 s
        assert_eq!(backend.writes().len(), 3);

        manager.shutdown_all().await.unwrap();
    }
}
