//! Transport service
//!
//! Runs the [`BipServer`] receive loop for the lifetime of the service and
//! renews the foreign device registration once per tick.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::warn;

use super::BipServer;
use crate::service::{Service, ServiceContext, ServiceResult, ServiceSpec};

pub const TRANSPORT_SERVICE_ID: &str = "bacnet-transport";

/// Foreign device registration target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignDevice {
    pub bbmd: SocketAddr,
    /// Registration lifetime (seconds)
    pub ttl: u16,
}

impl ForeignDevice {
    /// Renew at half the lifetime so the entry never lapses
    fn renewal_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.ttl.max(2) / 2))
    }
}

pub struct TransportService {
    server: Arc<BipServer>,
    foreign: Option<ForeignDevice>,
    receiver: Option<JoinHandle<()>>,
}

impl TransportService {
    pub fn new(server: Arc<BipServer>, foreign: Option<ForeignDevice>) -> Self {
        Self {
            server,
            foreign,
            receiver: None,
        }
    }
}

#[async_trait]
impl Service for TransportService {
    fn spec(&self) -> ServiceSpec {
        let spec = ServiceSpec::new(TRANSPORT_SERVICE_ID, "BACnet/IP Transport")
            .with_description(format!("UDP endpoint on {}", self.server.bind_address()));
        match self.foreign {
            Some(fd) => spec.with_tick_interval(fd.renewal_interval()),
            None => spec,
        }
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.receiver = Some(tokio::spawn(self.server.clone().receive_loop()));
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
        Ok(())
    }

    /// The first tick fires immediately, which performs the initial registration
    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        if let Some(fd) = self.foreign {
            if let Err(e) = self.server.register_foreign_device(fd.bbmd, fd.ttl).await {
                // Continue unregistered; the next tick retries
                warn!("{}", e);
            }
        }
        Ok(())
    }
}
