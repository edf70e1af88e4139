//! Managed services
//!
//! The gateway's long-running loops (the BACnet/IP transport and the sync
//! engine) implement [`Service`] and are driven by the [`ServiceManager`],
//! which owns their tick timers and the shared shutdown signal.
//!
//! # Lifecycle
//!
//! - `on_start`: once, before the first tick; an error leaves the service `Failed`
//! - `on_tick`: every `tick_interval` and on [`ServiceHandle::force_tick`];
//!   errors are logged and the schedule continues
//! - `on_stop`: once after shutdown, bounded by `shutdown_timeout`

mod handle;
mod manager;

pub use handle::*;
pub use manager::*;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

// ─────────────────────────────────────────────────────────────────────────────
// Service Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    #[error("Service not running: {0}")]
    NotRunning(String),

    /// Raised by a service's own lifecycle hook
    #[error("{0}")]
    Hook(String),

    #[error("Shutdown timeout")]
    ShutdownTimeout,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ─────────────────────────────────────────────────────────────────────────────
// Service Spec
// ─────────────────────────────────────────────────────────────────────────────

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Static description of a service, read once at spawn time
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub id: String,
    pub name: String,
    /// `None` means the service only ticks on demand
    pub tick_interval: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub description: Option<String>,
}

impl ServiceSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tick_interval: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            description: None,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Context
// ─────────────────────────────────────────────────────────────────────────────

/// Per-service bookkeeping handed to every hook
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub service_id: String,
    /// Ticks completed so far, scheduled or forced
    pub ticks: u64,
    /// Set when `on_start` succeeds
    pub started_at: Option<DateTime<Utc>>,
}

impl ServiceContext {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            ticks: 0,
            started_at: None,
        }
    }

    /// Time since `on_start` returned, zero before that
    pub fn uptime(&self) -> Duration {
        self.started_at
            .and_then(|t| (Utc::now() - t).to_std().ok())
            .unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Trait
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn spec(&self) -> ServiceSpec;

    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    /// The service ends up `Stopped` or `Failed` whatever this returns.
    async fn on_stop(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults_to_on_demand_ticks() {
        let spec = ServiceSpec::new("sync", "Synchronization Engine");
        assert_eq!(spec.tick_interval, None);
        assert_eq!(spec.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);

        let spec = spec
            .with_tick_interval(Duration::from_secs(5))
            .with_shutdown_timeout(Duration::from_secs(2))
            .with_description("GPIO reconciliation");
        assert_eq!(spec.tick_interval, Some(Duration::from_secs(5)));
        assert_eq!(spec.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(spec.description.as_deref(), Some("GPIO reconciliation"));
    }

    #[test]
    fn test_uptime_before_start_is_zero() {
        let ctx = ServiceContext::new("sync");
        assert_eq!(ctx.uptime(), Duration::ZERO);
    }
}
