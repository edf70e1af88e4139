//! Service handle
//!
//! Cloneable view of a spawned service. State is published over a
//! `watch` channel so callers can await transitions instead of polling.

use std::fmt;

use tokio::sync::{mpsc, oneshot, watch};

use super::{ServiceError, ServiceResult};

// ─────────────────────────────────────────────────────────────────────────────
// Service State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
    /// Stopped after a clean `on_stop`
    Stopped,
    /// Start failure, stop failure, stop timeout or panic
    Failed,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sender half owned by the service task
pub(crate) type StateTx = watch::Sender<ServiceState>;

// ─────────────────────────────────────────────────────────────────────────────
// Service Command
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) enum ServiceCommand {
    /// Run one tick now; the sender fires once it completes
    ForceTick(oneshot::Sender<()>),
    Shutdown,
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Handle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ServiceHandle {
    pub service_id: String,
    command_tx: mpsc::Sender<ServiceCommand>,
    state_rx: watch::Receiver<ServiceState>,
}

impl ServiceHandle {
    pub(crate) fn new(
        service_id: String,
        command_tx: mpsc::Sender<ServiceCommand>,
        state_rx: watch::Receiver<ServiceState>,
    ) -> Self {
        Self {
            service_id,
            command_tx,
            state_rx,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Wait until the service leaves `Starting`.
    pub async fn started(&self) -> ServiceState {
        self.wait_until(|s| *s != ServiceState::Starting).await
    }

    /// Wait until the service is `Stopped` or `Failed`.
    pub async fn terminated(&self) -> ServiceState {
        self.wait_until(|s| s.is_terminal()).await
    }

    async fn wait_until(&self, done: impl FnMut(&ServiceState) -> bool) -> ServiceState {
        let mut rx = self.state_rx.clone();
        match rx.wait_for(done).await {
            Ok(state) => *state,
            // The task dropped its sender without a final state; treat it as a crash
            Err(_) => ServiceState::Failed,
        }
    }

    /// Run one tick out of schedule and wait for it to finish
    pub async fn force_tick(&self) -> ServiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(ServiceCommand::ForceTick(tx))
            .await
            .map_err(|_| ServiceError::NotRunning(self.service_id.clone()))?;

        rx.await.map_err(|_| ServiceError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> ServiceResult<()> {
        self.command_tx
            .send(ServiceCommand::Shutdown)
            .await
            .map_err(|_| ServiceError::NotRunning(self.service_id.clone()))
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("service_id", &self.service_id)
            .field("state", &self.state())
            .finish()
    }
}
