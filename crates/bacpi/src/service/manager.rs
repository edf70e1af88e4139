//! Service manager
//!
//! Spawns each [`Service`] onto its own task, drives its tick timer and
//! tears everything down on the shared shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use super::{
    Service, ServiceCommand, ServiceContext, ServiceError, ServiceHandle, ServiceResult,
    ServiceState, StateTx,
};

const COMMAND_QUEUE: usize = 16;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

struct Entry {
    handle: ServiceHandle,
    task: JoinHandle<ServiceResult<()>>,
    stop_budget: Duration,
}

/// Owns every spawned service, keyed by service id
pub struct ServiceManager {
    services: DashMap<String, Entry>,
    shutdown: broadcast::Sender<()>,
    drain_timeout: Duration,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            services: DashMap::new(),
            shutdown,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Start `service` on its own task. Ids are unique per manager.
    pub async fn spawn<S: Service>(&self, service: S) -> ServiceResult<ServiceHandle> {
        let spec = service.spec();
        if self.services.contains_key(&spec.id) {
            return Err(ServiceError::AlreadyRunning(spec.id));
        }
        tracing::debug!(
            service_id = %spec.id,
            name = %spec.name,
            description = spec.description.as_deref().unwrap_or(""),
            "Spawning service"
        );

        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(ServiceState::Starting);
        let state = Arc::new(state_tx);
        let handle = ServiceHandle::new(spec.id.clone(), command_tx, state_rx);

        let runner = Runner {
            service,
            ctx: ServiceContext::new(spec.id.clone()),
            commands,
            shutdown: self.shutdown.subscribe(),
            state: Arc::clone(&state),
            timer: spec.tick_interval.map(tick_timer),
            stop_timeout: spec.shutdown_timeout,
        };
        let inner = tokio::spawn(runner.run());

        // A panic unwinds past the runner, so the final state is published here
        let service_id = spec.id.clone();
        let task = tokio::spawn(async move {
            inner.await.unwrap_or_else(|e| {
                state.send_replace(ServiceState::Failed);
                tracing::error!(service_id = %service_id, error = ?e, "Service task panicked");
                Err(ServiceError::Internal(format!("service task panicked: {e}")))
            })
        });

        self.services.insert(
            spec.id,
            Entry {
                handle: handle.clone(),
                task,
                stop_budget: spec.shutdown_timeout + Duration::from_secs(1),
            },
        );
        Ok(handle)
    }

    pub fn get(&self, service_id: &str) -> Option<ServiceHandle> {
        self.services.get(service_id).map(|e| e.handle.clone())
    }

    pub fn is_running(&self, service_id: &str) -> bool {
        self.get(service_id).is_some_and(|h| h.is_running())
    }

    /// Resolve once the service reaches a terminal state (or was never spawned)
    pub async fn wait_terminated(&self, service_id: &str) -> ServiceState {
        match self.get(service_id) {
            Some(handle) => handle.terminated().await,
            None => ServiceState::Stopped,
        }
    }

    /// Stop one service and wait for its task to finish
    pub async fn stop(&self, service_id: &str) -> ServiceResult<()> {
        let (_, entry) = self
            .services
            .remove(service_id)
            .ok_or_else(|| ServiceError::NotRunning(service_id.to_string()))?;

        // A closed command queue means the loop already exited
        let _ = entry.handle.shutdown().await;

        match tokio::time::timeout(entry.stop_budget, entry.task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ServiceError::Internal(format!("join failed: {e}"))),
            Err(_) => {
                tracing::warn!(service_id, "Timed out waiting for service to stop");
                Err(ServiceError::ShutdownTimeout)
            }
        }
    }

    /// Signal every service to stop and wait for all of them to settle
    pub async fn shutdown_all(&self) -> ServiceResult<()> {
        tracing::info!(count = self.services.len(), "Shutting down services");
        let _ = self.shutdown.send(());

        let handles: Vec<ServiceHandle> = self
            .services
            .iter()
            .map(|e| e.value().handle.clone())
            .collect();

        let drained = tokio::time::timeout(self.drain_timeout, async {
            for handle in &handles {
                let state = handle.terminated().await;
                self.services.remove(&handle.service_id);
                tracing::debug!(service_id = %handle.service_id, %state, "Service terminated");
            }
        })
        .await;

        drained.map_err(|_| {
            tracing::warn!(
                remaining = self.services.len(),
                "Services still running after drain timeout"
            );
            ServiceError::ShutdownTimeout
        })
    }

    /// Snapshot of every managed service and its state
    pub fn list(&self) -> Vec<(String, ServiceState)> {
        self.services
            .iter()
            .map(|e| (e.key().clone(), e.value().handle.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner
// ─────────────────────────────────────────────────────────────────────────────

/// The first tick fires immediately; a slow tick delays the next one rather
/// than bursting to catch up.
fn tick_timer(period: Duration) -> Interval {
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

enum Wake {
    Tick,
    Forced(tokio::sync::oneshot::Sender<()>),
    Stop(&'static str),
}

struct Runner<S> {
    service: S,
    ctx: ServiceContext,
    commands: mpsc::Receiver<ServiceCommand>,
    shutdown: broadcast::Receiver<()>,
    state: Arc<StateTx>,
    timer: Option<Interval>,
    stop_timeout: Duration,
}

impl<S: Service> Runner<S> {
    async fn run(mut self) -> ServiceResult<()> {
        if let Err(e) = self.service.on_start(&self.ctx).await {
            tracing::error!(service_id = %self.ctx.service_id, error = %e, "Service failed to start");
            self.state.send_replace(ServiceState::Failed);
            return Err(e);
        }
        self.ctx.started_at = Some(chrono::Utc::now());
        self.state.send_replace(ServiceState::Running);
        tracing::info!(service_id = %self.ctx.service_id, "Service running");

        loop {
            match self.next_wake().await {
                Wake::Tick => self.tick().await,
                Wake::Forced(done) => {
                    self.tick().await;
                    let _ = done.send(());
                }
                Wake::Stop(reason) => {
                    tracing::debug!(service_id = %self.ctx.service_id, reason, "Leaving service loop");
                    break;
                }
            }
        }

        self.finish().await
    }

    async fn next_wake(&mut self) -> Wake {
        let timer = self.timer.as_mut();
        tokio::select! {
            _ = self.shutdown.recv() => Wake::Stop("global shutdown"),
            cmd = self.commands.recv() => match cmd {
                Some(ServiceCommand::ForceTick(done)) => Wake::Forced(done),
                Some(ServiceCommand::Shutdown) => Wake::Stop("shutdown command"),
                None => Wake::Stop("all handles dropped"),
            },
            _ = async {
                match timer {
                    Some(timer) => { timer.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => Wake::Tick,
        }
    }

    async fn tick(&mut self) {
        if let Err(e) = self.service.on_tick(&self.ctx).await {
            tracing::warn!(service_id = %self.ctx.service_id, error = %e, "Tick failed");
        }
        self.ctx.ticks += 1;
    }

    async fn finish(mut self) -> ServiceResult<()> {
        self.state.send_replace(ServiceState::Stopping);

        let outcome = tokio::time::timeout(self.stop_timeout, self.service.on_stop(&self.ctx))
            .await
            .unwrap_or(Err(ServiceError::ShutdownTimeout));

        let service_id = &self.ctx.service_id;
        match &outcome {
            Ok(()) => {
                self.state.send_replace(ServiceState::Stopped);
                tracing::info!(service_id = %service_id, ticks = self.ctx.ticks, "Service stopped");
            }
            Err(e) => {
                self.state.send_replace(ServiceState::Failed);
                tracing::error!(service_id = %service_id, error = %e, "Service did not stop cleanly");
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceSpec;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Calls {
        start: AtomicUsize,
        tick: AtomicUsize,
        stop: AtomicUsize,
    }

    impl Calls {
        fn get(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Normal,
        RefuseStart,
        PanicOnTick,
    }

    struct Probe {
        id: &'static str,
        period: Option<Duration>,
        behaviour: Behaviour,
        calls: Arc<Calls>,
    }

    fn probe(id: &'static str, period: Option<Duration>) -> (Probe, Arc<Calls>) {
        probe_with(id, period, Behaviour::Normal)
    }

    fn probe_with(
        id: &'static str,
        period: Option<Duration>,
        behaviour: Behaviour,
    ) -> (Probe, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let probe = Probe {
            id,
            period,
            behaviour,
            calls: calls.clone(),
        };
        (probe, calls)
    }

    #[async_trait]
    impl Service for Probe {
        fn spec(&self) -> ServiceSpec {
            let spec = ServiceSpec::new(self.id, "Probe");
            match self.period {
                Some(period) => spec.with_tick_interval(period),
                None => spec,
            }
        }

        async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.calls.start.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::RefuseStart => Err(ServiceError::Hook("no hardware".into())),
                _ => Ok(()),
            }
        }

        async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            self.calls.stop.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            if let Behaviour::PanicOnTick = self.behaviour {
                panic!("tick exploded");
            }
            self.calls.tick.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_spawn_then_stop() {
        let manager = ServiceManager::new();
        let (service, calls) = probe("probe", None);

        let handle = manager.spawn(service).await.unwrap();
        assert_eq!(handle.started().await, ServiceState::Running);
        assert!(manager.is_running("probe"));
        assert_eq!(Calls::get(&calls.start), 1);

        manager.stop("probe").await.unwrap();
        assert_eq!(Calls::get(&calls.stop), 1);
        assert_eq!(handle.state(), ServiceState::Stopped);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_service() {
        let manager = ServiceManager::new();
        assert!(matches!(
            manager.stop("ghost").await,
            Err(ServiceError::NotRunning(_))
        ));
        assert_eq!(manager.wait_terminated("ghost").await, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_force_tick_runs_to_completion() {
        let manager = ServiceManager::new();
        let (service, calls) = probe("on-demand", None);

        let handle = manager.spawn(service).await.unwrap();
        handle.force_tick().await.unwrap();
        handle.force_tick().await.unwrap();
        assert_eq!(Calls::get(&calls.tick), 2);

        manager.shutdown_all().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks() {
        let manager = ServiceManager::new();
        let (service, calls) = probe("periodic", Some(Duration::from_secs(5)));

        manager.spawn(service).await.unwrap();
        // Immediate first tick, then at 5 s and 10 s
        tokio::time::sleep(Duration::from_millis(12_500)).await;
        assert_eq!(Calls::get(&calls.tick), 3);

        manager.shutdown_all().await.unwrap();
        assert_eq!(Calls::get(&calls.stop), 1);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let manager = ServiceManager::new();
        let (first, _) = probe("sync", None);
        let (second, second_calls) = probe("sync", None);

        manager.spawn(first).await.unwrap();
        assert!(matches!(
            manager.spawn(second).await,
            Err(ServiceError::AlreadyRunning(_))
        ));
        assert_eq!(Calls::get(&second_calls.start), 0);
        assert_eq!(manager.len(), 1);

        manager.shutdown_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_failure_is_terminal() {
        let manager = ServiceManager::new();
        let (service, calls) = probe_with("refusing", None, Behaviour::RefuseStart);
        let handle = manager.spawn(service).await.unwrap();

        assert_eq!(handle.started().await, ServiceState::Failed);
        assert_eq!(manager.wait_terminated("refusing").await, ServiceState::Failed);
        assert!(!manager.is_running("refusing"));
        assert_eq!(Calls::get(&calls.stop), 0);
    }

    #[tokio::test]
    async fn test_panic_marks_service_failed() {
        let manager = ServiceManager::new();
        let (service, _) = probe_with("panicky", None, Behaviour::PanicOnTick);
        let handle = manager.spawn(service).await.unwrap();

        assert!(handle.force_tick().await.is_err());
        assert_eq!(manager.wait_terminated("panicky").await, ServiceState::Failed);
        assert_eq!(manager.list(), vec![("panicky".to_string(), ServiceState::Failed)]);
    }
}
