//! Bot lifecycle state machine: an explicit
//! `Stopped -> Starting -> Running -> Stopping -> Stopped` machine that owns
//! shutdown signaling and heartbeat publication for every background task.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::events::{BotStatusEvent, BusEvent, EventBus, PerformanceMetric};
use crate::metrics::Metrics;
use crate::types::{BotStatus, ExchangeApiStatus};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const RESTART_GUARD: Duration = Duration::from_secs(1);
const DEGRADED_AFTER_MISSED: u32 = 3;
const DOWN_AFTER_MISSED: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Inner {
    state: SupervisorState,
    started_at: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
}

/// Owns the process-wide shutdown channel and tracks every task spawned
/// under it. Only one `Running` instance is allowed per process, enforced
/// by `running_guard`.
pub struct BotSupervisor {
    inner: RwLock<Inner>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    running_guard: AtomicBool,
    consecutive_probe_failures: AtomicU32,
    metrics: Arc<Metrics>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    version: String,
    sys: parking_lot::Mutex<sysinfo::System>,
}

impl BotSupervisor {
    pub fn new(metrics: Arc<Metrics>, bus: Arc<EventBus>, clock: Arc<dyn Clock>, version: String) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            inner: RwLock::new(Inner {
                state: SupervisorState::Stopped,
                started_at: None,
                last_heartbeat: None,
            }),
            shutdown_tx,
            shutdown_rx,
            handles: tokio::sync::Mutex::new(Vec::new()),
            running_guard: AtomicBool::new(false),
            consecutive_probe_failures: AtomicU32::new(0),
            metrics,
            bus,
            clock,
            version,
            sys: parking_lot::Mutex::new(sysinfo::System::new_all()),
        })
    }

    pub fn state(&self) -> SupervisorState {
        self.inner.read().state
    }

    /// Clone of the shutdown receiver handed to every periodic task this
    /// supervisor starts; tasks select on `changed()` and exit when it
    /// flips to `true`.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Registers a spawned task's handle so `stop` can join it.
    pub async fn track(&self, handle: JoinHandle<()>) {
        self.handles.lock().await.push(handle);
    }

    /// Called by the credential probe (or any other liveness check) to feed
    /// the heartbeat's degraded/down classification.
    pub fn record_probe_result(&self, ok: bool) {
        if ok {
            self.consecutive_probe_failures.store(0, Ordering::Relaxed);
        } else {
            self.consecutive_probe_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn exchange_api_status(&self) -> ExchangeApiStatus {
        match self.consecutive_probe_failures.load(Ordering::Relaxed) {
            n if n >= DOWN_AFTER_MISSED => ExchangeApiStatus::Down,
            n if n >= DEGRADED_AFTER_MISSED => ExchangeApiStatus::Degraded,
            _ => ExchangeApiStatus::Ok,
        }
    }

    /// `Stopped -> Starting -> Running`. Fails if another instance is
    /// already running in this process.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running_guard.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("supervisor already running in this process"));
        }

        {
            let mut inner = self.inner.write();
            inner.state = SupervisorState::Starting;
        }
        self.shutdown_tx.send_replace(false);

        let now = self.clock.now();
        {
            let mut inner = self.inner.write();
            inner.state = SupervisorState::Running;
            inner.started_at = Some(now);
            inner.last_heartbeat = Some(now);
        }
        info!("supervisor entering RUNNING state");

        let this = Arc::clone(self);
        tokio::spawn(async move { this.heartbeat_loop().await });

        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut shutdown = self.shutdown_receiver();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.state() != SupervisorState::Running {
                        break;
                    }
                    self.emit_heartbeat();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    fn emit_heartbeat(&self) {
        let now = self.clock.now();
        self.inner.write().last_heartbeat = Some(now);
        let status = self.exchange_api_status();
        let uptime = self.uptime_secs();
        let api_response_time = self.metrics.mean_exchange_latency_ms("placeOrder");

        self.bus.publish(BusEvent::BotStatus(BotStatusEvent {
            is_running: true,
            last_heartbeat: now,
            exchange_api_status: status,
            api_response_time,
            uptime,
        }));

        self.bus.publish(BusEvent::PerformanceMetric(self.sample_performance(api_response_time)));
    }

    /// Samples process CPU/memory alongside the exchange latency and trade
    /// success rate already tracked in the metrics registry.
    fn sample_performance(&self, api_response_time: f64) -> PerformanceMetric {
        let mut sys = self.sys.lock();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu_usage = sys.global_cpu_info().cpu_usage() as f64;
        let memory_usage = sys.used_memory() as f64;

        PerformanceMetric {
            execution_time: self.metrics.mean_exchange_latency_ms("placeOrder"),
            success_rate: self.metrics.trade_success_rate(),
            api_response_time,
            memory_usage,
            cpu_usage,
        }
    }

    fn uptime_secs(&self) -> i64 {
        let inner = self.inner.read();
        match inner.started_at {
            Some(start) => self.clock.now().signed_duration_since(start).num_seconds(),
            None => 0,
        }
    }

    /// `Running -> Stopping -> Stopped`. Signals shutdown to every tracked
    /// task and joins them before returning.
    pub async fn stop(&self) {
        {
            let mut inner = self.inner.write();
            if inner.state == SupervisorState::Stopped {
                return;
            }
            inner.state = SupervisorState::Stopping;
        }
        info!("supervisor stopping, signaling shutdown to background tasks");
        let _ = self.shutdown_tx.send(true);

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task panicked during shutdown");
            }
        }

        self.inner.write().state = SupervisorState::Stopped;
        self.running_guard.store(false, Ordering::SeqCst);
        info!("supervisor stopped");
    }

    /// `stop` then `start` with a 1 s guard between them.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        self.stop().await;
        tokio::time::sleep(RESTART_GUARD).await;
        self.start()
    }

    pub fn status(&self) -> BotStatus {
        let inner = self.inner.read();
        BotStatus {
            is_running: inner.state == SupervisorState::Running,
            last_heartbeat: inner.last_heartbeat.unwrap_or_else(|| self.clock.now()),
            exchange_api_status: self.exchange_api_status(),
            api_response_time_ms: self.metrics.mean_exchange_latency_ms("placeOrder"),
            uptime_secs: self.uptime_secs(),
            version: self.version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn supervisor() -> Arc<BotSupervisor> {
        BotSupervisor::new(
            Arc::new(Metrics::default()),
            Arc::new(EventBus::new()),
            Arc::new(FakeClock::new(0)),
            "test".to_string(),
        )
    }

    #[tokio::test]
    async fn start_transitions_to_running_and_stop_transitions_back() {
        let supervisor = supervisor();
        supervisor.start().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);
        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn starting_twice_concurrently_is_rejected() {
        let supervisor = supervisor();
        supervisor.start().unwrap();
        assert!(supervisor.start().is_err());
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn restart_after_stop_succeeds() {
        let supervisor = supervisor();
        supervisor.start().unwrap();
        supervisor.restart().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);
        supervisor.stop().await;
    }

    #[test]
    fn probe_failures_escalate_exchange_status() {
        let supervisor = supervisor();
        for _ in 0..3 {
            supervisor.record_probe_result(false);
        }
        assert_eq!(supervisor.exchange_api_status(), ExchangeApiStatus::Degraded);
        for _ in 0..3 {
            supervisor.record_probe_result(false);
        }
        assert_eq!(supervisor.exchange_api_status(), ExchangeApiStatus::Down);
        supervisor.record_probe_result(true);
        assert_eq!(supervisor.exchange_api_status(), ExchangeApiStatus::Ok);
    }

    #[test]
    fn sample_performance_reports_success_rate_and_non_negative_usage() {
        let supervisor = supervisor();
        supervisor.metrics.increment_counter("trades_total_success");
        let sample = supervisor.sample_performance(12.5);
        assert_eq!(sample.success_rate, 1.0);
        assert_eq!(sample.api_response_time, 12.5);
        assert!(sample.memory_usage >= 0.0);
        assert!(sample.cpu_usage >= 0.0);
    }
}
