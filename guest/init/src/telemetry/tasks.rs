//! Background telemetry loops.
//!
//! Four detached tasks run for the rest of the boot: heartbeat, metrics,
//! log flush and failed-log retry. A failed call is logged at debug level
//! and retried on the next tick. It never reaches the boot sequence.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{Networks, System};
use thinboot_core::config::SupervisorConfig;
use thinboot_core::error::BootFailure;
use thinboot_core::log::encode_batch;
use thinboot_core::metrics::{memory_percent, MetricsSample, SessionStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::api::ServerApi;
use super::buffer::LogBuffer;

type DeliveryResult<T> = std::result::Result<T, BootFailure>;

fn delivery_failure(e: impl std::fmt::Display) -> BootFailure {
    BootFailure::TelemetryDelivery(e.to_string())
}

/// Deliver parked batches, then pending records as one batch. Returns the
/// number delivered.
///
/// Parked batches go first so the server receives records in the order they
/// were logged. While any parked batch is still undeliverable, the pending
/// records are parked behind it.
pub async fn flush_once(api: &dyn ServerApi, buffer: &LogBuffer, mac: &str) -> DeliveryResult<usize> {
    let mut delivered = 0;
    if buffer.failed_batches() > 0 {
        match retry_failed_once(api, buffer, mac).await {
            Ok(count) => delivered += count,
            Err(failure) => {
                buffer.park_failed(buffer.take_pending());
                return Err(failure);
            }
        }
    }

    let batch = buffer.take_pending();
    if batch.is_empty() {
        return Ok(delivered);
    }
    let count = batch.len();
    if let Err(e) = api.post_logs(encode_batch(&batch, mac)).await {
        buffer.park_failed(batch);
        return Err(delivery_failure(e));
    }
    Ok(delivered + count)
}

/// Re-deliver parked batches, oldest first. Stops at the first failure and
/// parks it with everything after it.
pub async fn retry_failed_once(api: &dyn ServerApi, buffer: &LogBuffer, mac: &str) -> DeliveryResult<usize> {
    let mut batches = buffer.take_failed().into_iter();
    let mut delivered = 0;
    while let Some(batch) = batches.next() {
        if let Err(e) = api.post_logs(encode_batch(&batch, mac)).await {
            buffer.park_failed(batch);
            for rest in batches {
                buffer.park_failed(rest);
            }
            return Err(delivery_failure(e));
        }
        delivered += batch.len();
    }
    Ok(delivered)
}

/// Samples resource usage for the metrics endpoint.
pub struct MetricsSampler {
    system: System,
    networks: Networks,
}

impl MetricsSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            networks: Networks::new_with_refreshed_list(),
        }
    }

    pub fn sample(&mut self, mac: &str, session: SessionStatus) -> MetricsSample {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.networks.refresh();

        let (rx_bytes, tx_bytes) = self
            .networks
            .iter()
            .filter(|(name, _)| name.as_str() != "lo")
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.total_received(), tx + data.total_transmitted())
            });

        MetricsSample {
            mac: mac.to_string(),
            cpu_usage: self.system.global_cpu_info().cpu_usage(),
            mem_percent: memory_percent(self.system.used_memory(), self.system.total_memory()),
            rx_bytes,
            tx_bytes,
            session,
            uptime: System::uptime(),
        }
    }
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn heartbeat_loop(api: Arc<dyn ServerApi>, mac: String, period: Duration) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        if let Err(e) = api.heartbeat(&mac).await {
            tracing::debug!(error = %e, "Heartbeat not delivered");
        }
    }
}

async fn metrics_loop(
    api: Arc<dyn ServerApi>,
    mac: String,
    status: watch::Receiver<SessionStatus>,
    period: Duration,
) {
    let sampler = Arc::new(Mutex::new(MetricsSampler::new()));
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        let session = *status.borrow();
        let sampler = sampler.clone();
        let mac_for_sample = mac.clone();
        let sample = match tokio::task::spawn_blocking(move || sampler.lock().sample(&mac_for_sample, session)).await {
            Ok(sample) => sample,
            Err(e) => {
                tracing::debug!(error = %e, "Metrics sampling aborted");
                continue;
            }
        };
        if let Err(e) = api.post_metrics(&sample).await {
            tracing::debug!(error = %e, "Metrics not delivered");
        }
    }
}

async fn flush_loop(api: Arc<dyn ServerApi>, buffer: Arc<LogBuffer>, mac: String, period: Duration) {
    let mut ticker = interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = buffer.urgent() => {}
        }
        if let Err(e) = flush_once(api.as_ref(), &buffer, &mac).await {
            tracing::debug!(error = %e, parked = buffer.failed_batches(), "Log batch parked");
        }
    }
}

async fn retry_loop(api: Arc<dyn ServerApi>, buffer: Arc<LogBuffer>, mac: String, period: Duration) {
    let mut ticker = interval(period);
    // First tick completes immediately; nothing is parked yet.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match retry_failed_once(api.as_ref(), &buffer, &mac).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(records = n, "Parked log records delivered"),
            Err(e) => tracing::debug!(error = %e, "Parked log batches still undeliverable"),
        }
    }
}

/// Handles of the detached telemetry tasks.
#[derive(Debug)]
pub struct TelemetryTasks {
    pub heartbeat: JoinHandle<()>,
    pub metrics: JoinHandle<()>,
    pub flush: JoinHandle<()>,
    pub retry: JoinHandle<()>,
}

impl TelemetryTasks {
    /// Start all four loops on the current runtime. They run until the
    /// machine reboots.
    pub fn spawn(
        api: Arc<dyn ServerApi>,
        buffer: Arc<LogBuffer>,
        mac: &str,
        status: watch::Receiver<SessionStatus>,
        config: &SupervisorConfig,
    ) -> Self {
        tracing::info!(
            mac,
            heartbeat = ?config.heartbeat_interval(),
            metrics = ?config.metrics_interval(),
            "Starting telemetry tasks"
        );
        Self {
            heartbeat: tokio::spawn(heartbeat_loop(api.clone(), mac.to_string(), config.heartbeat_interval())),
            metrics: tokio::spawn(metrics_loop(api.clone(), mac.to_string(), status, config.metrics_interval())),
            flush: tokio::spawn(flush_loop(
                api.clone(),
                buffer.clone(),
                mac.to_string(),
                config.log_flush_interval(),
            )),
            retry: tokio::spawn(retry_loop(api, buffer, mac.to_string(), config.failed_log_retry_interval())),
        }
    }
}
