//! Prometheus metrics for pulls, layers, containers and exec.

use andock_core::container::{Container, ContainerStatus};
use andock_core::error::{AndockError, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Runtime metrics, registered on a private registry.
pub struct RuntimeMetrics {
    registry: Registry,
    pulls_total: IntCounterVec,
    layer_bytes_downloaded: IntCounter,
    pull_duration: Histogram,
    containers: IntGaugeVec,
    exec_total: IntCounter,
}

impl RuntimeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let pulls_total = IntCounterVec::new(
            Opts::new("andock_pulls_total", "Image pulls by result"),
            &["result"],
        )
        .map_err(metrics_err)?;
        let layer_bytes_downloaded = IntCounter::new(
            "andock_layer_bytes_downloaded_total",
            "Compressed layer bytes downloaded",
        )
        .map_err(metrics_err)?;
        let pull_duration = Histogram::with_opts(
            HistogramOpts::new("andock_pull_duration_seconds", "Wall time of image pulls")
                .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )
        .map_err(metrics_err)?;
        let containers = IntGaugeVec::new(
            Opts::new("andock_containers", "Containers by status"),
            &["status"],
        )
        .map_err(metrics_err)?;
        let exec_total =
            IntCounter::new("andock_exec_total", "Commands executed in containers")
                .map_err(metrics_err)?;

        registry
            .register(Box::new(pulls_total.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(layer_bytes_downloaded.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(pull_duration.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(containers.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(exec_total.clone()))
            .map_err(metrics_err)?;

        Ok(Self {
            registry,
            pulls_total,
            layer_bytes_downloaded,
            pull_duration,
            containers,
            exec_total,
        })
    }

    /// Record a finished pull. `result` is `success`, `cached` or an error kind.
    pub fn record_pull(&self, result: &str, seconds: f64) {
        self.pulls_total.with_label_values(&[result]).inc();
        self.pull_duration.observe(seconds);
    }

    pub fn add_layer_bytes(&self, bytes: u64) {
        self.layer_bytes_downloaded.inc_by(bytes);
    }

    pub fn record_exec(&self) {
        self.exec_total.inc();
    }

    /// Reset the per-status container gauge from the current records.
    pub fn set_containers(&self, containers: &[Container]) {
        for status in [
            ContainerStatus::Created,
            ContainerStatus::Running,
            ContainerStatus::Paused,
            ContainerStatus::Stopped,
            ContainerStatus::Exited,
        ] {
            let count = containers.iter().filter(|c| c.status == status).count();
            self.containers
                .with_label_values(&[status.as_str()])
                .set(count as i64);
        }
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(metrics_err)?;
        String::from_utf8(buf).map_err(|e| AndockError::Serialization(e.to_string()))
    }
}

fn metrics_err(e: prometheus::Error) -> AndockError {
    AndockError::Config(format!("Metrics error: {}", e))
}
