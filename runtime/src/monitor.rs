//! Periodic mirror health checks.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::mirror::MirrorResolver;
use crate::oci::registry::RegistryClient;

/// Checks every mirror once per interval until cancelled.
pub struct MirrorMonitor {
    resolver: Arc<MirrorResolver>,
    registry: Arc<RegistryClient>,
    interval: Duration,
}

impl MirrorMonitor {
    pub fn new(resolver: Arc<MirrorResolver>, registry: Arc<RegistryClient>, interval: Duration) -> Self {
        Self {
            resolver,
            registry,
            interval,
        }
    }

    /// Start monitoring. The first check runs one interval after start.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.resolver.check_all(&self.registry).await,
                }
            }
            tracing::debug!("Mirror monitor stopped");
        })
    }
}
