use super::device::{probe, ConcreteDevice, Health};
use super::shutdown::ShutdownListener;
use crate::config::MAX_HEALTH_CHECK_INTERVAL_SECS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Periodic health check for one plugin generation.
///
/// Probes the device files every `interval` and publishes a new value on the
/// health channel only when it differs from the last one. The ListAndWatch
/// streams are the only place where the value is applied to devices.
pub struct HealthMonitor {
    devices: Arc<[ConcreteDevice]>,
    interval: Duration,
    last: Health,
    updates: watch::Sender<Health>,
    stop: ShutdownListener,
}

impl HealthMonitor {
    pub fn new(
        devices: Arc<[ConcreteDevice]>,
        interval: Duration,
        updates: watch::Sender<Health>,
        stop: ShutdownListener,
    ) -> Self {
        let last = *updates.borrow();
        Self {
            devices,
            interval: interval.min(Duration::from_secs(MAX_HEALTH_CHECK_INTERVAL_SECS)),
            last,
            updates,
            stop,
        }
    }

    /// Run until the generation's stop signal fires.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!(
            "Starting health check every {:?} ({} device files)",
            self.interval,
            self.devices.len()
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check();
                }
                _ = self.stop.wait() => {
                    debug!("Health monitor stopped");
                    return;
                }
            }
        }
    }

    /// Probe once, publishing on change. Returns the new value if it changed.
    fn check(&mut self) -> Option<Health> {
        let health = probe(&self.devices);
        if health == self.last {
            debug!(%health, "Device health unchanged");
            return None;
        }

        info!("Health is changed: {} -> {}", self.last, health);
        self.updates.send_replace(health);
        self.last = health;
        Some(health)
    }
}
