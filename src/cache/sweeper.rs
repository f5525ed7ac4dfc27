//! Background reclamation of expired cache entries.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::aging::{AgingCache, SweepStats};
use crate::config::CacheConfig;
use crate::error::{GatekeeperError, Result};

/// How often the sweeper runs.
///
/// The sweeper normally sleeps `interval` between passes. When a pass finds
/// that at least `decay_factor` of the scanned entries had expired, the next
/// sleep is shortened to `interval * decay_factor`, so caches with heavy
/// churn are reclaimed sooner. The next quiet pass restores the full interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPolicy {
    interval: Duration,
    decay_factor: f64,
}

impl SweepPolicy {
    /// Create a policy, rejecting a zero interval or a decay factor
    /// outside `(0, 1]`.
    pub fn new(interval: Duration, decay_factor: f64) -> Result<Self> {
        if interval.is_zero() {
            return Err(GatekeeperError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        if !(decay_factor > 0.0 && decay_factor <= 1.0) {
            return Err(GatekeeperError::Config(format!(
                "decay factor must be in (0, 1], got {}",
                decay_factor
            )));
        }
        Ok(Self {
            interval,
            decay_factor,
        })
    }

    /// Base interval between sweeps.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Expired ratio that triggers a shortened interval, and the factor it
    /// is shortened by.
    pub fn decay_factor(&self) -> f64 {
        self.decay_factor
    }

    /// Delay before the pass following one that produced `stats`.
    pub fn next_delay(&self, stats: &SweepStats) -> Duration {
        if stats.removed > 0 && stats.expired_ratio() >= self.decay_factor {
            self.interval.mul_f64(self.decay_factor)
        } else {
            self.interval
        }
    }
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            decay_factor: 0.5,
        }
    }
}

impl TryFrom<&CacheConfig> for SweepPolicy {
    type Error = GatekeeperError;

    fn try_from(config: &CacheConfig) -> Result<Self> {
        SweepPolicy::new(
            Duration::from_secs(config.sweep_interval_secs),
            config.decay_factor,
        )
    }
}

/// Handle to a running sweeper task.
///
/// Dropping the handle stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Whether the sweeper task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawn a task that periodically sweeps `cache` according to `policy`.
///
/// The task holds only a weak reference and exits once the cache is
/// dropped. Fails if called outside a Tokio runtime.
pub fn spawn_sweeper<V>(cache: &Arc<AgingCache<V>>, policy: SweepPolicy) -> Result<SweeperHandle>
where
    V: Send + Sync + 'static,
{
    let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
        GatekeeperError::Startup(format!("cache sweeper needs a Tokio runtime: {}", e))
    })?;

    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let cache: Weak<AgingCache<V>> = Arc::downgrade(cache);

    info!(
        interval_ms = policy.interval.as_millis() as u64,
        decay_factor = policy.decay_factor,
        "Starting cache sweeper"
    );

    let task = runtime.spawn(async move {
        let mut delay = policy.interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }

            let Some(live) = cache.upgrade() else {
                break;
            };
            let stats = live.sweep();
            drop(live);

            delay = policy.next_delay(&stats);
            if stats.removed > 0 {
                debug!(
                    scanned = stats.scanned,
                    removed = stats.removed,
                    next_delay_ms = delay.as_millis() as u64,
                    "Swept expired cache entries"
                );
            }
        }
        info!("Cache sweeper stopped");
    });

    Ok(SweeperHandle {
        shutdown,
        task: Some(task),
    })
}
