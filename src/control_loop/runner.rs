//! Driving the loop from a tokio interval

use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::{AppConfig, ConfigWatcher};

fn tick_interval(tick_ms: u64) -> tokio::time::Interval {
    let mut ticker = interval(Duration::from_millis(tick_ms.max(1)));
    // A late tick must not be followed by a burst of catch-up ticks
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_reload(watcher: &mut Option<ConfigWatcher>) -> Option<AppConfig> {
    match watcher {
        Some(watcher) => watcher.next_config().await,
        None => std::future::pending().await,
    }
}

impl super::ControlLoop {
    /// Tick until `shutdown` resolves, then flush persistence
    pub async fn run(mut self, mut watcher: Option<ConfigWatcher>, shutdown: impl Future<Output = ()>) {
        let started = Instant::now();
        let mut ticker = tick_interval(self.tick_ms);
        tokio::pin!(shutdown);

        info!("🎛️  Control loop running every {}ms", self.tick_ms);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now_ms = started.elapsed().as_millis() as u64;
                    self.tick(now_ms);
                }

                Some(new_config) = next_reload(&mut watcher) => {
                    info!("📝 Configuration file changed, reloading...");
                    let old_tick = self.tick_ms;
                    self.apply_config(&new_config);
                    if self.tick_ms != old_tick {
                        ticker = tick_interval(self.tick_ms);
                    }
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping control loop");
                    break;
                }
            }
        }

        if let Some(persistence) = self.persistence.take() {
            if let Err(e) = persistence.save(self.snapshot()) {
                warn!("{:#}", e);
            }
            if let Err(e) = persistence.flush().await {
                warn!("Final flush failed: {:#}", e);
            }
            persistence.shutdown();
        }
        info!("Control loop stopped");
    }
}
