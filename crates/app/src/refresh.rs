use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::{poll::PollCache, shutdown::Shutdown};

/// Periodically fills waiting poll-cache entries from the event store.
///
/// Ingress already wakes the recipient after each append; this loop covers
/// events that arrive while no poll is registered.
pub struct PollRefreshWorker {
    cache: PollCache,
    interval: Duration,
}

impl PollRefreshWorker {
    pub fn new(cache: PollCache, interval: Duration) -> Self {
        Self { cache, interval }
    }

    pub fn spawn(self, shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(shutdown).await;
        })
    }

    async fn run_loop(self, shutdown: Shutdown) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            let populated = self.cache.refresh().await;
            if populated > 0 {
                debug!(stage = "poll", populated, "poll cache refreshed");
            }
        }
        info!(stage = "poll", "poll refresh worker stopped");
    }
}
