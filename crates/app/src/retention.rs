use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use eventsub_hub_storage::{EventError, EventRepository};
use metrics::counter;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::shutdown::Shutdown;

const BATCH_LIMIT: u32 = 1000;

/// Background worker that purges stored events older than the retention window,
/// whether or not they were delivered.
#[derive(Clone)]
pub struct RetentionWorker {
    events: EventRepository,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    retention: Duration,
    interval: Duration,
}

impl RetentionWorker {
    pub fn new(events: EventRepository, retention: Duration, interval: Duration) -> Self {
        Self {
            events,
            clock: Arc::new(Utc::now),
            retention,
            interval,
        }
    }

    /// Overrides the clock used for determining the purge threshold.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background until shutdown.
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
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "retention sweep failed");
            }
        }
        info!(stage = "storage", "retention worker stopped");
    }

    /// Deletes every event received strictly before `now - retention`, and the
    /// delivered-message records of the same age.
    pub async fn run_once(&self) -> Result<u64, EventError> {
        let now = (self.clock)();
        let threshold = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let deleted = self.events.purge_older_than(threshold, BATCH_LIMIT).await?;
        counter!("db_ttl_deleted_total", "table" => "eventsub_events").increment(deleted);
        info!(
            stage = "storage",
            table = "eventsub_events",
            deleted,
            threshold = %threshold.to_rfc3339(),
            "event retention sweep completed"
        );

        let forgotten = self.events.purge_delivered_before(threshold).await?;
        counter!("db_ttl_deleted_total", "table" => "eventsub_delivered").increment(forgotten);
        if forgotten > 0 {
            debug!(
                stage = "storage",
                table = "eventsub_delivered",
                deleted = forgotten,
                "delivered message ids expired"
            );
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_db;
    use eventsub_hub_storage::NewEvent;

    #[tokio::test]
    async fn purges_only_events_past_the_window() {
        let (_dir, db) = setup_db().await;
        let events = db.events();
        let now = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .expect("time")
            .with_timezone(&Utc);
        let window = chrono::Duration::hours(1);

        for (message_id, received_at) in [
            ("too-old", now - window - chrono::Duration::microseconds(1)),
            ("edge", now - window),
            ("fresh", now - chrono::Duration::minutes(5)),
        ] {
            events
                .append(NewEvent {
                    user_id: "42",
                    event_type: "channel.follow",
                    message_id,
                    payload: "{}",
                    received_at,
                })
                .await
                .expect("append");
        }

        let worker = RetentionWorker::new(events.clone(), Duration::from_secs(3600), Duration::from_secs(60))
            .with_clock(Arc::new(move || now));
        assert_eq!(worker.run_once().await.expect("sweep"), 1);
        assert_eq!(events.count_for_user("42").await.expect("count"), 2);

        let oldest = events.peek_oldest("42").await.expect("peek").expect("event");
        assert_eq!(oldest.received_at, now - window);
    }

    #[tokio::test]
    async fn expires_delivered_message_ids_with_the_window() {
        let (_dir, db) = setup_db().await;
        let events = db.events();
        let now = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .expect("time")
            .with_timezone(&Utc);
        let old = NewEvent {
            user_id: "42",
            event_type: "channel.follow",
            message_id: "delivered",
            payload: "{}",
            received_at: now - chrono::Duration::hours(2),
        };
        events.append(old).await.expect("append");
        let delivered = events.peek_oldest("42").await.expect("peek").expect("event");
        events.delete(&delivered).await.expect("delete");
        assert!(events.append(old).await.expect("redelivery").is_duplicate());

        let worker = RetentionWorker::new(events.clone(), Duration::from_secs(3600), Duration::from_secs(60))
            .with_clock(Arc::new(move || now));
        assert_eq!(worker.run_once().await.expect("sweep"), 0);

        assert!(!events.append(old).await.expect("after expiry").is_duplicate());
    }

    #[tokio::test]
    async fn loop_exits_on_shutdown() {
        let (_dir, db) = setup_db().await;
        let (trigger, shutdown) = crate::shutdown::channel();
        let handle = RetentionWorker::new(db.events(), Duration::from_secs(3600), Duration::from_secs(3600))
            .spawn(shutdown);

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker stopped")
            .expect("join");
    }
}
