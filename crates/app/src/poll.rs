use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use eventsub_hub_storage::{EventError, EventRepository, StoredEvent};
use metrics::gauge;
use tokio::sync::{futures::Notified, Notify};
use tracing::warn;

/// Per-user slot tracked while a long-poll is waiting.
struct PendingEntry {
    registration: u64,
    event: Option<StoredEvent>,
    notify: Arc<Notify>,
}

/// Observable state of a user's entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
    Listening,
    Ready(StoredEvent),
}

/// In-memory map from user id to the next event waiting for that user's long-poll.
///
/// At most one entry exists per user. A later [`PollCache::listen`] replaces the
/// earlier entry; the earlier [`Registration`] then no longer matches and will
/// neither receive events nor remove the newer entry when dropped.
#[derive(Clone)]
pub struct PollCache {
    entries: Arc<RwLock<HashMap<String, PendingEntry>>>,
    events: EventRepository,
    next_registration: Arc<AtomicU64>,
}

impl PollCache {
    pub fn new(events: EventRepository) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            events,
            next_registration: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Registers `user_id` with an empty entry. The entry lives until the
    /// returned guard is dropped or [`PollCache::done`] is called.
    pub fn listen(&self, user_id: &str) -> Registration {
        let id = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let notify = Arc::new(Notify::new());
        let len = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.insert(
                user_id.to_owned(),
                PendingEntry {
                    registration: id,
                    event: None,
                    notify: notify.clone(),
                },
            );
            entries.len()
        };
        gauge!("poll_cache_entries").set(len as f64);

        Registration {
            cache: self.clone(),
            user_id: user_id.to_owned(),
            id,
            notify,
        }
    }

    pub fn get(&self, user_id: &str) -> Option<PendingState> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(user_id).map(|entry| match &entry.event {
            Some(event) => PendingState::Ready(event.clone()),
            None => PendingState::Listening,
        })
    }

    /// Removes the user's entry whoever registered it.
    pub fn done(&self, user_id: &str) {
        self.remove_if(user_id, |_| true);
    }

    fn release(&self, user_id: &str, registration: u64) {
        self.remove_if(user_id, |entry| entry.registration == registration);
    }

    fn remove_if(&self, user_id: &str, matches: impl FnOnce(&PendingEntry) -> bool) {
        let len = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if entries.get(user_id).is_some_and(matches) {
                entries.remove(user_id);
            }
            entries.len()
        };
        gauge!("poll_cache_entries").set(len as f64);
    }

    /// Hands the populated event to the registration that owns the entry.
    pub fn take(&self, registration: &Registration) -> Option<StoredEvent> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .get_mut(&registration.user_id)
            .filter(|entry| entry.registration == registration.id)
            .and_then(|entry| entry.event.take())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Populates every waiting entry that has a stored event. Returns how many
    /// entries were filled.
    ///
    /// The store is queried outside the lock; an entry is only filled if the
    /// registration seen in the snapshot still owns it. A failed lookup is
    /// logged and the sweep moves on to the next user.
    pub async fn refresh(&self) -> usize {
        let waiting: Vec<(String, u64)> = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .filter(|(_, entry)| entry.event.is_none())
                .map(|(user_id, entry)| (user_id.clone(), entry.registration))
                .collect()
        };

        let mut populated = 0;
        for (user_id, registration) in waiting {
            match self.populate(&user_id, registration).await {
                Ok(true) => populated += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    stage = "poll",
                    %user_id,
                    error = %err,
                    "failed to load pending event"
                ),
            }
        }
        populated
    }

    /// Same as [`PollCache::refresh`] for a single user.
    pub async fn refresh_user(&self, user_id: &str) -> Result<bool, EventError> {
        let registration = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(user_id) {
                Some(entry) if entry.event.is_none() => entry.registration,
                _ => return Ok(false),
            }
        };
        self.populate(user_id, registration).await
    }

    async fn populate(&self, user_id: &str, registration: u64) -> Result<bool, EventError> {
        let Some(event) = self.events.peek_oldest(user_id).await? else {
            return Ok(false);
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(user_id) {
            Some(entry) if entry.registration == registration && entry.event.is_none() => {
                entry.event = Some(event);
                entry.notify.notify_one();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Guard for one long-poll registration. Dropping it releases the entry if it
/// still belongs to this registration.
pub struct Registration {
    cache: PollCache,
    user_id: String,
    id: u64,
    notify: Arc<Notify>,
}

impl Registration {
    /// Completes after the entry is populated. A population that happened
    /// before the call is not lost.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.cache.release(&self.user_id, self.id);
    }
}
