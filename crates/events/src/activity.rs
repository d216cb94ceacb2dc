//! Bounded activity ring buffer with debounced persistence.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use lockly_core::activity::ActivityEvent;
use lockly_core::dedup::dedup;
use lockly_store::{BlobStore, StoreError};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

/// Raw events retained before the oldest is evicted.
pub const DEFAULT_CAPACITY: usize = 100;

/// Events returned by [`ActivityBuffer::recent`] when no count is given.
pub const DEFAULT_RECENT: usize = 20;

/// Minimum spacing between two persists.
pub const SAVE_DEBOUNCE: Duration = Duration::from_secs(1);

/// Shared handle to one installation's activity log.
///
/// Cloning is cheap; all clones see the same buffer.
#[derive(Clone)]
pub struct ActivityBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    events: Mutex<VecDeque<ActivityEvent>>,
    capacity: usize,
    persistence: Option<Persistence>,
    /// Armed debounce timer, if a save is scheduled.
    pending_save: Mutex<Option<AbortHandle>>,
}

struct Persistence {
    store: Arc<dyn BlobStore>,
    key: String,
}

impl ActivityBuffer {
    /// Buffer without persistence.
    pub fn in_memory(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// Buffer persisted under `key` in `store`.
    pub fn persisted(capacity: usize, store: Arc<dyn BlobStore>, key: impl Into<String>) -> Self {
        Self::build(
            capacity,
            Some(Persistence {
                store,
                key: key.into(),
            }),
        )
    }

    fn build(capacity: usize, persistence: Option<Persistence>) -> Self {
        Self {
            inner: Arc::new(Inner {
                events: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity: capacity.max(1),
                persistence,
                pending_save: Mutex::new(None),
            }),
        }
    }

    /// Restore persisted events, keeping only the newest `capacity`.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let Some(persistence) = &self.inner.persistence else {
            return Ok(0);
        };
        let Some(doc) = persistence.store.load(&persistence.key).await? else {
            return Ok(0);
        };
        let serde_json::Value::Array(records) = doc else {
            tracing::warn!(key = %persistence.key, "Activity log is not a list, ignoring");
            return Ok(0);
        };

        let mut events = self.inner.events.lock().await;
        let mut loaded = 0usize;
        for record in records {
            match serde_json::from_value::<ActivityEvent>(record) {
                Ok(event) => {
                    push_bounded(&mut events, event, self.inner.capacity);
                    loaded += 1;
                }
                Err(e) => tracing::debug!(error = %e, "Skipping malformed activity record"),
            }
        }
        tracing::info!(key = %persistence.key, loaded, retained = events.len(), "Activity log loaded");
        Ok(loaded)
    }

    /// Store a raw event and schedule a debounced save.
    pub async fn append(&self, event: ActivityEvent) {
        {
            let mut events = self.inner.events.lock().await;
            push_bounded(&mut events, event, self.inner.capacity);
        }
        self.schedule_save().await;
    }

    /// Newest-first deduplicated view, at most `max_events` long.
    pub async fn recent(&self, max_events: usize) -> Vec<ActivityEvent> {
        let raw: Vec<ActivityEvent> = self.inner.events.lock().await.iter().cloned().collect();
        let mut view = dedup(&raw);
        view.reverse();
        view.truncate(max_events);
        view
    }

    /// Raw retained events, oldest first.
    pub async fn raw(&self) -> Vec<ActivityEvent> {
        self.inner.events.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Persist immediately, cancelling any scheduled save.
    pub async fn flush(&self) -> Result<(), StoreError> {
        if let Some(handle) = self.inner.pending_save.lock().await.take() {
            handle.abort();
        }
        self.inner.save().await
    }

    async fn schedule_save(&self) {
        if self.inner.persistence.is_none() {
            return;
        }
        let mut pending = self.inner.pending_save.lock().await;
        if pending.is_some() {
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.pending_save.lock().await.take();
            if let Err(e) = inner.save().await {
                tracing::error!(error = %e, "Failed to persist activity log");
            }
        });
        *pending = Some(task.abort_handle());
    }
}

impl Inner {
    async fn save(&self) -> Result<(), StoreError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        let records = {
            let events = self.events.lock().await;
            events
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?
        };
        persistence
            .store
            .save(&persistence.key, &serde_json::Value::Array(records))
            .await
    }
}

fn push_bounded(events: &mut VecDeque<ActivityEvent>, event: ActivityEvent, capacity: usize) {
    while events.len() >= capacity {
        events.pop_front();
    }
    events.push_back(event);
}
