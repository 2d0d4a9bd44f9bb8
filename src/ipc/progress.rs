//! Per-item progress channels
//!
//! Each work item registers its logical identifier and observes its own
//! progress through a `watch` channel. Control-plane notifications (`TOTAL`,
//! `DL`) are routed to the channel matching the sender's identifier.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Progress of one work item
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ItemProgress {
    /// Items the worker announced via `TOTAL`
    pub total: Option<u32>,
    /// Items the worker reported via `DL`
    pub current: u32,
    /// The item finished with a failure
    pub failed: bool,
    /// The item's process exited
    pub finished: bool,
}

struct Entry {
    generation: u64,
    sender: watch::Sender<ItemProgress>,
}

/// Registry of active work items keyed by logical identifier
#[derive(Default)]
pub struct ProgressRegistry {
    items: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
    processed: AtomicU64,
}

impl ProgressRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a work item; the registration is removed when the handle drops
    pub fn register(self: &Arc<Self>, identifier: impl Into<String>) -> ProgressHandle {
        let identifier = identifier.into();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(ItemProgress::default());
        self.items.lock().insert(
            identifier.clone(),
            Entry { generation, sender },
        );
        ProgressHandle {
            registry: Arc::clone(self),
            identifier,
            generation,
            receiver,
        }
    }

    /// Set the total for `identifier`; returns false if it is not registered
    pub fn set_total(&self, identifier: &str, total: i32) -> bool {
        let items = self.items.lock();
        match items.get(identifier) {
            Some(entry) => {
                entry
                    .sender
                    .send_modify(|p| p.total = Some(total.max(0) as u32));
                true
            }
            None => false,
        }
    }

    /// Count one processed item for `identifier`
    ///
    /// The run-wide counter always advances; returns false if the identifier
    /// is not registered.
    pub fn advance(&self, identifier: &str) -> bool {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let items = self.items.lock();
        match items.get(identifier) {
            Some(entry) => {
                entry
                    .sender
                    .send_modify(|p| p.current = p.current.saturating_add(1));
                true
            }
            None => false,
        }
    }

    /// Subscribe to an active item's progress
    pub fn subscribe(&self, identifier: &str) -> Option<watch::Receiver<ItemProgress>> {
        self.items
            .lock()
            .get(identifier)
            .map(|entry| entry.sender.subscribe())
    }

    /// Processed-item notifications received during the run
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Number of registered items
    pub fn active(&self) -> usize {
        self.items.lock().len()
    }

    fn finish(&self, identifier: &str, generation: u64, success: bool) {
        if let Some(entry) = self.items.lock().get(identifier)
            && entry.generation == generation
        {
            entry.sender.send_modify(|p| {
                p.finished = true;
                p.failed = !success;
            });
        }
    }

    fn unregister(&self, identifier: &str, generation: u64) {
        let mut items = self.items.lock();
        if items
            .get(identifier)
            .is_some_and(|entry| entry.generation == generation)
        {
            items.remove(identifier);
        }
    }
}

/// Registration of one work item
pub struct ProgressHandle {
    registry: Arc<ProgressRegistry>,
    identifier: String,
    generation: u64,
    receiver: watch::Receiver<ItemProgress>,
}

impl ProgressHandle {
    /// Logical identifier of the item
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Current progress snapshot
    pub fn snapshot(&self) -> ItemProgress {
        *self.receiver.borrow()
    }

    /// Receiver observing this item's progress
    pub fn receiver(&self) -> watch::Receiver<ItemProgress> {
        self.receiver.clone()
    }

    /// Mark the item finished
    pub fn finish(&self, success: bool) {
        self.registry
            .finish(&self.identifier, self.generation, success);
    }
}

impl Drop for ProgressHandle {
    fn drop(&mut self) {
        self.registry.unregister(&self.identifier, self.generation);
    }
}
