//! Insertion-ordered queue of pending work items.
//!
//! The queue itself is not synchronized: the scheduler keeps it behind its
//! own mutex together with the active set, so "unclaimed = queue - active"
//! is always computed on a consistent snapshot. Changes are broadcast as
//! [`QueueEvent`]s for observers such as a UI list.

use tokio::sync::broadcast;

use crate::models::{BlogIdentity, WorkItem};

const EVENT_CAPACITY: usize = 256;

/// Change notification emitted by [`QueueManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Added {
        index: usize,
        items: Vec<BlogIdentity>,
    },
    Removed {
        items: Vec<BlogIdentity>,
    },
    Moved {
        item: BlogIdentity,
        from: usize,
        to: usize,
    },
    Cleared,
}

/// Ordered, duplicate-free list of work items. Position is dispatch priority.
pub struct QueueManager {
    items: Vec<WorkItem>,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            items: Vec::new(),
            events,
        }
    }

    /// Subscribes to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn snapshot(&self) -> Vec<WorkItem> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, identity: &BlogIdentity) -> bool {
        self.position(identity).is_some()
    }

    pub fn position(&self, identity: &BlogIdentity) -> Option<usize> {
        self.items.iter().position(|item| item.identity() == identity)
    }

    /// Appends items, skipping identities already queued. Returns how many were added.
    pub fn add_items(&mut self, items: impl IntoIterator<Item = WorkItem>) -> usize {
        let index = self.items.len();
        self.insert_items(index, items)
    }

    /// Inserts items at `index` (clamped to the end), skipping duplicates.
    /// Returns how many were inserted.
    pub fn insert_items(&mut self, index: usize, items: impl IntoIterator<Item = WorkItem>) -> usize {
        let index = index.min(self.items.len());
        let mut fresh: Vec<WorkItem> = Vec::new();
        for item in items {
            if self.contains(item.identity()) || fresh.contains(&item) {
                tracing::debug!(blog = %item.identity(), "Skipping duplicate queue entry");
                continue;
            }
            fresh.push(item);
        }
        if fresh.is_empty() {
            return 0;
        }

        let added: Vec<BlogIdentity> = fresh.iter().map(|i| i.identity().clone()).collect();
        let count = fresh.len();
        self.items.splice(index..index, fresh);
        self.notify(QueueEvent::Added {
            index,
            items: added,
        });
        count
    }

    /// Removes every item matching `predicate`; returns the removed items in queue order.
    pub fn remove_items(&mut self, mut predicate: impl FnMut(&WorkItem) -> bool) -> Vec<WorkItem> {
        let mut removed = Vec::new();
        self.items.retain(|item| {
            if predicate(item) {
                removed.push(item.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.notify(QueueEvent::Removed {
                items: removed.iter().map(|i| i.identity().clone()).collect(),
            });
        }
        removed
    }

    /// Removes the item with `identity`, if queued.
    pub fn remove(&mut self, identity: &BlogIdentity) -> Option<WorkItem> {
        self.remove_items(|item| item.identity() == identity)
            .into_iter()
            .next()
    }

    pub fn clear_items(&mut self) -> Vec<WorkItem> {
        let removed = std::mem::take(&mut self.items);
        if !removed.is_empty() {
            self.notify(QueueEvent::Cleared);
        }
        removed
    }

    /// Moves the item at `from` to position `to` (clamped). Returns `false`
    /// if `from` is out of range.
    pub fn move_item(&mut self, from: usize, to: usize) -> bool {
        if from >= self.items.len() {
            return false;
        }
        let to = to.min(self.items.len() - 1);
        if from != to {
            let item = self.items.remove(from);
            let identity = item.identity().clone();
            self.items.insert(to, item);
            self.notify(QueueEvent::Moved {
                item: identity,
                from,
                to,
            });
        }
        true
    }

    fn notify(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}
