//! Coalescing of "page changed" notifications.
//!
//! Any context may report a touched page; only the interactive timer drains.
//! The pending set stores [`PageId`] handles, so a page deleted before the drain
//! simply fails to resolve and is dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::model::PageId;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentEvent {
    PageChanged(usize),
    PageInserted(usize),
    PageDeleted(usize),
    PageSizeChanged(usize),
    /// The whole document was replaced or cleared.
    DocumentChanged,
}

pub trait DocumentListener: Send + Sync {
    fn document_event(&self, event: DocumentEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The document was busy; nothing was touched.
    Skipped,
    Drained { fired: usize, dropped: usize },
}

#[derive(Default)]
pub struct ChangeAggregator {
    pending: Mutex<Vec<PageId>>,
    listeners: Mutex<Vec<Arc<dyn DocumentListener>>>,
}

impl ChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the page was not already pending.
    pub fn notify_page_changed(&self, page: PageId) -> bool {
        let mut pending = self.pending.lock();
        if pending.contains(&page) {
            return false;
        }
        pending.push(page);
        true
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn subscribe(&self, listener: Arc<dyn DocumentListener>) {
        self.listeners.lock().push(listener);
    }

    /// Sends `event` to every subscriber right away.
    pub fn fire(&self, event: DocumentEvent) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.document_event(event);
        }
    }

    /// Resolves every pending page under a non-blocking document lock and emits
    /// one `PageChanged` per surviving page. When the lock is unavailable the
    /// pending set is left intact for the next tick.
    ///
    /// Notifications go out after the lock is released so listeners are free
    /// to lock the document themselves.
    pub fn drain(&self, store: &DocumentStore) -> DrainOutcome {
        let Some(doc) = store.try_lock() else {
            trace!("change drain skipped, document busy");
            return DrainOutcome::Skipped;
        };

        let pages = std::mem::take(&mut *self.pending.lock());
        let total = pages.len();
        let indices: Vec<usize> = pages
            .into_iter()
            .filter_map(|page| doc.index_of(page))
            .collect();
        drop(doc);

        let dropped = total - indices.len();
        if total > 0 {
            debug!(fired = indices.len(), dropped, "page changes drained");
        }
        for index in &indices {
            self.fire(DocumentEvent::PageChanged(*index));
        }
        DrainOutcome::Drained {
            fired: indices.len(),
            dropped,
        }
    }
}

/// Listener that queues everything it hears, for consumers that poll.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<DocumentEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<DocumentEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl DocumentListener for EventRecorder {
    fn document_event(&self, event: DocumentEvent) {
        self.events.lock().push(event);
    }
}
