//! Lock-guarded ownership of the open document.
//!
//! Every structural read or write goes through a [`DocumentGuard`]. The guard
//! is the only way to reach the [`Document`], so "mutating without holding the
//! lock" cannot be expressed; the lock is released when the guard is dropped,
//! which covers early returns and `?` paths alike.
//!
//! The lock is not recursive. Code that already holds a guard passes
//! `&mut Document` down instead of locking again; a nested `lock()` on the
//! holding thread trips a debug assertion rather than deadlocking silently.

use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::model::Document;

pub struct DocumentStore {
    document: Mutex<Document>,
    holder: Mutex<Option<ThreadId>>,
}

impl DocumentStore {
    pub fn new(document: Document) -> Self {
        Self {
            document: Mutex::new(document),
            holder: Mutex::new(None),
        }
    }

    /// Blocks until exclusive access is available.
    pub fn lock(&self) -> DocumentGuard<'_> {
        debug_assert!(
            !self.is_held_by_current_thread(),
            "document lock requested twice on the same thread"
        );
        let guard = self.document.lock();
        self.guard(guard)
    }

    /// Never blocks. `None` means someone else holds the document; callers on a
    /// timer simply try again at their next tick.
    pub fn try_lock(&self) -> Option<DocumentGuard<'_>> {
        match self.document.try_lock() {
            Some(guard) => Some(self.guard(guard)),
            None => {
                trace!("document busy, try_lock declined");
                None
            }
        }
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<DocumentGuard<'_>> {
        self.document
            .try_lock_for(timeout)
            .map(|guard| self.guard(guard))
    }

    pub fn is_locked(&self) -> bool {
        self.document.is_locked()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        *self.holder.lock() == Some(thread::current().id())
    }

    fn guard<'a>(&'a self, guard: MutexGuard<'a, Document>) -> DocumentGuard<'a> {
        *self.holder.lock() = Some(thread::current().id());
        DocumentGuard {
            document: guard,
            holder: &self.holder,
        }
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new(Document::new())
    }
}

/// Exclusive access to the document; dropping it unlocks.
pub struct DocumentGuard<'a> {
    document: MutexGuard<'a, Document>,
    holder: &'a Mutex<Option<ThreadId>>,
}

impl DocumentGuard<'_> {
    /// Swaps in a whole new document and returns the previous one.
    pub fn replace(&mut self, document: Document) -> Document {
        std::mem::replace(&mut *self.document, document)
    }

    pub fn unlock(self) {}
}

impl Deref for DocumentGuard<'_> {
    type Target = Document;

    fn deref(&self) -> &Document {
        &self.document
    }
}

impl DerefMut for DocumentGuard<'_> {
    fn deref_mut(&mut self) -> &mut Document {
        &mut self.document
    }
}

impl Drop for DocumentGuard<'_> {
    fn drop(&mut self) {
        *self.holder.lock() = None;
    }
}
