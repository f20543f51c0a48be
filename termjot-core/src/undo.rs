//! # Undo/Redo
//!
//! [`UndoAction`] describes one reversible mutation; [`ActionLog`] keeps the
//! ordered history plus a cursor separating executed actions from undone ones.
//!
//! - Actions below the cursor can be undone, actions at or above it redone.
//! - Pushing a new action discards everything at or above the cursor.
//! - Delete actions own the removed page/element while they are undoable and
//!   hand it back to the document when reverted, so the log never points at
//!   something that no longer exists.
//! - Dirty tracking is positional: the log remembers which action was on top at
//!   the last save and at the last autosave.
//!
//! The log is driven from the interactive context only. Its listeners are not
//! `Send`, which keeps the whole log on the thread that created it.

use tracing::{debug, warn};

use thiserror::Error;

use crate::changes::DocumentEvent;
use crate::model::{Document, Element, ElementProperty, Page, PageId, PropertyKind};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActionError {
    #[error("page {0} is no longer part of the document")]
    PageNotFound(PageId),
    #[error("layer {layer} does not exist on page {page}")]
    LayerNotFound { page: PageId, layer: usize },
    #[error("element {index} does not exist on layer {layer} of page {page}")]
    ElementNotFound {
        page: PageId,
        layer: usize,
        index: usize,
    },
    #[error("{0} has nothing to restore")]
    NothingHeld(&'static str),
    #[error("{kind:?} does not apply to element {index}")]
    PropertyMismatch { kind: PropertyKind, index: usize },
}

/// One element inserted into or removed from a layer.
#[derive(Debug, Clone)]
pub struct ElementChange {
    page: PageId,
    layer: usize,
    index: usize,
    /// Present while the element is outside the document.
    element: Option<Element>,
}

/// One page inserted into or removed from the document.
#[derive(Debug, Clone)]
pub struct PageChange {
    id: PageId,
    index: usize,
    /// Present while the page is outside the document.
    page: Option<Page>,
}

#[derive(Debug, Clone)]
pub struct PropertyTarget {
    pub index: usize,
    pub old: ElementProperty,
    pub new: ElementProperty,
}

#[derive(Debug, Clone)]
pub struct PropertyChange {
    page: PageId,
    layer: usize,
    description: String,
    targets: Vec<PropertyTarget>,
}

#[derive(Debug, Clone)]
pub struct GroupAction {
    description: String,
    children: Vec<UndoAction>,
}

#[derive(Debug, Clone)]
pub enum UndoAction {
    InsertElement(ElementChange),
    DeleteElement(ElementChange),
    InsertPage(PageChange),
    DeletePage(PageChange),
    Group(GroupAction),
    Property(PropertyChange),
}

impl UndoAction {
    /// Records an element that has already been inserted at `index`.
    pub fn inserted_element(page: PageId, layer: usize, index: usize) -> Self {
        UndoAction::InsertElement(ElementChange {
            page,
            layer,
            index,
            element: None,
        })
    }

    /// Records an element that has already been removed from `index`; the action
    /// takes ownership of it.
    pub fn deleted_element(page: PageId, layer: usize, index: usize, element: Element) -> Self {
        UndoAction::DeleteElement(ElementChange {
            page,
            layer,
            index,
            element: Some(element),
        })
    }

    pub fn inserted_page(id: PageId, index: usize) -> Self {
        UndoAction::InsertPage(PageChange {
            id,
            index,
            page: None,
        })
    }

    pub fn deleted_page(index: usize, page: Page) -> Self {
        UndoAction::DeletePage(PageChange {
            id: page.id(),
            index,
            page: Some(page),
        })
    }

    pub fn group(description: impl Into<String>, children: Vec<UndoAction>) -> Self {
        UndoAction::Group(GroupAction {
            description: description.into(),
            children,
        })
    }

    /// Records property values that have already been switched from `old` to `new`.
    pub fn property(
        page: PageId,
        layer: usize,
        description: impl Into<String>,
        targets: Vec<PropertyTarget>,
    ) -> Self {
        UndoAction::Property(PropertyChange {
            page,
            layer,
            description: description.into(),
            targets,
        })
    }

    pub fn description(&self) -> &str {
        match self {
            UndoAction::InsertElement(_) => "Insert element",
            UndoAction::DeleteElement(_) => "Delete element",
            UndoAction::InsertPage(_) => "Insert page",
            UndoAction::DeletePage(_) => "Delete page",
            UndoAction::Group(group) => &group.description,
            UndoAction::Property(change) => &change.description,
        }
    }

    /// Pages whose content this action touches, without duplicates.
    pub fn affected_pages(&self) -> Vec<PageId> {
        let mut pages = Vec::new();
        self.collect_pages(&mut pages);
        pages
    }

    fn collect_pages(&self, out: &mut Vec<PageId>) {
        let page = match self {
            UndoAction::InsertElement(change) | UndoAction::DeleteElement(change) => change.page,
            UndoAction::Property(change) => change.page,
            UndoAction::InsertPage(change) | UndoAction::DeletePage(change) => change.id,
            UndoAction::Group(group) => {
                for child in &group.children {
                    child.collect_pages(out);
                }
                return;
            }
        };
        if !out.contains(&page) {
            out.push(page);
        }
    }

    /// Structural notifications caused by running this action forwards
    /// (`applied == true`) or backwards.
    pub fn page_events(&self, applied: bool) -> Vec<DocumentEvent> {
        match self {
            UndoAction::InsertPage(change) if applied => {
                vec![DocumentEvent::PageInserted(change.index)]
            }
            UndoAction::InsertPage(change) => vec![DocumentEvent::PageDeleted(change.index)],
            UndoAction::DeletePage(change) if applied => {
                vec![DocumentEvent::PageDeleted(change.index)]
            }
            UndoAction::DeletePage(change) => vec![DocumentEvent::PageInserted(change.index)],
            UndoAction::Group(group) => {
                let mut events: Vec<_> = group
                    .children
                    .iter()
                    .flat_map(|child| child.page_events(applied))
                    .collect();
                if !applied {
                    events.reverse();
                }
                events
            }
            _ => Vec::new(),
        }
    }

    /// Redo.
    pub fn apply(&mut self, doc: &mut Document) -> Result<(), ActionError> {
        match self {
            UndoAction::InsertElement(change) => change.restore(doc, "insert element"),
            UndoAction::DeleteElement(change) => change.take(doc),
            UndoAction::InsertPage(change) => change.restore(doc, "insert page"),
            UndoAction::DeletePage(change) => change.take(doc),
            UndoAction::Group(group) => group.apply(doc),
            UndoAction::Property(change) => change.set(doc, true),
        }
    }

    /// Undo.
    pub fn revert(&mut self, doc: &mut Document) -> Result<(), ActionError> {
        match self {
            UndoAction::InsertElement(change) => change.take(doc),
            UndoAction::DeleteElement(change) => change.restore(doc, "delete element"),
            UndoAction::InsertPage(change) => change.take(doc),
            UndoAction::DeletePage(change) => change.restore(doc, "delete page"),
            UndoAction::Group(group) => group.revert(doc),
            UndoAction::Property(change) => change.set(doc, false),
        }
    }
}

impl ElementChange {
    fn take(&mut self, doc: &mut Document) -> Result<(), ActionError> {
        let page = doc
            .page_by_id_mut(self.page)
            .ok_or(ActionError::PageNotFound(self.page))?;
        let layer = page.layer_mut(self.layer).ok_or(ActionError::LayerNotFound {
            page: self.page,
            layer: self.layer,
        })?;
        let element = layer
            .remove_element(self.index)
            .ok_or(ActionError::ElementNotFound {
                page: self.page,
                layer: self.layer,
                index: self.index,
            })?;
        self.element = Some(element);
        Ok(())
    }

    fn restore(&mut self, doc: &mut Document, what: &'static str) -> Result<(), ActionError> {
        if self.element.is_none() {
            return Err(ActionError::NothingHeld(what));
        }
        let page = doc
            .page_by_id_mut(self.page)
            .ok_or(ActionError::PageNotFound(self.page))?;
        let layer = page.layer_mut(self.layer).ok_or(ActionError::LayerNotFound {
            page: self.page,
            layer: self.layer,
        })?;
        if let Some(element) = self.element.take() {
            layer.insert_element(self.index, element);
        }
        Ok(())
    }
}

impl PageChange {
    fn take(&mut self, doc: &mut Document) -> Result<(), ActionError> {
        let index = doc
            .index_of(self.id)
            .ok_or(ActionError::PageNotFound(self.id))?;
        self.page = doc.delete_page(index);
        self.index = index;
        Ok(())
    }

    fn restore(&mut self, doc: &mut Document, what: &'static str) -> Result<(), ActionError> {
        let page = self.page.take().ok_or(ActionError::NothingHeld(what))?;
        self.index = doc.insert_page(page, self.index);
        Ok(())
    }
}

impl GroupAction {
    fn apply(&mut self, doc: &mut Document) -> Result<(), ActionError> {
        for done in 0..self.children.len() {
            if let Err(err) = self.children[done].apply(doc) {
                // put the group back the way it was before the failing child
                for child in self.children[..done].iter_mut().rev() {
                    if let Err(rollback) = child.revert(doc) {
                        warn!(%rollback, "could not roll back partially applied group");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn revert(&mut self, doc: &mut Document) -> Result<(), ActionError> {
        let len = self.children.len();
        for done in 0..len {
            let position = len - 1 - done;
            if let Err(err) = self.children[position].revert(doc) {
                for child in self.children[position + 1..].iter_mut() {
                    if let Err(rollback) = child.apply(doc) {
                        warn!(%rollback, "could not roll back partially reverted group");
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }
}

impl PropertyChange {
    fn set(&self, doc: &mut Document, forward: bool) -> Result<(), ActionError> {
        let page = doc
            .page_by_id_mut(self.page)
            .ok_or(ActionError::PageNotFound(self.page))?;
        let layer = page.layer_mut(self.layer).ok_or(ActionError::LayerNotFound {
            page: self.page,
            layer: self.layer,
        })?;
        for (done, target) in self.targets.iter().enumerate() {
            let value = if forward { &target.new } else { &target.old };
            let failure = match layer.element_mut(target.index) {
                None => ActionError::ElementNotFound {
                    page: self.page,
                    layer: self.layer,
                    index: target.index,
                },
                Some(element) => {
                    if element.set_property(value) {
                        continue;
                    }
                    ActionError::PropertyMismatch {
                        kind: value.kind(),
                        index: target.index,
                    }
                }
            };
            for undone in &self.targets[..done] {
                let previous = if forward { &undone.old } else { &undone.new };
                if let Some(element) = layer.element_mut(undone.index) {
                    element.set_property(previous);
                }
            }
            return Err(failure);
        }
        Ok(())
    }
}

/// Receives notifications from the [`ActionLog`] on the interactive context.
pub trait ActionLogListener {
    /// Undo/redo availability, descriptions or dirty state may have changed.
    fn undo_redo_changed(&self, _log: &ActionLog) {}

    /// Content of `page` was modified by a push, undo or redo.
    fn undo_redo_page_changed(&self, _page: PageId) {}
}

/// Identifies the action on top of the undo side at some instant; used to
/// remember where the document was last saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SavePoint(u64);

/// Result of a successful undo or redo.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub description: String,
    pub events: Vec<DocumentEvent>,
}

struct Entry {
    serial: u64,
    action: UndoAction,
}

pub struct ActionLog {
    entries: Vec<Entry>,
    cursor: usize,
    next_serial: u64,
    /// State at the bottom of the history: the last action dropped by the
    /// depth limit, or the default point while nothing was dropped.
    base: SavePoint,
    saved: SavePoint,
    autosaved: SavePoint,
    max_depth: usize,
    listeners: Vec<Box<dyn ActionLogListener>>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::with_max_depth(0)
    }

    /// `max_depth == 0` keeps the whole history.
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            next_serial: 1,
            base: SavePoint::default(),
            saved: SavePoint::default(),
            autosaved: SavePoint::default(),
            max_depth,
            listeners: Vec::new(),
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn ActionLogListener>) {
        self.listeners.push(listener);
    }

    pub fn push(&mut self, action: UndoAction) {
        let discarded = self.entries.len() - self.cursor;
        self.entries.truncate(self.cursor);
        if discarded > 0 {
            debug!(discarded, "redo history dropped by new action");
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        let pages = action.affected_pages();
        debug!(action = action.description(), serial, "undo action pushed");
        self.entries.push(Entry { serial, action });
        self.cursor = self.entries.len();

        if self.max_depth > 0 && self.entries.len() > self.max_depth {
            let excess = self.entries.len() - self.max_depth;
            if let Some(last) = self.entries.drain(..excess).last() {
                self.base = SavePoint(last.serial);
            }
            self.cursor -= excess;
        }

        self.notify(&pages);
    }

    /// Reverts the action before the cursor. `Ok(None)` when there is nothing
    /// to undo. On error the cursor stays where it was.
    pub fn undo(&mut self, doc: &mut Document) -> Result<Option<Step>, ActionError> {
        if self.cursor == 0 {
            debug!("nothing to undo");
            return Ok(None);
        }
        let entry = &mut self.entries[self.cursor - 1];
        entry.action.revert(doc)?;
        let step = Step {
            description: entry.action.description().to_string(),
            events: entry.action.page_events(false),
        };
        let pages = entry.action.affected_pages();
        self.cursor -= 1;
        self.notify(&pages);
        Ok(Some(step))
    }

    /// Re-applies the action at the cursor. `Ok(None)` when there is nothing to
    /// redo.
    pub fn redo(&mut self, doc: &mut Document) -> Result<Option<Step>, ActionError> {
        if self.cursor == self.entries.len() {
            debug!("nothing to redo");
            return Ok(None);
        }
        let entry = &mut self.entries[self.cursor];
        entry.action.apply(doc)?;
        let step = Step {
            description: entry.action.description().to_string(),
            events: entry.action.page_events(true),
        };
        let pages = entry.action.affected_pages();
        self.cursor += 1;
        self.notify(&pages);
        Ok(Some(step))
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    pub fn undo_description(&self) -> String {
        match self.cursor.checked_sub(1).and_then(|i| self.entries.get(i)) {
            Some(entry) => format!("Undo: {}", entry.action.description()),
            None => "Undo".to_string(),
        }
    }

    pub fn redo_description(&self) -> String {
        match self.entries.get(self.cursor) {
            Some(entry) => format!("Redo: {}", entry.action.description()),
            None => "Redo".to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn save_point(&self) -> SavePoint {
        match self.cursor.checked_sub(1) {
            Some(top) => SavePoint(self.entries[top].serial),
            None => self.base,
        }
    }

    pub fn is_changed(&self) -> bool {
        self.save_point() != self.saved
    }

    pub fn is_changed_autosave(&self) -> bool {
        self.save_point() != self.autosaved
    }

    pub fn document_saved(&mut self) {
        self.document_saved_at(self.save_point());
    }

    /// Marks the state identified by `point` as the saved one; used when the
    /// save ran in the background and the log moved on meanwhile.
    pub fn document_saved_at(&mut self, point: SavePoint) {
        self.saved = point;
        self.notify(&[]);
    }

    pub fn document_autosaved(&mut self) {
        self.document_autosaved_at(self.save_point());
    }

    pub fn document_autosaved_at(&mut self, point: SavePoint) {
        self.autosaved = point;
    }

    /// Forgets the whole history, e.g. when the document is closed or replaced.
    pub fn clear_contents(&mut self) {
        self.entries.clear();
        self.cursor = 0;
        self.base = SavePoint::default();
        self.saved = SavePoint::default();
        self.autosaved = SavePoint::default();
        self.notify(&[]);
    }

    fn notify(&self, pages: &[PageId]) {
        for listener in &self.listeners {
            for page in pages {
                listener.undo_redo_page_changed(*page);
            }
            listener.undo_redo_changed(self);
        }
    }
}

impl Default for ActionLog {
    fn default() -> Self {
        Self::new()
    }
}
