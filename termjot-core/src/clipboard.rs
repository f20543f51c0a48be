//! Copy and paste of layer contents.
//!
//! Pasting is a two-phase operation: the payload is decoded into a free-standing
//! [`EditSelection`] first, and only a fully decoded selection is inserted into
//! the document and recorded in the history. A decode failure releases whatever
//! was built so far and leaves document and history untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{Color, Document, Element, Font, Point, Text, ELEMENT_KINDS};
use crate::undo::UndoAction;

pub const CLIPBOARD_FORMAT: &str = "termjot-elements";
pub const CLIPBOARD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pasted elements are shifted by this much so they do not hide the originals.
pub const PASTE_OFFSET: f64 = 10.0;

#[derive(Debug, Error, PartialEq)]
pub enum PasteError {
    #[error("clipboard data is malformed: {message}")]
    DataFormat { message: String, released: usize },
    #[error("there is no page to paste into")]
    NoTargetPage,
}

#[derive(Serialize, Deserialize)]
struct Payload {
    format: String,
    version: String,
    elements: Vec<Value>,
}

pub fn copy_elements(elements: &[Element]) -> serde_json::Result<String> {
    let elements = elements
        .iter()
        .map(serde_json::to_value)
        .collect::<serde_json::Result<Vec<_>>>()?;
    serde_json::to_string(&Payload {
        format: CLIPBOARD_FORMAT.to_string(),
        version: CLIPBOARD_VERSION.to_string(),
        elements,
    })
}

/// Serialises the selected layer of page `page_index`, or `None` when the
/// page does not exist or the layer is empty.
pub fn copy_layer(doc: &Document, page_index: usize) -> serde_json::Result<Option<String>> {
    let Some(page) = doc.page(page_index) else {
        return Ok(None);
    };
    match page.layer(page.selected_layer_index()) {
        Some(layer) if !layer.is_empty() => copy_elements(layer.elements()).map(Some),
        _ => Ok(None),
    }
}

/// Elements decoded from the clipboard that do not belong to any layer yet.
#[derive(Debug, Default)]
pub struct EditSelection {
    elements: Vec<Element>,
}

impl EditSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, element: Element) {
        self.elements.push(element);
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn translate(&mut self, dx: f64, dy: f64) {
        for element in &mut self.elements {
            element.translate(dx, dy);
        }
    }

    /// Drops every element and returns how many there were.
    pub fn release(self) -> usize {
        self.elements.len()
    }

    fn into_elements(self) -> Vec<Element> {
        self.elements
    }
}

pub fn read_selection(payload: &str) -> Result<EditSelection, PasteError> {
    let payload: Payload = serde_json::from_str(payload).map_err(|err| PasteError::DataFormat {
        message: err.to_string(),
        released: 0,
    })?;
    if payload.format != CLIPBOARD_FORMAT {
        return Err(PasteError::DataFormat {
            message: format!("unexpected clipboard format {:?}", payload.format),
            released: 0,
        });
    }
    if payload.version != CLIPBOARD_VERSION {
        warn!(
            from = %payload.version,
            to = CLIPBOARD_VERSION,
            "pasting elements copied by another version"
        );
    }

    let mut selection = EditSelection::new();
    for value in payload.elements {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("<missing>")
            .to_string();
        let decoded = if ELEMENT_KINDS.contains(&kind.as_str()) {
            serde_json::from_value::<Element>(value).map_err(|err| err.to_string())
        } else {
            Err(format!("unknown object {kind}"))
        };
        match decoded {
            Ok(element) => selection.push(element),
            Err(message) => {
                let released = selection.release();
                debug!(released, %message, "paste aborted");
                return Err(PasteError::DataFormat { message, released });
            }
        }
    }
    Ok(selection)
}

/// True when `text` claims to be an element payload, whether or not its
/// elements decode. Anything else is pasted as plain text.
pub fn is_element_payload(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| {
            value
                .get("format")
                .and_then(Value::as_str)
                .map(|format| format == CLIPBOARD_FORMAT)
        })
        .unwrap_or(false)
}

/// Inserts a decoded selection on top of the selected layer of `page_index`
/// and returns the grouped action describing it. Call with the document
/// locked; push the returned action after unlocking.
pub fn paste_selection(
    doc: &mut Document,
    page_index: usize,
    mut selection: EditSelection,
) -> Result<UndoAction, PasteError> {
    let page = doc.page_mut(page_index).ok_or(PasteError::NoTargetPage)?;
    let page_id = page.id();
    selection.translate(PASTE_OFFSET, PASTE_OFFSET);

    let layer = page.selected_layer_mut();
    let indices: Vec<usize> = selection
        .into_elements()
        .into_iter()
        .map(|element| layer.add_element(element))
        .collect();
    let layer_index = page.selected_layer_index();
    let children = indices
        .into_iter()
        .map(|index| UndoAction::inserted_element(page_id, layer_index, index))
        .collect();
    Ok(UndoAction::group("Paste", children))
}

/// Adds `text` as a text element centred on the page.
pub fn paste_text(
    doc: &mut Document,
    page_index: usize,
    text: &str,
    font: Font,
    color: Color,
) -> Result<UndoAction, PasteError> {
    let page = doc.page_mut(page_index).ok_or(PasteError::NoTargetPage)?;
    let mut element = Element::Text(Text {
        position: Point::new(0.0, 0.0),
        text: text.to_string(),
        font,
        color,
    });
    let bounds = element.bounds();
    let x = (page.width() / 2.0 - bounds.width / 2.0).max(0.0);
    let y = (page.height() / 2.0 - bounds.height / 2.0).max(0.0);
    element.translate(x, y);

    let page_id = page.id();
    let index = page.selected_layer_mut().add_element(element);
    Ok(UndoAction::inserted_element(
        page_id,
        page.selected_layer_index(),
        index,
    ))
}

/// Removes every element of the selected layer. Returns the clipboard payload
/// and the action that restores them, or `None` if there was nothing to cut.
pub fn cut_layer(
    doc: &mut Document,
    page_index: usize,
) -> serde_json::Result<Option<(String, UndoAction)>> {
    let Some(payload) = copy_layer(doc, page_index)? else {
        return Ok(None);
    };
    let Some(page) = doc.page_mut(page_index) else {
        return Ok(None);
    };
    let page_id = page.id();
    let layer_index = page.selected_layer_index();
    let layer = page.selected_layer_mut();

    // highest index first, so the remaining indices stay valid
    let mut children = Vec::with_capacity(layer.len());
    while let Some(index) = layer.len().checked_sub(1) {
        if let Some(element) = layer.remove_element(index) {
            children.push(UndoAction::deleted_element(page_id, layer_index, index, element));
        }
    }
    Ok(Some((payload, UndoAction::group("Cut", children))))
}
