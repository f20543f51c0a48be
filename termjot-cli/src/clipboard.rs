use anyhow::{anyhow, Result};
use tracing::warn;

/// Plain-text clipboard used for copy, cut and paste.
pub trait TextClipboard {
    fn get_text(&mut self) -> Result<String>;
    fn set_text(&mut self, text: String) -> Result<()>;
}

/// The desktop clipboard when one is reachable, otherwise a buffer private to
/// this process (e.g. on a headless console).
pub struct SystemClipboard {
    system: Option<arboard::Clipboard>,
    local: Option<String>,
}

impl SystemClipboard {
    pub fn new() -> Self {
        let system = match arboard::Clipboard::new() {
            Ok(clipboard) => Some(clipboard),
            Err(err) => {
                warn!(%err, "system clipboard unavailable, using a private one");
                None
            }
        };
        Self {
            system,
            local: None,
        }
    }
}

impl TextClipboard for SystemClipboard {
    fn get_text(&mut self) -> Result<String> {
        match self.system.as_mut() {
            Some(clipboard) => Ok(clipboard.get_text()?),
            None => self
                .local
                .clone()
                .ok_or_else(|| anyhow!("the clipboard is empty")),
        }
    }

    fn set_text(&mut self, text: String) -> Result<()> {
        match self.system.as_mut() {
            Some(clipboard) => Ok(clipboard.set_text(text)?),
            None => {
                self.local = Some(text);
                Ok(())
            }
        }
    }
}
