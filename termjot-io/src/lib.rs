use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use termjot_core::{Document, DocumentPersistence, DocumentProvider};
use thiserror::Error;
use tracing::{debug, instrument};

mod export;

pub use export::{render_page_svg, FileExporter};

pub const FORMAT_NAME: &str = "termjot";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{path:?} is not a termjot document (format {found:?})")]
    WrongFormat { path: PathBuf, found: String },
    #[error("{path:?} was written by a newer termjot (format version {found})")]
    UnsupportedVersion { path: PathBuf, found: u32 },
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format: &'static str,
    version: u32,
    document: &'a Document,
}

#[derive(Deserialize)]
struct Envelope {
    format: String,
    version: u32,
    document: Document,
}

/// Documents as pretty JSON wrapped in a small format envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDocumentCodec;

impl JsonDocumentCodec {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentPersistence for JsonDocumentCodec {
    #[instrument(skip(self, document), fields(pages = document.page_count()))]
    fn write(&self, document: &Document, path: &Path) -> Result<()> {
        let payload = serde_json::to_vec_pretty(&EnvelopeRef {
            format: FORMAT_NAME,
            version: FORMAT_VERSION,
            document,
        })?;
        write_atomically(path, &payload)
    }

    #[instrument(skip(self))]
    fn read(&self, path: &Path) -> Result<Document> {
        let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
        let envelope: Envelope = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to decode {:?}", path))?;
        if envelope.format != FORMAT_NAME {
            return Err(CodecError::WrongFormat {
                path: path.to_path_buf(),
                found: envelope.format,
            }
            .into());
        }
        if envelope.version > FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: envelope.version,
            }
            .into());
        }
        debug!(pages = envelope.document.page_count(), "document decoded");
        Ok(envelope.document)
    }
}

#[async_trait]
impl DocumentProvider for JsonDocumentCodec {
    async fn open(&self, path: &Path) -> Result<Document> {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", path))?;
        self.read(&absolute)
    }
}

/// Writes next to `path` first and renames over it, so readers never see a
/// half-written file.
pub(crate) fn write_atomically(path: &Path, payload: &[u8]) -> Result<()> {
    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    let mut file =
        File::create(&tmp).with_context(|| format!("failed to open temp file {:?}", tmp))?;
    file.write_all(payload)?;
    file.flush()?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {:?}", path))?;
    Ok(())
}
