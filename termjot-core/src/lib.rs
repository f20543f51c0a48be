use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::model::PropertyKind;

pub mod busy;
pub mod changes;
pub mod clipboard;
pub mod clock;
pub mod config;
pub mod jobs;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod undo;

pub use busy::{Busy, BusySurface};
pub use changes::{ChangeAggregator, DocumentEvent, DocumentListener, DrainOutcome, EventRecorder};
pub use clock::{Maintenance, MaintenanceClock};
pub use config::EditorConfig;
pub use jobs::{DocumentExporter, DocumentPersistence, ExportFormat};
pub use model::{Color, Document, Element, Page, PageId, PageTemplate};
pub use scheduler::{
    Job, JobContext, JobError, JobEvent, JobEventKind, JobHandle, JobOutput, JobPriority,
    JobScheduler, JobState, Mailbox,
};
pub use store::{DocumentGuard, DocumentStore};
pub use undo::{ActionError, ActionLog, ActionLogListener, SavePoint, UndoAction};

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0d6a52-8e0b-5c9e-9a51-2d7c4be1f6a3").expect("valid namespace UUID")
});

/// Stable key for a document file, independent of how the path was spelled.
pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&DOCUMENT_NAMESPACE, rendered.as_bytes())
}

/// Per-document view state remembered between sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub current_page: usize,
}

pub trait MetadataStore: Send + Sync {
    fn load(&self, id: DocumentId) -> Result<Option<MetadataEntry>>;
    fn save(&self, id: DocumentId, entry: &MetadataEntry) -> Result<()>;
}

pub struct FileMetadataStore {
    root: PathBuf,
}

impl FileMetadataStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create metadata directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn entry_path(&self, id: DocumentId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }
}

impl MetadataStore for FileMetadataStore {
    fn load(&self, id: DocumentId) -> Result<Option<MetadataEntry>> {
        let path = self.entry_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let mut file =
            File::open(&path).with_context(|| format!("failed to open metadata {:?}", path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let entry = serde_json::from_str(&buf)
            .with_context(|| format!("failed to decode metadata {:?}", path))?;
        Ok(Some(entry))
    }

    fn save(&self, id: DocumentId, entry: &MetadataEntry) -> Result<()> {
        let path = self.entry_path(id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(entry)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp metadata file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: Mutex<HashMap<DocumentId, MetadataEntry>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn load(&self, id: DocumentId) -> Result<Option<MetadataEntry>> {
        Ok(self.inner.lock().get(&id).cloned())
    }

    fn save(&self, id: DocumentId, entry: &MetadataEntry) -> Result<()> {
        self.inner.lock().insert(id, entry.clone());
        Ok(())
    }
}

/// Loads documents for the initial open, before the scheduler is involved.
#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Document>;
}

pub struct OpenedDocument {
    pub id: DocumentId,
    pub document: Document,
    pub metadata: MetadataEntry,
}

/// Opens `path` through `provider` and attaches its remembered view state.
#[instrument(skip(provider, metadata))]
pub async fn open_with<P: DocumentProvider + ?Sized>(
    provider: &P,
    metadata: &dyn MetadataStore,
    path: PathBuf,
) -> Result<OpenedDocument> {
    let mut document = provider.open(&path).await?;
    document.set_filename(Some(path.clone()));
    let id = document_id_for_path(&path);
    let mut entry = metadata.load(id)?.unwrap_or_default();
    if entry.current_page >= document.page_count() {
        entry.current_page = document.page_count().saturating_sub(1);
    }
    debug!(%id, pages = document.page_count(), "document opened");
    Ok(OpenedDocument {
        id,
        document,
        metadata: entry,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    NextPage { count: usize },
    PrevPage { count: usize },
    GotoPage { page: usize },
    LastPage,
    InsertPage,
    DeletePage,
    SetPageSize { width: f64, height: f64 },
    SetBackgroundColor { color: Color },
    Undo { count: usize },
    Redo { count: usize },
    SampleStroke,
    InsertText { text: String },
    DeleteLastElement,
    /// Steps the last element of the current layer to the next value of `kind`.
    CycleProperty { kind: PropertyKind },
    Copy,
    Cut,
    Paste,
    Save,
    SaveAs { path: PathBuf },
    Open { path: PathBuf },
    Export { format: ExportFormat },
    NewDocument,
    Quit,
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    use crate::model::PageTemplate;

    struct FakeProvider {
        pages: usize,
    }

    #[async_trait::async_trait]
    impl DocumentProvider for FakeProvider {
        async fn open(&self, _path: &Path) -> Result<Document> {
            let mut document = Document::new();
            for _ in 0..self.pages {
                document.add_page(Page::from_template(&PageTemplate::default()));
            }
            Ok(document)
        }
    }

    #[tokio::test]
    async fn open_with_restores_and_clamps_remembered_page() {
        let metadata = MemoryMetadataStore::new();
        let path = PathBuf::from("/tmp/termjot-example.json");
        metadata
            .save(
                document_id_for_path(&path),
                &MetadataEntry { current_page: 40 },
            )
            .unwrap();

        let opened = open_with(&FakeProvider { pages: 3 }, &metadata, path.clone())
            .await
            .unwrap();
        assert_eq!(opened.metadata.current_page, 2);
        assert_eq!(opened.document.filename(), Some(path.as_path()));
        assert_eq!(opened.id, document_id_for_path(&path));
    }

    #[test]
    fn document_id_is_stable_for_same_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sample.json");
        std::fs::write(&file_path, b"{}").unwrap();

        let first = document_id_for_path(&file_path);
        let second = document_id_for_path(&dir.path().join(".").join("sample.json"));

        assert_eq!(first, second);
    }

    #[test]
    fn file_metadata_store_round_trips_entries() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sample.json");
        std::fs::write(&file_path, b"{}").unwrap();
        let id = document_id_for_path(&file_path);

        let store = FileMetadataStore::new(dir.path().join("state")).unwrap();
        assert!(store.load(id).unwrap().is_none());

        store.save(id, &MetadataEntry { current_page: 2 }).unwrap();
        assert_eq!(
            store.load(id).unwrap(),
            Some(MetadataEntry { current_page: 2 })
        );
        assert!(!dir.path().join("state").join(format!("{id}.json.tmp")).exists());
    }
}
