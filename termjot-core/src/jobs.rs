//! Concrete jobs and the collaborator interfaces they drive.
//!
//! Every job copies what it needs while holding the document lock and releases
//! it before doing I/O, so the interactive context is never stalled by a slow
//! disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::model::Document;
use crate::scheduler::{Job, JobContext, JobError, JobOutput};
use crate::store::DocumentStore;
use crate::undo::SavePoint;

pub const DOCUMENT_EXTENSION: &str = "json";
pub const AUTOSAVE_SUFFIX: &str = ".autosave.json";

/// Reads and writes whole documents. Implementations must not keep a
/// reference to the document beyond the call.
pub trait DocumentPersistence: Send + Sync {
    fn write(&self, document: &Document, path: &Path) -> Result<()>;
    fn read(&self, path: &Path) -> Result<Document>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Svg,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Svg => "svg",
            ExportFormat::Json => "json",
        }
    }
}

pub trait DocumentExporter: Send + Sync {
    /// `progress(done, total)` is called as pages are produced, from any thread.
    fn export(
        &self,
        document: &Document,
        format: ExportFormat,
        target: &Path,
        progress: &(dyn Fn(usize, usize) + Sync),
    ) -> Result<()>;
}

fn snapshot(store: &DocumentStore) -> Document {
    store.lock().clone()
}

/// Writes the current document to `target`. Blocking: input stays disabled
/// until the file is on disk.
pub struct SaveJob {
    store: Arc<DocumentStore>,
    persistence: Arc<dyn DocumentPersistence>,
    target: PathBuf,
    point: SavePoint,
}

impl SaveJob {
    /// `point` is the action-log position being saved, reported back so the
    /// log can be marked clean at exactly that position.
    pub fn new(
        store: Arc<DocumentStore>,
        persistence: Arc<dyn DocumentPersistence>,
        target: PathBuf,
        point: SavePoint,
    ) -> Self {
        Self {
            store,
            persistence,
            target,
            point,
        }
    }
}

impl Job for SaveJob {
    fn name(&self) -> &str {
        "Save"
    }

    fn is_blocking(&self) -> bool {
        true
    }

    #[instrument(skip_all, fields(target = %self.target.display()))]
    fn run(&self, _ctx: &JobContext) -> Result<JobOutput, JobError> {
        let document = snapshot(&self.store);
        self.persistence
            .write(&document, &self.target)
            .with_context(|| format!("could not save {}", self.target.display()))?;
        info!(pages = document.page_count(), "document saved");
        Ok(JobOutput::Saved {
            path: self.target.clone(),
            point: self.point,
        })
    }
}

/// Background copy of the document next to (or instead of) the real file.
pub struct AutosaveJob {
    store: Arc<DocumentStore>,
    persistence: Arc<dyn DocumentPersistence>,
    target: PathBuf,
    point: SavePoint,
}

impl AutosaveJob {
    pub fn new(
        store: Arc<DocumentStore>,
        persistence: Arc<dyn DocumentPersistence>,
        target: PathBuf,
        point: SavePoint,
    ) -> Self {
        Self {
            store,
            persistence,
            target,
            point,
        }
    }
}

impl Job for AutosaveJob {
    fn name(&self) -> &str {
        "Autosave"
    }

    #[instrument(skip_all, fields(target = %self.target.display()))]
    fn run(&self, _ctx: &JobContext) -> Result<JobOutput, JobError> {
        let document = snapshot(&self.store);
        if let Some(dir) = self.target.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("could not create autosave directory {}", dir.display()))?;
        }
        self.persistence
            .write(&document, &self.target)
            .with_context(|| format!("autosave to {} failed", self.target.display()))?;
        Ok(JobOutput::Autosaved {
            path: self.target.clone(),
            point: self.point,
        })
    }
}

pub struct ExportJob {
    store: Arc<DocumentStore>,
    exporter: Arc<dyn DocumentExporter>,
    format: ExportFormat,
    target: PathBuf,
}

impl ExportJob {
    pub fn new(
        store: Arc<DocumentStore>,
        exporter: Arc<dyn DocumentExporter>,
        format: ExportFormat,
        target: PathBuf,
    ) -> Self {
        Self {
            store,
            exporter,
            format,
            target,
        }
    }
}

impl Job for ExportJob {
    fn name(&self) -> &str {
        "Export"
    }

    fn is_blocking(&self) -> bool {
        true
    }

    #[instrument(skip_all, fields(format = ?self.format, target = %self.target.display()))]
    fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        let document = snapshot(&self.store);
        if document.page_count() == 0 {
            return Err(JobError::Failed("nothing to export: the document has no pages".into()));
        }
        ctx.set_maximum_state(document.page_count());
        let progress = |done: usize, _total: usize| ctx.set_current_state(done);
        self.exporter
            .export(&document, self.format, &self.target, &progress)
            .with_context(|| format!("export to {} failed", self.target.display()))?;
        Ok(JobOutput::Exported(self.target.clone()))
    }
}

/// Reads a document from disk. The store is not touched; the interactive
/// context swaps the result in so history and document change together.
pub struct LoadJob {
    persistence: Arc<dyn DocumentPersistence>,
    path: PathBuf,
}

impl LoadJob {
    pub fn new(persistence: Arc<dyn DocumentPersistence>, path: PathBuf) -> Self {
        Self { persistence, path }
    }
}

impl Job for LoadJob {
    fn name(&self) -> &str {
        "Load"
    }

    fn is_blocking(&self) -> bool {
        true
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn run(&self, _ctx: &JobContext) -> Result<JobOutput, JobError> {
        let mut document = self
            .persistence
            .read(&self.path)
            .with_context(|| format!("could not open {}", self.path.display()))?;
        document.set_filename(Some(self.path.clone()));
        Ok(JobOutput::Loaded {
            path: self.path.clone(),
            document: Box::new(document),
        })
    }
}

/// Where the autosave copy of a document goes: a hidden sibling of the saved
/// file, or a per-document file in `autosave_dir` while it has no name.
pub fn autosave_target(filename: Option<&Path>, autosave_dir: &Path, key: Uuid) -> PathBuf {
    match filename {
        Some(path) => {
            let stem = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string());
            let name = format!(".{stem}{AUTOSAVE_SUFFIX}");
            match path.parent() {
                Some(parent) => parent.join(name),
                None => PathBuf::from(name),
            }
        }
        None => autosave_dir.join(format!("unsaved-{}{AUTOSAVE_SUFFIX}", key.simple())),
    }
}

/// True for files that are themselves autosave copies or live in the autosave
/// directory; those are never opened as documents.
pub fn is_autosave_file(path: &Path, autosave_dir: &Path) -> bool {
    let named_like_autosave = path
        .file_name()
        .map(|name| name.to_string_lossy().ends_with(AUTOSAVE_SUFFIX))
        .unwrap_or(false);
    if named_like_autosave {
        return true;
    }
    canonical(path).starts_with(canonical(autosave_dir))
}

fn canonical(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    // not on disk (yet): resolve the directory and keep the name
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use parking_lot::Mutex;
    use tempfile::tempdir;

    use crate::model::{Page, PageTemplate};
    use crate::scheduler::{JobEventKind, JobPriority, JobScheduler, JobState, Mailbox};

    #[derive(Default)]
    struct MemoryPersistence {
        files: Mutex<HashMap<PathBuf, Document>>,
    }

    impl DocumentPersistence for MemoryPersistence {
        fn write(&self, document: &Document, path: &Path) -> Result<()> {
            if path.starts_with("/readonly") {
                anyhow::bail!("permission denied");
            }
            self.files.lock().insert(path.to_path_buf(), document.clone());
            Ok(())
        }

        fn read(&self, path: &Path) -> Result<Document> {
            self.files
                .lock()
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such file"))
        }
    }

    struct CountingExporter;

    impl DocumentExporter for CountingExporter {
        fn export(
            &self,
            document: &Document,
            _format: ExportFormat,
            _target: &Path,
            progress: &(dyn Fn(usize, usize) + Sync),
        ) -> Result<()> {
            for done in 1..=document.page_count() {
                progress(done, document.page_count());
            }
            Ok(())
        }
    }

    fn store(pages: usize) -> Arc<DocumentStore> {
        let mut doc = Document::new();
        for _ in 0..pages {
            doc.add_page(Page::from_template(&PageTemplate::default()));
        }
        Arc::new(DocumentStore::new(doc))
    }

    #[test]
    fn save_job_writes_a_snapshot_and_reports_the_save_point() {
        let store = store(2);
        let persistence = Arc::new(MemoryPersistence::default());
        let scheduler = JobScheduler::new(1, Mailbox::new()).unwrap();
        let job = SaveJob::new(
            Arc::clone(&store),
            persistence.clone(),
            PathBuf::from("/notes/a.json"),
            SavePoint::default(),
        );

        match scheduler.run_now(&job).unwrap() {
            JobOutput::Saved { path, point } => {
                assert_eq!(path, PathBuf::from("/notes/a.json"));
                assert_eq!(point, SavePoint::default());
            }
            other => panic!("unexpected {other:?}"),
        }
        let saved = persistence.read(Path::new("/notes/a.json")).unwrap();
        assert_eq!(saved.page_count(), 2);
        assert!(!store.is_locked());
    }

    #[test]
    fn failed_save_is_reported_once_through_the_mailbox() {
        let mailbox = Mailbox::new();
        let scheduler = JobScheduler::new(1, Arc::clone(&mailbox)).unwrap();
        let job = Arc::new(SaveJob::new(
            store(1),
            Arc::new(MemoryPersistence::default()),
            PathBuf::from("/readonly/a.json"),
            SavePoint::default(),
        ));
        let handle = scheduler.add_job(job, JobPriority::Urgent);
        assert!(matches!(
            handle.wait_timeout(std::time::Duration::from_secs(5)),
            JobState::Failed(_)
        ));

        let failures: Vec<_> = mailbox
            .drain()
            .into_iter()
            .filter_map(|event| match event.kind {
                JobEventKind::Failed(message) => Some((event.blocking, message)),
                _ => None,
            })
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].0);
        assert!(failures[0].1.contains("could not save /readonly/a.json"));
    }

    #[test]
    fn export_reports_progress_per_page() {
        let mailbox = Mailbox::new();
        let scheduler = JobScheduler::new(1, Arc::clone(&mailbox)).unwrap();
        let job = ExportJob::new(
            store(3),
            Arc::new(CountingExporter),
            ExportFormat::Svg,
            PathBuf::from("/tmp/out.svg"),
        );
        scheduler.run_now(&job).unwrap();

        let progress: Vec<_> = mailbox
            .drain()
            .into_iter()
            .filter_map(|event| match event.kind {
                JobEventKind::Progress { current, maximum } => Some((current, maximum)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(0, 3), (1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn empty_document_is_not_exported() {
        let scheduler = JobScheduler::new(1, Mailbox::new()).unwrap();
        let job = ExportJob::new(
            store(0),
            Arc::new(CountingExporter),
            ExportFormat::Json,
            PathBuf::from("/tmp/out.json"),
        );
        assert!(scheduler.run_now(&job).is_err());
    }

    #[test]
    fn load_job_names_the_document_after_its_file() {
        let persistence = Arc::new(MemoryPersistence::default());
        persistence
            .write(&Document::with_page(&PageTemplate::default()), Path::new("/notes/b.json"))
            .unwrap();
        let scheduler = JobScheduler::new(1, Mailbox::new()).unwrap();

        match scheduler
            .run_now(&LoadJob::new(persistence, PathBuf::from("/notes/b.json")))
            .unwrap()
        {
            JobOutput::Loaded { document, .. } => {
                assert_eq!(document.filename(), Some(Path::new("/notes/b.json")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn autosave_job_creates_its_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested").join("unsaved.autosave.json");
        let persistence = Arc::new(MemoryPersistence::default());
        let scheduler = JobScheduler::new(1, Mailbox::new()).unwrap();
        let job = AutosaveJob::new(store(1), persistence.clone(), target.clone(), SavePoint::default());

        scheduler.run_now(&job).unwrap();
        assert!(dir.path().join("nested").is_dir());
        assert!(persistence.read(&target).is_ok());
    }

    #[test]
    fn autosave_targets() {
        let key = Uuid::nil();
        let dir = Path::new("/data/autosave");
        assert_eq!(
            autosave_target(Some(Path::new("/notes/lecture.json")), dir, key),
            PathBuf::from("/notes/.lecture.autosave.json")
        );
        assert_eq!(
            autosave_target(None, dir, key),
            dir.join(format!("unsaved-{}.autosave.json", key.simple()))
        );
    }

    #[test]
    fn autosave_files_are_recognised() {
        let dir = tempdir().unwrap();
        let autosave = dir.path().join("autosave");
        fs::create_dir_all(&autosave).unwrap();

        assert!(is_autosave_file(&autosave.join("anything.json"), &autosave));
        assert!(is_autosave_file(
            &dir.path().join(".notes.autosave.json"),
            &autosave
        ));
        assert!(!is_autosave_file(&dir.path().join("notes.json"), &autosave));
    }
}
