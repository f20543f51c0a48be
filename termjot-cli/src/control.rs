//! The interactive context. `Control` is the only owner of the action log and
//! the busy state; it turns commands into document edits and jobs, and turns
//! job events coming back through the mailbox into log updates and messages.

use std::fs;
use std::mem::{self, Discriminant};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use termjot_core::clipboard;
use termjot_core::jobs::{
    autosave_target, is_autosave_file, AutosaveJob, ExportJob, LoadJob, SaveJob,
    DOCUMENT_EXTENSION,
};
use termjot_core::model::{ElementProperty, Font, LineStyle, Point, PropertyKind, Stroke, BLACK};
use termjot_core::undo::PropertyTarget;
use termjot_core::{
    document_id_for_path, ActionLog, ActionLogListener, Busy, BusySurface, ChangeAggregator,
    Color, Command, Document, DocumentEvent, DocumentExporter, DocumentGuard, DocumentListener,
    DocumentPersistence, DocumentStore, DrainOutcome, EditorConfig, Element, ExportFormat, Job, JobEvent,
    JobEventKind, JobHandle, JobOutput, JobPriority, JobScheduler, Maintenance, MaintenanceClock,
    MetadataEntry, MetadataStore, Page, PageId, PageTemplate, UndoAction,
};
use termjot_tty::StatusInfo;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::clipboard::TextClipboard;
use crate::view;

const APP_NAME: &str = "termjot";

const PALETTE: [Color; 5] = [BLACK, 0x3333cc, 0xcc3333, 0x33aa33, 0xff8800];
const STROKE_WIDTHS: [f64; 4] = [1.0, 2.0, 4.0, 8.0];
const FONT_SIZES: [f64; 4] = [12.0, 16.0, 24.0, 32.0];
const FONT_FAMILIES: [&str; 3] = ["Sans", "Serif", "Monospace"];
const FILL_ALPHA: u8 = 128;

/// Everything `Control` coordinates, built by the caller.
pub struct Services {
    pub store: Arc<DocumentStore>,
    pub scheduler: JobScheduler,
    pub changes: Arc<ChangeAggregator>,
    pub persistence: Arc<dyn DocumentPersistence>,
    pub exporter: Arc<dyn DocumentExporter>,
    pub metadata: Arc<dyn MetadataStore>,
    pub clipboard: Box<dyn TextClipboard>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

struct PageFeed(Arc<ChangeAggregator>);

impl ActionLogListener for PageFeed {
    fn undo_redo_changed(&self, log: &ActionLog) {
        trace!(
            can_undo = log.can_undo(),
            can_redo = log.can_redo(),
            changed = log.is_changed(),
            "history changed"
        );
    }

    fn undo_redo_page_changed(&self, page: PageId) {
        self.0.notify_page_changed(page);
    }
}

#[derive(Default)]
struct RefreshFlag(AtomicBool);

impl RefreshFlag {
    fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::Relaxed)
    }
}

impl DocumentListener for RefreshFlag {
    fn document_event(&self, event: DocumentEvent) {
        trace!(?event, "document event");
        self.raise();
    }
}

pub struct Control<S: BusySurface> {
    services: Services,
    log: ActionLog,
    busy: Busy<S>,
    clock: MaintenanceClock,
    refresh: Arc<RefreshFlag>,
    template: PageTemplate,
    autosave_dir: PathBuf,
    autosave_key: Uuid,
    last_autosave: Option<PathBuf>,
    current_page: usize,
    message: Option<String>,
    discard_armed: Option<Discriminant<Command>>,
}

impl<S: BusySurface> Control<S> {
    pub fn new(
        services: Services,
        surface: S,
        config: &EditorConfig,
        autosave_dir: PathBuf,
        now: Instant,
    ) -> Self {
        let mut log = ActionLog::with_max_depth(config.history.max_depth);
        log.add_listener(Box::new(PageFeed(Arc::clone(&services.changes))));

        let refresh = Arc::new(RefreshFlag::default());
        services.changes.subscribe(refresh.clone());

        let mut clock = MaintenanceClock::new();
        clock.schedule(Maintenance::ChangeDrain, config.changes.drain_interval(), now);
        if config.autosave.enabled {
            clock.schedule(Maintenance::Autosave, config.autosave.interval(), now);
        }

        Self {
            services,
            log,
            busy: Busy::new(surface),
            clock,
            refresh,
            template: config.page.template(),
            autosave_dir,
            autosave_key: Uuid::new_v4(),
            last_autosave: None,
            current_page: 0,
            message: None,
            discard_armed: None,
        }
    }

    /// Replaces the document and starts a fresh history for it.
    pub fn install(&mut self, mut document: Document, current_page: usize) {
        if document.page_count() == 0 {
            document.add_page(Page::from_template(&self.template));
        }
        self.discard_autosave();
        let pages = {
            let mut doc = self.services.store.lock();
            doc.replace(document);
            doc.page_count()
        };
        self.log.clear_contents();
        self.autosave_key = Uuid::new_v4();
        self.current_page = current_page.min(pages.saturating_sub(1));
        self.services.changes.fire(DocumentEvent::DocumentChanged);
    }

    pub fn busy(&self) -> &Busy<S> {
        &self.busy
    }

    pub fn busy_mut(&mut self) -> &mut Busy<S> {
        &mut self.busy
    }

    pub fn is_blocked(&self) -> bool {
        self.busy.is_blocked()
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// True once after anything visible changed.
    pub fn take_refresh(&self) -> bool {
        self.refresh.take()
    }

    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.clock.next_deadline(now)
    }

    fn document(&self) -> DocumentGuard<'_> {
        self.services.store.lock()
    }

    /// Messages go to the status line; this is the only place user-facing
    /// reports are produced.
    fn report(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(%message, "reported to user");
        self.message = Some(message);
        self.refresh.raise();
    }

    pub fn title(&self) -> String {
        let doc = self.document();
        let name = if doc.filename().is_none() && doc.background_file().is_none() {
            "Unsaved Document".to_string()
        } else {
            let marker = if self.log.is_changed() { "*" } else { "" };
            format!("{marker}{}", doc.display_name().unwrap_or_default())
        };
        format!("{name} - {APP_NAME}")
    }

    pub fn status(&self, pending: Option<String>) -> StatusInfo {
        let title = self.title();
        let doc = self.document();
        StatusInfo {
            title,
            page: self.current_page,
            page_count: doc.page_count(),
            elements: doc
                .page(self.current_page)
                .map(Page::element_count)
                .unwrap_or(0),
            undo: self.log.undo_description(),
            pending,
            message: self.message.clone(),
        }
    }

    pub fn page_lines(&self) -> Vec<String> {
        let doc = self.document();
        doc.page(self.current_page)
            .map(|page| view::page_lines(page, self.current_page, doc.page_count()))
            .unwrap_or_default()
    }

    #[instrument(skip(self), level = "debug")]
    pub fn handle(&mut self, command: Command) -> Result<Flow> {
        if self.busy.is_blocked() {
            debug!(reason = self.busy.reason(), "input ignored while busy");
            return Ok(Flow::Continue);
        }
        let kind = mem::discriminant(&command);
        let confirmed = self.discard_armed.take() == Some(kind);
        self.message = None;
        self.refresh.raise();

        match command {
            Command::NextPage { count } => self.goto(self.current_page.saturating_add(count)),
            Command::PrevPage { count } => self.goto(self.current_page.saturating_sub(count)),
            Command::GotoPage { page } => self.goto(page),
            Command::LastPage => self.goto(usize::MAX),
            Command::InsertPage => self.insert_page(),
            Command::DeletePage => self.delete_page(),
            Command::SetPageSize { width, height } => self.set_page_size(width, height),
            Command::SetBackgroundColor { color } => self.set_background_color(color),
            Command::Undo { count } => self.step_history(count, false),
            Command::Redo { count } => self.step_history(count, true),
            Command::SampleStroke => self.sample_stroke(),
            Command::InsertText { text } => self.insert_text(&text),
            Command::DeleteLastElement => self.delete_last_element(),
            Command::CycleProperty { kind } => self.cycle_property(kind),
            Command::Copy => self.copy()?,
            Command::Cut => self.cut()?,
            Command::Paste => self.paste(),
            Command::Save => self.save(),
            Command::SaveAs { path } => self.save_as(path),
            Command::Export { format } => self.export(format),
            Command::Open { path } => self.open(path, kind, confirmed),
            Command::NewDocument => self.new_document(kind, confirmed),
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    fn goto(&mut self, page: usize) {
        let count = self.document().page_count();
        self.current_page = page.min(count.saturating_sub(1));
    }

    fn insert_page(&mut self) {
        let page = Page::from_template(&self.template);
        let id = page.id();
        let index = {
            let mut doc = self.document();
            let at = (self.current_page + 1).min(doc.page_count());
            doc.insert_page(page, at)
        };
        self.log.push(UndoAction::inserted_page(id, index));
        self.services.changes.fire(DocumentEvent::PageInserted(index));
        self.current_page = index;
    }

    fn delete_page(&mut self) {
        let index = self.current_page;
        let removed = {
            let mut doc = self.document();
            if doc.page_count() < 2 {
                None
            } else {
                doc.delete_page(index)
            }
        };
        let Some(page) = removed else {
            self.report("Cannot delete the only page");
            return;
        };
        self.log.push(UndoAction::deleted_page(index, page));
        self.services.changes.fire(DocumentEvent::PageDeleted(index));
        self.goto(index);
    }

    fn set_page_size(&mut self, width: f64, height: f64) {
        if !(width > 0.0 && height > 0.0) {
            self.report(format!("Invalid page size {width}x{height}"));
            return;
        }
        let resized = self
            .document()
            .set_page_size(self.current_page, width, height);
        if resized {
            self.services
                .changes
                .fire(DocumentEvent::PageSizeChanged(self.current_page));
        }
    }

    fn set_background_color(&mut self, color: Color) {
        let id = {
            let mut doc = self.document();
            doc.page_mut(self.current_page).map(|page| {
                page.set_background_color(color);
                page.id()
            })
        };
        if let Some(id) = id {
            self.services.changes.notify_page_changed(id);
        }
    }

    fn step_history(&mut self, count: usize, redo: bool) {
        let store = Arc::clone(&self.services.store);
        let mut events = Vec::new();
        let mut last = None;
        let mut failure = None;
        {
            let mut doc = store.lock();
            for _ in 0..count.max(1) {
                let result = if redo {
                    self.log.redo(&mut doc)
                } else {
                    self.log.undo(&mut doc)
                };
                match result {
                    Ok(Some(step)) => {
                        events.extend(step.events);
                        last = Some(step.description);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }
        for event in events {
            self.services.changes.fire(event);
        }
        self.goto(self.current_page);

        let verb = if redo { "Redo" } else { "Undo" };
        match (failure, last) {
            (Some(err), _) => {
                warn!(%err, redo, "history step failed");
                self.report(format!("{verb} failed: {err}"));
            }
            (None, Some(description)) => self.report(format!("{verb}: {description}")),
            (None, None) => {
                let what = if redo { "redo" } else { "undo" };
                self.report(format!("Nothing to {what}"));
            }
        }
    }

    fn sample_stroke(&mut self) {
        let action = {
            let mut doc = self.document();
            doc.page_mut(self.current_page).map(|page| {
                let n = page.element_count() as f64;
                let (x, y) = (40.0 + (n % 10.0) * 50.0, 60.0 + (n / 10.0).floor() * 40.0);
                let points = (0..8)
                    .map(|i| {
                        let dy = if i % 2 == 0 { 0.0 } else { 12.0 };
                        Point::new(x + f64::from(i) * 5.0, y + dy)
                    })
                    .collect();
                let id = page.id();
                let layer = page.selected_layer_index();
                let index = page.selected_layer_mut().add_element(Element::Stroke(Stroke {
                    points,
                    width: 1.4,
                    color: BLACK,
                    fill: None,
                    line_style: LineStyle::Solid,
                }));
                UndoAction::inserted_element(id, layer, index)
            })
        };
        if let Some(action) = action {
            self.log.push(action);
        }
    }

    fn insert_text(&mut self, text: &str) {
        let result = {
            let mut doc = self.document();
            clipboard::paste_text(&mut doc, self.current_page, text, Font::default(), BLACK)
        };
        match result {
            Ok(action) => self.log.push(action),
            Err(err) => self.report(err.to_string()),
        }
    }

    fn delete_last_element(&mut self) {
        let action = {
            let mut doc = self.document();
            doc.page_mut(self.current_page).and_then(|page| {
                let id = page.id();
                let layer_index = page.selected_layer_index();
                let layer = page.selected_layer_mut();
                let index = layer.len().checked_sub(1)?;
                let element = layer.remove_element(index)?;
                Some(UndoAction::deleted_element(id, layer_index, index, element))
            })
        };
        match action {
            Some(action) => self.log.push(action),
            None => self.report("Nothing to delete on this layer"),
        }
    }

    fn cycle_property(&mut self, kind: PropertyKind) {
        let step = step_last_element(&mut self.document(), self.current_page, kind);
        match step {
            Ok(action) => self.log.push(action),
            Err(message) => self.report(message),
        }
    }

    fn copy(&mut self) -> Result<()> {
        let payload = clipboard::copy_layer(&self.document(), self.current_page)?;
        match payload {
            Some(payload) => match self.services.clipboard.set_text(payload) {
                Ok(()) => self.report("Layer copied"),
                Err(err) => self.report(format!("Copy failed: {err}")),
            },
            None => self.report("Nothing to copy"),
        }
        Ok(())
    }

    fn cut(&mut self) -> Result<()> {
        let cut = {
            let mut doc = self.document();
            clipboard::cut_layer(&mut doc, self.current_page)?
        };
        let Some((payload, action)) = cut else {
            self.report("Nothing to cut");
            return Ok(());
        };
        self.log.push(action);
        if let Err(err) = self.services.clipboard.set_text(payload) {
            self.report(format!("Cut elements could not reach the clipboard: {err}"));
        }
        Ok(())
    }

    fn paste(&mut self) {
        let text = match self.services.clipboard.get_text() {
            Ok(text) => text,
            Err(err) => {
                self.report(format!("Nothing to paste: {err}"));
                return;
            }
        };
        if !clipboard::is_element_payload(&text) {
            if text.trim().is_empty() {
                self.report("Nothing to paste");
            } else {
                self.insert_text(text.trim_end());
            }
            return;
        }

        // decode completely before the document is touched
        let selection = match clipboard::read_selection(&text) {
            Ok(selection) => selection,
            Err(err) => {
                warn!(%err, "paste rejected");
                self.report(format!("Paste failed: {err}"));
                return;
            }
        };
        let count = selection.len();
        let result = {
            let mut doc = self.document();
            clipboard::paste_selection(&mut doc, self.current_page, selection)
        };
        match result {
            Ok(action) => {
                self.log.push(action);
                self.report(format!("Pasted {count} elements"));
            }
            Err(err) => self.report(format!("Paste failed: {err}")),
        }
    }

    fn submit_blocking(&mut self, job: Arc<dyn Job>, priority: JobPriority) -> JobHandle {
        self.busy.block(job.name());
        self.services.scheduler.add_job(job, priority)
    }

    fn save(&mut self) {
        let filename = self.document().filename().map(Path::to_path_buf);
        let Some(target) = filename else {
            self.report("The document has no file name yet, use W to save as");
            return;
        };
        let job = SaveJob::new(
            Arc::clone(&self.services.store),
            Arc::clone(&self.services.persistence),
            target,
            self.log.save_point(),
        );
        self.submit_blocking(Arc::new(job), JobPriority::Urgent);
    }

    fn save_as(&mut self, path: PathBuf) {
        let path = if path.extension().is_none() {
            path.with_extension(DOCUMENT_EXTENSION)
        } else {
            path
        };
        if is_autosave_file(&path, &self.autosave_dir) {
            self.report(format!("{} is reserved for autosave copies", path.display()));
            return;
        }
        self.document().set_filename(Some(path));
        self.save();
    }

    fn export(&mut self, format: ExportFormat) {
        let target = match self.document().filename() {
            Some(path) => path.with_extension(format!("export.{}", format.extension())),
            None => PathBuf::from(format!("unsaved.export.{}", format.extension())),
        };
        let job = ExportJob::new(
            Arc::clone(&self.services.store),
            Arc::clone(&self.services.exporter),
            format,
            target,
        );
        self.submit_blocking(Arc::new(job), JobPriority::Background);
    }

    /// Returns `false` after arming the confirmation when unsaved work would be
    /// thrown away; the same command issued again goes through.
    fn may_discard(&mut self, kind: Discriminant<Command>, confirmed: bool) -> bool {
        if !self.log.is_changed() || confirmed {
            return true;
        }
        self.discard_armed = Some(kind);
        self.report("Unsaved changes, repeat the command to discard them");
        false
    }

    fn open(&mut self, path: PathBuf, kind: Discriminant<Command>, confirmed: bool) {
        if is_autosave_file(&path, &self.autosave_dir) {
            self.report(format!(
                "{} is an autosave file, open the document it belongs to",
                path.display()
            ));
            return;
        }
        if !self.may_discard(kind, confirmed) {
            return;
        }
        let job = LoadJob::new(Arc::clone(&self.services.persistence), path);
        self.submit_blocking(Arc::new(job), JobPriority::Urgent);
    }

    fn new_document(&mut self, kind: Discriminant<Command>, confirmed: bool) {
        if !self.may_discard(kind, confirmed) {
            return;
        }
        self.install(Document::with_page(&self.template), 0);
        self.report("New document");
    }

    /// Applies everything workers posted since the last call.
    pub fn pump(&mut self) {
        for event in self.services.scheduler.mailbox().drain() {
            self.on_job_event(event);
        }
    }

    fn on_job_event(&mut self, event: JobEvent) {
        let finished = !matches!(
            event.kind,
            JobEventKind::Started | JobEventKind::Progress { .. }
        );
        match event.kind {
            JobEventKind::Started => debug!(job = %event.name, id = event.id, "job started"),
            JobEventKind::Progress { current, maximum } => {
                if event.blocking {
                    self.busy.set_maximum_state(maximum);
                    self.busy.set_current_state(current);
                }
            }
            JobEventKind::Finished(output) => self.on_job_output(output),
            JobEventKind::Failed(message) => {
                warn!(job = %event.name, %message, "job failed");
                self.report(format!("{} failed: {message}", event.name));
            }
            JobEventKind::Discarded => debug!(job = %event.name, id = event.id, "job discarded"),
        }
        if finished && event.blocking {
            self.busy.unblock();
        }
    }

    fn on_job_output(&mut self, output: JobOutput) {
        match output {
            JobOutput::Done => {}
            JobOutput::Saved { path, point } => {
                self.log.document_saved_at(point);
                self.retire_stale_autosave();
                self.report(format!("Saved {}", path.display()));
            }
            JobOutput::Autosaved { path, point } => {
                self.log.document_autosaved_at(point);
                if let Some(previous) = self.last_autosave.replace(path) {
                    if Some(&previous) != self.last_autosave.as_ref() {
                        remove_autosave(&previous);
                    }
                }
            }
            JobOutput::Exported(path) => self.report(format!("Exported to {}", path.display())),
            JobOutput::Loaded { path, document } => {
                let page = match self.services.metadata.load(document_id_for_path(&path)) {
                    Ok(entry) => entry.map(|entry| entry.current_page).unwrap_or(0),
                    Err(err) => {
                        warn!(%err, "could not read document metadata");
                        0
                    }
                };
                self.install(*document, page);
                self.report(format!("Opened {}", path.display()));
            }
        }
    }

    /// Runs the periodic maintenance tasks that are due.
    pub fn maintenance(&mut self, now: Instant) {
        for task in self.clock.due(now) {
            match task {
                Maintenance::ChangeDrain => {
                    match self.services.changes.drain(&self.services.store) {
                        DrainOutcome::Skipped => {}
                        DrainOutcome::Drained { fired, dropped } if fired + dropped > 0 => {
                            debug!(fired, dropped, "page changes drained")
                        }
                        DrainOutcome::Drained { .. } => {}
                    }
                }
                Maintenance::Autosave => {
                    self.autosave();
                }
            }
        }
    }

    /// Queues a background autosave, unless nothing changed since the last one
    /// or a job currently holds the document.
    pub fn autosave(&mut self) -> Option<JobHandle> {
        if !self.log.is_changed_autosave() {
            trace!("autosave skipped, nothing changed");
            return None;
        }
        let Some(target) = self.current_autosave_target() else {
            debug!("autosave skipped, document busy");
            return None;
        };
        let job = AutosaveJob::new(
            Arc::clone(&self.services.store),
            Arc::clone(&self.services.persistence),
            target,
            self.log.save_point(),
        );
        Some(
            self.services
                .scheduler
                .add_job(Arc::new(job), JobPriority::Background),
        )
    }

    fn current_autosave_target(&self) -> Option<PathBuf> {
        let doc = self.services.store.try_lock()?;
        Some(autosave_target(
            doc.filename(),
            &self.autosave_dir,
            self.autosave_key,
        ))
    }

    fn retire_stale_autosave(&mut self) {
        let current = {
            let doc = self.document();
            autosave_target(doc.filename(), &self.autosave_dir, self.autosave_key)
        };
        if self.last_autosave.as_ref().is_some_and(|last| *last != current) {
            self.discard_autosave();
        }
    }

    fn discard_autosave(&mut self) {
        if let Some(path) = self.last_autosave.take() {
            remove_autosave(&path);
        }
    }

    /// Runs the interactive `session`, then shuts down whether or not it
    /// failed. A session error is returned in preference to a shutdown error,
    /// which is logged.
    pub fn run_then_shutdown(
        mut self,
        session: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        let outcome = session(&mut self);
        let closed = self.shutdown();
        match (outcome, closed) {
            (Err(err), Err(close_err)) => {
                error!(%close_err, "shutdown after a failed session also failed");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), closed) => closed,
        }
    }

    /// Closes the document and stops the scheduler. A modified document with a
    /// file name is saved on this thread first; one without keeps its autosave
    /// copy.
    #[instrument(skip(self))]
    pub fn shutdown(mut self) -> Result<()> {
        self.pump();
        self.close_document();

        // metadata is read before the scheduler lock, the document lock is
        // never taken while holding it
        let metadata = {
            let doc = self.document();
            doc.filename().map(|path| {
                (
                    document_id_for_path(path),
                    MetadataEntry {
                        current_page: self.current_page,
                    },
                )
            })
        };

        let paused = self.services.scheduler.lock();
        if let Some((id, entry)) = metadata {
            if let Err(err) = self.services.metadata.save(id, &entry) {
                warn!(%err, "failed to persist document metadata");
            }
        }
        let discarded = self.services.scheduler.remove_all_jobs();
        paused.unlock();
        self.services.scheduler.shutdown();
        self.pump();
        // an autosave that landed while closing belongs to a clean document
        if !self.log.is_changed() {
            self.discard_autosave();
        }
        info!(discarded, "editor shut down");
        Ok(())
    }

    fn close_document(&mut self) {
        if self.log.is_changed() {
            let filename = self.document().filename().map(Path::to_path_buf);
            match filename {
                Some(target) => {
                    let job = SaveJob::new(
                        Arc::clone(&self.services.store),
                        Arc::clone(&self.services.persistence),
                        target,
                        self.log.save_point(),
                    );
                    let result = {
                        let _scope = self.busy.scoped("Save");
                        self.services.scheduler.run_now(&job)
                    };
                    match result {
                        Ok(JobOutput::Saved { point, .. }) => self.log.document_saved_at(point),
                        Ok(_) => {}
                        Err(err) => {
                            warn!(%err, "saving on close failed, keeping an autosave copy");
                            self.keep_autosave_copy();
                            return;
                        }
                    }
                }
                None => {
                    self.keep_autosave_copy();
                    return;
                }
            }
        }
        self.discard_autosave();
    }

    fn keep_autosave_copy(&mut self) {
        let Some(target) = self.current_autosave_target() else {
            return;
        };
        if !self.log.is_changed_autosave() {
            if let Some(path) = &self.last_autosave {
                warn!(path = %path.display(), "unsaved changes remain in the autosave copy");
            }
            return;
        }
        let job = AutosaveJob::new(
            Arc::clone(&self.services.store),
            Arc::clone(&self.services.persistence),
            target,
            self.log.save_point(),
        );
        match self.services.scheduler.run_now(&job) {
            Ok(JobOutput::Autosaved { path, point }) => {
                self.log.document_autosaved_at(point);
                warn!(path = %path.display(), "unsaved changes kept in an autosave copy");
                self.last_autosave = Some(path);
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "final autosave failed, unsaved changes are lost"),
        }
    }
}

/// Changes `kind` on the topmost element of the selected layer and returns
/// the action recording it.
fn step_last_element(
    doc: &mut Document,
    page_index: usize,
    kind: PropertyKind,
) -> std::result::Result<UndoAction, String> {
    let page = doc
        .page_mut(page_index)
        .ok_or_else(|| "Nothing to change on this page".to_string())?;
    let id = page.id();
    let layer_index = page.selected_layer_index();
    let layer = page.selected_layer_mut();
    let index = layer
        .len()
        .checked_sub(1)
        .ok_or_else(|| "Nothing to change on this layer".to_string())?;
    let element = layer
        .element_mut(index)
        .ok_or_else(|| "Nothing to change on this layer".to_string())?;
    let old = element
        .property(kind)
        .ok_or_else(|| format!("{} has no {}", element.kind_name(), property_label(kind)))?;
    let new = next_property(element, &old);
    element.set_property(&new);
    Ok(UndoAction::property(
        id,
        layer_index,
        format!("Change {}", property_label(kind)),
        vec![PropertyTarget { index, old, new }],
    ))
}

fn property_label(kind: PropertyKind) -> &'static str {
    match kind {
        PropertyKind::Color => "color",
        PropertyKind::Size => "size",
        PropertyKind::Fill => "fill",
        PropertyKind::Font => "font",
        PropertyKind::LineStyle => "line style",
    }
}

/// The value after `values`' entry equal to `current`, wrapping; the first
/// value when `current` is not listed.
fn next_in<T: PartialEq + Copy>(values: &[T], current: &T) -> T {
    values
        .iter()
        .position(|value| value == current)
        .map(|i| values[(i + 1) % values.len()])
        .unwrap_or(values[0])
}

fn next_property(element: &Element, current: &ElementProperty) -> ElementProperty {
    match current {
        ElementProperty::Color(color) => ElementProperty::Color(next_in(&PALETTE, color)),
        ElementProperty::Size(size) => {
            let steps: &[f64] = match element {
                Element::Text(_) => &FONT_SIZES,
                _ => &STROKE_WIDTHS,
            };
            ElementProperty::Size(next_in(steps, size))
        }
        ElementProperty::Fill(None) => ElementProperty::Fill(Some(FILL_ALPHA)),
        ElementProperty::Fill(Some(_)) => ElementProperty::Fill(None),
        ElementProperty::LineStyle(style) => ElementProperty::LineStyle(match style {
            LineStyle::Solid => LineStyle::Dashed,
            LineStyle::Dashed => LineStyle::Dotted,
            LineStyle::Dotted => LineStyle::Solid,
        }),
        ElementProperty::Font(font) => ElementProperty::Font(Font {
            family: next_in(&FONT_FAMILIES, &font.family.as_str()).to_string(),
            size: font.size,
        }),
    }
}

fn remove_autosave(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "autosave file removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "could not remove autosave file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use parking_lot::Mutex;
    use tempfile::{tempdir, TempDir};
    use termjot_core::{JobState, Mailbox, MemoryMetadataStore};
    use termjot_io::{FileExporter, JsonDocumentCodec};

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct FakeSurface {
        disabled: bool,
        shown: Vec<String>,
        progress: Vec<(usize, usize)>,
    }

    impl BusySurface for FakeSurface {
        fn set_controls_enabled(&mut self, enabled: bool) {
            self.disabled = !enabled;
        }

        fn show_busy(&mut self, reason: &str) {
            self.shown.push(reason.to_string());
        }

        fn set_progress(&mut self, current: usize, maximum: usize) {
            self.progress.push((current, maximum));
        }

        fn hide_busy(&mut self) {}
    }

    #[derive(Clone, Default)]
    struct MemoryClipboard(Arc<Mutex<Option<String>>>);

    impl TextClipboard for MemoryClipboard {
        fn get_text(&mut self) -> Result<String> {
            self.0
                .lock()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("empty"))
        }

        fn set_text(&mut self, text: String) -> Result<()> {
            *self.0.lock() = Some(text);
            Ok(())
        }
    }

    struct Harness {
        control: Control<FakeSurface>,
        clipboard: MemoryClipboard,
        metadata: Arc<MemoryMetadataStore>,
        dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let clipboard = MemoryClipboard::default();
        let metadata = Arc::new(MemoryMetadataStore::new());
        let services = Services {
            store: Arc::new(DocumentStore::default()),
            scheduler: JobScheduler::new(1, Mailbox::new()).unwrap(),
            changes: Arc::new(ChangeAggregator::new()),
            persistence: Arc::new(JsonDocumentCodec::new()),
            exporter: Arc::new(FileExporter::new()),
            metadata: metadata.clone(),
            clipboard: Box::new(clipboard.clone()),
        };
        let mut control = Control::new(
            services,
            FakeSurface::default(),
            &EditorConfig::default(),
            dir.path().join("autosave"),
            Instant::now(),
        );
        control.install(Document::with_page(&PageTemplate::default()), 0);
        Harness {
            control,
            clipboard,
            metadata,
            dir,
        }
    }

    fn run(control: &mut Control<FakeSurface>, command: Command) {
        assert_eq!(control.handle(command).unwrap(), Flow::Continue);
    }

    /// Pumps the mailbox until the running blocking job has reported back.
    fn settle(control: &mut Control<FakeSurface>) {
        let deadline = Instant::now() + WAIT;
        while control.is_blocked() {
            assert!(Instant::now() < deadline, "blocking job never finished");
            thread::sleep(Duration::from_millis(5));
            control.pump();
        }
    }

    fn page_count(control: &Control<FakeSurface>) -> usize {
        control.document().page_count()
    }

    fn elements(control: &Control<FakeSurface>) -> Vec<Element> {
        control
            .document()
            .page(control.current_page())
            .map(|page| page.layers()[0].elements().to_vec())
            .unwrap_or_default()
    }

    #[test]
    fn page_insert_and_delete_are_undoable() {
        let Harness { mut control, .. } = harness();
        run(&mut control, Command::InsertPage);
        run(&mut control, Command::InsertPage);
        assert_eq!(page_count(&control), 3);
        assert_eq!(control.current_page(), 2);

        run(&mut control, Command::GotoPage { page: 0 });
        run(&mut control, Command::DeletePage);
        assert_eq!(page_count(&control), 2);
        assert_eq!(control.log().undo_description(), "Undo: Delete page");

        run(&mut control, Command::Undo { count: 3 });
        assert_eq!(page_count(&control), 1);
        assert_eq!(control.message(), Some("Undo: Insert page"));
        run(&mut control, Command::Undo { count: 1 });
        assert_eq!(control.message(), Some("Nothing to undo"));

        run(&mut control, Command::Redo { count: 2 });
        assert_eq!(page_count(&control), 3);
    }

    #[test]
    fn last_page_cannot_be_deleted() {
        let Harness { mut control, .. } = harness();
        run(&mut control, Command::DeletePage);
        assert_eq!(page_count(&control), 1);
        assert_eq!(control.message(), Some("Cannot delete the only page"));
        assert!(!control.log().can_undo());
    }

    #[test]
    fn title_marks_unsaved_changes() {
        let Harness {
            mut control, dir, ..
        } = harness();
        assert_eq!(control.title(), "Unsaved Document - termjot");

        run(&mut control, Command::SampleStroke);
        assert_eq!(control.title(), "Unsaved Document - termjot");

        run(
            &mut control,
            Command::SaveAs {
                path: dir.path().join("notes"),
            },
        );
        settle(&mut control);
        assert!(dir.path().join("notes.json").exists());
        assert_eq!(control.title(), "notes.json - termjot");

        run(&mut control, Command::SampleStroke);
        assert_eq!(control.title(), "*notes.json - termjot");
        run(&mut control, Command::Undo { count: 1 });
        assert_eq!(control.title(), "notes.json - termjot");
    }

    #[test]
    fn save_blocks_input_until_the_job_reports() {
        let Harness {
            mut control, dir, ..
        } = harness();
        let target = dir.path().join("blocked.json");
        control.document().set_filename(Some(target.clone()));
        run(&mut control, Command::SampleStroke);

        run(&mut control, Command::Save);
        assert!(control.is_blocked());
        assert!(control.busy().surface().disabled);
        assert_eq!(control.busy().reason(), Some("Save"));

        // ignored, the save is still outstanding
        run(&mut control, Command::InsertPage);
        assert_eq!(page_count(&control), 1);

        settle(&mut control);
        assert!(!control.busy().surface().disabled);
        assert!(!control.log().is_changed());
        assert!(target.exists());
    }

    #[test]
    fn failed_save_is_reported_once_and_unblocks() {
        let Harness {
            mut control, dir, ..
        } = harness();
        let target = dir.path().join("missing-dir").join("x.json");
        control.document().set_filename(Some(target));
        run(&mut control, Command::SampleStroke);
        run(&mut control, Command::Save);
        settle(&mut control);

        assert!(control.message().unwrap().starts_with("Save failed"));
        assert!(control.log().is_changed());
    }

    #[test]
    fn export_reports_progress_per_page() {
        let Harness {
            mut control, dir, ..
        } = harness();
        control
            .document()
            .set_filename(Some(dir.path().join("pages.json")));
        run(&mut control, Command::InsertPage);
        run(&mut control, Command::InsertPage);

        run(
            &mut control,
            Command::Export {
                format: ExportFormat::Svg,
            },
        );
        settle(&mut control);

        let svg = fs::read_to_string(dir.path().join("pages.export.svg")).unwrap();
        assert_eq!(svg.matches("<svg ").count(), 3);
        assert_eq!(control.busy().surface().shown, vec!["Export".to_string()]);
        assert!(control.busy().surface().progress.contains(&(3, 3)));
    }

    #[test]
    fn autosave_runs_only_after_changes_and_moves_with_the_file_name() {
        let Harness {
            mut control, dir, ..
        } = harness();
        assert!(control.autosave().is_none());

        run(&mut control, Command::SampleStroke);
        let handle = control.autosave().unwrap();
        handle.wait_timeout(WAIT);
        control.pump();
        assert!(!control.log().is_changed_autosave());
        assert!(control.log().is_changed());
        let first = control.last_autosave.clone().unwrap();
        assert!(first.starts_with(dir.path().join("autosave")));
        assert!(first.exists());
        assert!(control.autosave().is_none());

        run(
            &mut control,
            Command::SaveAs {
                path: dir.path().join("named.json"),
            },
        );
        settle(&mut control);
        assert!(!first.exists());

        run(&mut control, Command::SampleStroke);
        control.autosave().unwrap().wait_timeout(WAIT);
        control.pump();
        assert_eq!(
            control.last_autosave.as_deref(),
            Some(dir.path().join(".named.autosave.json").as_path())
        );
    }

    #[test]
    fn copy_paste_and_cut_go_through_the_clipboard() {
        let Harness {
            mut control,
            clipboard,
            ..
        } = harness();
        run(&mut control, Command::SampleStroke);
        run(&mut control, Command::Copy);
        assert!(clipboard.0.lock().is_some());

        run(&mut control, Command::Paste);
        assert_eq!(elements(&control).len(), 2);
        assert_eq!(control.message(), Some("Pasted 1 elements"));

        run(&mut control, Command::Cut);
        assert!(elements(&control).is_empty());
        run(&mut control, Command::Undo { count: 1 });
        assert_eq!(elements(&control).len(), 2);

        *clipboard.0.lock() = Some("plain words\n".into());
        run(&mut control, Command::Paste);
        match elements(&control).last() {
            Some(Element::Text(text)) => assert_eq!(text.text, "plain words"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_paste_changes_nothing() {
        let Harness {
            mut control,
            clipboard,
            ..
        } = harness();
        run(&mut control, Command::SampleStroke);
        run(&mut control, Command::Copy);
        let broken = clipboard
            .0
            .lock()
            .clone()
            .unwrap()
            .replace("\"Stroke\"", "\"Hologram\"");
        *clipboard.0.lock() = Some(broken);
        let history = control.log().len();

        run(&mut control, Command::Paste);
        assert!(control.message().unwrap().starts_with("Paste failed"));
        assert_eq!(elements(&control).len(), 1);
        assert_eq!(control.log().len(), history);
    }

    #[test]
    fn text_delete_and_recolor_are_undoable() {
        let Harness { mut control, .. } = harness();
        run(
            &mut control,
            Command::InsertText {
                text: "hello".into(),
            },
        );
        run(
            &mut control,
            Command::CycleProperty {
                kind: PropertyKind::Color,
            },
        );
        match elements(&control).last() {
            Some(Element::Text(text)) => assert_eq!(text.color, PALETTE[1]),
            other => panic!("unexpected {other:?}"),
        }
        run(&mut control, Command::Undo { count: 1 });
        match elements(&control).last() {
            Some(Element::Text(text)) => assert_eq!(text.color, BLACK),
            other => panic!("unexpected {other:?}"),
        }

        run(&mut control, Command::DeleteLastElement);
        assert!(elements(&control).is_empty());
        run(&mut control, Command::DeleteLastElement);
        assert_eq!(control.message(), Some("Nothing to delete on this layer"));
    }

    #[test]
    fn stroke_width_fill_and_line_style_cycle_and_undo() {
        let Harness { mut control, .. } = harness();
        run(&mut control, Command::SampleStroke);
        let original = elements(&control);

        for kind in [PropertyKind::Size, PropertyKind::Fill, PropertyKind::LineStyle] {
            run(&mut control, Command::CycleProperty { kind });
        }
        match elements(&control).last() {
            Some(Element::Stroke(stroke)) => {
                assert_eq!(stroke.width, STROKE_WIDTHS[0]);
                assert_eq!(stroke.fill, Some(FILL_ALPHA));
                assert_eq!(stroke.line_style, LineStyle::Dashed);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(control.log().undo_description(), "Undo: Change line style");

        let history = control.log().len();
        run(
            &mut control,
            Command::CycleProperty {
                kind: PropertyKind::Font,
            },
        );
        assert_eq!(control.message(), Some("Stroke has no font"));
        assert_eq!(control.log().len(), history);

        run(&mut control, Command::Undo { count: 3 });
        assert_eq!(elements(&control), original);
    }

    #[test]
    fn text_font_and_size_cycle_through_their_own_steps() {
        let Harness { mut control, .. } = harness();
        run(
            &mut control,
            Command::InsertText {
                text: "note".into(),
            },
        );
        for kind in [PropertyKind::Font, PropertyKind::Size] {
            run(&mut control, Command::CycleProperty { kind });
        }
        match elements(&control).last() {
            Some(Element::Text(text)) => {
                assert_eq!(text.font.family, "Serif");
                assert_eq!(text.font.size, FONT_SIZES[1]);
            }
            other => panic!("unexpected {other:?}"),
        }
        run(&mut control, Command::Undo { count: 2 });
        match elements(&control).last() {
            Some(Element::Text(text)) => assert_eq!(text.font, Font::default()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn page_size_and_background_changes_reach_listeners() {
        let Harness { mut control, .. } = harness();
        let recorder = termjot_core::EventRecorder::new();
        control.services.changes.subscribe(recorder.clone());

        run(
            &mut control,
            Command::SetPageSize {
                width: 300.0,
                height: 200.0,
            },
        );
        run(
            &mut control,
            Command::SetPageSize {
                width: -1.0,
                height: 200.0,
            },
        );
        assert!(control.message().unwrap().starts_with("Invalid page size"));
        run(&mut control, Command::SetBackgroundColor { color: 0xeeeeee });
        assert_eq!(recorder.take(), vec![DocumentEvent::PageSizeChanged(0)]);

        control.maintenance(Instant::now() + Duration::from_secs(60));
        assert_eq!(recorder.take(), vec![DocumentEvent::PageChanged(0)]);
        assert!(control.take_refresh());
        assert_eq!(control.document().pages()[0].width(), 300.0);
    }

    #[test]
    fn new_document_asks_before_discarding_changes() {
        let Harness { mut control, .. } = harness();
        run(&mut control, Command::SampleStroke);

        run(&mut control, Command::NewDocument);
        assert_eq!(elements(&control).len(), 1);
        assert!(control.message().unwrap().starts_with("Unsaved changes"));

        run(&mut control, Command::NewDocument);
        assert!(elements(&control).is_empty());
        assert!(!control.log().can_undo());
    }

    #[test]
    fn open_restores_remembered_page_and_refuses_autosave_files() {
        let Harness {
            mut control,
            metadata,
            dir,
            ..
        } = harness();
        let path = dir.path().join("three.json");
        let mut doc = Document::with_page(&PageTemplate::default());
        doc.add_page(Page::from_template(&PageTemplate::default()));
        doc.add_page(Page::from_template(&PageTemplate::default()));
        JsonDocumentCodec::new().write(&doc, &path).unwrap();
        metadata
            .save(
                document_id_for_path(&path),
                &MetadataEntry { current_page: 2 },
            )
            .unwrap();

        run(
            &mut control,
            Command::Open {
                path: dir.path().join(".three.autosave.json"),
            },
        );
        assert!(control.message().unwrap().contains("autosave file"));
        assert!(!control.is_blocked());

        run(&mut control, Command::Open { path: path.clone() });
        settle(&mut control);
        assert_eq!(page_count(&control), 3);
        assert_eq!(control.current_page(), 2);
        assert_eq!(control.title(), "three.json - termjot");
    }

    #[test]
    fn shutdown_saves_named_documents_and_remembers_the_page() {
        let Harness {
            mut control,
            metadata,
            dir,
            ..
        } = harness();
        let path = dir.path().join("closing.json");
        control.document().set_filename(Some(path.clone()));
        run(&mut control, Command::InsertPage);
        run(&mut control, Command::SampleStroke);

        control.shutdown().unwrap();

        let saved = JsonDocumentCodec::new().read(&path).unwrap();
        assert_eq!(saved.page_count(), 2);
        assert_eq!(saved.pages()[1].element_count(), 1);
        assert_eq!(
            metadata.load(document_id_for_path(&path)).unwrap(),
            Some(MetadataEntry { current_page: 1 })
        );
    }

    #[test]
    fn clean_close_removes_an_autosave_that_finished_before_quitting() {
        let Harness {
            mut control, dir, ..
        } = harness();
        let path = dir.path().join("tidy.json");
        control.document().set_filename(Some(path.clone()));
        run(&mut control, Command::SampleStroke);
        run(&mut control, Command::Save);
        settle(&mut control);
        assert!(!control.log().is_changed());

        // saved but not autosaved yet; the result is left unread in the mailbox
        let autosave = control.autosave().unwrap();
        assert_eq!(autosave.wait_timeout(WAIT), JobState::Completed);
        let leftover = dir.path().join(".tidy.autosave.json");
        assert!(leftover.exists());

        control.shutdown().unwrap();
        assert!(path.exists());
        assert!(!leftover.exists());
    }

    #[test]
    fn failed_session_still_saves_before_reporting() {
        let Harness {
            mut control,
            metadata,
            dir,
            ..
        } = harness();
        let path = dir.path().join("crashed.json");
        control.document().set_filename(Some(path.clone()));

        let result = control.run_then_shutdown(|control| {
            run(control, Command::InsertPage);
            run(control, Command::SampleStroke);
            Err(anyhow::anyhow!("terminal went away"))
        });

        assert_eq!(result.unwrap_err().to_string(), "terminal went away");
        let saved = JsonDocumentCodec::new().read(&path).unwrap();
        assert_eq!(saved.page_count(), 2);
        assert_eq!(
            metadata.load(document_id_for_path(&path)).unwrap(),
            Some(MetadataEntry { current_page: 1 })
        );
    }

    #[test]
    fn shutdown_keeps_an_autosave_copy_of_unnamed_work() {
        let Harness {
            mut control, dir, ..
        } = harness();
        run(&mut control, Command::SampleStroke);
        control.shutdown().unwrap();

        let kept: Vec<_> = fs::read_dir(dir.path().join("autosave"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .collect();
        assert_eq!(kept.len(), 1);
    }
}
