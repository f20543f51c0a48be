use std::fs;
use std::io::{self, Stdout, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, Event};
use crossterm::queue;
use crossterm::style::Print;
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use termjot_core::config::project_dirs;
use termjot_core::jobs::is_autosave_file;
use termjot_core::{
    open_with, ChangeAggregator, Command, Document, DocumentStore, EditorConfig,
    FileMetadataStore, JobScheduler, Mailbox, MetadataStore,
};
use termjot_io::{FileExporter, JsonDocumentCodec};
use termjot_tty::{EventMapper, StatusLine, UiEvent};
use tracing::{debug, info, level_filters::LevelFilter};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, reload, EnvFilter, Registry};

mod clipboard;
mod control;
mod view;

use clipboard::SystemClipboard;
use control::{Control, Flow, Services};

/// Upper bound on how long the loop sleeps waiting for a key.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(
    name = "termjot",
    version,
    about = "Terminal note editor with background saving and full undo"
)]
struct Args {
    /// Document to edit; created on first save if it does not exist
    file: Option<PathBuf>,

    /// Settings file (defaults to $TERMJOT_CONFIG, then the platform config directory)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Page to open the document on (0-based)
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = EditorConfig::discover(args.config.as_deref())?;

    let project_dirs =
        project_dirs().ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let (_log_guard, console) = init_logging(&project_dirs, &config.logging.level)?;
    let data_dir = project_dirs.data_local_dir();
    let autosave_dir = config.autosave.directory_or(data_dir);
    let metadata: Arc<dyn MetadataStore> =
        Arc::new(FileMetadataStore::new(data_dir.join("state"))?);
    let codec = JsonDocumentCodec::new();
    let template = config.page.template();

    let (document, current_page) = match &args.file {
        Some(path) if is_autosave_file(path, &autosave_dir) => {
            return Err(anyhow!(
                "{} is an autosave file, open the document it belongs to",
                path.display()
            ));
        }
        Some(path) if path.exists() => {
            let opened = open_with(&codec, metadata.as_ref(), path.clone())
                .await
                .with_context(|| format!("failed to open {:?}", path))?;
            let page = args.page.unwrap_or(opened.metadata.current_page);
            (opened.document, page)
        }
        Some(path) => {
            let mut document = Document::with_page(&template);
            document.set_filename(Some(path.clone()));
            (document, 0)
        }
        None => (Document::with_page(&template), 0),
    };

    let services = Services {
        store: Arc::new(DocumentStore::default()),
        scheduler: JobScheduler::new(config.scheduler.workers, Mailbox::new())?,
        changes: Arc::new(ChangeAggregator::new()),
        persistence: Arc::new(codec),
        exporter: Arc::new(FileExporter::new()),
        metadata,
        clipboard: Box::new(SystemClipboard::new()),
    };
    let mut control = Control::new(
        services,
        StatusLine::new(io::stdout()),
        &config,
        autosave_dir,
        Instant::now(),
    );
    control.install(document, current_page);
    info!(title = %control.title(), "editor started");

    control.run_then_shutdown(|control| {
        let outcome = run_editor(control);
        console.enable();
        outcome
    })
}

/// Runs the interactive loop with the terminal in raw mode, restoring it on
/// every exit path.
fn run_editor(control: &mut Control<StatusLine<Stdout>>) -> Result<()> {
    let _raw = RawModeGuard::new()?;
    crossterm::execute!(io::stdout(), cursor::Hide, Clear(ClearType::All))?;
    let result = event_loop(control);
    let writer = control.busy_mut().surface_mut().writer();
    let _ = crossterm::execute!(writer, Clear(ClearType::All), cursor::MoveTo(0, 0));
    result
}

fn event_loop(control: &mut Control<StatusLine<Stdout>>) -> Result<()> {
    let mut event_mapper = EventMapper::new();
    let mut dirty = true;

    loop {
        control.pump();
        control.maintenance(Instant::now());
        if control.take_refresh() || control.busy_mut().surface_mut().take_redraw() {
            dirty = true;
        }

        if dirty {
            redraw(control, event_mapper.pending_input())?;
            dirty = false;
        }

        let timeout = control
            .next_deadline(Instant::now())
            .map_or(POLL_INTERVAL, |deadline| deadline.min(POLL_INTERVAL));
        if !event::poll(timeout)? {
            continue;
        }
        let ev = event::read()?;
        if matches!(ev, Event::Resize(..)) {
            dirty = true;
            continue;
        }
        if control.is_blocked() {
            continue;
        }
        let command = match event_mapper.map_event(ev) {
            UiEvent::Command(command) => command,
            UiEvent::Quit => Command::Quit,
            UiEvent::BeginPrompt(_)
            | UiEvent::PromptChanged { .. }
            | UiEvent::PromptCancel
            | UiEvent::None => {
                dirty = true;
                continue;
            }
        };
        match control.handle(command)? {
            Flow::Quit => return Ok(()),
            Flow::Continue => dirty = true,
        }
    }
}

fn redraw(control: &mut Control<StatusLine<Stdout>>, pending: Option<String>) -> Result<()> {
    let (cols, rows) = terminal::size()?;
    let status_row = rows.saturating_sub(1);
    let lines = control.page_lines();
    let info = control.status(pending);

    let status = control.busy_mut().surface_mut();
    {
        let writer = status.writer();
        queue!(writer, Clear(ClearType::All))?;
        for (row, line) in lines.into_iter().take(usize::from(status_row)).enumerate() {
            let row = u16::try_from(row).unwrap_or(u16::MAX);
            queue!(
                writer,
                cursor::MoveTo(0, row),
                Print(view::truncate_with_ellipsis(line, usize::from(cols)))
            )?;
        }
    }
    status.draw(&info, status_row)?;
    status.writer().flush()?;
    Ok(())
}

/// The stderr log layer. It stays silent while the editor owns the terminal.
struct ConsoleLog(reload::Handle<LevelFilter, Registry>);

impl ConsoleLog {
    /// The filter for the stderr layer, silent until [`enable`](Self::enable).
    fn filter() -> (reload::Layer<LevelFilter, Registry>, Self) {
        let (filter, handle) = reload::Layer::new(LevelFilter::OFF);
        (filter, Self(handle))
    }

    fn enable(&self) {
        if let Err(err) = self.0.modify(|filter| *filter = LevelFilter::WARN) {
            debug!(%err, "console log layer could not be enabled");
        }
    }
}

fn init_logging(project_dirs: &ProjectDirs, level: &str) -> Result<(WorkerGuard, ConsoleLog)> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "termjot.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (console_filter, console) = ConsoleLog::filter();
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(console_filter);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok((guard, console))
}
