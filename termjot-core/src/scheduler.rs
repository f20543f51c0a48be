//! Priority job queue served by named worker threads.
//!
//! Ordering is `(priority, submission order)`: an urgent job jumps ahead of
//! everything still queued but never interrupts a job that already started.
//! Results never touch UI state from a worker. They are posted to a
//! [`Mailbox`] which the interactive loop drains.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{self, AtomicUsize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::Document;
use crate::undo::SavePoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobPriority {
    Background,
    Normal,
    Urgent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed(String),
    /// Removed from the queue before it started.
    Discarded,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug)]
pub enum JobOutput {
    Done,
    Saved { path: PathBuf, point: SavePoint },
    Autosaved { path: PathBuf, point: SavePoint },
    Exported(PathBuf),
    Loaded { path: PathBuf, document: Box<Document> },
}

pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// Blocking jobs keep interactive input disabled until they finish.
    fn is_blocking(&self) -> bool {
        false
    }

    fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError>;
}

pub type JobId = u64;

#[derive(Debug)]
pub enum JobEventKind {
    Started,
    Progress { current: usize, maximum: usize },
    Finished(JobOutput),
    Failed(String),
    Discarded,
}

/// Report from a job, consumed on the interactive context.
#[derive(Debug)]
pub struct JobEvent {
    pub id: JobId,
    pub name: String,
    pub blocking: bool,
    pub kind: JobEventKind,
}

#[derive(Debug, Default)]
pub struct Mailbox {
    events: Mutex<Vec<JobEvent>>,
}

impl Mailbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn post(&self, event: JobEvent) {
        self.events.lock().push(event);
    }

    pub fn drain(&self) -> Vec<JobEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// What a running job sees of the scheduler: its identity and a progress
/// channel back to the interactive context.
pub struct JobContext {
    id: JobId,
    name: String,
    blocking: bool,
    mailbox: Arc<Mailbox>,
    maximum: AtomicUsize,
    current: AtomicUsize,
}

impl JobContext {
    fn new(handle: &JobHandle, mailbox: Arc<Mailbox>) -> Self {
        Self {
            id: handle.id(),
            name: handle.name().to_string(),
            blocking: handle.is_blocking(),
            mailbox,
            maximum: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn set_maximum_state(&self, maximum: usize) {
        self.maximum.store(maximum, atomic::Ordering::Relaxed);
        self.current.store(0, atomic::Ordering::Relaxed);
        self.post(JobEventKind::Progress {
            current: 0,
            maximum,
        });
    }

    pub fn set_current_state(&self, current: usize) {
        let previous = self.current.swap(current, atomic::Ordering::Relaxed);
        if previous != current {
            self.post(JobEventKind::Progress {
                current,
                maximum: self.maximum.load(atomic::Ordering::Relaxed),
            });
        }
    }

    fn post(&self, kind: JobEventKind) {
        self.mailbox.post(JobEvent {
            id: self.id,
            name: self.name.clone(),
            blocking: self.blocking,
            kind,
        });
    }
}

struct HandleInner {
    id: JobId,
    name: String,
    priority: JobPriority,
    blocking: bool,
    state: Mutex<JobState>,
    changed: Condvar,
}

/// Submitter's view of a job. Holding one does not keep the job queued.
#[derive(Clone)]
pub struct JobHandle(Arc<HandleInner>);

impl JobHandle {
    fn new(id: JobId, job: &dyn Job, priority: JobPriority) -> Self {
        Self(Arc::new(HandleInner {
            id,
            name: job.name().to_string(),
            priority,
            blocking: job.is_blocking(),
            state: Mutex::new(JobState::Queued),
            changed: Condvar::new(),
        }))
    }

    pub fn id(&self) -> JobId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn priority(&self) -> JobPriority {
        self.0.priority
    }

    pub fn is_blocking(&self) -> bool {
        self.0.blocking
    }

    pub fn state(&self) -> JobState {
        self.0.state.lock().clone()
    }

    /// Waits until the job completed, failed or was discarded.
    pub fn wait(&self) -> JobState {
        let mut state = self.0.state.lock();
        while !state.is_terminal() {
            self.0.changed.wait(&mut state);
        }
        state.clone()
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning the
    /// state observed at that point.
    pub fn wait_timeout(&self, timeout: Duration) -> JobState {
        let deadline = Instant::now() + timeout;
        let mut state = self.0.state.lock();
        while !state.is_terminal() {
            if self.0.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.clone()
    }

    fn set_state(&self, state: JobState) {
        *self.0.state.lock() = state;
        self.0.changed.notify_all();
    }

    fn event(&self, kind: JobEventKind) -> JobEvent {
        JobEvent {
            id: self.id(),
            name: self.0.name.clone(),
            blocking: self.0.blocking,
            kind,
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("priority", &self.0.priority)
            .field("state", &*self.0.state.lock())
            .finish()
    }
}

struct Queued {
    priority: JobPriority,
    seq: u64,
    job: Arc<dyn Job>,
    handle: JobHandle,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // max-heap: higher priority first, then lower sequence number
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    stopping: bool,
    /// Outstanding [`SchedulerLock`]s; no job starts while non-zero.
    paused: usize,
    running: usize,
}

impl Queue {
    fn can_start(&self) -> bool {
        self.paused == 0 && !self.heap.is_empty()
    }
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    idle: Condvar,
    mailbox: Arc<Mailbox>,
}

pub struct JobScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Starts `workers` threads (at least one).
    pub fn new(workers: usize, mailbox: Arc<Mailbox>) -> anyhow::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
            idle: Condvar::new(),
            mailbox,
        });
        let mut handles = Vec::new();
        for index in 0..workers.max(1) {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("termjot-job-{index}"))
                .spawn(move || worker_loop(&shared))
                .with_context(|| format!("failed to spawn job worker {index}"))?;
            handles.push(handle);
        }
        info!(workers = handles.len(), "job scheduler started");
        Ok(Self {
            shared,
            workers: Mutex::new(handles),
        })
    }

    pub fn mailbox(&self) -> Arc<Mailbox> {
        Arc::clone(&self.shared.mailbox)
    }

    pub fn add_job(&self, job: Arc<dyn Job>, priority: JobPriority) -> JobHandle {
        let mut queue = self.shared.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        let handle = JobHandle::new(seq, job.as_ref(), priority);

        if queue.stopping {
            warn!(job = handle.name(), "scheduler stopped, job discarded");
            drop(queue);
            self.discard(&handle);
            return handle;
        }

        debug!(job = handle.name(), ?priority, id = seq, "job queued");
        queue.heap.push(Queued {
            priority,
            seq,
            job,
            handle: handle.clone(),
        });
        drop(queue);
        self.shared.available.notify_one();
        handle
    }

    /// Runs `job` on the calling thread, bypassing the queue. Progress still
    /// goes to the mailbox; the outcome is returned directly.
    pub fn run_now(&self, job: &dyn Job) -> Result<JobOutput, JobError> {
        let id = {
            let mut queue = self.shared.queue.lock();
            queue.next_seq += 1;
            queue.next_seq - 1
        };
        let handle = JobHandle::new(id, job, JobPriority::Urgent);
        handle.set_state(JobState::Running);
        let ctx = JobContext::new(&handle, self.mailbox());
        let result = run_guarded(job, &ctx);
        match &result {
            Ok(_) => handle.set_state(JobState::Completed),
            Err(err) => {
                warn!(job = handle.name(), %err, "synchronous job failed");
                handle.set_state(JobState::Failed(err.to_string()));
            }
        }
        result
    }

    /// Drops every job that has not started. Running jobs are unaffected.
    /// Returns how many jobs were discarded.
    pub fn remove_all_jobs(&self) -> usize {
        let drained: Vec<Queued> = self.shared.queue.lock().heap.drain().collect();
        for queued in &drained {
            self.discard(&queued.handle);
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "queued jobs discarded");
        }
        drained.len()
    }

    /// Stops new jobs from starting until the returned guard is dropped.
    /// Jobs already running carry on; use [`wait_idle`](Self::wait_idle) to
    /// wait for them.
    ///
    /// Returns at once, so it may be taken while holding the document lock
    /// (document first, scheduler second).
    pub fn lock(&self) -> SchedulerLock<'_> {
        self.shared.queue.lock().paused += 1;
        debug!("scheduler locked");
        SchedulerLock {
            shared: &self.shared,
        }
    }

    /// Waits until no job is running. Never call this while holding a lock
    /// a running job may need, such as the document lock.
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock();
        while queue.running > 0 {
            self.shared.idle.wait(&mut queue);
        }
    }

    pub fn running_len(&self) -> usize {
        self.shared.queue.lock().running
    }

    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    /// Lets running jobs finish, discards the rest and joins the workers.
    /// Like [`wait_idle`](Self::wait_idle), never call it with the document
    /// locked.
    pub fn shutdown(&self) {
        self.shared.queue.lock().stopping = true;
        self.shared.available.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            if worker.join().is_err() {
                warn!("job worker terminated abnormally");
            }
        }
        self.remove_all_jobs();
        info!("job scheduler stopped");
    }

    fn discard(&self, handle: &JobHandle) {
        handle.set_state(JobState::Discarded);
        self.shared
            .mailbox
            .post(handle.event(JobEventKind::Discarded));
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct SchedulerLock<'a> {
    shared: &'a Shared,
}

impl SchedulerLock<'_> {
    pub fn unlock(self) {}
}

impl Drop for SchedulerLock<'_> {
    fn drop(&mut self) {
        let mut queue = self.shared.queue.lock();
        queue.paused = queue.paused.saturating_sub(1);
        let resume = queue.paused == 0;
        drop(queue);
        if resume {
            debug!("scheduler unlocked");
            self.shared.available.notify_all();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let queued = {
            let mut queue = shared.queue.lock();
            while !queue.can_start() && !queue.stopping {
                shared.available.wait(&mut queue);
            }
            if queue.stopping {
                return;
            }
            let Some(queued) = queue.heap.pop() else {
                continue;
            };
            queue.running += 1;
            queued
        };

        execute(shared, queued);

        let mut queue = shared.queue.lock();
        queue.running -= 1;
        if queue.running == 0 {
            shared.idle.notify_all();
        }
    }
}

fn execute(shared: &Shared, queued: Queued) {
    let Queued { job, handle, .. } = queued;
    handle.set_state(JobState::Running);
    shared.mailbox.post(handle.event(JobEventKind::Started));
    debug!(job = handle.name(), id = handle.id(), "job started");

    // the outcome is in the mailbox before a waiting handle can observe it
    let ctx = JobContext::new(&handle, Arc::clone(&shared.mailbox));
    match run_guarded(job.as_ref(), &ctx) {
        Ok(output) => {
            debug!(job = handle.name(), id = handle.id(), "job completed");
            shared
                .mailbox
                .post(handle.event(JobEventKind::Finished(output)));
            handle.set_state(JobState::Completed);
        }
        Err(err) => {
            let message = err.to_string();
            warn!(job = handle.name(), id = handle.id(), %message, "job failed");
            shared
                .mailbox
                .post(handle.event(JobEventKind::Failed(message.clone())));
            handle.set_state(JobState::Failed(message));
        }
    }
}

fn run_guarded(job: &dyn Job, ctx: &JobContext) -> Result<JobOutput, JobError> {
    match panic::catch_unwind(AssertUnwindSafe(|| job.run(ctx))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(JobError::Panicked(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    struct Recording {
        name: String,
        blocking: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recording {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                blocking: false,
                log: Arc::clone(log),
            })
        }

        fn blocking(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                blocking: true,
                log: Arc::clone(log),
            })
        }
    }

    impl Job for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_blocking(&self) -> bool {
            self.blocking
        }

        fn run(&self, _ctx: &JobContext) -> Result<JobOutput, JobError> {
            self.log.lock().push(self.name.clone());
            Ok(JobOutput::Done)
        }
    }

    struct Failing;

    impl Job for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn run(&self, _ctx: &JobContext) -> Result<JobOutput, JobError> {
            Err(JobError::Failed("disk full".into()))
        }
    }

    struct Panicking;

    impl Job for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn is_blocking(&self) -> bool {
            true
        }

        fn run(&self, _ctx: &JobContext) -> Result<JobOutput, JobError> {
            panic!("exporter exploded");
        }
    }

    /// Signals that it started, then waits until released.
    struct Gate {
        started: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Job for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        fn run(&self, _ctx: &JobContext) -> Result<JobOutput, JobError> {
            if let Some(started) = self.started.lock().take() {
                let _ = started.send(());
            }
            let _ = self.release.lock().recv_timeout(WAIT);
            Ok(JobOutput::Done)
        }
    }

    fn gate() -> (Arc<Gate>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let job = Arc::new(Gate {
            started: Mutex::new(Some(started_tx)),
            release: Mutex::new(release_rx),
        });
        (job, started_rx, release_tx)
    }

    #[test]
    fn urgent_job_starts_before_queued_ones() {
        let scheduler = JobScheduler::new(1, Mailbox::new()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let paused = scheduler.lock();
        let background =
            scheduler.add_job(Recording::new("background", &log), JobPriority::Background);
        scheduler.add_job(Recording::new("normal", &log), JobPriority::Normal);
        scheduler.add_job(Recording::new("urgent", &log), JobPriority::Urgent);
        paused.unlock();

        assert_eq!(background.wait_timeout(WAIT), JobState::Completed);
        assert_eq!(*log.lock(), vec!["urgent", "normal", "background"]);
    }

    #[test]
    fn equal_priority_keeps_submission_order() {
        let scheduler = JobScheduler::new(1, Mailbox::new()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let paused = scheduler.lock();
        scheduler.add_job(Recording::blocking("blocking", &log), JobPriority::Normal);
        let second = scheduler.add_job(Recording::new("background", &log), JobPriority::Normal);
        paused.unlock();

        assert_eq!(second.wait_timeout(WAIT), JobState::Completed);
        assert_eq!(*log.lock(), vec!["blocking", "background"]);
    }

    #[test]
    fn running_job_is_not_preempted_and_failures_do_not_stop_the_queue() {
        let mailbox = Mailbox::new();
        let scheduler = JobScheduler::new(1, Arc::clone(&mailbox)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (job, started, release) = gate();

        let running = scheduler.add_job(job, JobPriority::Background);
        started.recv_timeout(WAIT).unwrap();
        let failing = scheduler.add_job(Arc::new(Failing), JobPriority::Normal);
        let urgent = scheduler.add_job(Recording::new("urgent", &log), JobPriority::Urgent);
        assert_eq!(running.state(), JobState::Running);

        release.send(()).unwrap();
        assert_eq!(urgent.wait_timeout(WAIT), JobState::Completed);
        assert_eq!(
            failing.wait_timeout(WAIT),
            JobState::Failed("disk full".into())
        );

        let failures: Vec<_> = mailbox
            .drain()
            .into_iter()
            .filter_map(|event| match event.kind {
                JobEventKind::Failed(message) => Some((event.name, message)),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![("failing".to_string(), "disk full".to_string())]);
    }

    #[test]
    fn remove_all_jobs_discards_only_queued_work() {
        let mailbox = Mailbox::new();
        let scheduler = JobScheduler::new(1, Arc::clone(&mailbox)).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (job, started, release) = gate();

        let running = scheduler.add_job(job, JobPriority::Normal);
        started.recv_timeout(WAIT).unwrap();
        let queued = scheduler.add_job(Recording::blocking("queued", &log), JobPriority::Urgent);

        let stop = scheduler.lock();
        assert_eq!(scheduler.remove_all_jobs(), 1);
        assert_eq!(running.state(), JobState::Running);
        release.send(()).unwrap();
        scheduler.wait_idle();
        assert_eq!(running.state(), JobState::Completed);
        stop.unlock();

        assert_eq!(queued.state(), JobState::Discarded);
        assert!(log.lock().is_empty());
        let discarded = mailbox
            .drain()
            .into_iter()
            .find(|event| matches!(event.kind, JobEventKind::Discarded))
            .unwrap();
        assert!(discarded.blocking);
    }

    #[test]
    fn lock_taken_under_the_document_lock_does_not_wait_for_running_jobs() {
        use crate::model::{Document, PageTemplate};
        use crate::store::DocumentStore;

        struct NeedsDocument(Arc<DocumentStore>);

        impl Job for NeedsDocument {
            fn name(&self) -> &str {
                "snapshot"
            }

            fn run(&self, _ctx: &JobContext) -> Result<JobOutput, JobError> {
                let _doc = self.0.lock();
                Ok(JobOutput::Done)
            }
        }

        let store = Arc::new(DocumentStore::new(Document::with_page(
            &PageTemplate::default(),
        )));
        let scheduler = Arc::new(JobScheduler::new(1, Mailbox::new()).unwrap());
        let log = Arc::new(Mutex::new(Vec::new()));

        let doc = store.lock();
        let snapshot = scheduler.add_job(
            Arc::new(NeedsDocument(Arc::clone(&store))),
            JobPriority::Normal,
        );
        let deadline = Instant::now() + WAIT;
        while snapshot.state() != JobState::Running && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(snapshot.state(), JobState::Running);

        let (locked_tx, locked_rx) = mpsc::channel();
        let later = {
            let scheduler = Arc::clone(&scheduler);
            let log = Arc::clone(&log);
            thread::spawn(move || {
                let stop = scheduler.lock();
                let later = scheduler.add_job(Recording::new("later", &log), JobPriority::Urgent);
                locked_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                assert_eq!(later.state(), JobState::Queued);
                stop.unlock();
                later
            })
        };
        locked_rx.recv_timeout(WAIT).unwrap();
        drop(doc);

        let later = later.join().unwrap();
        assert_eq!(snapshot.wait_timeout(WAIT), JobState::Completed);
        assert_eq!(later.wait_timeout(WAIT), JobState::Completed);
        scheduler.wait_idle();
        assert_eq!(scheduler.running_len(), 0);
    }

    #[test]
    fn panicking_job_is_reported_as_failure() {
        let mailbox = Mailbox::new();
        let scheduler = JobScheduler::new(1, Arc::clone(&mailbox)).unwrap();
        let handle = scheduler.add_job(Arc::new(Panicking), JobPriority::Urgent);
        let state = handle.wait_timeout(WAIT);
        assert!(matches!(state, JobState::Failed(ref m) if m.contains("exporter exploded")));
        assert!(mailbox
            .drain()
            .iter()
            .any(|event| event.blocking && matches!(event.kind, JobEventKind::Failed(_))));
    }

    #[test]
    fn run_now_executes_on_the_calling_thread() {
        struct WhereAmI;

        impl Job for WhereAmI {
            fn name(&self) -> &str {
                "where"
            }

            fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
                ctx.set_maximum_state(2);
                ctx.set_current_state(1);
                ctx.set_current_state(1);
                Ok(JobOutput::Exported(PathBuf::from(
                    thread::current().name().unwrap_or("unnamed"),
                )))
            }
        }

        let mailbox = Mailbox::new();
        let scheduler = JobScheduler::new(1, Arc::clone(&mailbox)).unwrap();
        let here = thread::current().name().map(str::to_string);
        match scheduler.run_now(&WhereAmI).unwrap() {
            JobOutput::Exported(name) => {
                assert_eq!(Some(name.to_string_lossy().into_owned()), here)
            }
            other => panic!("unexpected output {other:?}"),
        }
        // repeated identical progress is not re-posted
        assert_eq!(mailbox.drain().len(), 2);
    }

    #[test]
    fn jobs_added_after_shutdown_are_discarded() {
        let scheduler = JobScheduler::new(2, Mailbox::new()).unwrap();
        scheduler.shutdown();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = scheduler.add_job(Recording::new("late", &log), JobPriority::Urgent);
        assert_eq!(handle.state(), JobState::Discarded);
    }
}
