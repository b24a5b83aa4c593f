// src/print_job.rs - Print job state machine and work loop
//
// A job is a selected file (or script) plus a cursor into its expanded
// lines. The work loop pulls lines and dispatches them under the shared
// dispatch lock. Interactive commands win that lock; the loop then backs
// off one line and retries after a short sleep.

mod commands;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::LoaderSection;
use crate::cursor::FileCursor;
use crate::dispatch::Dispatcher;
use crate::error::GCodeError;
use crate::expander::MacroExpander;
use crate::file_manager::FileInfo;
use crate::print_stats::PrintStats;

tokio::task_local! {
    /// Set on the work loop task: the engine it belongs to and whether it is
    /// dispatching one of the job's own lines.
    static LOOP_SCOPE: (usize, bool);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobState {
    Idle,
    Selected,
    Printing,
    Paused,
    Completed,
    Cancelled,
    Error(String),
}

#[derive(Debug, Clone)]
pub enum JobSource {
    File(FileInfo),
    Script { name: String },
}

impl JobSource {
    pub fn name(&self) -> &str {
        match self {
            JobSource::File(file) => &file.name,
            JobSource::Script { name } => name,
        }
    }
}

pub struct PrintJob {
    id: String,
    source: JobSource,
    size: u64,
    cursor: FileCursor,
}

impl PrintJob {
    fn new(source: JobSource, size: u64, expander: MacroExpander) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            size,
            cursor: FileCursor::new(expander),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &JobSource {
        &self.source
    }

    /// Size in bytes; 0 for scripts.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn pos(&self) -> u64 {
        self.cursor.pos()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrintStatus {
    pub file_path: Option<String>,
    pub progress: f64,
    pub is_active: bool,
    pub file_position: u64,
    pub file_size: u64,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Sleep after losing the dispatch lock to an interactive command.
    pub busy_backoff: Duration,
    /// Poll interval while waiting for the loop to pause.
    pub pause_poll: Duration,
    pub on_error_gcode: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            busy_backoff: Duration::from_millis(100),
            pause_poll: Duration::from_millis(1),
            on_error_gcode: None,
        }
    }
}

impl From<&LoaderSection> for EngineOptions {
    fn from(section: &LoaderSection) -> Self {
        Self {
            busy_backoff: section.busy_backoff(),
            pause_poll: section.pause_poll(),
            on_error_gcode: section.on_error_gcode.clone(),
        }
    }
}

enum LoopExit {
    Paused,
    Completed,
    /// The job was closed underneath the loop by cancel or reset.
    Detached,
    Failed(String),
}

struct EngineInner {
    dispatcher: Arc<Dispatcher>,
    stats: Arc<dyn PrintStats>,
    options: EngineOptions,
    job: Mutex<Option<PrintJob>>,
    state: StdMutex<JobState>,
    work_active: AtomicBool,
    must_pause: AtomicBool,
    task: StdMutex<Option<JoinHandle<()>>>,
}

/// Owns the single active print job and drives it.
#[derive(Clone)]
pub struct PrintEngine {
    inner: Arc<EngineInner>,
}

impl PrintEngine {
    pub fn new(dispatcher: Arc<Dispatcher>, stats: Arc<dyn PrintStats>, options: EngineOptions) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                dispatcher,
                stats,
                options,
                job: Mutex::new(None),
                state: StdMutex::new(JobState::Idle),
                work_active: AtomicBool::new(false),
                must_pause: AtomicBool::new(false),
                task: StdMutex::new(None),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn state(&self) -> JobState {
        self.inner
            .state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// True while the work loop runs.
    pub fn is_active(&self) -> bool {
        self.inner.work_active.load(Ordering::SeqCst)
    }

    /// True when called from a command the work loop is dispatching out of
    /// the job itself.
    pub fn is_cmd_from_job(&self) -> bool {
        self.inner.in_scope(true)
    }

    /// Select a file for printing. Any previously selected job is discarded.
    pub async fn load_file(&self, filename: &str, check_subdirs: bool) -> Result<FileInfo, GCodeError> {
        if self.is_active() {
            return Err(GCodeError::Busy);
        }
        self.reset_file().await?;
        let file = self
            .inner
            .dispatcher
            .files()
            .resolve(filename, check_subdirs)
            .await?;
        let expander = MacroExpander::for_file(&file, Arc::clone(&self.inner.dispatcher))
            .await
            .map_err(|e| match e {
                GCodeError::Io(err) => GCodeError::command(format!("Unable to open file: {}", err)),
                other => other,
            })?;
        info!("Selected {} ({} bytes)", file.name, file.size);
        self.inner
            .install(PrintJob::new(JobSource::File(file.clone()), file.size, expander))
            .await;
        let dispatcher = &self.inner.dispatcher;
        dispatcher.respond_raw(&format!("File opened:{} Size:{}", file.name, file.size));
        dispatcher.respond_raw("File selected");
        Ok(file)
    }

    /// Select an in-memory script as a job. Its size is reported as 0.
    pub async fn load_script(&self, name: &str, script: &str) -> Result<(), GCodeError> {
        if self.is_active() {
            return Err(GCodeError::Busy);
        }
        self.reset_file().await?;
        let expander = MacroExpander::for_script(script, Arc::clone(&self.inner.dispatcher));
        info!("Selected script {}", name);
        self.inner
            .install(PrintJob::new(
                JobSource::Script {
                    name: name.to_string(),
                },
                0,
                expander,
            ))
            .await;
        Ok(())
    }

    /// Start or continue the work loop.
    pub async fn resume(&self) -> Result<(), GCodeError> {
        let inner = &self.inner;
        if inner
            .work_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(GCodeError::Busy);
        }
        if inner.job.lock().await.is_none() {
            inner.work_active.store(false, Ordering::SeqCst);
            return Err(GCodeError::NotLoaded);
        }
        inner.must_pause.store(false, Ordering::SeqCst);
        inner.set_state(JobState::Printing);
        let handle = tokio::spawn(work_loop(Arc::clone(inner)));
        if let Ok(mut slot) = inner.task.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Ask the loop to stop after the current line. Called from outside the
    /// job this waits until the loop has exited; from inside a job command it
    /// returns immediately.
    pub async fn pause(&self) {
        let inner = &self.inner;
        if !inner.work_active.load(Ordering::SeqCst) {
            return;
        }
        inner.must_pause.store(true, Ordering::SeqCst);
        if inner.in_scope(false) {
            // The loop is our caller; it stops once this command returns.
            return;
        }
        while inner.work_active.load(Ordering::SeqCst) {
            tokio::time::sleep(inner.options.pause_poll).await;
        }
    }

    pub async fn cancel(&self) {
        let has_job = self.inner.job.lock().await.is_some();
        if !has_job {
            return;
        }
        self.pause().await;
        self.inner.close_job().await;
        self.inner.stats.note_cancel();
        self.inner.set_state(JobState::Cancelled);
        info!("Print cancelled");
    }

    /// Discard the selected job and reset statistics.
    pub async fn reset_file(&self) -> Result<(), GCodeError> {
        if self.is_cmd_from_job() {
            return Err(GCodeError::command(
                "SDCARD_RESET_FILE cannot be run from the sdcard",
            ));
        }
        let has_job = self.inner.job.lock().await.is_some();
        if has_job {
            self.pause().await;
            self.inner.close_job().await;
        }
        self.inner.stats.reset();
        self.inner.set_state(JobState::Idle);
        Ok(())
    }

    /// Reposition the selected job. Not allowed while printing.
    pub async fn seek(&self, pos: u64) -> Result<(), GCodeError> {
        if self.is_active() {
            return Err(GCodeError::Busy);
        }
        let mut job = self.inner.job.lock().await;
        let job = job.as_mut().ok_or(GCodeError::NotLoaded)?;
        job.cursor.seek(pos).await
    }

    pub async fn status(&self) -> PrintStatus {
        let job = self.inner.job.lock().await;
        let (file_path, file_position, file_size) = match job.as_ref() {
            Some(job) => (Some(job.source.name().to_string()), job.pos(), job.size),
            None => (None, 0, 0),
        };
        let progress = if file_size > 0 {
            (file_position as f64 / file_size as f64).min(1.0)
        } else {
            0.0
        };
        PrintStatus {
            file_path,
            progress,
            is_active: self.is_active(),
            file_position,
            file_size,
        }
    }

    /// Wait for the most recently started work loop to exit.
    pub async fn wait(&self) {
        let handle = self.inner.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Print task failed: {}", e);
            }
        }
    }

    /// Log where the job stood and stop the loop. Runs on host shutdown.
    pub async fn handle_shutdown(&self, reason: &str) {
        if !self.is_active() {
            return;
        }
        self.inner.must_pause.store(true, Ordering::SeqCst);
        let mut job = self.inner.job.lock().await;
        let Some(job) = job.as_mut() else {
            return;
        };
        let pos = job.pos();
        let current = match job.cursor.current().await {
            Ok(Some(line)) => line.to_string(),
            _ => "<none>".to_string(),
        };
        let upcoming = match job.cursor.lookahead(3).await {
            Ok(lines) => lines
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("<unavailable: {}>", e),
        };
        error!(
            "Shutdown during print ({}): {}\nCurrent ({}):\n{}\nUpcoming:\n{}",
            job.source.name(),
            reason,
            pos,
            current,
            upcoming
        );
    }

    /// Spawn a task that runs [`PrintEngine::handle_shutdown`] for every
    /// shutdown raised on the dispatcher.
    pub fn watch_shutdown(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let mut shutdown_rx = self.inner.dispatcher.subscribe_shutdown();
        tokio::spawn(async move {
            loop {
                match shutdown_rx.recv().await {
                    Ok(reason) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        PrintEngine { inner }.handle_shutdown(&reason).await;
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl EngineInner {
    fn id(&self) -> usize {
        self as *const EngineInner as usize
    }

    /// Whether the caller runs on this engine's work loop. With `job_line`
    /// it must also be dispatching a line of the job.
    fn in_scope(&self, job_line: bool) -> bool {
        LOOP_SCOPE
            .try_with(|&(id, dispatching)| id == self.id() && (dispatching || !job_line))
            .unwrap_or(false)
    }

    fn set_state(&self, state: JobState) {
        match self.state.lock() {
            Ok(mut current) => *current = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    async fn install(&self, job: PrintJob) {
        self.stats.set_current_file(job.source.name());
        *self.job.lock().await = Some(job);
        self.set_state(JobState::Selected);
    }

    async fn close_job(&self) {
        let job = self.job.lock().await.take();
        if let Some(mut job) = job {
            job.cursor.close().await;
        }
    }

    async fn position(&self) -> u64 {
        self.job.lock().await.as_ref().map_or(0, PrintJob::pos)
    }

    async fn drive(&self) -> LoopExit {
        while !self.must_pause.load(Ordering::SeqCst) {
            let pulled = {
                let mut job = self.job.lock().await;
                match job.as_mut() {
                    Some(job) => job.cursor.next_line().await,
                    None => return LoopExit::Detached,
                }
            };
            let line = match pulled {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.close_job().await;
                    self.dispatcher.respond_raw("Done printing file");
                    return LoopExit::Completed;
                }
                Err(e) => return self.fail(e).await,
            };

            let Some(guard) = self.dispatcher.try_acquire() else {
                // An interactive command holds the lock; retry this line later.
                let backed_off = match self.job.lock().await.as_mut() {
                    Some(job) => job.cursor.backoff(),
                    None => return LoopExit::Detached,
                };
                if let Err(e) = backed_off {
                    return self.fail(e).await;
                }
                tokio::time::sleep(self.options.busy_backoff).await;
                continue;
            };

            let result = LOOP_SCOPE
                .scope((self.id(), true), self.dispatcher.dispatch_line(&line))
                .await;
            drop(guard);
            if let Err(e) = result {
                return self.fail(e).await;
            }
            tokio::task::yield_now().await;
        }
        LoopExit::Paused
    }

    async fn fail(&self, error: GCodeError) -> LoopExit {
        let message = error.report();
        self.dispatcher.respond_error(&message);
        if error.is_internal() {
            error!("Internal error during print: {}", message);
            self.dispatcher.invoke_shutdown(&message);
        } else {
            warn!("Print aborted: {}", message);
            self.run_on_error().await;
        }
        self.close_job().await;
        LoopExit::Failed(message)
    }

    async fn run_on_error(&self) {
        let Some(template) = self.options.on_error_gcode.as_deref() else {
            return;
        };
        let script = match self
            .dispatcher
            .templates()
            .render("on_error_gcode", template, &serde_json::json!({}))
        {
            Ok(script) => script,
            Err(e) => {
                warn!("on_error_gcode failed: {}", e);
                return;
            }
        };
        let _guard = self.dispatcher.acquire().await;
        if let Err(e) = self.dispatcher.run_script_from_command(&script).await {
            warn!("on_error_gcode failed: {}", e.report());
        }
    }
}

async fn work_loop(inner: Arc<EngineInner>) {
    info!("Starting print (position {})", inner.position().await);
    inner.stats.note_start();

    let mut exit = LOOP_SCOPE.scope((inner.id(), false), inner.drive()).await;
    if matches!(exit, LoopExit::Paused) && inner.job.lock().await.is_none() {
        exit = LoopExit::Detached;
    }

    match exit {
        LoopExit::Failed(message) => {
            inner.stats.note_error(&message);
            inner.set_state(JobState::Error(message));
        }
        LoopExit::Paused => {
            info!("Exiting print (position {})", inner.position().await);
            inner.stats.note_pause();
            inner.set_state(JobState::Paused);
        }
        LoopExit::Completed => {
            info!("Finished print");
            inner.stats.note_complete();
            inner.set_state(JobState::Completed);
        }
        LoopExit::Detached => info!("Exiting print, job was closed"),
    }

    inner.work_active.store(false, Ordering::SeqCst);
}
