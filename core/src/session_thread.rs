//! The thread an evaluation runs on.
//!
//! Each evaluation request gets a fresh, named [`SessionThread`]. The
//! evaluation receives an [`ExecutionContext`] instead of reaching for
//! thread-local state, and its outcome is recorded as a [`ThreadExit`] that
//! the session can await.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::io;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::config::ChannelConfig;
use crate::config::NAME_PLACEHOLDER;
use crate::error::ConfigError;
use crate::error::TerminationError;
use crate::interrupt::InterruptHandle;
use crate::interrupt::Interrupted;
use crate::sink::lock_state;
use crate::termination::StopDelivery;
use crate::termination::Terminable;
use crate::termination::TerminationSignal;
use crate::termination::panic_message;

/// Name of the frame that separates evaluated code from thread plumbing in
/// a backtrace.
const EVALUATION_BOUNDARY: &str = "begin_evaluation";

/// Everything an evaluation may know about where it runs.
#[derive(Clone)]
pub struct ExecutionContext {
    session_id: String,
    thread_name: String,
    interrupt: InterruptHandle,
    extension: Option<Arc<dyn Any + Send + Sync>>,
}

impl ExecutionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            thread_name: String::new(),
            interrupt: InterruptHandle::new(),
            extension: None,
        }
    }

    /// Attaches a host-defined value the evaluation can fetch back with
    /// [`Self::extension`].
    pub fn with_extension<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.extension = Some(Arc::new(value));
        self
    }

    pub fn with_interrupt(mut self, interrupt: InterruptHandle) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Empty until the context is handed to a [`SessionThread`].
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn interrupt(&self) -> &InterruptHandle {
        &self.interrupt
    }

    pub fn extension<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extension.as_deref()?.downcast_ref::<T>()
    }

    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        self.interrupt.checkpoint()
    }

    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.interrupt.sleep(duration)
    }

    /// Backtrace of the calling evaluation, cut where the session thread
    /// entered it, so it starts and ends in evaluated code.
    pub fn trimmed_backtrace(&self) -> String {
        trim_backtrace(&Backtrace::force_capture().to_string())
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("session_id", &self.session_id)
            .field("thread_name", &self.thread_name)
            .field("interrupt", &self.interrupt)
            .field("has_extension", &self.extension.is_some())
            .finish()
    }
}

fn trim_backtrace(rendered: &str) -> String {
    let lines: Vec<&str> = rendered.lines().collect();
    let end = lines
        .iter()
        .position(|line| line.contains(EVALUATION_BOUNDARY))
        .unwrap_or(lines.len());
    // Drop the capture machinery above the caller.
    let start = lines[..end]
        .iter()
        .rposition(|line| line.contains("trimmed_backtrace"))
        .map(|idx| skip_location_lines(&lines[..end], idx + 1))
        .unwrap_or(0);
    lines[start..end].join("\n")
}

fn skip_location_lines(lines: &[&str], mut idx: usize) -> usize {
    while idx < lines.len() && lines[idx].trim_start().starts_with("at ") {
        idx += 1;
    }
    idx
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadExit {
    Completed,
    Interrupted,
    Failed(String),
    Terminated,
    Panicked(String),
}

/// A running (or finished) evaluation thread. Not reusable: one per
/// evaluation.
pub struct SessionThread {
    name: String,
    context: ExecutionContext,
    handle: Mutex<Option<JoinHandle<ThreadExit>>>,
    exit: Arc<ExitSlot>,
    done: Arc<watch::Sender<bool>>,
}

/// Outcome of the thread, filled exactly once.
#[derive(Default)]
struct ExitSlot {
    value: Mutex<Option<ThreadExit>>,
    filled: Condvar,
}

impl ExitSlot {
    fn get(&self) -> Option<ThreadExit> {
        lock_state(&self.value).clone()
    }

    fn fill(&self, outcome: ThreadExit) {
        let mut value = lock_state(&self.value);
        if value.is_none() {
            *value = Some(outcome);
        }
        self.filled.notify_all();
    }

    fn wait(&self) -> ThreadExit {
        let mut value = lock_state(&self.value);
        loop {
            if let Some(outcome) = value.as_ref() {
                return outcome.clone();
            }
            value = self
                .filled
                .wait(value)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl SessionThread {
    pub fn spawn<F>(
        name: impl Into<String>,
        mut context: ExecutionContext,
        runnable: F,
    ) -> io::Result<Self>
    where
        F: FnOnce(&ExecutionContext) -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        context.thread_name = name.clone();
        let exit = Arc::new(ExitSlot::default());
        let (done, _) = watch::channel(false);
        let done = Arc::new(done);

        let handle = thread::Builder::new().name(name.clone()).spawn({
            let context = context.clone();
            let exit = Arc::clone(&exit);
            let done = Arc::clone(&done);
            move || {
                let outcome = begin_evaluation(&context, runnable);
                debug!(thread = %context.thread_name, exit = ?outcome, "session thread finished");
                exit.fill(outcome.clone());
                done.send_replace(true);
                outcome
            }
        })?;
        debug!(thread = %name, session = %context.session_id, "session thread spawned");

        Ok(Self {
            name,
            context,
            handle: Mutex::new(Some(handle)),
            exit,
            done,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn interrupt(&self) -> &InterruptHandle {
        &self.context.interrupt
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// The recorded outcome, once the thread has finished.
    pub fn exit(&self) -> Option<ThreadExit> {
        self.exit.get()
    }

    /// Blocks until the thread has finished. Any number of callers may join;
    /// all of them see the same outcome.
    pub fn join(&self) -> ThreadExit {
        let handle = lock_state(&self.handle).take();
        match handle {
            Some(handle) => {
                let outcome = match handle.join() {
                    Ok(outcome) => outcome,
                    Err(payload) => ThreadExit::Panicked(panic_message(payload.as_ref())),
                };
                // Covers a thread that died before recording its outcome.
                self.exit.fill(outcome);
                self.exit.wait()
            }
            None => self.exit.wait(),
        }
    }

    /// Waits up to `timeout` for the thread to finish.
    pub async fn wait_finished(&self, timeout: Duration) -> Option<ThreadExit> {
        let mut finished = self.done.subscribe();
        let in_time = tokio::time::timeout(timeout, finished.wait_for(|done| *done))
            .await
            .is_ok();
        if !in_time {
            return None;
        }
        self.exit()
    }
}

impl fmt::Debug for SessionThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionThread")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl Terminable for SessionThread {
    fn label(&self) -> String {
        self.name.clone()
    }

    fn request_interrupt(&self) -> Result<(), TerminationError> {
        self.context.interrupt.request_interrupt();
        Ok(())
    }

    /// Arms the deferred stop. Evaluations that never reach a checkpoint
    /// (a tight loop, a blocking native call) are not affected.
    fn force_stop(&self, _signal: TerminationSignal) -> Result<StopDelivery, TerminationError> {
        if self.is_finished() {
            return Err(TerminationError::AlreadyFinished(self.name.clone()));
        }
        self.context.interrupt.request_stop();
        Ok(StopDelivery::AtNextCheckpoint)
    }

    fn finished(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }
}

#[inline(never)]
fn begin_evaluation<F>(context: &ExecutionContext, runnable: F) -> ThreadExit
where
    F: FnOnce(&ExecutionContext) -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| runnable(context))) {
        Ok(Ok(())) => ThreadExit::Completed,
        Ok(Err(err)) if Interrupted::is_cause_of(&err) => ThreadExit::Interrupted,
        Ok(Err(err)) => ThreadExit::Failed(format!("{err:#}")),
        Err(payload) if TerminationSignal::is_payload(payload.as_ref()) => ThreadExit::Terminated,
        Err(payload) => ThreadExit::Panicked(panic_message(payload.as_ref())),
    }
}

/// Names and spawns the worker threads of one server. Threads never keep
/// the process alive past `main`, so every worker is a daemon.
#[derive(Debug)]
pub struct WorkerThreadFactory {
    name_format: String,
    counter: AtomicU64,
}

impl WorkerThreadFactory {
    /// `name_format` must contain `{}`, which is replaced by a counter
    /// starting at 0; a format without it would give every worker the same
    /// name.
    pub fn new(name_format: impl Into<String>) -> Result<Self, ConfigError> {
        let name_format = name_format.into();
        if !name_format.contains(NAME_PLACEHOLDER) {
            return Err(ConfigError::invalid(
                "thread_name_format",
                format!("must contain a `{NAME_PLACEHOLDER}` placeholder"),
            ));
        }
        Ok(Self {
            name_format,
            counter: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &ChannelConfig) -> Result<Self, ConfigError> {
        Self::new(config.thread_name_format.clone())
    }

    pub fn next_name(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        self.name_format.replace(NAME_PLACEHOLDER, &id.to_string())
    }

    pub fn spawn<F, T>(&self, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        thread::Builder::new().name(self.next_name()).spawn(f)
    }

    pub fn session_thread<F>(
        &self,
        context: ExecutionContext,
        runnable: F,
    ) -> io::Result<SessionThread>
    where
        F: FnOnce(&ExecutionContext) -> anyhow::Result<()> + Send + 'static,
    {
        SessionThread::spawn(self.next_name(), context, runnable)
    }
}
