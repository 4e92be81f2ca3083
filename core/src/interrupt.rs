//! Cancellation flags shared between a session and its evaluation.
//!
//! An evaluation observes cancellation only at checkpoints: explicit
//! [`InterruptHandle::checkpoint`] calls, [`InterruptHandle::sleep`], and
//! blocking input reads. A cooperative interrupt surfaces as an
//! [`Interrupted`] error the evaluation may handle. A forced stop unwinds the
//! evaluation with a [`TerminationSignal`] and cannot be handled by ordinary
//! error paths.

use std::io;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

use crate::error::InputError;
use crate::sink::lock_state;
use crate::termination::TerminationSignal;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("evaluation interrupted")]
pub struct Interrupted;

impl Interrupted {
    /// Whether `error` reports a cooperative interrupt, however it was
    /// wrapped on the way out of the evaluation.
    pub fn is_cause_of(error: &anyhow::Error) -> bool {
        error.chain().any(|cause| {
            if cause.is::<Interrupted>() {
                return true;
            }
            if let Some(input) = cause.downcast_ref::<InputError>() {
                return matches!(input, InputError::Interrupted);
            }
            cause
                .downcast_ref::<io::Error>()
                .and_then(|io| io.get_ref())
                .and_then(|inner| inner.downcast_ref::<InputError>())
                .is_some_and(|input| matches!(input, InputError::Interrupted))
        })
    }
}

impl From<Interrupted> for InputError {
    fn from(_: Interrupted) -> Self {
        InputError::Interrupted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptState {
    Running,
    InterruptRequested,
    StopRequested,
}

struct Flag;
impl Flag {
    const RUNNING: u8 = 0;
    const INTERRUPT: u8 = 1;
    const STOP: u8 = 2;
}

/// Cloneable handle to one evaluation's cancellation state. Requests are
/// sticky: once interrupted, every later checkpoint reports it.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: AtomicU8,
    wake: Mutex<()>,
    cvar: Condvar,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> InterruptState {
        match self.inner.state.load(Ordering::SeqCst) {
            Flag::RUNNING => InterruptState::Running,
            Flag::INTERRUPT => InterruptState::InterruptRequested,
            _ => InterruptState::StopRequested,
        }
    }

    /// Requests a cooperative interrupt. Returns `false` if one (or a stop)
    /// was already requested.
    pub fn request_interrupt(&self) -> bool {
        let changed = self
            .inner
            .state
            .compare_exchange(
                Flag::RUNNING,
                Flag::INTERRUPT,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        self.wake_sleepers();
        changed
    }

    /// Arms the deferred stop: the next checkpoint unwinds the evaluation.
    pub fn request_stop(&self) {
        self.inner.state.store(Flag::STOP, Ordering::SeqCst);
        self.wake_sleepers();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) != Flag::RUNNING
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == Flag::STOP
    }

    /// Observes pending requests. Raises [`TerminationSignal`] when a stop is
    /// armed; returns [`Interrupted`] when an interrupt is pending.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        match self.inner.state.load(Ordering::SeqCst) {
            Flag::RUNNING => Ok(()),
            Flag::INTERRUPT => Err(Interrupted),
            _ => TerminationSignal::raise(),
        }
    }

    /// Sleeps for `duration`, returning early through [`Self::checkpoint`]
    /// when a request arrives.
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let deadline = Instant::now() + duration;
        let mut guard = lock_state(&self.inner.wake);
        loop {
            if self.is_interrupted() {
                drop(guard);
                return self.checkpoint();
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            guard = self
                .inner
                .cvar
                .wait_timeout(guard, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn wake_sleepers(&self) {
        // Taking the lock orders the notification after any sleeper's check.
        let _guard = lock_state(&self.inner.wake);
        self.inner.cvar.notify_all();
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("state", &self.state())
            .finish()
    }
}
