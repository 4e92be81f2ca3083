//! Escalating cancellation: ask politely, then force, then give up.
//!
//! [`Terminator::terminate`] drives a [`Terminable`] target through
//! `Running → InterruptRequested → (Resumed | Stopped)`. A target that
//! survives the forced stop is reported [`TerminationState::Unresponsive`]
//! and abandoned; in-process threads spinning without a checkpoint end up
//! there, which is why evaluations that may run native loops should be
//! hosted in an [`crate::isolated::IsolatedProcess`].

use std::any::Any;
use std::fmt;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::watch;
use tracing::info;
use tracing::warn;

use crate::config::ChannelConfig;
use crate::error::TerminationError;

/// Payload of the unwind that ends a forcibly stopped evaluation.
///
/// It is raised with [`std::panic::resume_unwind`], so the panic hook does
/// not run and nothing is printed. Code that catches panics should go
/// through [`catch_ordinary_panics`] so the signal keeps propagating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminationSignal;

impl TerminationSignal {
    pub fn raise() -> ! {
        panic::resume_unwind(Box::new(TerminationSignal))
    }

    pub fn is_payload(payload: &(dyn Any + Send)) -> bool {
        payload.is::<TerminationSignal>()
    }
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("evaluation terminated")
    }
}

/// Runs `f`, turning ordinary panics into `Err(message)`. A
/// [`TerminationSignal`] is re-raised untouched.
pub fn catch_ordinary_panics<F, R>(f: F) -> Result<R, String>
where
    F: FnOnce() -> R,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) if TerminationSignal::is_payload(payload.as_ref()) => {
            panic::resume_unwind(payload)
        }
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// How a forced stop reaches its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDelivery {
    /// The target is gone once the call returns (a killed process).
    Immediate,
    /// The target unwinds the next time it passes a checkpoint.
    AtNextCheckpoint,
    /// The target has no way to be stopped.
    Unsupported,
}

/// Something a session can cancel.
pub trait Terminable: Send + Sync {
    fn label(&self) -> String;

    fn request_interrupt(&self) -> Result<(), TerminationError>;

    fn force_stop(&self, signal: TerminationSignal) -> Result<StopDelivery, TerminationError>;

    /// Flips to `true` once the target has finished, for whatever reason.
    fn finished(&self) -> watch::Receiver<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Running,
    InterruptRequested,
    /// The target finished without a forced stop.
    Resumed,
    /// The target finished after a forced stop.
    Stopped,
    /// The target outlived the forced stop and was abandoned.
    Unresponsive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    pub label: String,
    pub state: TerminationState,
    pub escalated: bool,
    pub delivery: Option<StopDelivery>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminator {
    interrupt_grace: Duration,
    stop_grace: Duration,
}

impl Terminator {
    pub fn new(interrupt_grace: Duration, stop_grace: Duration) -> Self {
        Self {
            interrupt_grace,
            stop_grace,
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.interrupt_grace(), config.stop_grace())
    }

    pub async fn terminate(
        &self,
        target: &dyn Terminable,
    ) -> Result<TerminationReport, TerminationError> {
        let started = Instant::now();
        let label = target.label();
        let finished = target.finished();
        let mut state = TerminationState::Running;
        info!(label = %label, state = ?state, "termination requested");

        let report = |state, escalated, delivery| TerminationReport {
            label: label.clone(),
            state,
            escalated,
            delivery,
            elapsed: started.elapsed(),
        };

        if *finished.borrow() {
            return Ok(report(TerminationState::Resumed, false, None));
        }

        target.request_interrupt()?;
        state = TerminationState::InterruptRequested;
        info!(label = %label, state = ?state, "interrupt requested");
        if wait_finished(finished.clone(), self.interrupt_grace).await {
            let done = report(TerminationState::Resumed, false, None);
            info!(label = %label, state = ?done.state, escalated = false, "termination finished");
            return Ok(done);
        }

        warn!(
            label = %label,
            grace_ms = self.interrupt_grace.as_millis() as u64,
            "interrupt ignored; forcing stop"
        );
        let delivery = match target.force_stop(TerminationSignal) {
            Ok(delivery) => delivery,
            Err(TerminationError::AlreadyFinished(_)) => {
                return Ok(report(TerminationState::Resumed, false, None));
            }
            Err(err) => return Err(err),
        };

        let stopped = match delivery {
            StopDelivery::Unsupported => *finished.borrow(),
            StopDelivery::Immediate | StopDelivery::AtNextCheckpoint => {
                wait_finished(finished, self.stop_grace).await
            }
        };
        let state = if stopped {
            TerminationState::Stopped
        } else {
            warn!(label = %label, delivery = ?delivery, "target did not stop; abandoning it");
            TerminationState::Unresponsive
        };
        info!(label = %label, state = ?state, escalated = true, "termination finished");
        Ok(report(state, true, Some(delivery)))
    }
}

/// `true` once the target reports completion (or can no longer report
/// anything) within `grace`.
async fn wait_finished(mut finished: watch::Receiver<bool>, grace: Duration) -> bool {
    tokio::time::timeout(grace, finished.wait_for(|done| *done))
        .await
        .is_ok()
}
