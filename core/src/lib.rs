//! Per-session execution and output channel for an interactive evaluation
//! server.
//!
//! Output leaves an evaluation through an [`OutputPipeline`], input reaches
//! it through an [`InputChannel`], and it runs on a [`SessionThread`] (or in
//! an [`IsolatedProcess`]) that a [`Terminator`] can cancel.

pub mod config;
pub mod error;
pub mod input;
pub mod interrupt;
pub mod isolated;
pub mod pipeline;
#[cfg(unix)]
mod process_death;
pub mod session_thread;
pub mod sink;
pub mod termination;

pub use config::ChannelConfig;
pub use error::ConfigError;
pub use error::InputError;
pub use error::OutputError;
pub use error::TerminationError;
pub use input::InputChannel;
pub use input::InputReader;
pub use input::InputSender;
pub use interrupt::InterruptHandle;
pub use interrupt::Interrupted;
pub use isolated::IsolatedProcess;
pub use pipeline::OutputPipeline;
pub use pipeline::PipelineOptions;
pub use pipeline::SessionStreams;
pub use session_thread::ExecutionContext;
pub use session_thread::SessionThread;
pub use session_thread::ThreadExit;
pub use session_thread::WorkerThreadFactory;
pub use termination::Terminable;
pub use termination::TerminationReport;
pub use termination::TerminationSignal;
pub use termination::TerminationState;
pub use termination::Terminator;
pub use termination::catch_ordinary_panics;
