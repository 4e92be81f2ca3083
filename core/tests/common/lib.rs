//! Helpers shared by the `evalchan-core` integration tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use evalchan_core::sink::OutputHandler;

/// Output handler that records every chunk it receives.
#[derive(Clone, Default)]
pub struct Recorder {
    chunks: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> OutputHandler {
        let chunks = Arc::clone(&self.chunks);
        Arc::new(move |chunk: &str| {
            chunks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(chunk.to_string());
        })
    }

    pub fn chunks(&self) -> Vec<String> {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn text(&self) -> String {
        self.chunks().concat()
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` passes. Returns
/// whether it held.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
