//! Per-stream output chain for one session.
//!
//! Bytes written by the evaluation are fanned out to a mirror and to a
//! line-buffered, quota-limited path that ends at the network handler:
//!
//! ```text
//! TeeSink
//!  ├─ LineBufferedSink ─ QuotaGuard (optional) ─ CallbackSink(handler)
//!  └─ mirror (CaptureBuffer unless one is supplied)
//! ```

use std::sync::Arc;

use crate::config::ChannelConfig;
use crate::error::OutputError;
use crate::sink::ByteSink;
use crate::sink::CallbackSink;
use crate::sink::CaptureBuffer;
use crate::sink::LineBufferedSink;
use crate::sink::OutputHandler;
use crate::sink::QuotaGuard;
use crate::sink::SinkWriter;
use crate::sink::TeeSink;
use crate::sink::TextSink;

pub struct PipelineOptions {
    pub quota: Option<usize>,
    pub line_buffer_size: usize,
    /// Second leg of the fan-out. `None` captures into memory.
    pub mirror: Option<Arc<dyn ByteSink>>,
}

impl PipelineOptions {
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            quota: config.output_quota,
            line_buffer_size: config.line_buffer_size,
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn ByteSink>) -> Self {
        self.mirror = Some(mirror);
        self
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&ChannelConfig::default())
    }
}

pub struct OutputPipeline {
    head: Arc<TeeSink>,
    quota: Option<Arc<QuotaGuard>>,
    capture: Option<Arc<CaptureBuffer>>,
}

impl OutputPipeline {
    pub fn new(handler: OutputHandler, options: PipelineOptions) -> Result<Self, OutputError> {
        let leaf: Arc<dyn TextSink> = Arc::new(CallbackSink::new(handler));
        let (limited, quota) = match options.quota {
            Some(limit) => {
                let guard = Arc::new(QuotaGuard::new(leaf, limit)?);
                (Arc::clone(&guard) as Arc<dyn TextSink>, Some(guard))
            }
            None => (leaf, None),
        };
        let buffered: Arc<dyn ByteSink> =
            Arc::new(LineBufferedSink::new(limited, options.line_buffer_size)?);

        let (mirror, capture) = match options.mirror {
            Some(mirror) => (mirror, None),
            None => {
                let capture = Arc::new(CaptureBuffer::new());
                (Arc::clone(&capture) as Arc<dyn ByteSink>, Some(capture))
            }
        };

        Ok(Self {
            head: Arc::new(TeeSink::new(buffered, mirror)),
            quota,
            capture,
        })
    }

    pub fn from_config(config: &ChannelConfig, handler: OutputHandler) -> Result<Self, OutputError> {
        Self::new(handler, PipelineOptions::from_config(config))
    }

    pub fn writer(&self) -> SinkWriter {
        SinkWriter::new(self.sink())
    }

    pub fn sink(&self) -> Arc<dyn ByteSink> {
        Arc::clone(&self.head) as Arc<dyn ByteSink>
    }

    /// Everything written so far, when the pipeline mirrors into memory.
    pub fn captured(&self) -> Option<String> {
        self.capture.as_ref().map(|capture| capture.contents_lossy())
    }

    /// Chars the handler may still receive, if a quota is set.
    pub fn quota_remaining(&self) -> Option<usize> {
        self.quota.as_ref().map(|quota| quota.remaining())
    }

    pub fn flush(&self) -> Result<(), OutputError> {
        ByteSink::flush(self.head.as_ref())
    }

    pub fn close(&self) -> Result<(), OutputError> {
        ByteSink::close(self.head.as_ref())
    }
}

/// The stdout/stderr pair of one session.
pub struct SessionStreams {
    pub out: OutputPipeline,
    pub err: OutputPipeline,
}

impl SessionStreams {
    pub fn new(
        config: &ChannelConfig,
        out_handler: OutputHandler,
        err_handler: OutputHandler,
    ) -> Result<Self, OutputError> {
        Ok(Self {
            out: OutputPipeline::from_config(config, out_handler)?,
            err: OutputPipeline::from_config(config, err_handler)?,
        })
    }

    /// Closes both streams, reporting the first failure.
    pub fn close(&self) -> Result<(), OutputError> {
        let out = self.out.close();
        let err = self.err.close();
        out.and(err)
    }
}
