//! bmnotify sinks: where flushed batches go.
//!
//! - [`HttpSink`] posts batches to the provisioning service events API
//! - [`LogSink`] writes each batch as a JSON line (dry runs)
//! - [`RecordingSink`] keeps batches in memory (tests)

#![forbid(unsafe_code)]

mod http;
mod recording;

use std::io::Write;
use std::sync::Mutex;

use bmnotify_core::{EventRecord, Sink, SinkError};
use serde::Serialize;

pub use http::{HttpSink, HttpSinkConfig, API_VERSION_HEADER, AUTH_TOKEN_HEADER, DEFAULT_API_VERSION};
pub use recording::RecordingSink;

#[derive(Serialize)]
struct LogLine<'a> {
    ts: String,
    count: usize,
    events: &'a [EventRecord],
}

/// Writes every batch as one JSON line to `W`.
pub struct LogSink<W> {
    out: Mutex<W>,
}

impl LogSink<std::io::Stdout> {
    pub fn stdout() -> Self { Self::new(std::io::stdout()) }
}

impl<W: Write + Send> LogSink<W> {
    pub fn new(out: W) -> Self { Self { out: Mutex::new(out) } }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl<W: Write + Send + 'static> Sink for LogSink<W> {
    async fn submit(&self, events: Vec<EventRecord>) -> Result<(), SinkError> {
        let line = LogLine { ts: chrono::Utc::now().to_rfc3339(), count: events.len(), events: &events };
        let mut buf = serde_json::to_vec(&line).map_err(|e| SinkError::Encode(e.to_string()))?;
        buf.push(b'\n');
        let mut out = self.out.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        out.write_all(&buf).and_then(|_| out.flush()).map_err(|e| SinkError::Transport(e.to_string()))
    }

    fn name(&self) -> &str { "log" }
}
