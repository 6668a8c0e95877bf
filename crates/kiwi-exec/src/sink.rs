// SPDX-License-Identifier: MIT OR Apache-2.0
//! Streaming sinks.
//!
//! A sink consumes streamed events: `write(event)` per event, `close()`
//! exactly once when the stream ends, normally or not.  Events are
//! delivered to every sink in registration order before the next event is
//! read.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;

/// Default cap for the in-memory return buffer.
pub const DEFAULT_RETURN_MAX_SIZE: usize = 1000;

/// Default flush cadence for file sinks.
pub const DEFAULT_FLUSH_EVERY: usize = 10;

/// Consumer of streaming events.
#[async_trait]
pub trait EventSink: Send {
    /// Deliver one event.
    async fn write(&mut self, event: &str) -> std::io::Result<()>;
    /// Finish the stream.  Called exactly once, including on interruption.
    async fn close(&mut self) -> std::io::Result<()>;
}

// ---------------------------------------------------------------------------
// ReturnSink
// ---------------------------------------------------------------------------

/// In-memory ring buffer exposed to the caller via
/// [`ExecutionResult::events`](crate::ExecutionResult).
///
/// The buffer keeps the newest `max_size` events; older events are
/// dropped from the front.
#[derive(Debug, Clone)]
pub struct ReturnSink {
    buffer: Arc<Mutex<VecDeque<String>>>,
    max_size: usize,
}

impl ReturnSink {
    /// Create a sink with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_RETURN_MAX_SIZE)
    }

    /// Create a sink capped at `max_size` events.
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Snapshot of buffered events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.buffer
            .lock()
            .expect("return buffer lock")
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for ReturnSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for ReturnSink {
    async fn write(&mut self, event: &str) -> std::io::Result<()> {
        let mut buffer = self.buffer.lock().expect("return buffer lock");
        buffer.push_back(event.to_string());
        while buffer.len() > self.max_size {
            buffer.pop_front();
        }
        Ok(())
    }

    async fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

/// Append-only JSONL sink, flushing every `flush_every` events.
pub struct FileSink {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    flush_every: usize,
    pending: usize,
}

impl FileSink {
    /// Create a sink appending to `path` (parent directories are created
    /// lazily on first write).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, flush_every: usize) -> Self {
        Self {
            path: path.into(),
            file: None,
            flush_every: flush_every.max(1),
            pending: 0,
        }
    }

    /// The path this sink appends to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&mut self) -> std::io::Result<&mut tokio::fs::File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().expect("file opened above"))
    }
}

#[async_trait]
impl EventSink for FileSink {
    async fn write(&mut self, event: &str) -> std::io::Result<()> {
        let flush_every = self.flush_every;
        let pending = self.pending + 1;
        let file = self.open().await?;
        file.write_all(event.as_bytes()).await?;
        file.write_all(b"\n").await?;
        self.pending = pending;
        if self.pending >= flush_every {
            if let Some(file) = self.file.as_mut() {
                file.flush().await?;
            }
            self.pending = 0;
        }
        Ok(())
    }

    async fn close(&mut self) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sink construction from merged config
// ---------------------------------------------------------------------------

/// Build the sink fan-out declared under `stream.destinations`.
///
/// Recognized entries:
/// - `{"type": "return", "max_size"?}`: ring-buffered return sink
/// - `{"type": "file_sink", "path", "flush_every"?}`: JSONL file sink
///
/// Returns the sinks in declaration order plus a handle to the first
/// return sink (if any) for reading accumulated events afterwards.
/// Unknown destination types are skipped with a warning.
#[must_use]
pub fn build_sinks(destinations: &[Value]) -> (Vec<Box<dyn EventSink>>, Option<ReturnSink>) {
    let mut sinks: Vec<Box<dyn EventSink>> = Vec::new();
    let mut return_handle: Option<ReturnSink> = None;

    for dest in destinations {
        match dest.get("type").and_then(Value::as_str) {
            Some("return") => {
                let max_size = dest
                    .get("max_size")
                    .and_then(Value::as_u64)
                    .map_or(DEFAULT_RETURN_MAX_SIZE, |n| n as usize);
                let sink = ReturnSink::with_max_size(max_size);
                if return_handle.is_none() {
                    return_handle = Some(sink.clone());
                }
                sinks.push(Box::new(sink));
            }
            Some("file_sink") => {
                let Some(path) = dest.get("path").and_then(Value::as_str) else {
                    tracing::warn!(target: "kiwi.exec", "file_sink destination missing path, skipped");
                    continue;
                };
                let flush_every = dest
                    .get("flush_every")
                    .and_then(Value::as_u64)
                    .map_or(DEFAULT_FLUSH_EVERY, |n| n as usize);
                sinks.push(Box::new(FileSink::new(path, flush_every)));
            }
            other => {
                tracing::warn!(target: "kiwi.exec", kind = ?other, "unknown stream destination, skipped");
            }
        }
    }
    (sinks, return_handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn return_sink_buffers_in_order() {
        let mut sink = ReturnSink::with_max_size(5);
        for i in 0..3 {
            sink.write(&format!("event{i}")).await.unwrap();
        }
        assert_eq!(sink.events(), vec!["event0", "event1", "event2"]);
    }

    #[tokio::test]
    async fn return_sink_keeps_newest_at_cap() {
        let mut sink = ReturnSink::with_max_size(5);
        for i in 0..10 {
            sink.write(&format!("event{i}")).await.unwrap();
        }
        let events = sink.events();
        assert_eq!(events.len(), 5);
        assert_eq!(events.first().map(String::as_str), Some("event5"));
        assert_eq!(events.last().map(String::as_str), Some("event9"));
    }

    #[tokio::test]
    async fn file_sink_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threads/t1/transcript.jsonl");
        let mut sink = FileSink::new(&path, 2);
        sink.write(&json!({"type": "test", "data": "hello"}).to_string())
            .await
            .unwrap();
        sink.write(&json!({"type": "test", "data": "world"}).to_string())
            .await
            .unwrap();
        sink.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["data"], "hello");
    }

    #[tokio::test]
    async fn file_sink_close_without_writes_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.jsonl");
        let mut sink = FileSink::new(&path, 1);
        sink.close().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn file_sink_appends_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        for round in 0..2 {
            let mut sink = FileSink::new(&path, 1);
            sink.write(&format!("line{round}")).await.unwrap();
            sink.close().await.unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "line0\nline1\n");
    }

    #[tokio::test]
    async fn build_sinks_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        let destinations = vec![
            json!({"type": "file_sink", "path": path.to_str().unwrap()}),
            json!({"type": "return", "max_size": 3}),
            json!({"type": "mystery"}),
        ];
        let (mut sinks, handle) = build_sinks(&destinations);
        assert_eq!(sinks.len(), 2);
        let handle = handle.unwrap();

        for sink in &mut sinks {
            sink.write("e1").await.unwrap();
            sink.close().await.unwrap();
        }
        assert_eq!(handle.events(), vec!["e1"]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "e1\n");
    }

    #[tokio::test]
    async fn build_sinks_empty_when_no_destinations() {
        let (sinks, handle) = build_sinks(&[]);
        assert!(sinks.is_empty());
        assert!(handle.is_none());
    }
}
