// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only JSONL transcripts.
//!
//! Each thread owns `.ai/threads/{thread_id}/transcript.jsonl`.  Every
//! line is an object with at least `{ts, type}` plus type-specific
//! fields.  Lines are appended, never rewritten; the transcript grows
//! monotonically.

use chrono::Utc;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Errors from transcript writing and reading.
#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    /// Filesystem failure.
    #[error("transcript io error at {path}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// No transcript exists for the thread.
    #[error("transcript for '{thread_id}' not found")]
    NotFound {
        /// Thread with no transcript.
        thread_id: String,
    },
}

/// Writes thread events to per-thread JSONL transcripts.
pub struct TranscriptWriter {
    threads_root: PathBuf,
}

impl TranscriptWriter {
    /// Create a writer rooted at the threads directory
    /// (`.ai/threads/` per project).
    #[must_use]
    pub fn new(threads_root: impl Into<PathBuf>) -> Self {
        Self {
            threads_root: threads_root.into(),
        }
    }

    /// Path of a thread's transcript.
    #[must_use]
    pub fn transcript_path(&self, thread_id: &str) -> PathBuf {
        self.threads_root.join(thread_id).join("transcript.jsonl")
    }

    /// Append one event line: `{ts, type, ...data}`.
    ///
    /// # Errors
    ///
    /// Returns [`TranscriptError::Io`] on filesystem failure.
    pub fn write_event(
        &self,
        thread_id: &str,
        event_type: &str,
        data: &Value,
    ) -> Result<(), TranscriptError> {
        let path = self.transcript_path(thread_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| TranscriptError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut line = Map::new();
        line.insert("ts".into(), Value::String(Utc::now().to_rfc3339()));
        line.insert("type".into(), Value::String(event_type.to_string()));
        if let Some(fields) = data.as_object() {
            for (key, value) in fields {
                line.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| TranscriptError::Io {
                path: path.clone(),
                source,
            })?;
        writeln!(file, "{}", Value::Object(line)).map_err(|source| TranscriptError::Io {
            path,
            source,
        })
    }

    /// Read the last `last_n` transcript entries (all when `None`).
    ///
    /// # Errors
    ///
    /// [`TranscriptError::NotFound`] when the thread has no transcript.
    pub fn read(
        &self,
        thread_id: &str,
        last_n: Option<usize>,
    ) -> Result<Vec<Value>, TranscriptError> {
        let path = self.transcript_path(thread_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TranscriptError::NotFound {
                    thread_id: thread_id.to_string(),
                })
            }
            Err(source) => return Err(TranscriptError::Io { path, source }),
        };

        let entries: Vec<Value> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let start = last_n.map_or(0, |n| entries.len().saturating_sub(n));
        Ok(entries[start..].to_vec())
    }
}

/// Convenience for the standard per-project layout.
#[must_use]
pub fn project_transcripts(project_path: &Path) -> TranscriptWriter {
    TranscriptWriter::new(project_path.join(".ai").join("threads"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_event_with_ts_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        writer
            .write_event("thread-1", "turn_start", &json!({"turn": 1}))
            .unwrap();

        let path = dir.path().join("thread-1").join("transcript.jsonl");
        assert!(path.exists());
        let line: Value =
            serde_json::from_str(std::fs::read_to_string(&path).unwrap().lines().next().unwrap())
                .unwrap();
        assert_eq!(line["type"], "turn_start");
        assert_eq!(line["turn"], 1);
        assert!(line["ts"].is_string());
    }

    #[test]
    fn transcript_is_append_only_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        writer.write_event("t", "turn_start", &json!({"turn": 1})).unwrap();
        writer
            .write_event("t", "user_message", &json!({"content": "Hello"}))
            .unwrap();
        writer.write_event("t", "turn_end", &json!({"turn": 1})).unwrap();

        let entries = writer.read("t", None).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["type"], "turn_start");
        assert_eq!(entries[1]["type"], "user_message");
        assert_eq!(entries[2]["type"], "turn_end");
    }

    #[test]
    fn monotone_growth_across_writers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let writer = TranscriptWriter::new(dir.path());
            writer.write_event("t", "turn_start", &json!({})).unwrap();
        }
        {
            let writer = TranscriptWriter::new(dir.path());
            writer.write_event("t", "turn_end", &json!({})).unwrap();
        }
        let writer = TranscriptWriter::new(dir.path());
        assert_eq!(writer.read("t", None).unwrap().len(), 2);
    }

    #[test]
    fn read_last_n() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        for i in 0..5 {
            writer.write_event("t", "turn_start", &json!({"turn": i})).unwrap();
        }
        let entries = writer.read("t", Some(2)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["turn"], 3);
        assert_eq!(entries[1]["turn"], 4);
    }

    #[test]
    fn missing_transcript_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        assert!(matches!(
            writer.read("ghost", None),
            Err(TranscriptError::NotFound { .. })
        ));
    }

    #[test]
    fn event_fields_do_not_override_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TranscriptWriter::new(dir.path());
        writer
            .write_event("t", "injected_message", &json!({"type": "fake", "ts": "fake"}))
            .unwrap();
        let entries = writer.read("t", None).unwrap();
        assert_eq!(entries[0]["type"], "injected_message");
        assert_ne!(entries[0]["ts"], "fake");
    }
}
