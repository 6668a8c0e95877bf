// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persistent thread registry and transcripts.
//!
//! Every directive thread is registered in a small relational store
//! (SQLite, WAL journal mode) with two tables, `threads` and
//! `thread_events`, and mirrors its events into an append-only JSONL
//! transcript at `.ai/threads/{thread_id}/transcript.jsonl`.  Status
//! transitions are enforced: `pause` requires `running`, `resume`
//! requires `paused`, and terminal states are final.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod transcript;

pub use transcript::{project_transcripts, TranscriptError, TranscriptWriter};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle state of a registered thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    /// Actively taking turns.
    Running,
    /// Suspended; may be resumed.
    Paused,
    /// Finished successfully.  Terminal.
    Completed,
    /// Finished with an error.  Terminal.
    Failed,
}

impl ThreadStatus {
    /// Parse from the stored string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Stored string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether a transition from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Paused)
                | (Self::Paused, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Paused, Self::Failed)
        )
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registered thread row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    /// Thread identifier.
    pub thread_id: String,
    /// Directive the thread runs.
    pub directive_id: String,
    /// Parent thread for spawned children.
    pub parent_thread_id: Option<String>,
    /// Current lifecycle status.
    pub status: ThreadStatus,
    /// Capability context recorded at registration.
    pub permission_context: Value,
    /// Cost budget recorded at registration.
    pub cost_budget: Value,
    /// Accumulated usage recorded on status updates.
    pub total_usage: Value,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 last-update timestamp.
    pub updated_at: String,
}

/// One logged thread event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadEvent {
    /// Event type (`tool_call`, `turn_start`, `error`, …).
    pub event_type: String,
    /// Event payload.
    pub payload: Value,
    /// RFC 3339 timestamp.
    pub ts: String,
}

/// Query filters for [`ThreadRegistry::query`].
#[derive(Debug, Clone, Default)]
pub struct ThreadQuery {
    /// Filter by directive.
    pub directive_id: Option<String>,
    /// Filter by status.
    pub status: Option<ThreadStatus>,
    /// Only threads created strictly after this RFC 3339 instant.
    pub created_after: Option<String>,
    /// Only threads created strictly before this RFC 3339 instant.
    pub created_before: Option<String>,
}

/// Errors from the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A thread with this id is already registered.
    #[error("thread '{thread_id}' already exists")]
    AlreadyExists {
        /// Duplicated id.
        thread_id: String,
    },

    /// The thread is not registered.
    #[error("thread '{thread_id}' not found")]
    NotFound {
        /// Missing id.
        thread_id: String,
    },

    /// The requested status change is not a legal transition.
    #[error("illegal transition for '{thread_id}': {from} -> {to}")]
    IllegalTransition {
        /// Thread involved.
        thread_id: String,
        /// Current status.
        from: ThreadStatus,
        /// Requested status.
        to: ThreadStatus,
    },

    /// Underlying SQLite failure.
    #[error("registry storage error")]
    Storage(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// SQLite-backed thread registry.
pub struct ThreadRegistry {
    conn: Connection,
    db_path: PathBuf,
}

impl ThreadRegistry {
    /// Open (creating if needed) the registry at `db_path` and apply the
    /// schema.  The journal is switched to write-ahead mode so readers
    /// never block the single writer.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] on SQLite failure.
    pub fn open(db_path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                directive_id TEXT NOT NULL,
                parent_thread_id TEXT,
                status TEXT NOT NULL,
                permission_context TEXT NOT NULL DEFAULT '{}',
                cost_budget TEXT NOT NULL DEFAULT '{}',
                total_usage TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS thread_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_threads_directive ON threads (directive_id);
            CREATE INDEX IF NOT EXISTS idx_events_thread ON thread_events (thread_id, ts);",
        )?;

        debug!(target: "kiwi.registry", path = %db_path.display(), "registry opened");
        Ok(Self {
            conn,
            db_path: db_path.to_path_buf(),
        })
    }

    /// The database path this registry is bound to.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Register a new thread in `running` state.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyExists`] when the id is taken.
    pub fn register(
        &self,
        thread_id: &str,
        directive_id: &str,
        parent_thread_id: Option<&str>,
        permission_context: &Value,
        cost_budget: &Value,
    ) -> Result<(), RegistryError> {
        let now = Utc::now().to_rfc3339();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO threads
             (thread_id, directive_id, parent_thread_id, status,
              permission_context, cost_budget, total_usage, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'running', ?4, ?5, '{}', ?6, ?6)",
            params![
                thread_id,
                directive_id,
                parent_thread_id,
                permission_context.to_string(),
                cost_budget.to_string(),
                now,
            ],
        )?;
        if inserted == 0 {
            return Err(RegistryError::AlreadyExists {
                thread_id: thread_id.to_string(),
            });
        }
        info!(target: "kiwi.registry", thread_id, directive_id, "thread registered");
        Ok(())
    }

    /// Fetch a thread's record, `None` if unknown.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] on SQLite failure.
    pub fn get_status(&self, thread_id: &str) -> Result<Option<ThreadRecord>, RegistryError> {
        let record = self
            .conn
            .query_row(
                "SELECT thread_id, directive_id, parent_thread_id, status,
                        permission_context, cost_budget, total_usage, created_at, updated_at
                 FROM threads WHERE thread_id = ?1",
                params![thread_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Transition a thread's status, enforcing the lifecycle.
    ///
    /// `metadata.usage`, when present, replaces the stored `total_usage`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] for unknown threads,
    /// [`RegistryError::IllegalTransition`] for lifecycle violations.
    pub fn update_status(
        &self,
        thread_id: &str,
        status: ThreadStatus,
        metadata: Option<&Value>,
    ) -> Result<(), RegistryError> {
        let current = self
            .get_status(thread_id)?
            .ok_or_else(|| RegistryError::NotFound {
                thread_id: thread_id.to_string(),
            })?;

        if !current.status.can_transition_to(status) {
            return Err(RegistryError::IllegalTransition {
                thread_id: thread_id.to_string(),
                from: current.status,
                to: status,
            });
        }

        let usage = metadata
            .and_then(|m| m.get("usage"))
            .map(ToString::to_string);
        self.conn.execute(
            "UPDATE threads
             SET status = ?2, updated_at = ?3,
                 total_usage = COALESCE(?4, total_usage)
             WHERE thread_id = ?1",
            params![thread_id, status.as_str(), Utc::now().to_rfc3339(), usage],
        )?;
        info!(
            target: "kiwi.registry",
            thread_id,
            from = %current.status,
            to = %status,
            "thread status updated"
        );
        Ok(())
    }

    /// Query threads by directive, status, and creation time.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] on SQLite failure.
    pub fn query(&self, filter: &ThreadQuery) -> Result<Vec<ThreadRecord>, RegistryError> {
        let mut sql = String::from(
            "SELECT thread_id, directive_id, parent_thread_id, status,
                    permission_context, cost_budget, total_usage, created_at, updated_at
             FROM threads WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(directive_id) = &filter.directive_id {
            sql.push_str(&format!(" AND directive_id = ?{}", args.len() + 1));
            args.push(directive_id.clone());
        }
        if let Some(status) = filter.status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(status.as_str().to_string());
        }
        if let Some(after) = &filter.created_after {
            sql.push_str(&format!(" AND created_at >= ?{}", args.len() + 1));
            args.push(after.clone());
        }
        if let Some(before) = &filter.created_before {
            sql.push_str(&format!(" AND created_at < ?{}", args.len() + 1));
            args.push(before.clone());
        }
        sql.push_str(" ORDER BY created_at");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Append an event row for a thread.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] on SQLite failure.
    pub fn log_event(
        &self,
        thread_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> Result<(), RegistryError> {
        self.conn.execute(
            "INSERT INTO thread_events (thread_id, event_type, payload, ts)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                thread_id,
                event_type,
                payload.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Events for a thread in insertion order, optionally filtered by
    /// type.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] on SQLite failure.
    pub fn get_events(
        &self,
        thread_id: &str,
        event_type: Option<&str>,
    ) -> Result<Vec<ThreadEvent>, RegistryError> {
        let mut stmt = self.conn.prepare(
            "SELECT event_type, payload, ts FROM thread_events
             WHERE thread_id = ?1 AND (?2 IS NULL OR event_type = ?2)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![thread_id, event_type], |row| {
            let payload_text: String = row.get(1)?;
            Ok(ThreadEvent {
                event_type: row.get(0)?,
                payload: serde_json::from_str(&payload_text).unwrap_or(Value::Null),
                ts: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadRecord> {
    let status_text: String = row.get(3)?;
    let permission_context: String = row.get(4)?;
    let cost_budget: String = row.get(5)?;
    let total_usage: String = row.get(6)?;
    Ok(ThreadRecord {
        thread_id: row.get(0)?,
        directive_id: row.get(1)?,
        parent_thread_id: row.get(2)?,
        status: ThreadStatus::parse(&status_text).unwrap_or(ThreadStatus::Failed),
        permission_context: serde_json::from_str(&permission_context).unwrap_or(Value::Null),
        cost_budget: serde_json::from_str(&cost_budget).unwrap_or(Value::Null),
        total_usage: serde_json::from_str(&total_usage).unwrap_or(Value::Null),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
