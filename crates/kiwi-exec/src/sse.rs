// SPDX-License-Identifier: MIT OR Apache-2.0
//! Server-sent-event line parser.
//!
//! A state machine over lines with one buffered event: `data: ` lines
//! carry the payload, a blank line completes the buffered event, and every
//! other line is metadata and ignored.

/// Incremental SSE parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buffered: Option<String>,
}

impl SseParser {
    /// Create a parser with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its trailing newline).  Returns a completed
    /// event when the line delimits one.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let trimmed = line.trim_end_matches(['\r', '\n']);

        if trimmed.is_empty() {
            return self.buffered.take();
        }

        if let Some(data) = trimmed.strip_prefix("data: ").or_else(|| {
            // `data:` with no space is valid SSE framing too.
            trimmed.strip_prefix("data:")
        }) {
            match &mut self.buffered {
                Some(existing) => {
                    // Multi-line data joins with a newline.
                    existing.push('\n');
                    existing.push_str(data);
                }
                None => self.buffered = Some(data.to_string()),
            }
        }
        // Comments, `event:`, `id:` and other fields are metadata.
        None
    }

    /// Flush any event still buffered at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.buffered.take()
    }
}
