// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP primitive.
//!
//! Issues a request described by merged config.  Two modes: `sync` reads
//! the whole response; `stream` parses SSE events and fans each one out to
//! every registered sink before reading the next.  Mid-stream transport
//! errors close every sink and return the events accumulated so far.
//!
//! Retries are this primitive's responsibility: transport errors and 5xx
//! responses retry under `retry.{max_attempts, backoff}`; 4xx responses
//! never retry.

use crate::sink::EventSink;
use crate::sse::SseParser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Streaming mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMode {
    /// Read the full response body.
    #[default]
    Sync,
    /// Parse the response as SSE and fan out to sinks.
    Stream,
}

impl HttpMode {
    /// Parse a mode string from config or params.
    ///
    /// # Errors
    ///
    /// Returns the unknown mode string.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "sync" => Ok(Self::Sync),
            "stream" => Ok(Self::Stream),
            other => Err(other.to_string()),
        }
    }
}

/// Result of an HTTP execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResult {
    /// `true` unless a policy-failed status was tolerated into a value.
    pub success: bool,
    /// Response status code, when a response was received.
    pub status_code: Option<u16>,
    /// Parsed JSON body (sync mode) or `null` (stream mode).
    pub body: Value,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Number of events fanned out (stream mode).
    pub stream_events_count: usize,
    /// `true` when a stream was interrupted mid-flight.
    pub interrupted: bool,
}

/// Errors from the HTTP primitive.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// Config is missing or malformed.
    #[error("invalid http config: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },

    /// Request kept failing after the configured attempts.
    #[error("failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Final failure description.
        last_error: String,
    },

    /// Response status rejected by policy (`fail_on_error`, default true).
    #[error("http status {status}")]
    Status {
        /// Rejected status code.
        status: u16,
    },
}

/// Retry policy parsed from `config.retry`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    initial_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backoff {
    Exponential,
    Constant,
}

impl RetryPolicy {
    fn from_config(config: &Value) -> Self {
        let retry = config.get("retry");
        let max_attempts = retry
            .and_then(|r| r.get("max_attempts"))
            .and_then(Value::as_u64)
            .map_or(1, |n| n.max(1) as u32);
        let backoff = match retry
            .and_then(|r| r.get("backoff"))
            .and_then(Value::as_str)
        {
            Some("constant") => Backoff::Constant,
            _ => Backoff::Exponential,
        };
        let initial_delay = retry
            .and_then(|r| r.get("initial_delay_ms"))
            .and_then(Value::as_u64)
            .map_or(Duration::from_millis(100), Duration::from_millis);
        Self {
            max_attempts,
            backoff,
            initial_delay,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Constant => self.initial_delay,
            Backoff::Exponential => self.initial_delay * 2u32.saturating_pow(attempt),
        }
    }
}

/// Primitive for issuing HTTP requests.
pub struct HttpPrimitive {
    client: reqwest::Client,
}

impl HttpPrimitive {
    /// Create a primitive with a fresh connection pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Execute a request in the given mode.
    ///
    /// `sinks` receive events in registration order (stream mode); every
    /// sink is closed exactly once, including on empty and interrupted
    /// streams.
    ///
    /// # Errors
    ///
    /// [`HttpError::InvalidConfig`] for missing url/method,
    /// [`HttpError::RetriesExhausted`] after the retry budget, and
    /// [`HttpError::Status`] for policy-rejected statuses.
    pub async fn execute(
        &self,
        config: &Value,
        mode: HttpMode,
        sinks: &mut [Box<dyn EventSink>],
    ) -> Result<HttpResult, HttpError> {
        let start = Instant::now();
        let policy = RetryPolicy::from_config(config);
        let fail_on_error = config
            .get("fail_on_error")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        // Config problems are not retryable; surface them before the loop.
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| HttpError::InvalidConfig {
                reason: "url is required".into(),
            })?;
        let method_str = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");
        let method = reqwest::Method::from_bytes(method_str.to_ascii_uppercase().as_bytes())
            .map_err(|_| HttpError::InvalidConfig {
                reason: format!("invalid method '{method_str}'"),
            })?;

        let mut last_error = String::new();
        for attempt in 0..policy.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(policy.delay_for(attempt - 1)).await;
                debug!(target: "kiwi.exec", attempt, "retrying http request");
            }

            let response = match self.send(config, method.clone(), url).await {
                Ok(response) => response,
                Err(transport) => {
                    last_error = transport;
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() {
                last_error = format!("http status {status}");
                continue;
            }

            if !status.is_success() {
                if fail_on_error {
                    return Err(HttpError::Status {
                        status: status.as_u16(),
                    });
                }
                let headers = header_map(&response);
                let body = read_body(response).await;
                return Ok(HttpResult {
                    success: false,
                    status_code: Some(status.as_u16()),
                    body,
                    headers,
                    duration_ms: elapsed_ms(start),
                    stream_events_count: 0,
                    interrupted: false,
                });
            }

            return match mode {
                HttpMode::Sync => {
                    let headers = header_map(&response);
                    let body = read_body(response).await;
                    Ok(HttpResult {
                        success: true,
                        status_code: Some(status.as_u16()),
                        body,
                        headers,
                        duration_ms: elapsed_ms(start),
                        stream_events_count: 0,
                        interrupted: false,
                    })
                }
                HttpMode::Stream => {
                    let headers = header_map(&response);
                    let status_code = status.as_u16();
                    let (count, interrupted) = stream_to_sinks(response, sinks).await;
                    Ok(HttpResult {
                        success: true,
                        status_code: Some(status_code),
                        body: Value::Null,
                        headers,
                        duration_ms: elapsed_ms(start),
                        stream_events_count: count,
                        interrupted,
                    })
                }
            };
        }

        // Out of attempts: close sinks so no consumer hangs.
        close_all(sinks).await;
        Err(HttpError::RetriesExhausted {
            attempts: policy.max_attempts,
            last_error,
        })
    }

    /// Build and send one request.  Errors are transport failures,
    /// described as strings for the retry loop.
    async fn send(
        &self,
        config: &Value,
        method: reqwest::Method,
        url: &str,
    ) -> Result<reqwest::Response, String> {
        let mut request = self.client.request(method, url);

        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(name, v);
                }
            }
        }
        if let Some(timeout) = config.get("timeout").and_then(Value::as_u64) {
            request = request.timeout(Duration::from_secs(timeout));
        }
        if let Some(body) = config.get("body") {
            if !body.is_null() {
                request = request.json(body);
            }
        }

        request.send().await.map_err(|e| e.to_string())
    }
}

impl Default for HttpPrimitive {
    fn default() -> Self {
        Self::new()
    }
}

/// Read SSE lines and fan events out to every sink, in order, one event at
/// a time.  On any transport error mid-stream, close all sinks and report
/// what accumulated.
async fn stream_to_sinks(
    response: reqwest::Response,
    sinks: &mut [Box<dyn EventSink>],
) -> (usize, bool) {
    use futures::StreamExt;

    let mut parser = SseParser::new();
    let mut count = 0usize;
    let mut interrupted = false;
    let mut pending = String::new();
    let mut byte_stream = response.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(target: "kiwi.exec", error = %e, "stream interrupted");
                interrupted = true;
                break;
            }
        };
        pending.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = pending.find('\n') {
            let line: String = pending.drain(..=newline).collect();
            if let Some(event) = parser.push_line(line.trim_end_matches('\n')) {
                if !fan_out(sinks, &event).await {
                    interrupted = true;
                    break 'outer;
                }
                count += 1;
            }
        }
    }

    if !interrupted {
        // Flush a trailing unterminated event.
        if !pending.is_empty() {
            if let Some(event) = parser.push_line(&pending) {
                if fan_out(sinks, &event).await {
                    count += 1;
                }
            }
        }
        if let Some(event) = parser.finish() {
            if fan_out(sinks, &event).await {
                count += 1;
            }
        }
    }

    close_all(sinks).await;
    (count, interrupted)
}

/// Deliver one event to every sink in registration order.  Returns `false`
/// when a sink failed.
async fn fan_out(sinks: &mut [Box<dyn EventSink>], event: &str) -> bool {
    for sink in sinks.iter_mut() {
        if let Err(e) = sink.write(event).await {
            warn!(target: "kiwi.exec", error = %e, "sink write failed");
            return false;
        }
    }
    true
}

async fn close_all(sinks: &mut [Box<dyn EventSink>]) {
    for sink in sinks.iter_mut() {
        if let Err(e) = sink.close().await {
            warn!(target: "kiwi.exec", error = %e, "sink close failed");
        }
    }
}

fn header_map(response: &reqwest::Response) -> HashMap<String, String> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

async fn read_body(response: reqwest::Response) -> Value {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
