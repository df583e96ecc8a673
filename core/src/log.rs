//! Log records shipped from the terminal to the server.
//!
//! Records travel as newline-separated batch lines of the form
//! `unix_ts|LEVEL|message|MAC`. The server splits each line into at most
//! four fields, so the message must not contain `|` or newlines.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Maximum message length accepted by the log endpoint.
pub const MAX_MESSAGE_BYTES: usize = 8192;

/// Suffix appended to messages cut at [`MAX_MESSAGE_BYTES`].
pub const TRUNCATED_SUFFIX: &str = "... [TRUNCATED]";

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl Severity {
    /// Records at this severity are flushed without waiting for the next tick.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Severity::Error | Severity::Critical)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DEBUG" | "TRACE" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" | "FATAL" => Ok(Self::Critical),
            _ => Err(format!("unknown severity: '{}'", s)),
        }
    }
}

impl From<tracing::Level> for Severity {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE | tracing::Level::DEBUG => Severity::Debug,
            tracing::Level::INFO => Severity::Info,
            tracing::Level::WARN => Severity::Warn,
            tracing::Level::ERROR => Severity::Error,
        }
    }
}

/// A single diagnostic record produced during a boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    /// Hardware address of the terminal. Filled in at delivery time when the
    /// record was produced before the network interface was known.
    pub client_id: Option<String>,
}

impl LogRecord {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            message: message.into(),
            client_id: None,
        }
    }

    /// Render as one batch line, using `fallback_client` when the record
    /// carries no client identifier of its own.
    pub fn to_batch_line(&self, fallback_client: &str) -> String {
        let client = self.client_id.as_deref().unwrap_or(fallback_client);
        format!(
            "{}|{}|{}|{}",
            self.timestamp.timestamp(),
            self.severity,
            sanitize_message(&self.message),
            client
        )
    }

    /// Parse a batch line produced by [`LogRecord::to_batch_line`].
    pub fn parse_batch_line(line: &str) -> Option<Self> {
        let mut parts = line.splitn(4, '|');
        let ts: i64 = parts.next()?.trim().parse().ok()?;
        let severity = parts.next()?.parse().unwrap_or(Severity::Info);
        let message = parts.next()?.to_string();
        let client = parts.next()?.trim().to_uppercase();
        if message.is_empty() || client.is_empty() {
            return None;
        }
        Some(Self {
            timestamp: Utc.timestamp_opt(ts, 0).single()?,
            severity,
            message,
            client_id: Some(client),
        })
    }
}

/// Join records into a batch request body.
pub fn encode_batch(records: &[LogRecord], fallback_client: &str) -> String {
    records
        .iter()
        .map(|r| r.to_batch_line(fallback_client))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip field separators and cap the length at [`MAX_MESSAGE_BYTES`].
pub fn sanitize_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .map(|c| match c {
            '|' => '/',
            '\n' | '\r' => ' ',
            c => c,
        })
        .collect();
    truncate_message(&cleaned)
}

fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_MESSAGE_BYTES {
        return message.to_string();
    }
    let mut end = MAX_MESSAGE_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &message[..end], TRUNCATED_SUFFIX)
}
