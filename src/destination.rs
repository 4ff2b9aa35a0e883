use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

/// Syslog priority for lines written to stderr (daemon.err)
pub const PRIORITY_STDERR: u8 = 27;
/// Syslog priority for lines written to stdout (daemon.info)
pub const PRIORITY_STDOUT: u8 = 30;

/// The normalized unit produced by both the relay and the tailers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub priority: u8,
}

impl LogRecord {
    /// Render as a syslog wire line, using `name` in the tag position
    pub fn to_syslog_line(&self, name: &str) -> String {
        format!(
            "<{}>{} {} {}: {}\n",
            self.priority,
            format_timestamp(&self.timestamp),
            self.source_id,
            name,
            self.content
        )
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

// Anything that can take records off a tailer or the relay's receive loop.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn send(&self, record: LogRecord) -> Result<()>;
}
