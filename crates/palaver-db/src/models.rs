//! Database row types and query outcomes.
//! Distinct from palaver-types wire models to keep the DB layer independent.

use anyhow::{Context, Result};
use palaver_types::api::VersionedValue;
use palaver_types::fields::{Fields, LogEntry};

pub struct EntryRow {
    pub channel_id: String,
    pub key: String,
    pub fields: String,
    pub revision: i64,
}

impl EntryRow {
    pub fn decode_fields(&self) -> Result<Fields> {
        serde_json::from_str(&self.fields)
            .with_context(|| format!("corrupt fields on {}/{}", self.channel_id, self.key))
    }

    pub fn into_entry(self) -> Result<LogEntry> {
        let fields = self.decode_fields()?;
        Ok(LogEntry::new(self.key, fields))
    }
}

/// Result of a path-update write.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub entry: LogEntry,
    pub revision: u64,
    /// True when the write appended a new key to the log.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Committed(VersionedValue),
    /// The entry moved on; carries the current value and revision.
    Conflict(VersionedValue),
    /// No entry under that key.
    Missing,
}
