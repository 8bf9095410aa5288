use anyhow::Result;
use palaver_types::api::{Direction, VersionedValue};
use palaver_types::fields::{Fields, LogEntry, apply_updates, set_at, value_at};
use rusqlite::Connection;
use serde_json::Value;

use crate::Database;
use crate::models::{CasOutcome, EntryRow, WriteOutcome};

impl Database {
    // -- Entries --

    /// Create or update an entry with path updates. The revision is bumped on
    /// every write.
    pub fn write_entry(&self, channel_id: &str, key: &str, updates: &Fields) -> Result<WriteOutcome> {
        self.with_tx(|tx| {
            let (mut fields, revision, created) = match query_entry(tx, channel_id, key)? {
                Some(row) => (row.decode_fields()?, row.revision as u64, false),
                None => (Fields::new(), 0, true),
            };

            apply_updates(&mut fields, updates);
            let revision = revision + 1;
            upsert_entry(tx, channel_id, key, &fields, revision)?;

            Ok(WriteOutcome {
                entry: LogEntry::new(key, fields),
                revision,
                created,
            })
        })
    }

    pub fn get_entry(&self, channel_id: &str, key: &str) -> Result<Option<LogEntry>> {
        self.with_conn(|conn| query_entry(conn, channel_id, key)?.map(EntryRow::into_entry).transpose())
    }

    /// Range read over one channel's log. Results are always ascending by key.
    pub fn get_range(
        &self,
        channel_id: &str,
        bound: Option<&str>,
        direction: Direction,
        limit: u32,
    ) -> Result<Vec<LogEntry>> {
        self.with_conn(|conn| {
            let mut rows = query_range(conn, channel_id, bound, direction, limit)?;
            if direction == Direction::Backward {
                rows.reverse();
            }
            rows.into_iter().map(EntryRow::into_entry).collect()
        })
    }

    // -- Path values --

    /// Revision 0 means the entry does not exist.
    pub fn read_value(&self, channel_id: &str, key: &str, path: &str) -> Result<VersionedValue> {
        self.with_conn(|conn| {
            let Some(row) = query_entry(conn, channel_id, key)? else {
                return Ok(VersionedValue {
                    value: None,
                    revision: 0,
                });
            };
            let fields = row.decode_fields()?;
            Ok(VersionedValue {
                value: value_at(&fields, path).cloned(),
                revision: row.revision as u64,
            })
        })
    }

    /// Set the value at `path` only if the entry is still at
    /// `expected_revision`. Never creates entries.
    pub fn compare_and_set(
        &self,
        channel_id: &str,
        key: &str,
        path: &str,
        expected_revision: u64,
        value: Value,
    ) -> Result<CasOutcome> {
        self.with_tx(|tx| {
            let Some(row) = query_entry(tx, channel_id, key)? else {
                return Ok(CasOutcome::Missing);
            };
            let mut fields = row.decode_fields()?;
            let revision = row.revision as u64;

            if revision != expected_revision {
                return Ok(CasOutcome::Conflict(VersionedValue {
                    value: value_at(&fields, path).cloned(),
                    revision,
                }));
            }

            set_at(&mut fields, path, value);
            let revision = revision + 1;
            upsert_entry(tx, channel_id, key, &fields, revision)?;

            Ok(CasOutcome::Committed(VersionedValue {
                value: value_at(&fields, path).cloned(),
                revision,
            }))
        })
    }
}

fn query_entry(conn: &Connection, channel_id: &str, key: &str) -> Result<Option<EntryRow>> {
    let mut stmt = conn.prepare(
        "SELECT channel_id, key, fields, revision FROM entries WHERE channel_id = ?1 AND key = ?2",
    )?;

    let row = stmt
        .query_row([channel_id, key], |row| {
            Ok(EntryRow {
                channel_id: row.get(0)?,
                key: row.get(1)?,
                fields: row.get(2)?,
                revision: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_range(
    conn: &Connection,
    channel_id: &str,
    bound: Option<&str>,
    direction: Direction,
    limit: u32,
) -> Result<Vec<EntryRow>> {
    let sql = match direction {
        Direction::Backward => {
            "SELECT channel_id, key, fields, revision FROM entries
             WHERE channel_id = ?1 AND (?2 IS NULL OR key <= ?2)
             ORDER BY key DESC
             LIMIT ?3"
        }
        Direction::Forward => {
            "SELECT channel_id, key, fields, revision FROM entries
             WHERE channel_id = ?1 AND (?2 IS NULL OR key >= ?2)
             ORDER BY key ASC
             LIMIT ?3"
        }
    };

    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(rusqlite::params![channel_id, bound, limit], |row| {
            Ok(EntryRow {
                channel_id: row.get(0)?,
                key: row.get(1)?,
                fields: row.get(2)?,
                revision: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn upsert_entry(conn: &Connection, channel_id: &str, key: &str, fields: &Fields, revision: u64) -> Result<()> {
    let json = serde_json::to_string(fields)?;
    conn.execute(
        "INSERT INTO entries (channel_id, key, fields, revision) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(channel_id, key) DO UPDATE SET
             fields = excluded.fields,
             revision = excluded.revision,
             updated_at = datetime('now')",
        rusqlite::params![channel_id, key, json, revision as i64],
    )?;
    Ok(())
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
