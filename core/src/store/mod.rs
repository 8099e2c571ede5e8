//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Components call store methods; they never execute SQL directly.
//!
//! Money is written as decimal TEXT and read back exactly; dates use
//! rusqlite's chrono conversions.

use crate::{
    error::CollectionsResult,
    event::{CollectionsEvent, EventLogEntry},
};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::{cell::Cell, str::FromStr};

mod agreement;
mod alert;
mod config;
mod contact;
mod ledger;
mod run_log;
mod score;

pub struct CollectionsStore {
    conn: Connection,
    /// Open savepoints; `atomically` nests by naming them after the depth.
    depth: Cell<u32>,
}

impl CollectionsStore {
    pub fn open(path: &str) -> CollectionsResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (:memory: ignores it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            depth: Cell::new(0),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> CollectionsResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            depth: Cell::new(0),
        })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> CollectionsResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_collections.sql"))?;
        Ok(())
    }

    /// Run `f` inside one transaction. Any error rolls back every write `f`
    /// made; nested calls become savepoints of the enclosing transaction.
    pub fn atomically<T>(
        &self,
        f: impl FnOnce(&Self) -> CollectionsResult<T>,
    ) -> CollectionsResult<T> {
        let depth = self.depth.get();
        let name = format!("collections_sp{depth}");
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        self.depth.set(depth + 1);
        let result = f(self);
        self.depth.set(depth);
        match result {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
                {
                    log::error!("rollback of {name} failed: {rollback}");
                }
                Err(err)
            }
        }
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn record_event(
        &self,
        scope: &str,
        at: NaiveDateTime,
        event: &CollectionsEvent,
    ) -> CollectionsResult<()> {
        let payload = serde_json::to_string(event)?;
        self.conn.execute(
            "INSERT INTO event_log (scope, recorded_at, event_type, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![scope, at, event.type_name(), payload],
        )?;
        Ok(())
    }

    pub fn events_for_scope(&self, scope: &str) -> CollectionsResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, scope, recorded_at, event_type, payload
             FROM event_log WHERE scope = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![scope], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    scope: row.get(1)?,
                    recorded_at: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Decoded events of one type, oldest first.
    pub fn events_of_type(&self, event_type: &str) -> CollectionsResult<Vec<CollectionsEvent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM event_log WHERE event_type = ?1 ORDER BY id ASC")?;
        let payloads = stmt
            .query_map(params![event_type], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        payloads
            .iter()
            .map(|p| serde_json::from_str::<CollectionsEvent>(p).map_err(Into::into))
            .collect()
    }
}

// ── Column helpers ─────────────────────────────────────────────

pub(crate) fn dec_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    parse_dec(idx, &text)
}

pub(crate) fn opt_dec_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    row.get::<_, Option<String>>(idx)?
        .map(|text| parse_dec(idx, &text))
        .transpose()
}

fn parse_dec(idx: usize, text: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn bool_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<bool> {
    Ok(row.get::<_, i32>(idx)? != 0)
}

pub(crate) fn dec_text(amount: Decimal) -> String {
    amount.normalize().to_string()
}
