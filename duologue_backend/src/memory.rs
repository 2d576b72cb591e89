use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One persona turn kept for long-term recall and archival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: String,
    pub persona: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySummary {
    pub persona: String,
    pub turn_count: u64,
    pub last_at: Option<DateTime<Utc>>,
    pub recent: Vec<String>,
}

pub struct PersonaMemory {
    conn: Mutex<Connection>,
}

impl PersonaMemory {
    /// Helper to lock the connection
    pub(crate) fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open memory database {:?}", path))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let memory = Self {
            conn: Mutex::new(conn),
        };
        memory.ensure_schema()?;
        Ok(memory)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS persona_memory (
                id TEXT PRIMARY KEY,
                persona TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_persona_memory_persona
                ON persona_memory (persona, created_at);",
        )
        .context("Failed to create persona_memory schema")?;
        Ok(())
    }

    pub fn record(&self, persona: &str, content: &str) -> Result<MemoryRecord> {
        let record = MemoryRecord {
            id: Uuid::new_v4().to_string(),
            persona: persona.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO persona_memory (id, persona, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id,
                record.persona,
                record.content,
                record.created_at.to_rfc3339_opts(SecondsFormat::Micros, true)
            ],
        )?;
        Ok(record)
    }

    pub fn turn_count(&self, persona: &str) -> Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM persona_memory WHERE persona = ?1",
            [persona],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn summary(&self, persona: &str, recent_n: usize) -> Result<MemorySummary> {
        let turn_count = self.turn_count(persona)?;
        let recent_records = self.recent_for(persona, recent_n)?;
        Ok(MemorySummary {
            persona: persona.to_string(),
            turn_count,
            last_at: recent_records.first().map(|r| r.created_at),
            recent: recent_records.into_iter().map(|r| r.content).collect(),
        })
    }

    /// Newest first.
    pub fn recent_for(&self, persona: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, persona, content, created_at FROM persona_memory
             WHERE persona = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![persona, limit as i64], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Most recent `limit` records across both personas, oldest first.
    pub fn recent_records(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock_conn()?;
        query_recent(&conn, limit)
    }

    /// `None` when the connection is busy or poisoned. Never blocks, so it is safe
    /// from a panic hook running on the thread that holds the lock.
    pub fn try_recent_records(&self, limit: usize) -> Option<Vec<MemoryRecord>> {
        let conn = self.conn.try_lock().ok()?;
        match query_recent(&conn, limit) {
            Ok(records) => Some(records),
            Err(e) => {
                tracing::warn!("Skipping memories: {:#}", e);
                None
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM persona_memory", [])?;
        Ok(())
    }
}

/// Oldest first.
fn query_recent(conn: &Connection, limit: usize) -> Result<Vec<MemoryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, persona, content, created_at FROM persona_memory
         ORDER BY created_at DESC LIMIT ?1",
    )?;
    let mut records = stmt
        .query_map([limit as i64], row_to_record)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    records.reverse();
    Ok(records)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    Ok(MemoryRecord {
        id: row.get(0)?,
        persona: row.get(1)?,
        content: row.get(2)?,
        created_at: parse_rfc3339(row.get::<_, String>(3)?, 3)?,
    })
}

fn parse_rfc3339(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_summaries_are_per_persona() {
        let memory = PersonaMemory::in_memory().unwrap();
        memory.record("Aurora", "first").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        memory.record("Basalt", "reply").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        memory.record("Aurora", "second").unwrap();

        assert_eq!(memory.turn_count("Aurora").unwrap(), 2);
        assert_eq!(memory.turn_count("Basalt").unwrap(), 1);
        assert_eq!(memory.turn_count("Nobody").unwrap(), 0);

        let summary = memory.summary("Aurora", 5).unwrap();
        assert_eq!(summary.turn_count, 2);
        assert_eq!(summary.recent, vec!["second", "first"]);
        assert!(summary.last_at.is_some());
    }

    #[test]
    fn recent_records_are_oldest_first_and_limited() {
        let memory = PersonaMemory::in_memory().unwrap();
        for n in 0..5 {
            memory.record("Aurora", &format!("m{}", n)).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let records = memory.recent_records(3).unwrap();
        let contents: Vec<_> = records.into_iter().map(|r| r.content).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn try_recent_records_gives_up_while_connection_is_held() {
        let memory = PersonaMemory::in_memory().unwrap();
        memory.record("Aurora", "kept").unwrap();

        let held = memory.lock_conn().unwrap();
        assert!(memory.try_recent_records(10).is_none());
        drop(held);

        let records = memory.try_recent_records(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "kept");
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/memory.db");
        let memory = PersonaMemory::open(&path).unwrap();
        memory.record("Basalt", "hello").unwrap();
        drop(memory);

        let reopened = PersonaMemory::open(&path).unwrap();
        assert_eq!(reopened.turn_count("Basalt").unwrap(), 1);
        reopened.clear().unwrap();
        assert_eq!(reopened.turn_count("Basalt").unwrap(), 0);
    }
}
