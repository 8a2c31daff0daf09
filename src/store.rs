//! Persistent `ScheduleStore` (§4.C / §6.1).
//!
//! The engine is authoritative in-memory (§3 Ownership); a store just
//! mirrors it. [`InMemoryScheduleStore`] is always available and is what
//! tests use; [`SqliteScheduleStore`] behind the `sqlite-store` feature
//! persists across restarts, matching the teacher's `SqliteJobStore`.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::models::ScheduleEntry;
use crate::traits::ScheduleStore;

/// In-memory store. `save`/`update` are indistinguishable (both upsert),
/// matching the teacher's `INSERT OR REPLACE` semantics in `SqliteJobStore`.
#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    entries: DashMap<String, ScheduleEntry>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn save_schedule(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        self.entries.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn update_schedule(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        self.entries.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleEntry>, StoreError> {
        Ok(self.entries.get(id).map(|r| r.clone()))
    }

    async fn list_schedules(&self, enabled_only: bool) -> Result<Vec<ScheduleEntry>, StoreError> {
        Ok(self
            .entries
            .iter()
            .map(|r| r.clone())
            .filter(|e| !enabled_only || e.enabled)
            .collect())
    }

    async fn delete_schedule(&self, id: &str) -> Result<(), StoreError> {
        self.entries.remove(id);
        Ok(())
    }
}

#[cfg(feature = "sqlite-store")]
mod sqlite {
    use super::*;
    use chrono::{DateTime, Utc};

    /// SQLite-backed `ScheduleStore`, one row per `ScheduleEntry` with the
    /// `job_template`/`advanced_config` columns held as JSON text, mirroring
    /// the teacher's `agent_json`/`policy_ids` JSON-text columns.
    pub struct SqliteScheduleStore {
        conn: tokio::sync::Mutex<rusqlite::Connection>,
    }

    impl SqliteScheduleStore {
        pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
            }
            let conn = rusqlite::Connection::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Self::init_schema(&conn)?;
            Ok(Self {
                conn: tokio::sync::Mutex::new(conn),
            })
        }

        pub fn open_in_memory() -> Result<Self, StoreError> {
            let conn =
                rusqlite::Connection::open_in_memory().map_err(|e| StoreError::Backend(e.to_string()))?;
            Self::init_schema(&conn)?;
            Ok(Self {
                conn: tokio::sync::Mutex::new(conn),
            })
        }

        fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS schedules (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    description     TEXT NOT NULL DEFAULT '',
                    cron_expr       TEXT NOT NULL,
                    job_template    TEXT NOT NULL,
                    enabled         INTEGER NOT NULL,
                    created_at      TEXT NOT NULL,
                    updated_at      TEXT NOT NULL,
                    next_run        TEXT,
                    last_run        TEXT,
                    run_count       INTEGER NOT NULL DEFAULT 0,
                    tags            TEXT NOT NULL DEFAULT '[]',
                    advanced_config TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules(next_run);",
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        }
    }

    #[async_trait]
    impl ScheduleStore for SqliteScheduleStore {
        async fn save_schedule(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
            upsert(&self.conn, entry).await
        }

        async fn update_schedule(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
            upsert(&self.conn, entry).await
        }

        async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleEntry>, StoreError> {
            let conn = self.conn.lock().await;
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, description, cron_expr, job_template, enabled,
                            created_at, updated_at, next_run, last_run, run_count, tags, advanced_config
                     FROM schedules WHERE id = ?1",
                )
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let result = stmt
                .query_row(rusqlite::params![id], row_to_entry)
                .optional()
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            match result {
                Some(Ok(entry)) => Ok(Some(entry)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        }

        async fn list_schedules(&self, enabled_only: bool) -> Result<Vec<ScheduleEntry>, StoreError> {
            let conn = self.conn.lock().await;
            let sql = if enabled_only {
                "SELECT id, name, description, cron_expr, job_template, enabled,
                        created_at, updated_at, next_run, last_run, run_count, tags, advanced_config
                 FROM schedules WHERE enabled = 1 ORDER BY created_at"
            } else {
                "SELECT id, name, description, cron_expr, job_template, enabled,
                        created_at, updated_at, next_run, last_run, run_count, tags, advanced_config
                 FROM schedules ORDER BY created_at"
            };
            let mut stmt = conn.prepare(sql).map_err(|e| StoreError::Backend(e.to_string()))?;
            let rows = stmt
                .query_map([], row_to_entry)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| StoreError::Backend(e.to_string()))??);
            }
            Ok(out)
        }

        async fn delete_schedule(&self, id: &str) -> Result<(), StoreError> {
            let conn = self.conn.lock().await;
            conn.execute("DELETE FROM schedules WHERE id = ?1", rusqlite::params![id])
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        }
    }

    async fn upsert(conn: &tokio::sync::Mutex<rusqlite::Connection>, entry: &ScheduleEntry) -> Result<(), StoreError> {
        let job_template =
            serde_json::to_string(&entry.job_template).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tags = serde_json::to_string(&entry.tags).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let advanced_config = entry
            .advanced_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let conn = conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO schedules
                (id, name, description, cron_expr, job_template, enabled,
                 created_at, updated_at, next_run, last_run, run_count, tags, advanced_config)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            rusqlite::params![
                entry.id,
                entry.name,
                entry.description,
                entry.schedule,
                job_template,
                entry.enabled as i32,
                entry.created_at.to_rfc3339(),
                entry.updated_at.to_rfc3339(),
                entry.next_run.map(|t| t.to_rfc3339()),
                entry.last_run.map(|t| t.to_rfc3339()),
                entry.run_count as i64,
                tags,
                advanced_config,
            ],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ScheduleEntry, StoreError>> {
        let id: String = row.get(0)?;
        let name: String = row.get(1)?;
        let description: String = row.get(2)?;
        let cron_expr: String = row.get(3)?;
        let job_template_json: String = row.get(4)?;
        let enabled: i32 = row.get(5)?;
        let created_str: String = row.get(6)?;
        let updated_str: String = row.get(7)?;
        let next_run_str: Option<String> = row.get(8)?;
        let last_run_str: Option<String> = row.get(9)?;
        let run_count: i64 = row.get(10)?;
        let tags_json: String = row.get(11)?;
        let advanced_config_json: Option<String> = row.get(12)?;

        Ok((|| -> Result<ScheduleEntry, StoreError> {
            let job_template = serde_json::from_str(&job_template_json)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let tags = serde_json::from_str(&tags_json).map_err(|e| StoreError::Serialization(e.to_string()))?;
            let advanced_config = advanced_config_json
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let parse_ts = |s: &str| -> Result<DateTime<Utc>, StoreError> {
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            };
            Ok(ScheduleEntry {
                id,
                name,
                description,
                schedule: cron_expr,
                job_template,
                enabled: enabled != 0,
                created_at: parse_ts(&created_str)?,
                updated_at: parse_ts(&updated_str)?,
                next_run: next_run_str.map(|s| parse_ts(&s)).transpose()?,
                last_run: last_run_str.map(|s| parse_ts(&s)).transpose()?,
                run_count: run_count as u64,
                tags,
                advanced_config,
            })
        })())
    }

    trait OptionalExt<T> {
        fn optional(self) -> Result<Option<T>, rusqlite::Error>;
    }

    impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
        fn optional(self) -> Result<Option<T>, rusqlite::Error> {
            match self {
                Ok(v) => Ok(Some(v)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        }
    }

}

#[cfg(feature = "sqlite-store")]
pub use sqlite::SqliteScheduleStore;
