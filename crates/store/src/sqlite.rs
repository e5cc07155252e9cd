//! SQLite-backed history store.
//!
//! Same contract as the in-memory store, but run history survives process
//! restarts. Events are stored as JSON rows.

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use planweave_core::{
    events::{HistoryRecord, RunEvent},
    traits::HistoryStore,
    types::{now_ms, Plan},
    Error, Result,
};

/// History store over a single SQLite database file.
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    /// Open (and migrate) the database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::store(e.to_string()))?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::store(e.to_string()))?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS run_history (
                run_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                event_json TEXT NOT NULL,
                PRIMARY KEY (run_id, seq)
            );
            CREATE TABLE IF NOT EXISTS run_meta (
                run_id TEXT PRIMARY KEY,
                plan_json TEXT,
                summary TEXT
            );",
        )
        .map_err(|e| Error::store(e.to_string()))
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, run_id: &str, event: RunEvent) -> Result<()> {
        let event_json = serde_json::to_string(&event)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO run_history (run_id, seq, timestamp_ms, event_json)
             VALUES (
                ?1,
                COALESCE((SELECT MAX(seq) + 1 FROM run_history WHERE run_id = ?1), 0),
                ?2,
                ?3
             )",
            params![run_id, now_ms(), event_json],
        )
        .map_err(|e| Error::store(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, run_id: &str) -> Result<Vec<HistoryRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT seq, timestamp_ms, event_json FROM run_history
                 WHERE run_id = ?1 ORDER BY seq",
            )
            .map_err(|e| Error::store(e.to_string()))?;

        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| Error::store(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            let (seq, timestamp_ms, event_json) = row.map_err(|e| Error::store(e.to_string()))?;
            let event: RunEvent = serde_json::from_str(&event_json)?;
            records.push(HistoryRecord {
                seq,
                timestamp_ms,
                event,
            });
        }
        Ok(records)
    }

    async fn set_plan(&self, run_id: &str, plan: &Plan) -> Result<()> {
        let plan_json = serde_json::to_string(plan)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO run_meta (run_id, plan_json) VALUES (?1, ?2)
             ON CONFLICT(run_id) DO UPDATE SET plan_json = excluded.plan_json",
            params![run_id, plan_json],
        )
        .map_err(|e| Error::store(e.to_string()))?;
        Ok(())
    }

    async fn get_plan(&self, run_id: &str) -> Result<Option<Plan>> {
        let conn = self.conn.lock().await;
        let row = conn.query_row(
            "SELECT plan_json FROM run_meta WHERE run_id = ?1",
            params![run_id],
            |row| row.get::<_, Option<String>>(0),
        );

        match row {
            Ok(Some(json)) => Ok(Some(serde_json::from_str(&json)?)),
            Ok(None) => Ok(None),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::store(e.to_string())),
        }
    }

    async fn set_summary(&self, run_id: &str, summary: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO run_meta (run_id, summary) VALUES (?1, ?2)
             ON CONFLICT(run_id) DO UPDATE SET summary = excluded.summary",
            params![run_id, summary],
        )
        .map_err(|e| Error::store(e.to_string()))?;
        Ok(())
    }

    async fn get_summary(&self, run_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let row = conn.query_row(
            "SELECT summary FROM run_meta WHERE run_id = ?1",
            params![run_id],
            |row| row.get::<_, Option<String>>(0),
        );

        match row {
            Ok(summary) => Ok(summary),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::store(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planweave_core::events::{StartEvent, SummaryEvent};

    #[tokio::test]
    async fn test_append_and_list_roundtrip() {
        let store = SqliteHistoryStore::open_in_memory().unwrap();

        store
            .append(
                "r1",
                RunEvent::Start(StartEvent {
                    run_id: "r1".to_string(),
                    objective: "check the weather".to_string(),
                    channel_id: String::new(),
                    identity_key: String::new(),
                }),
            )
            .await
            .unwrap();
        store
            .append(
                "r1",
                RunEvent::Summary(SummaryEvent {
                    summary: "done".to_string(),
                    success: true,
                    error: None,
                    attempts: 1,
                }),
            )
            .await
            .unwrap();

        let records = store.list("r1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].seq, 0);
        assert_eq!(records[1].seq, 1);
        assert!(matches!(records[1].event, RunEvent::Summary(_)));
    }

    #[tokio::test]
    async fn test_meta_upsert() {
        let store = SqliteHistoryStore::open_in_memory().unwrap();
        store.set_summary("r1", "first").await.unwrap();
        store.set_summary("r1", "second").await.unwrap();
        assert_eq!(
            store.get_summary("r1").await.unwrap().as_deref(),
            Some("second")
        );
        assert!(store.get_plan("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        {
            let store = SqliteHistoryStore::open(&path).unwrap();
            store
                .append(
                    "r1",
                    RunEvent::Start(StartEvent {
                        run_id: "r1".to_string(),
                        objective: "persist me".to_string(),
                        channel_id: String::new(),
                        identity_key: String::new(),
                    }),
                )
                .await
                .unwrap();
            store.set_plan("r1", &Plan::default()).await.unwrap();
            store.set_summary("r1", "kept").await.unwrap();
        }

        let reopened = SqliteHistoryStore::open(&path).unwrap();
        let records = reopened.list("r1").await.unwrap();
        assert_eq!(records.len(), 1);
        match &records[0].event {
            RunEvent::Start(start) => assert_eq!(start.objective, "persist me"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(reopened.get_plan("r1").await.unwrap().is_some());
        assert_eq!(
            reopened.get_summary("r1").await.unwrap().as_deref(),
            Some("kept")
        );

        // New appends continue the per-run sequence.
        reopened
            .append(
                "r1",
                RunEvent::Summary(SummaryEvent {
                    summary: "done".to_string(),
                    success: true,
                    error: None,
                    attempts: 1,
                }),
            )
            .await
            .unwrap();
        let records = reopened.list("r1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].seq, 1);
    }
}
