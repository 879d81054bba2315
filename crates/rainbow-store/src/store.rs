use std::sync::{Mutex, PoisonError};

use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::types::{matches, Record};

/// Generic create/query/update storage used for best-effort bookkeeping.
///
/// The conversation core never depends on these calls succeeding; callers
/// log failures and move on.
pub trait KvStore: Send + Sync {
    /// Insert `record` into `table`, returning it with a generated `"id"`.
    fn create(&self, table: &str, record: Record) -> Result<Record>;

    /// Every record in `table` whose fields equal all entries of `filter`.
    fn query(&self, table: &str, filter: &Record) -> Result<Vec<Record>>;

    /// Merge the top-level keys of `partial` into the record and return it.
    fn update(&self, table: &str, id: &str, partial: Record) -> Result<Record>;
}

/// SQLite-backed [`KvStore`] storing each record as a JSON body.
///
/// Wraps a single connection in a `Mutex`; sufficient for the single-node
/// deployments this targets.
pub struct SqliteKvStore {
    db: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Open an in-memory database with the schema applied.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        crate::db::init_db(&conn)?;
        Ok(Self::new(conn))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KvStore for SqliteKvStore {
    #[instrument(skip(self, record), fields(table))]
    fn create(&self, table: &str, mut record: Record) -> Result<Record> {
        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        record.insert("id".to_string(), Value::String(id.clone()));
        let body = serde_json::to_string(&record)?;

        let db = self.lock();
        db.execute(
            "INSERT INTO records (id, tbl, body, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![id, table, body, now],
        )?;
        debug!(%id, "record created");
        Ok(record)
    }

    #[instrument(skip(self, filter), fields(table))]
    fn query(&self, table: &str, filter: &Record) -> Result<Vec<Record>> {
        let db = self.lock();
        let mut stmt = db.prepare(
            "SELECT body FROM records WHERE tbl = ?1 ORDER BY created_at, id",
        )?;
        let bodies = stmt.query_map(rusqlite::params![table], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for body in bodies {
            let record = parse_body(&body?)?;
            if matches(&record, filter) {
                out.push(record);
            }
        }
        Ok(out)
    }

    #[instrument(skip(self, partial), fields(table, id))]
    fn update(&self, table: &str, id: &str, partial: Record) -> Result<Record> {
        let db = self.lock();
        let body: String = match db.query_row(
            "SELECT body FROM records WHERE tbl = ?1 AND id = ?2",
            rusqlite::params![table, id],
            |row| row.get(0),
        ) {
            Ok(b) => b,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(StoreError::NotFound {
                    table: table.to_string(),
                    id: id.to_string(),
                })
            }
            Err(e) => return Err(StoreError::Database(e)),
        };

        let mut record = parse_body(&body)?;
        for (key, value) in partial {
            // The primary key is immutable.
            if key != "id" {
                record.insert(key, value);
            }
        }

        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "UPDATE records SET body = ?1, updated_at = ?2 WHERE tbl = ?3 AND id = ?4",
            rusqlite::params![serde_json::to_string(&record)?, now, table, id],
        )?;
        Ok(record)
    }
}

fn parse_body(body: &str) -> Result<Record> {
    match serde_json::from_str::<Value>(body)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidRecord(format!(
            "expected JSON object, found {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn create_assigns_id_and_query_finds_it() {
        let store = SqliteKvStore::in_memory().unwrap();
        let created = store
            .create("sessions", obj(json!({"session_id": "s1", "user_id": "u1"})))
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let found = store
            .query("sessions", &obj(json!({"session_id": "s1"})))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], json!(id));
        assert_eq!(found[0]["user_id"], json!("u1"));
    }

    #[test]
    fn query_is_scoped_to_table() {
        let store = SqliteKvStore::in_memory().unwrap();
        store.create("a", obj(json!({"k": 1}))).unwrap();
        store.create("b", obj(json!({"k": 1}))).unwrap();
        assert_eq!(store.query("a", &Record::new()).unwrap().len(), 1);
        assert!(store.query("c", &Record::new()).unwrap().is_empty());
    }

    #[test]
    fn update_merges_and_keeps_id() {
        let store = SqliteKvStore::in_memory().unwrap();
        let created = store
            .create("sessions", obj(json!({"turn_count": 1, "ai_id": "ai_1"})))
            .unwrap();
        let id = created["id"].as_str().unwrap();

        let updated = store
            .update("sessions", id, obj(json!({"turn_count": 2, "id": "hijack"})))
            .unwrap();
        assert_eq!(updated["turn_count"], json!(2));
        assert_eq!(updated["ai_id"], json!("ai_1"));
        assert_eq!(updated["id"], json!(id));

        let reread = store.query("sessions", &obj(json!({"id": id}))).unwrap();
        assert_eq!(reread[0]["turn_count"], json!(2));
    }

    #[test]
    fn update_missing_record_is_not_found() {
        let store = SqliteKvStore::in_memory().unwrap();
        let err = store.update("sessions", "nope", Record::new()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
