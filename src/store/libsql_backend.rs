//! libSQL backend: async `TaskStore` implementation.
//!
//! Task documents are stored as JSON text keyed by `instance_id`. Supports
//! local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::sync::merge::prepare_for_storage;
use crate::task::Task;

/// libSQL task store.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Task store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Instance ids stored for a family, oldest first.
    pub async fn family_instances(&self, family_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT instance_id FROM tasks WHERE family_id = ?1 ORDER BY updated_at",
                params![family_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("family_instances: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("family_instances: {e}")))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("family_instances row parse: {e}")))?;
            ids.push(id);
        }
        Ok(ids)
    }
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn get(&self, instance_id: &str) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT body FROM tasks WHERE instance_id = ?1",
                params![instance_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let body: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_task row parse: {e}")))?;
                let task = serde_json::from_str(&body)
                    .map_err(|e| DatabaseError::Serialization(format!("get_task: {e}")))?;
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn set(&self, instance_id: &str, task: &Task) -> Result<(), DatabaseError> {
        let stored = prepare_for_storage(task)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let body = serde_json::to_string(&stored)
            .map_err(|e| DatabaseError::Serialization(format!("set_task: {e}")))?;
        let now = Utc::now().to_rfc3339();

        self.conn()
            .execute(
                "INSERT INTO tasks (instance_id, task_id, family_id, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(instance_id) DO UPDATE SET
                    task_id = excluded.task_id,
                    family_id = excluded.family_id,
                    body = excluded.body,
                    updated_at = excluded.updated_at",
                params![
                    instance_id,
                    opt_text_owned(stored.id.clone()),
                    opt_text_owned(stored.family_id.clone()),
                    body,
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_task: {e}")))?;

        debug!(instance_id = %instance_id, "Task stored");
        Ok(())
    }

    async fn has(&self, instance_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM tasks WHERE instance_id = ?1",
                params![instance_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_task: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("has_task: {e}")))?;
        Ok(row.is_some())
    }

    async fn delete(&self, instance_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM tasks WHERE instance_id = ?1",
                params![instance_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;
        self.set_active(instance_id, false).await
    }

    async fn set_active(&self, instance_id: &str, active: bool) -> Result<(), DatabaseError> {
        let sql = if active {
            "INSERT OR IGNORE INTO active_tasks (instance_id) VALUES (?1)"
        } else {
            "DELETE FROM active_tasks WHERE instance_id = ?1"
        };
        self.conn()
            .execute(sql, params![instance_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("set_active: {e}")))?;
        Ok(())
    }

    async fn is_active(&self, instance_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM active_tasks WHERE instance_id = ?1",
                params![instance_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_active: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("is_active: {e}")))?;
        Ok(row.is_some())
    }

    async fn active_ids(&self) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT instance_id FROM active_tasks ORDER BY instance_id", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("active_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("active_ids: {e}")))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("active_ids row parse: {e}")))?;
            ids.push(id);
        }
        Ok(ids)
    }
}
