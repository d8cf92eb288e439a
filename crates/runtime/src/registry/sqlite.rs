//! Persistent function registry backed by SQLite.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::OptionalExtension;

use super::FunctionRegistry;
use crate::types::{FunctionSpec, RegistryError};

/// SQLite-backed registry. One connection, serialised by an async mutex.
pub struct SqliteRegistry {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
}

impl SqliteRegistry {
    /// Open (or create) the registry at the given path.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RegistryError::Storage(format!("create dir: {e}")))?;
            }
        }
        let conn = rusqlite::Connection::open(path).map_err(storage)?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(storage)?;

        // Schema is created before the connection moves into the mutex.
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// Open an in-memory registry (useful for tests).
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(storage)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), RegistryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS functions (
                name        TEXT PRIMARY KEY,
                image       TEXT NOT NULL,
                runtime     TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );",
        )
        .map_err(storage)?;
        Ok(())
    }
}

fn storage(e: rusqlite::Error) -> RegistryError {
    RegistryError::Storage(e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl FunctionRegistry for SqliteRegistry {
    async fn put(&self, spec: FunctionSpec) -> Result<(), RegistryError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO functions (name, image, runtime, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                spec.name(),
                spec.image(),
                spec.runtime(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                RegistryError::AlreadyExists {
                    name: spec.name().to_string(),
                }
            } else {
                storage(e)
            }
        })?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<FunctionSpec, RegistryError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT image, runtime FROM functions WHERE name = ?1",
                rusqlite::params![name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(storage)?;

        let (image, runtime) = row.ok_or_else(|| RegistryError::NotFound {
            name: name.to_string(),
        })?;

        FunctionSpec::new(name, image, runtime).map_err(|e| RegistryError::Corrupt {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_get_function() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let spec = FunctionSpec::new("echo", "serverless-echo:latest", "go").unwrap();
        registry.put(spec.clone()).await.unwrap();

        let loaded = registry.get("echo").await.unwrap();
        assert_eq!(loaded, spec);
    }

    #[tokio::test]
    async fn get_missing_function() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let err = registry.get("ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry
            .put(FunctionSpec::new("echo", "first:1", "go").unwrap())
            .await
            .unwrap();

        let err = registry
            .put(FunctionSpec::new("echo", "second:2", "python").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { name } if name == "echo"));

        let kept = registry.get("echo").await.unwrap();
        assert_eq!(kept.image(), "first:1");
        assert_eq!(kept.runtime(), "go");
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("functions.db");

        {
            let registry = SqliteRegistry::open(&path).unwrap();
            registry
                .put(FunctionSpec::new("echo", "serverless-echo:latest", "go").unwrap())
                .await
                .unwrap();
        }

        let reopened = SqliteRegistry::open(&path).unwrap();
        assert_eq!(
            reopened.get("echo").await.unwrap().image(),
            "serverless-echo:latest"
        );
    }

    #[tokio::test]
    async fn corrupt_rows_are_reported() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        {
            let conn = registry.conn.lock().await;
            conn.execute(
                "INSERT INTO functions (name, image, runtime, created_at) VALUES ('bad', '', 'go', '')",
                [],
            )
            .unwrap();
        }

        let err = registry.get("bad").await.unwrap_err();
        assert!(matches!(err, RegistryError::Corrupt { .. }));
    }
}
