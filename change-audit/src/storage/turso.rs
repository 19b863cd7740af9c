//! Turso/libsql store
//!
//! Audit rows are append-only at the database level: triggers RAISE(ABORT)
//! on any UPDATE or DELETE of `audit_log`.
//!
//! SQLite admits one writer at a time, so transactions are serialized through
//! a writer lock. Waiting for it is bounded: a transaction that cannot take
//! the lock within the configured timeout fails with a retriable
//! `transaction_failed` error, the way SQLite reports `SQLITE_BUSY`. A
//! `:memory:` database
//! exists only on the connection that created it; in that case every
//! transaction runs on the shared connection, and reads issued while a
//! transaction is open observe its uncommitted writes.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{EntityRow, Store, StoreTransaction};
use crate::audit::{AuditAction, AuditLogEntry, AuditQuery};
use crate::error::{DatabaseError, DatabaseOperation, Error, Result};

const IN_MEMORY: &str = ":memory:";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const AUDIT_COLUMNS: &str = "id, created_at, action, resource_type, resource_id, \
     http_method, path, status_code, actor_id, actor_username, session_id, request_id, \
     ip, user_agent, changes_json, request_body_sha256, request_body_json";

/// libsql-backed store
pub struct TursoStore {
    db: libsql::Database,
    conn: libsql::Connection,
    in_memory: bool,
    writer: Arc<Mutex<()>>,
    lock_timeout: Duration,
}

impl TursoStore {
    /// Open (or create) a local database file, or `:memory:`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = libsql::Builder::new_local(path).build().await.map_err(|e| {
            DatabaseError::connection_failed(e.to_string()).add_context(path.display().to_string())
        })?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::connection_failed(e.to_string()))?;

        tracing::info!(path = %path.display(), "Opened libsql store");

        Ok(Self {
            db,
            conn,
            in_memory: path.as_os_str() == IN_MEMORY,
            writer: Arc::new(Mutex::new(())),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Bound how long `begin` waits for the writer lock
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Create the tables, indexes and immutability triggers
    pub async fn initialize(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS entity_rows (
                resource_type TEXT NOT NULL,
                key TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (resource_type, key)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                action TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT,
                http_method TEXT,
                path TEXT,
                status_code INTEGER,
                actor_id TEXT,
                actor_username TEXT,
                session_id TEXT,
                request_id TEXT,
                ip TEXT,
                user_agent TEXT,
                changes_json TEXT,
                request_body_sha256 TEXT,
                request_body_json TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_audit_log_resource ON audit_log (resource_type, resource_id)",
            "CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at)",
            "CREATE INDEX IF NOT EXISTS idx_audit_log_request_id ON audit_log (request_id)",
            r#"
            CREATE TRIGGER IF NOT EXISTS audit_log_no_update
            BEFORE UPDATE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit rows are immutable');
            END
            "#,
            r#"
            CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
            BEFORE DELETE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit rows are immutable');
            END
            "#,
        ];

        for statement in statements {
            self.conn.execute(statement, ()).await.map_err(|e| {
                DatabaseError::query_failed(DatabaseOperation::Migration, e.to_string())
            })?;
        }

        tracing::debug!("libsql store schema initialized");
        Ok(())
    }

    fn connection(&self) -> Result<libsql::Connection> {
        if self.in_memory {
            Ok(self.conn.clone())
        } else {
            self.db
                .connect()
                .map_err(|e| DatabaseError::connection_failed(e.to_string()).into())
        }
    }
}

#[async_trait]
impl Store for TursoStore {
    fn backend(&self) -> &'static str {
        "turso"
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let writer = tokio::time::timeout(self.lock_timeout, Arc::clone(&self.writer).lock_owned())
            .await
            .map_err(|_| {
                tracing::warn!(
                    timeout_ms = self.lock_timeout.as_millis() as u64,
                    "Timed out waiting for the libsql writer lock"
                );
                DatabaseError::transaction_failed("timed out waiting for the writer lock")
                    .add_context(format!("lock_timeout={:?}", self.lock_timeout))
            })?;
        let conn = self.connection()?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::transaction_failed(e.to_string()))?;

        Ok(Box::new(TursoTransaction {
            tx: Some(tx),
            _writer: writer,
        }))
    }

    async fn load_row(&self, resource_type: &str, key: &str) -> Result<Option<EntityRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT data FROM entity_rows WHERE resource_type = ?1 AND key = ?2",
                libsql::params![resource_type.to_string(), key.to_string()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let data: String = row.get(0)?;
                Ok(Some(EntityRow {
                    resource_type: resource_type.to_string(),
                    key: key.to_string(),
                    data: serde_json::from_str(&data)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>> {
        let mut filters = Vec::new();
        let mut params: Vec<libsql::Value> = Vec::new();

        let mut text_filter = |column: &str, value: Option<String>| {
            if let Some(value) = value {
                params.push(libsql::Value::Text(value));
                filters.push(format!("{column} = ?{}", params.len()));
            }
        };
        text_filter("action", query.action.map(|a| a.as_str().to_string()));
        text_filter("resource_type", query.resource_type.clone());
        text_filter("resource_id", query.resource_id.clone());
        text_filter("actor_id", query.actor_id.clone());
        text_filter("request_id", query.request_id.clone());

        if let Some(since) = query.since {
            params.push(libsql::Value::Text(timestamp(&since)));
            filters.push(format!("created_at >= ?{}", params.len()));
        }
        if let Some(until) = query.until {
            params.push(libsql::Value::Text(timestamp(&until)));
            filters.push(format!("created_at <= ?{}", params.len()));
        }

        let where_clause = if filters.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", filters.join(" AND "))
        };

        params.push(libsql::Value::Integer(query.effective_limit() as i64));
        let limit_idx = params.len();
        params.push(libsql::Value::Integer(query.offset as i64));
        let offset_idx = params.len();

        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log {where_clause} \
             ORDER BY created_at DESC, id DESC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
        );

        let mut rows = self
            .conn
            .query(&sql, libsql::params_from_iter(params))
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(row_to_entry(&row)?);
        }
        Ok(entries)
    }
}

struct TursoTransaction {
    tx: Option<libsql::Transaction>,
    _writer: OwnedMutexGuard<()>,
}

impl TursoTransaction {
    fn open(&self) -> Result<&libsql::Transaction> {
        self.tx.as_ref().ok_or_else(|| {
            Error::InvalidState("transaction already committed or rolled back".to_string())
        })
    }

    fn take(&mut self) -> Result<libsql::Transaction> {
        self.tx.take().ok_or_else(|| {
            Error::InvalidState("transaction already committed or rolled back".to_string())
        })
    }
}

#[async_trait]
impl StoreTransaction for TursoTransaction {
    async fn upsert(&mut self, row: &EntityRow) -> Result<()> {
        let data = serde_json::to_string(&row.data)?;
        self.open()?
            .execute(
                "INSERT INTO entity_rows (resource_type, key, data) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (resource_type, key) DO UPDATE SET data = excluded.data",
                libsql::params![row.resource_type.clone(), row.key.clone(), data],
            )
            .await
            .map_err(|e| {
                DatabaseError::query_failed(DatabaseOperation::Insert, e.to_string())
                    .add_context("entity_rows")
            })?;
        Ok(())
    }

    async fn remove(&mut self, resource_type: &str, key: &str) -> Result<()> {
        self.open()?
            .execute(
                "DELETE FROM entity_rows WHERE resource_type = ?1 AND key = ?2",
                libsql::params![resource_type.to_string(), key.to_string()],
            )
            .await
            .map_err(|e| {
                DatabaseError::query_failed(DatabaseOperation::Delete, e.to_string())
                    .add_context("entity_rows")
            })?;
        Ok(())
    }

    async fn insert_audit(&mut self, entry: &AuditLogEntry) -> Result<()> {
        let sql = format!(
            "INSERT INTO audit_log ({AUDIT_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        );
        self.open()?
            .execute(
                &sql,
                libsql::params![
                    entry.id.to_string(),
                    timestamp(&entry.created_at),
                    entry.action.as_str().to_string(),
                    entry.resource_type.clone(),
                    entry.resource_id.clone(),
                    entry.http_method.clone(),
                    entry.path.clone(),
                    entry.status_code.map(i64::from),
                    entry.actor_id.clone(),
                    entry.actor_username.clone(),
                    entry.session_id.clone(),
                    entry.request_id.clone(),
                    entry.ip.clone(),
                    entry.user_agent.clone(),
                    entry.changes_json.clone(),
                    entry.request_body_sha256.clone(),
                    entry.request_body_json.clone(),
                ],
            )
            .await
            .map_err(|e| {
                let mut err = crate::error::classify_libsql_error(&e);
                err.operation = DatabaseOperation::Insert;
                err.add_context("audit_log")
            })?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.take()?
            .commit()
            .await
            .map_err(|e| DatabaseError::transaction_failed(e.to_string()))?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.take()?
            .rollback()
            .await
            .map_err(|e| DatabaseError::transaction_failed(e.to_string()))?;
        Ok(())
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn get_opt_string(row: &libsql::Row, idx: i32) -> Result<Option<String>> {
    Ok(row.get::<Option<String>>(idx)?)
}

fn row_to_entry(row: &libsql::Row) -> Result<AuditLogEntry> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(1)?;
    let action: String = row.get(2)?;

    Ok(AuditLogEntry {
        id: id
            .parse()
            .map_err(|e| DatabaseError::type_conversion(format!("audit id '{id}': {e}")))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                DatabaseError::type_conversion(format!("created_at '{created_at}': {e}"))
            })?,
        action: action
            .parse::<AuditAction>()
            .map_err(DatabaseError::type_conversion)?,
        resource_type: row.get(3)?,
        resource_id: get_opt_string(row, 4)?,
        http_method: get_opt_string(row, 5)?,
        path: get_opt_string(row, 6)?,
        status_code: row
            .get::<Option<i64>>(7)?
            .map(|code| {
                u16::try_from(code).map_err(|_| {
                    DatabaseError::type_conversion(format!("status_code {code} out of range"))
                })
            })
            .transpose()?,
        actor_id: get_opt_string(row, 8)?,
        actor_username: get_opt_string(row, 9)?,
        session_id: get_opt_string(row, 10)?,
        request_id: get_opt_string(row, 11)?,
        ip: get_opt_string(row, 12)?,
        user_agent: get_opt_string(row, 13)?,
        changes_json: get_opt_string(row, 14)?,
        request_body_sha256: get_opt_string(row, 15)?,
        request_body_json: get_opt_string(row, 16)?,
    })
}
