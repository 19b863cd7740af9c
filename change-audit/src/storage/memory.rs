//! In-memory store
//!
//! Transactions buffer their writes and apply them under a single write lock
//! on commit, so readers never observe half a flush.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{EntityRow, Store, StoreTransaction};
use crate::audit::{AuditLogEntry, AuditQuery};
use crate::error::{DatabaseError, DatabaseOperation, Error, Result};

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<(String, String), serde_json::Value>,
    audit: Vec<AuditLogEntry>,
}

/// Process-local store, lost on drop
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed business rows
    pub async fn row_count(&self) -> usize {
        self.state.read().await.rows.len()
    }

    /// Number of committed audit rows
    pub async fn audit_count(&self) -> usize {
        self.state.read().await.audit.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            writes: Vec::new(),
            finished: false,
        }))
    }

    async fn load_row(&self, resource_type: &str, key: &str) -> Result<Option<EntityRow>> {
        let state = self.state.read().await;
        Ok(state
            .rows
            .get(&(resource_type.to_string(), key.to_string()))
            .map(|data| EntityRow {
                resource_type: resource_type.to_string(),
                key: key.to_string(),
                data: data.clone(),
            }))
    }

    async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .iter()
            .rev()
            .filter(|entry| query.matches(entry))
            .skip(query.offset)
            .take(query.effective_limit())
            .cloned()
            .collect())
    }
}

#[derive(Debug)]
enum Write {
    Upsert(EntityRow),
    Remove(String, String),
    Audit(AuditLogEntry),
}

struct MemoryTransaction {
    state: Arc<RwLock<MemoryState>>,
    writes: Vec<Write>,
    finished: bool,
}

impl MemoryTransaction {
    fn push(&mut self, write: Write) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidState(
                "transaction already committed or rolled back".to_string(),
            ));
        }
        self.writes.push(write);
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn upsert(&mut self, row: &EntityRow) -> Result<()> {
        self.push(Write::Upsert(row.clone()))
    }

    async fn remove(&mut self, resource_type: &str, key: &str) -> Result<()> {
        self.push(Write::Remove(resource_type.to_string(), key.to_string()))
    }

    async fn insert_audit(&mut self, entry: &AuditLogEntry) -> Result<()> {
        self.push(Write::Audit(entry.clone()))
    }

    async fn commit(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidState(
                "transaction already committed or rolled back".to_string(),
            ));
        }
        self.finished = true;

        let mut state = self.state.write().await;

        // Audit rows are append-only: reject the whole transaction before
        // touching anything if it would overwrite one.
        let mut seen: HashSet<&str> = state.audit.iter().map(|e| e.id.as_str()).collect();
        for write in &self.writes {
            if let Write::Audit(entry) = write {
                if !seen.insert(entry.id.as_str()) {
                    return Err(DatabaseError::constraint_violation(
                        DatabaseOperation::Insert,
                        format!("audit row {} already exists", entry.id),
                    )
                    .add_context("audit_log")
                    .into());
                }
            }
        }
        drop(seen);

        let applied = self.writes.len();
        for write in self.writes.drain(..) {
            match write {
                Write::Upsert(row) => {
                    state.rows.insert((row.resource_type, row.key), row.data);
                }
                Write::Remove(resource_type, key) => {
                    state.rows.remove(&(resource_type, key));
                }
                Write::Audit(entry) => state.audit.push(entry),
            }
        }

        tracing::debug!(writes = applied, "Memory transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let discarded = self.writes.len();
        self.writes.clear();
        self.finished = true;
        tracing::debug!(writes = discarded, "Memory transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;

    fn row(key: &str, nombre: &str) -> EntityRow {
        EntityRow {
            resource_type: "Cliente".to_string(),
            key: key.to_string(),
            data: serde_json::json!({"id": key, "Nombre": nombre}),
        }
    }

    #[tokio::test]
    async fn test_commit_applies_all_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert(&row("1", "Juan")).await.unwrap();
        tx.insert_audit(&AuditLogEntry::new(AuditAction::Create, "Cliente"))
            .await
            .unwrap();

        assert_eq!(store.row_count().await, 0);
        tx.commit().await.unwrap();

        assert_eq!(store.row_count().await, 1);
        assert_eq!(store.audit_count().await, 1);
        let loaded = store.load_row("Cliente", "1").await.unwrap().unwrap();
        assert_eq!(loaded.data["Nombre"], "Juan");
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert(&row("1", "Juan")).await.unwrap();
        tx.insert_audit(&AuditLogEntry::new(AuditAction::Create, "Cliente"))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.row_count().await, 0);
        assert_eq!(store.audit_count().await, 0);
        assert!(matches!(
            tx.upsert(&row("2", "Ana")).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_transaction_writes_nothing() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.upsert(&row("1", "Juan")).await.unwrap();
        }
        assert_eq!(store.row_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_row() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert(&row("42", "Juan")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.remove("Cliente", "42").await.unwrap();
        tx.remove("Cliente", "missing").await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.load_row("Cliente", "42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_audit_rows_cannot_be_overwritten() {
        let store = MemoryStore::new();
        let entry = AuditLogEntry::new(AuditAction::Create, "Cliente");

        let mut tx = store.begin().await.unwrap();
        tx.insert_audit(&entry).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.upsert(&row("1", "Juan")).await.unwrap();
        tx.insert_audit(&entry).await.unwrap();
        let err = tx.commit().await.unwrap_err();

        match err {
            Error::Database(db) => {
                assert_eq!(db.kind, crate::error::DatabaseErrorKind::ConstraintViolation)
            }
            other => panic!("Expected constraint violation, got {other:?}"),
        }
        assert_eq!(store.row_count().await, 0);
        assert_eq!(store.audit_count().await, 1);
    }

    #[tokio::test]
    async fn test_query_newest_first_with_paging() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        for key in ["1", "2", "3"] {
            tx.insert_audit(
                &AuditLogEntry::new(AuditAction::Update, "Cliente")
                    .with_resource_id(Some(key.to_string())),
            )
            .await
            .unwrap();
        }
        tx.insert_audit(&AuditLogEntry::new(AuditAction::Delete, "Factura"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let clientes = store
            .query_audit(&AuditQuery::new().resource_type("Cliente"))
            .await
            .unwrap();
        let ids: Vec<_> = clientes.iter().filter_map(|e| e.resource_id.as_deref()).collect();
        assert_eq!(ids, vec!["3", "2", "1"]);

        let page = store
            .query_audit(&AuditQuery::new().resource_type("Cliente").page(1, 1))
            .await
            .unwrap();
        assert_eq!(page[0].resource_id.as_deref(), Some("2"));
    }
}
