//! Transactional storage backends
//!
//! A [`Store`] persists business rows and audit rows. Writes always go
//! through a [`StoreTransaction`], so the audit rows enrolled by a flush share
//! the atomicity of the business rows written by that same flush.
//!
//! # Available Backends
//!
//! - **Memory** (always available): buffered writes applied under one lock on commit
//! - **Turso** (`turso` feature): libsql, append-only audit table enforced by triggers
//!
//! Both backends refuse to update or delete audit rows.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audit::{AuditLogEntry, AuditQuery};
use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;

pub mod memory;

#[cfg(feature = "turso")]
pub mod turso;

pub use memory::MemoryStore;

#[cfg(feature = "turso")]
pub use turso::TursoStore;

/// Business row as written by a unit-of-work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    /// Resource type of the entity
    pub resource_type: String,
    /// Row key within the resource type
    pub key: String,
    /// Persistent fields as a JSON object
    pub data: serde_json::Value,
}

/// Persistence backend
#[async_trait]
pub trait Store: Send + Sync {
    /// Short backend name for log output
    fn backend(&self) -> &'static str;

    /// Open a write transaction
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Read one committed business row
    async fn load_row(&self, resource_type: &str, key: &str) -> Result<Option<EntityRow>>;

    /// Read committed audit rows, newest first
    async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>>;
}

/// Open write transaction
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Insert or replace a business row
    async fn upsert(&mut self, row: &EntityRow) -> Result<()>;

    /// Delete a business row; deleting a missing row is not an error
    async fn remove(&mut self, resource_type: &str, key: &str) -> Result<()>;

    /// Append an audit row
    async fn insert_audit(&mut self, entry: &AuditLogEntry) -> Result<()>;

    /// Make every write of this transaction durable
    async fn commit(&mut self) -> Result<()>;

    /// Discard every write of this transaction
    async fn rollback(&mut self) -> Result<()>;
}

/// Open the backend selected by configuration
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "turso")]
        StoreBackend::Turso => {
            let store = TursoStore::open(&config.path)
                .await?
                .with_lock_timeout(std::time::Duration::from_millis(config.lock_timeout_ms));
            store.initialize().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "turso"))]
        StoreBackend::Turso => Err(crate::error::Error::InvalidState(
            "store backend 'turso' requires the `turso` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_backend() {
        let store = open(&StoreConfig::default()).await.unwrap();
        assert_eq!(store.backend(), "memory");
        assert!(store.query_audit(&AuditQuery::new()).await.unwrap().is_empty());
    }

    #[cfg(feature = "turso")]
    #[tokio::test]
    async fn test_open_turso_backend() {
        let config = StoreConfig {
            backend: StoreBackend::Turso,
            ..StoreConfig::default()
        };
        let store = open(&config).await.unwrap();
        assert_eq!(store.backend(), "turso");
        assert!(store.load_row("Cliente", "1").await.unwrap().is_none());
    }
}
