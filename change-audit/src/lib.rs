//! # change-audit
//!
//! Transactional change-capture audit trail for unit-of-work storage layers.
//!
//! Every create, update and delete committed through a [`Session`] produces
//! exactly one append-only [`AuditLogEntry`], written in the same store
//! transaction as the change itself. A rollback discards both.
//!
//! ## Features
//!
//! - **Field-level diffs**: update rows record `{field: {old, new}}` for fields whose value really changed
//! - **Request context**: method, path, actor, request id, client and redacted body stamped on every row
//! - **Fault isolation**: a failure inspecting one object never aborts the commit
//! - **Append-only storage**: in-memory and Turso/libsql (`turso` feature) backends refuse audit row updates
//! - **Axum middleware** (`http` feature): populates the request context for each inbound request
//!
//! ## Example
//!
//! ```rust,no_run
//! use change_audit::prelude::*;
//!
//! #[derive(Clone)]
//! struct Cliente {
//!     id: i64,
//!     nombre: String,
//! }
//!
//! impl Entity for Cliente {
//!     fn resource_type(&self) -> &str {
//!         "Cliente"
//!     }
//!
//!     fn primary_key(&self) -> Vec<Option<String>> {
//!         vec![Some(self.id.to_string())]
//!     }
//!
//!     fn fields(&self) -> Vec<(&'static str, Box<dyn FieldValue>)> {
//!         vec![("id", Box::new(self.id)), ("Nombre", Box::new(self.nombre.clone()))]
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let factory = SessionFactory::from_config(&config).await?;
//!
//!     let mut session = factory.session();
//!     session.bind_actor(Actor::system("import"));
//!     let cliente = session.add(Cliente { id: 7, nombre: "Juan".to_string() });
//!     session.commit().await?;
//!
//!     session.modify(cliente, |c| c.nombre = "Juan Pablo".to_string())?;
//!     session.commit().await?;
//!
//!     let history = factory
//!         .store()
//!         .query_audit(&AuditQuery::new().resource_type("Cliente").resource_id("7"))
//!         .await?;
//!     assert_eq!(history.len(), 2);
//!     Ok(())
//! }
//! ```

pub mod actor;
pub mod audit;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod ids;
pub mod observability;
pub mod session;
pub mod storage;

#[cfg(feature = "http")]
pub mod middleware;

pub use error::{Error, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::actor::{Actor, ActorBinder};
    pub use crate::audit::{
        AuditAction, AuditLogEntry, AuditQuery, ChangeCaptureEngine, ChangeSet, FieldChange,
        FlushDiagnostic, FlushDiagnostics,
    };
    pub use crate::config::{AuditConfig, Config, StoreBackend, StoreConfig};
    pub use crate::context::{RequestContext, RequestMetadata};
    pub use crate::entity::{ChangeTracked, Entity, FieldHistory, FieldValue, TrackedObject};
    pub use crate::error::{CaptureError, Error, Result};
    pub use crate::error::{DatabaseError, DatabaseErrorKind, DatabaseOperation};
    pub use crate::ids::{AuditEntryId, RequestId, TypedIdError};
    pub use crate::observability::init_tracing;
    pub use crate::session::{
        EntityHandle, FlushListener, PendingFlush, Session, SessionFactory, SessionInfo,
    };
    pub use crate::storage::{EntityRow, MemoryStore, Store, StoreTransaction};

    #[cfg(feature = "turso")]
    pub use crate::storage::TursoStore;

    #[cfg(feature = "http")]
    pub use crate::ids::MakeTypedRequestId;

    #[cfg(feature = "http")]
    pub use crate::middleware::{
        request_context_middleware, request_id_layer, request_id_propagation_layer,
    };
}
