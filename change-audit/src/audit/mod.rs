//! Transactional change capture
//!
//! Turns the pending changes of a unit-of-work into append-only audit rows
//! enrolled in that same unit-of-work.
//!
//! # Architecture
//!
//! [`ChangeCaptureEngine`] is registered once as a pre-flush listener. At each
//! flush it classifies new, deleted and dirty objects, diffs dirty objects
//! field by field, resolves each object's resource id and stamps every row
//! with the current request metadata and bound actor. Rows are written in
//! the same store transaction as the business rows, so a rollback discards
//! both.
//!
//! The engine sees objects only through the
//! [`ChangeTracked`](crate::entity::ChangeTracked) capability traits and
//! holds no storage-specific code.

pub mod diagnostics;
pub mod encode;
pub mod engine;
pub mod identity;
pub mod record;


pub use diagnostics::{FlushDiagnostic, FlushDiagnostics, ObjectRef};
pub use engine::ChangeCaptureEngine;
pub use identity::resolve_resource_id;
pub use record::{
    AuditAction, AuditLogEntry, AuditQuery, ChangeSet, FieldChange, DEFAULT_AUDIT_QUERY_LIMIT,
    MAX_AUDIT_QUERY_LIMIT,
};
