//! Per-flush capture diagnostics
//!
//! Faults inside one object's capture pipeline are absorbed and recorded here
//! instead of propagating. The accumulator lives on the unit-of-work's
//! [`SessionInfo`](crate::session::SessionInfo) and is reset at the start of
//! every flush.

use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use super::record::AuditAction;
use crate::error::CaptureError;

/// Which object a diagnostic is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectRef {
    /// Resource type, if it could be read
    pub resource_type: Option<String>,
    /// Change set the object was found in
    pub action: AuditAction,
    /// Position within that change set
    pub position: usize,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}#{}]",
            self.resource_type.as_deref().unwrap_or("<unknown>"),
            self.action,
            self.position
        )
    }
}

/// One absorbed fault
#[derive(Debug, Clone, Serialize)]
pub struct FlushDiagnostic {
    /// Flush during which the fault happened
    pub flush_id: Uuid,
    /// Object whose pipeline failed, `None` when enumeration itself failed
    pub object_ref: Option<ObjectRef>,
    /// Short error description
    pub error: String,
}

/// Accumulator of absorbed faults for the current flush
#[derive(Debug, Clone, Default)]
pub struct FlushDiagnostics {
    entries: Vec<FlushDiagnostic>,
}

impl FlushDiagnostics {
    /// Record a fault
    pub fn record(&mut self, flush_id: Uuid, object_ref: Option<ObjectRef>, error: &CaptureError) {
        self.entries.push(FlushDiagnostic {
            flush_id,
            object_ref,
            error: error.to_string(),
        });
    }

    /// Recorded faults, in the order they happened
    pub fn entries(&self) -> &[FlushDiagnostic] {
        &self.entries
    }

    /// Number of recorded faults
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the flush ran clean
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything recorded so far
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_clear() {
        let flush_id = Uuid::now_v7();
        let mut diagnostics = FlushDiagnostics::default();
        assert!(diagnostics.is_empty());

        diagnostics.record(
            flush_id,
            Some(ObjectRef {
                resource_type: Some("Cliente".to_string()),
                action: AuditAction::Update,
                position: 2,
            }),
            &CaptureError::Panicked("boom".to_string()),
        );

        assert_eq!(diagnostics.len(), 1);
        let entry = &diagnostics.entries()[0];
        assert_eq!(entry.flush_id, flush_id);
        assert_eq!(entry.error, "entity inspection panicked: boom");
        assert_eq!(
            entry.object_ref.as_ref().unwrap().to_string(),
            "Cliente[update#2]"
        );

        diagnostics.clear();
        assert!(diagnostics.is_empty());
    }
}
