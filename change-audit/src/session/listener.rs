//! Pre-flush hook and unit-of-work side-channel

use uuid::Uuid;

use crate::actor::ActorBinder;
use crate::audit::{AuditLogEntry, FlushDiagnostics};
use crate::entity::ChangeTracked;

/// Side-channel owned by exactly one unit-of-work
///
/// Carries the bound actor and the diagnostics of the most recent flush.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    actor: ActorBinder,
    diagnostics: FlushDiagnostics,
    flush_id: Option<Uuid>,
}

impl SessionInfo {
    /// Start a new flush: clears diagnostics and assigns a fresh flush id
    pub fn begin_flush(&mut self) -> Uuid {
        let flush_id = Uuid::now_v7();
        self.diagnostics.clear();
        self.flush_id = Some(flush_id);
        flush_id
    }

    /// Id of the most recent flush, if any has started
    pub fn flush_id(&self) -> Option<Uuid> {
        self.flush_id
    }

    /// Actor binding of this unit-of-work
    pub fn actor(&self) -> &ActorBinder {
        &self.actor
    }

    /// Mutable actor binding
    pub fn actor_mut(&mut self) -> &mut ActorBinder {
        &mut self.actor
    }

    /// Faults absorbed during the most recent flush
    pub fn diagnostics(&self) -> &FlushDiagnostics {
        &self.diagnostics
    }

    /// Mutable diagnostics accumulator
    pub fn diagnostics_mut(&mut self) -> &mut FlushDiagnostics {
        &mut self.diagnostics
    }
}


/// One flush in progress, as handed to listeners
///
/// Rows enrolled here are written into the same store transaction as the
/// business rows of the flush.
pub struct PendingFlush<'a> {
    changes: &'a dyn ChangeTracked,
    info: &'a mut SessionInfo,
    enrolled: &'a mut Vec<AuditLogEntry>,
}

impl<'a> PendingFlush<'a> {
    /// Wrap the pieces of a flush
    pub fn new(
        changes: &'a dyn ChangeTracked,
        info: &'a mut SessionInfo,
        enrolled: &'a mut Vec<AuditLogEntry>,
    ) -> Self {
        Self {
            changes,
            info,
            enrolled,
        }
    }

    /// Pending changes of the unit-of-work
    pub fn changes(&self) -> &'a dyn ChangeTracked {
        self.changes
    }

    /// Side-channel of the unit-of-work
    pub fn info(&self) -> &SessionInfo {
        &*self.info
    }

    /// Mutable side-channel of the unit-of-work
    pub fn info_mut(&mut self) -> &mut SessionInfo {
        &mut *self.info
    }

    /// Add an audit row to the flush
    pub fn enroll(&mut self, entry: AuditLogEntry) {
        self.enrolled.push(entry);
    }

    /// Rows enrolled so far
    pub fn enrolled(&self) -> &[AuditLogEntry] {
        self.enrolled.as_slice()
    }
}

/// Hook run synchronously just before a unit-of-work writes its changes
///
/// Registered once per [`SessionFactory`](super::SessionFactory) and shared
/// by every session it opens.
pub trait FlushListener: Send + Sync {
    /// Name used in log output
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Inspect the pending changes and enroll rows
    fn before_flush(&self, flush: &mut PendingFlush<'_>);
}
