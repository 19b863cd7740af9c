//! Change capture engine
//!
//! [`ChangeCaptureEngine`] runs as a [`FlushListener`]: synchronously, on the
//! task committing the unit-of-work, before any row is written. For every
//! new, deleted and dirty object it builds at most one [`AuditLogEntry`] and
//! enrolls it into the same flush, so audit rows commit and roll back together
//! with the business rows that caused them.
//!
//! Each object is processed behind its own fault boundary. An error or panic
//! while inspecting one object is recorded on the unit-of-work's diagnostics
//! and the remaining objects are processed normally. Nothing raised here can
//! abort the enclosing transaction.

use std::panic::{self, AssertUnwindSafe};

use super::diagnostics::ObjectRef;
use super::encode;
use super::identity::resolve_resource_id;
use super::record::{AuditAction, AuditLogEntry, ChangeSet};
use crate::actor::Actor;
use crate::config::AuditConfig;
use crate::context::{RequestContext, RequestMetadata};
use crate::entity::{ChangeTracked, TrackedObject};
use crate::error::CaptureError;
use crate::session::{FlushListener, PendingFlush, SessionInfo};

/// Outcome of one object's pipeline
enum Capture {
    Row(AuditLogEntry),
    Skipped(&'static str),
}

/// Pre-flush listener that turns pending changes into audit rows
#[derive(Debug, Clone, Default)]
pub struct ChangeCaptureEngine {
    config: AuditConfig,
}

impl ChangeCaptureEngine {
    /// Create an engine with the given settings
    pub fn new(config: AuditConfig) -> Self {
        Self { config }
    }

    /// Settings in effect
    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Build the audit rows for one flush
    ///
    /// Reads the current [`RequestContext`] and the actor bound on `info`.
    /// Faults are recorded on `info` under its current flush id; callers
    /// driving the engine directly should call
    /// [`SessionInfo::begin_flush`] before each flush.
    pub fn capture(
        &self,
        changes: &dyn ChangeTracked,
        info: &mut SessionInfo,
    ) -> Vec<AuditLogEntry> {
        if !self.config.enabled {
            return Vec::new();
        }

        let flush_id = info.flush_id().unwrap_or_else(|| info.begin_flush());
        let request = RequestContext::get();
        let actor = info.actor().current();
        let mut rows = Vec::new();

        for action in [AuditAction::Create, AuditAction::Delete, AuditAction::Update] {
            let enumerated = panic::catch_unwind(AssertUnwindSafe(|| match action {
                AuditAction::Create => changes.new_objects(),
                AuditAction::Delete => changes.deleted_objects(),
                AuditAction::Update => changes.dirty_objects(),
            }));
            let objects = match enumerated {
                Ok(objects) => objects,
                Err(payload) => {
                    let err = CaptureError::from_panic(payload);
                    tracing::warn!(%flush_id, %action, error = %err, "Failed to enumerate pending changes");
                    info.diagnostics_mut().record(flush_id, None, &err);
                    continue;
                }
            };

            for (position, object) in objects.into_iter().enumerate() {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.capture_object(object, action, &request, &actor)
                }))
                .unwrap_or_else(|payload| Err(CaptureError::from_panic(payload)));

                match outcome {
                    Ok(Capture::Row(entry)) => {
                        tracing::debug!(
                            %flush_id,
                            action = %entry.action,
                            resource_type = %entry.resource_type,
                            resource_id = ?entry.resource_id,
                            "Audit row enrolled"
                        );
                        rows.push(entry);
                    }
                    Ok(Capture::Skipped(reason)) => {
                        tracing::trace!(%flush_id, %action, position, reason, "Object skipped");
                    }
                    Err(err) => {
                        let object_ref = ObjectRef {
                            resource_type: safe_resource_type(object),
                            action,
                            position,
                        };
                        tracing::warn!(
                            %flush_id,
                            object = %object_ref,
                            error = %err,
                            "Change capture failed for object, continuing"
                        );
                        info.diagnostics_mut().record(flush_id, Some(object_ref), &err);
                    }
                }
            }
        }

        rows
    }

    fn capture_object(
        &self,
        object: &dyn TrackedObject,
        action: AuditAction,
        request: &RequestMetadata,
        actor: &Actor,
    ) -> Result<Capture, CaptureError> {
        if AuditLogEntry::is_audit_type(object.entity_type())
            || object.resource_type() == AuditLogEntry::RESOURCE_TYPE
        {
            return Ok(Capture::Skipped("audit record"));
        }

        let resource_type = object.resource_type();
        if self.config.is_excluded(resource_type) {
            return Ok(Capture::Skipped("excluded resource type"));
        }

        let changes_json = match action {
            AuditAction::Create | AuditAction::Delete => None,
            AuditAction::Update => {
                let changes = diff(object)?;
                if changes.is_empty() {
                    return Ok(Capture::Skipped("no real change"));
                }
                Some(encode::encode_changes(&changes))
            }
        };

        let resource_id = resolve_resource_id(object);
        if resource_id.is_none() {
            tracing::debug!(%resource_type, %action, "No resource id resolved, recording null");
        }

        let mut entry = AuditLogEntry::new(action, resource_type)
            .with_resource_id(resource_id)
            .with_request(request)
            .with_actor(actor);
        entry.changes_json = changes_json;

        Ok(Capture::Row(entry))
    }
}

impl FlushListener for ChangeCaptureEngine {
    fn name(&self) -> &str {
        "change-capture"
    }

    fn before_flush(&self, flush: &mut PendingFlush<'_>) {
        let changes = flush.changes();
        let rows = self.capture(changes, flush.info_mut());
        for row in rows {
            flush.enroll(row);
        }
    }
}

/// Field changes of a dirty object, restricted to fields whose value differs
fn diff(object: &dyn TrackedObject) -> Result<ChangeSet, CaptureError> {
    let mut changes = ChangeSet::new();

    for field in object.field_names() {
        let history = object
            .history(&field)
            .map_err(|source| CaptureError::History {
                field: field.clone(),
                source,
            })?;

        if history.is_real_change() {
            let change = encode::field_change(history.old.as_deref(), history.new.as_deref());
            changes.insert(field, change);
        }
    }

    Ok(changes)
}

fn safe_resource_type(object: &dyn TrackedObject) -> Option<String> {
    panic::catch_unwind(AssertUnwindSafe(|| object.resource_type().to_string())).ok()
}
