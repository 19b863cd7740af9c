//! Audit record types
//!
//! [`AuditLogEntry`] is the durable, append-only row the capture engine emits
//! once per affected object per flush. [`AuditQuery`] filters the trail when
//! reading it back from a [`Store`](crate::storage::Store).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::actor::Actor;
use crate::context::RequestMetadata;
use crate::entity::{Entity, FieldValue};
use crate::ids::AuditEntryId;

// ============================================================================
// Audit Query Constants
// ============================================================================

/// Default number of audit entries returned per query
pub const DEFAULT_AUDIT_QUERY_LIMIT: usize = 100;

/// Maximum number of audit entries that can be returned in a single query
pub const MAX_AUDIT_QUERY_LIMIT: usize = 1000;

/// Kind of change recorded by an audit row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    /// Object added in the unit-of-work
    Create,
    /// Persisted object with at least one changed field
    Update,
    /// Persisted object removed in the unit-of-work
    Delete,
}

impl AuditAction {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown audit action '{other}'")),
        }
    }
}

/// Old and new value of one changed field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Value before the change
    pub old: serde_json::Value,
    /// Value after the change
    pub new: serde_json::Value,
}

/// Field name to change, as stored in `changes_json`
pub type ChangeSet = BTreeMap<String, FieldChange>;

/// One durable audit row
///
/// Rows are never mutated after insert. Both bundled stores reject updates
/// and deletes of this table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Unique, time-ordered row id
    pub id: AuditEntryId,
    /// Server timestamp at capture time
    pub created_at: DateTime<Utc>,
    /// Kind of change
    pub action: AuditAction,
    /// Resource type of the changed object
    pub resource_type: String,
    /// Resolved identity, `|`-joined for composite keys
    pub resource_id: Option<String>,
    /// HTTP method of the enclosing request
    pub http_method: Option<String>,
    /// Path of the enclosing request
    pub path: Option<String>,
    /// Response status, when known at flush time
    pub status_code: Option<u16>,
    /// Actor id
    pub actor_id: Option<String>,
    /// Actor display name
    pub actor_username: Option<String>,
    /// Session id of the enclosing request
    pub session_id: Option<String>,
    /// Correlation id of the enclosing request
    pub request_id: Option<String>,
    /// Client IP address
    pub ip: Option<String>,
    /// Client user agent
    pub user_agent: Option<String>,
    /// JSON `{field: {old, new}}`, update rows only
    pub changes_json: Option<String>,
    /// Hex SHA-256 of the raw request body
    pub request_body_sha256: Option<String>,
    /// Redacted request body as JSON text
    pub request_body_json: Option<String>,
}

impl AuditLogEntry {
    /// Resource type under which audit rows themselves are known
    pub const RESOURCE_TYPE: &'static str = "audit_log";

    /// Create a bare row for one object
    pub fn new(action: AuditAction, resource_type: impl Into<String>) -> Self {
        Self {
            id: AuditEntryId::new(),
            created_at: Utc::now(),
            action,
            resource_type: resource_type.into(),
            resource_id: None,
            http_method: None,
            path: None,
            status_code: None,
            actor_id: None,
            actor_username: None,
            session_id: None,
            request_id: None,
            ip: None,
            user_agent: None,
            changes_json: None,
            request_body_sha256: None,
            request_body_json: None,
        }
    }

    /// Set the resolved resource id
    pub fn with_resource_id(mut self, resource_id: Option<String>) -> Self {
        self.resource_id = resource_id;
        self
    }

    /// Copy the request metadata onto the row
    ///
    /// The actor fields of the request are applied as well; a later
    /// [`with_actor`](Self::with_actor) overrides each field it knows.
    pub fn with_request(mut self, request: &RequestMetadata) -> Self {
        self.http_method = request.method.clone();
        self.path = request.path.clone();
        self.status_code = request.status_code;
        self.actor_id = request.actor_id.clone();
        self.actor_username = request.actor_username.clone();
        self.session_id = request.session_id.clone();
        self.request_id = request.request_id.clone();
        self.ip = request.ip.clone();
        self.user_agent = request.user_agent.clone();
        self.request_body_sha256 = request.request_body_sha256.clone();
        self.request_body_json = request.request_body_json.clone();
        self
    }

    /// Attribute the row to an actor bound to the unit-of-work
    ///
    /// Precedence is per field: a field the actor leaves unset keeps
    /// whatever the request supplied.
    pub fn with_actor(mut self, actor: &Actor) -> Self {
        if let Some(id) = &actor.id {
            self.actor_id = Some(id.clone());
        }
        if let Some(username) = &actor.username {
            self.actor_username = Some(username.clone());
        }
        self
    }

    /// Set the encoded change set
    pub fn with_changes_json(mut self, changes_json: impl Into<String>) -> Self {
        self.changes_json = Some(changes_json.into());
        self
    }

    /// Decode `changes_json`
    pub fn changes(&self) -> serde_json::Result<Option<ChangeSet>> {
        self.changes_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
    }

    /// Whether an object of the given Rust type is an audit row
    pub fn is_audit_type(type_id: TypeId) -> bool {
        type_id == TypeId::of::<AuditLogEntry>()
    }
}

impl Entity for AuditLogEntry {
    fn resource_type(&self) -> &str {
        Self::RESOURCE_TYPE
    }

    fn primary_key(&self) -> Vec<Option<String>> {
        vec![Some(self.id.to_string())]
    }

    fn fields(&self) -> Vec<(&'static str, Box<dyn FieldValue>)> {
        vec![
            ("id", Box::new(self.id.clone())),
            ("created_at", Box::new(self.created_at)),
            ("action", Box::new(self.action)),
            ("resource_type", Box::new(self.resource_type.clone())),
            ("resource_id", Box::new(self.resource_id.clone())),
            ("http_method", Box::new(self.http_method.clone())),
            ("path", Box::new(self.path.clone())),
            ("status_code", Box::new(self.status_code)),
            ("actor_id", Box::new(self.actor_id.clone())),
            ("actor_username", Box::new(self.actor_username.clone())),
            ("session_id", Box::new(self.session_id.clone())),
            ("request_id", Box::new(self.request_id.clone())),
            ("ip", Box::new(self.ip.clone())),
            ("user_agent", Box::new(self.user_agent.clone())),
            ("changes_json", Box::new(self.changes_json.clone())),
            (
                "request_body_sha256",
                Box::new(self.request_body_sha256.clone()),
            ),
            ("request_body_json", Box::new(self.request_body_json.clone())),
        ]
    }
}

/// Filter for reading the audit trail back
///
/// Results are ordered newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditQuery {
    /// Filter by action
    pub action: Option<AuditAction>,
    /// Filter by resource type
    pub resource_type: Option<String>,
    /// Filter by resource id
    pub resource_id: Option<String>,
    /// Filter by actor id
    pub actor_id: Option<String>,
    /// Filter by request id
    pub request_id: Option<String>,
    /// Inclusive lower bound on `created_at`
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of results to return
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    DEFAULT_AUDIT_QUERY_LIMIT
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            action: None,
            resource_type: None,
            resource_id: None,
            actor_id: None,
            request_id: None,
            since: None,
            until: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl AuditQuery {
    /// Query everything, newest first, with the default limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Only rows of one action
    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Only rows for one resource type
    pub fn resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    /// Only rows for one resource
    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Only rows attributed to one actor
    pub fn actor_id(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Only rows written while serving one request
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Only rows inside a time window
    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    /// Page size and offset
    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Limit clamped to `1..=MAX_AUDIT_QUERY_LIMIT`
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_AUDIT_QUERY_LIMIT)
    }

    /// Whether a row passes every filter
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        fn eq(filter: &Option<String>, value: &Option<String>) -> bool {
            filter.is_none() || filter == value
        }

        self.action.is_none_or(|action| action == entry.action)
            && self
                .resource_type
                .as_ref()
                .is_none_or(|resource_type| *resource_type == entry.resource_type)
            && eq(&self.resource_id, &entry.resource_id)
            && eq(&self.actor_id, &entry.actor_id)
            && eq(&self.request_id, &entry.request_id)
            && self.since.is_none_or(|since| entry.created_at >= since)
            && self.until.is_none_or(|until| entry.created_at <= until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_action_str_roundtrip() {
        for action in [AuditAction::Create, AuditAction::Update, AuditAction::Delete] {
            assert_eq!(action.as_str().parse::<AuditAction>().unwrap(), action);
        }
        assert!("upsert".parse::<AuditAction>().is_err());
        assert_eq!(
            serde_json::to_string(&AuditAction::Delete).unwrap(),
            "\"delete\""
        );
    }

    #[test]
    fn test_with_request_and_actor_precedence() {
        let request = RequestMetadata::new("PATCH", "/clientes/7")
            .with_actor(Some("web-user".to_string()), Some("web".to_string()))
            .with_request_id("req-9");

        let from_request = AuditLogEntry::new(AuditAction::Update, "Cliente")
            .with_request(&request)
            .with_actor(&Actor::unknown());
        assert_eq!(from_request.actor_id.as_deref(), Some("web-user"));
        assert_eq!(from_request.http_method.as_deref(), Some("PATCH"));
        assert_eq!(from_request.request_id.as_deref(), Some("req-9"));

        let bound = AuditLogEntry::new(AuditAction::Update, "Cliente")
            .with_request(&request)
            .with_actor(&Actor::new("u-1", "ana"));
        assert_eq!(bound.actor_id.as_deref(), Some("u-1"));
        assert_eq!(bound.actor_username.as_deref(), Some("ana"));

        let partial = Actor {
            id: Some("u-2".to_string()),
            username: None,
        };
        let partly_bound = AuditLogEntry::new(AuditAction::Update, "Cliente")
            .with_request(&request)
            .with_actor(&partial);
        assert_eq!(partly_bound.actor_id.as_deref(), Some("u-2"));
        assert_eq!(partly_bound.actor_username.as_deref(), Some("web"));
    }

    #[test]
    fn test_changes_decode() {
        let entry = AuditLogEntry::new(AuditAction::Update, "Cliente")
            .with_changes_json(r#"{"Nombre":{"old":"A","new":"B"}}"#);
        let changes = entry.changes().unwrap().unwrap();
        assert_eq!(changes["Nombre"].old, "A");
        assert_eq!(changes["Nombre"].new, "B");

        let created = AuditLogEntry::new(AuditAction::Create, "Cliente");
        assert!(created.changes().unwrap().is_none());
    }

    #[test]
    fn test_audit_type_detection() {
        assert!(AuditLogEntry::is_audit_type(TypeId::of::<AuditLogEntry>()));
        assert!(!AuditLogEntry::is_audit_type(TypeId::of::<String>()));
    }

    #[test]
    fn test_query_limit_clamped() {
        assert_eq!(AuditQuery::new().effective_limit(), 100);
        assert_eq!(AuditQuery::new().page(5000, 0).effective_limit(), 1000);
        assert_eq!(AuditQuery::new().page(0, 0).effective_limit(), 1);
    }

    #[test]
    fn test_query_matches() {
        let entry = AuditLogEntry::new(AuditAction::Delete, "Cliente")
            .with_resource_id(Some("42".to_string()));

        assert!(AuditQuery::new().matches(&entry));
        assert!(AuditQuery::new()
            .action(AuditAction::Delete)
            .resource_type("Cliente")
            .resource_id("42")
            .matches(&entry));
        assert!(!AuditQuery::new().action(AuditAction::Create).matches(&entry));
        assert!(!AuditQuery::new().resource_id("43").matches(&entry));
        assert!(!AuditQuery::new().actor_id("u-1").matches(&entry));

        let later = entry.created_at + chrono::Duration::seconds(1);
        assert!(!AuditQuery::new().between(later, later).matches(&entry));
    }
}
