//! Request-scoped metadata propagation
//!
//! [`RequestContext`] makes one [`RequestMetadata`] value visible to all code
//! running inside a logical request without threading it through every call.
//! It is backed by a tokio task-local, so the value is confined to the task
//! (and the future) that entered the scope:
//!
//! - concurrent requests never observe each other's metadata;
//! - tasks spawned with `tokio::spawn` start outside any scope;
//! - a nested scope shadows its parent only until it returns.
//!
//! Reads hand out an owned copy. There is no shared instance that a consumer
//! could mutate in place, so the "unset" default cannot leak between scopes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::{Arc, OnceLock};

use crate::audit::encode;

tokio::task_local! {
    static CURRENT_REQUEST: RequestScope;
}

/// Placeholder written over redacted request body fields
pub const REDACTED: &str = "[REDACTED]";

/// Per-request metadata captured by the web middleware
///
/// Every field is optional: background jobs run without a request, and the
/// middleware fills only what the inbound request actually carried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// HTTP method
    pub method: Option<String>,
    /// Request path
    pub path: Option<String>,
    /// Authenticated actor id, as seen by the web layer
    pub actor_id: Option<String>,
    /// Authenticated actor username, as seen by the web layer
    pub actor_username: Option<String>,
    /// Session identifier
    pub session_id: Option<String>,
    /// Correlation id for the request
    pub request_id: Option<String>,
    /// Client IP address
    pub ip: Option<String>,
    /// Client user agent string
    pub user_agent: Option<String>,
    /// Request body as JSON text (redacted)
    pub request_body_json: Option<String>,
    /// Hex SHA-256 of the raw request body bytes
    pub request_body_sha256: Option<String>,
    /// Response status, when known before the audit rows are written
    pub status_code: Option<u16>,
}

impl RequestMetadata {
    /// Create metadata for an HTTP request
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Set the actor identity reported by the web layer
    pub fn with_actor(mut self, id: Option<String>, username: Option<String>) -> Self {
        self.actor_id = id;
        self.actor_username = username;
        self
    }

    /// Set the session id
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the request id
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Set client address and user agent
    pub fn with_client(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip = ip;
        self.user_agent = user_agent;
        self
    }

    /// Attach the raw request body
    ///
    /// The SHA-256 always covers the raw bytes. The stored JSON has the listed
    /// top-level keys masked; a body that is not JSON is stored as a JSON
    /// string of its (lossy UTF-8) text. An empty body records nothing.
    pub fn with_body(mut self, raw: &[u8], redacted_fields: &[String]) -> Self {
        if raw.is_empty() {
            return self;
        }

        self.request_body_sha256 = Some(hex::encode(Sha256::digest(raw)));

        let value = match serde_json::from_slice::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Object(mut map)) => {
                for field in redacted_fields {
                    if let Some(slot) = map.get_mut(field) {
                        *slot = serde_json::Value::String(REDACTED.to_string());
                    }
                }
                serde_json::Value::Object(map)
            }
            Ok(other) => other,
            Err(_) => serde_json::Value::String(String::from_utf8_lossy(raw).into_owned()),
        };
        self.request_body_json = Some(encode::to_json_text(&value));
        self
    }

    /// Whether nothing at all has been recorded
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// What a scope stores: the frozen metadata plus a write-once status slot
#[derive(Debug, Clone)]
struct RequestScope {
    metadata: Arc<RequestMetadata>,
    status: Arc<OnceLock<u16>>,
}

impl RequestScope {
    fn new(metadata: RequestMetadata) -> Self {
        Self {
            metadata: Arc::new(metadata),
            status: Arc::new(OnceLock::new()),
        }
    }

    fn snapshot(&self) -> RequestMetadata {
        let mut metadata = (*self.metadata).clone();
        if metadata.status_code.is_none() {
            metadata.status_code = self.status.get().copied();
        }
        metadata
    }
}

/// Accessor for the current request's metadata
///
/// ```rust
/// use change_audit::context::{RequestContext, RequestMetadata};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let metadata = RequestMetadata::new("PATCH", "/clientes/7");
/// let path = RequestContext::scope(metadata, async {
///     RequestContext::get().path
/// })
/// .await;
/// assert_eq!(path.as_deref(), Some("/clientes/7"));
/// assert!(!RequestContext::is_set());
/// # }
/// ```
pub struct RequestContext;

impl RequestContext {
    /// Run `f` with `metadata` as the current request context
    ///
    /// This is the single write point, used once by the outermost middleware.
    pub async fn scope<F>(metadata: RequestMetadata, f: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_REQUEST.scope(RequestScope::new(metadata), f).await
    }

    /// Synchronous variant of [`RequestContext::scope`]
    pub fn sync_scope<R>(metadata: RequestMetadata, f: impl FnOnce() -> R) -> R {
        CURRENT_REQUEST.sync_scope(RequestScope::new(metadata), f)
    }

    /// Current metadata, or a fresh default when no scope is active
    ///
    /// Use [`RequestContext::is_set`] or [`RequestContext::try_get`] to tell
    /// the two apart.
    pub fn get() -> RequestMetadata {
        Self::try_get().unwrap_or_default()
    }

    /// Current metadata, or `None` when no scope is active
    pub fn try_get() -> Option<RequestMetadata> {
        CURRENT_REQUEST.try_with(RequestScope::snapshot).ok()
    }

    /// Whether the caller runs inside a request scope
    pub fn is_set() -> bool {
        CURRENT_REQUEST.try_with(|_| ()).is_ok()
    }

    /// Record the response status for the current scope
    ///
    /// Write-once: returns `false` when no scope is active or a status was
    /// already recorded. Audit rows written before this call keep a NULL
    /// status; rows are never updated after insert.
    pub fn record_status(status_code: u16) -> bool {
        CURRENT_REQUEST
            .try_with(|scope| scope.status.set(status_code).is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn populated() -> RequestMetadata {
        RequestMetadata::new("PUT", "/clientes/42")
            .with_actor(Some("u-1".to_string()), Some("ana".to_string()))
            .with_request_id("req-1")
    }

    #[test]
    fn test_unset_context_returns_fresh_default() {
        assert!(!RequestContext::is_set());
        assert!(RequestContext::try_get().is_none());
        assert!(RequestContext::get().is_empty());
    }

    #[test]
    fn test_mutating_returned_default_does_not_leak() {
        let mut first = RequestContext::get();
        first.path = Some("/leaked".to_string());
        first.actor_id = Some("intruder".to_string());

        assert!(RequestContext::get().is_empty());
    }

    #[tokio::test]
    async fn test_scope_exposes_metadata() {
        let seen = RequestContext::scope(populated(), async { RequestContext::get() }).await;
        assert_eq!(seen.method.as_deref(), Some("PUT"));
        assert_eq!(seen.actor_username.as_deref(), Some("ana"));
        assert!(!RequestContext::is_set());
    }

    #[tokio::test]
    async fn test_nested_scope_does_not_leak_to_parent() {
        RequestContext::scope(populated(), async {
            let child = RequestContext::scope(RequestMetadata::new("POST", "/child"), async {
                RequestContext::get().path
            })
            .await;
            assert_eq!(child.as_deref(), Some("/child"));
            assert_eq!(RequestContext::get().path.as_deref(), Some("/clientes/42"));
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_scopes_are_isolated() {
        let (set_tx, set_rx) = oneshot::channel::<()>();
        let (read_tx, read_rx) = oneshot::channel::<()>();

        let writer = tokio::spawn(RequestContext::scope(populated(), async move {
            let _ = set_tx.send(());
            let _ = read_rx.await;
            RequestContext::get()
        }));

        let reader = tokio::spawn(async move {
            let _ = set_rx.await;
            let mut seen = RequestContext::get();
            seen.actor_id = Some("mutated".to_string());
            let again = RequestContext::get();
            let _ = read_tx.send(());
            (RequestContext::is_set(), again)
        });

        let (reader_set, reader_seen) = reader.await.unwrap();
        let writer_seen = writer.await.unwrap();

        assert!(!reader_set);
        assert!(reader_seen.is_empty());
        assert_eq!(writer_seen.actor_id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn test_spawned_task_does_not_inherit_scope() {
        let inherited = RequestContext::scope(populated(), async {
            tokio::spawn(async { RequestContext::is_set() }).await.unwrap()
        })
        .await;
        assert!(!inherited);
    }

    #[tokio::test]
    async fn test_record_status_is_write_once() {
        assert!(!RequestContext::record_status(200));

        RequestContext::scope(populated(), async {
            assert_eq!(RequestContext::get().status_code, None);
            assert!(RequestContext::record_status(201));
            assert!(!RequestContext::record_status(500));
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(RequestContext::get().status_code, Some(201));
        })
        .await;
    }

    #[test]
    fn test_sync_scope() {
        let method = RequestContext::sync_scope(populated(), || RequestContext::get().method);
        assert_eq!(method.as_deref(), Some("PUT"));
    }

    #[test]
    fn test_with_body_hashes_raw_and_redacts_json() {
        let raw = br#"{"Nombre":"Juan","password":"hunter2"}"#;
        let metadata =
            RequestMetadata::new("POST", "/clientes").with_body(raw, &["password".to_string()]);

        assert_eq!(
            metadata.request_body_sha256,
            Some(hex::encode(Sha256::digest(raw)))
        );
        let json: serde_json::Value =
            serde_json::from_str(metadata.request_body_json.as_deref().unwrap()).unwrap();
        assert_eq!(json["Nombre"], "Juan");
        assert_eq!(json["password"], REDACTED);
    }

    #[test]
    fn test_with_body_non_json_and_empty() {
        let metadata = RequestMetadata::default().with_body(b"plain text", &[]);
        assert_eq!(metadata.request_body_json.as_deref(), Some("\"plain text\""));

        let empty = RequestMetadata::default().with_body(b"", &[]);
        assert!(empty.request_body_json.is_none());
        assert!(empty.request_body_sha256.is_none());
    }
}
