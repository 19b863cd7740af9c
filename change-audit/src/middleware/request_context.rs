//! Request context middleware
//!
//! Builds the [`RequestMetadata`] of each inbound request and runs the rest of
//! the stack inside [`RequestContext::scope`], so any unit-of-work committed
//! by a handler stamps its audit rows with the request that caused them.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use axum::{middleware::from_fn_with_state, Router};
//! use change_audit::middleware::{request_context_middleware, request_id_layer};
//!
//! let app = Router::new()
//!     .route("/clientes", post(create_cliente))
//!     .layer(from_fn_with_state(Arc::new(config.audit.clone()), request_context_middleware))
//!     .layer(request_id_layer());
//! ```

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;

use super::request_tracking::{
    FORWARDED_FOR_HEADER, REAL_IP_HEADER, REQUEST_ID_HEADER, SESSION_ID_HEADER,
};
use crate::actor::Actor;
use crate::config::AuditConfig;
use crate::context::{RequestContext, RequestMetadata};
use crate::ids::RequestId;

/// Axum middleware that populates the request context
///
/// The authenticated principal is read from an [`Actor`] request extension,
/// inserted by whatever auth layer runs before this one. The response status
/// is recorded after the handler returns, unless the handler recorded one
/// itself.
pub async fn request_context_middleware(
    State(config): State<Arc<AuditConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let headers = request.headers();

    let actor = request.extensions().get::<Actor>().cloned().unwrap_or_default();
    let request_id =
        header_text(headers, REQUEST_ID_HEADER).unwrap_or_else(|| RequestId::new().to_string());

    let mut metadata = RequestMetadata::new(method.as_str(), path.as_str())
        .with_actor(actor.id, actor.username)
        .with_request_id(request_id)
        .with_client(
            client_ip(headers, &request),
            header_text(headers, "user-agent"),
        );
    if let Some(session_id) = header_text(headers, SESSION_ID_HEADER) {
        metadata = metadata.with_session_id(session_id);
    }

    let request = if should_capture_body(&config, &method, &path, headers) {
        let (parts, body) = request.into_parts();
        // Buffered in full: the handler always receives the whole body.
        let bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(%method, %path, error = %err, "Failed to capture request body");
                Bytes::new()
            }
        };
        if bytes.len() <= config.max_body_bytes {
            tracing::trace!(%method, %path, body_size = bytes.len(), "Captured request body");
            metadata = metadata.with_body(&bytes, &config.redacted_body_fields);
        } else {
            tracing::debug!(
                %method,
                %path,
                body_size = bytes.len(),
                limit = config.max_body_bytes,
                "Request body over capture limit, not recorded"
            );
        }
        Request::from_parts(parts, Body::from(bytes))
    } else {
        request
    };

    RequestContext::scope(metadata, async move {
        let response = next.run(request).await;
        RequestContext::record_status(response.status().as_u16());
        response
    })
    .await
}

fn should_capture_body(config: &AuditConfig, method: &Method, path: &str, headers: &HeaderMap) -> bool {
    if !config.capture_request_body || config.is_route_excluded(path) {
        return false;
    }
    if !matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE) {
        return false;
    }

    // A body declared larger than the limit is passed through unbuffered.
    let declared = header_text(headers, "content-length").and_then(|v| v.parse::<usize>().ok());
    declared.is_none_or(|length| length <= config.max_body_bytes)
}

fn client_ip(headers: &HeaderMap, request: &Request) -> Option<String> {
    header_text(headers, FORWARDED_FOR_HEADER)
        .and_then(|chain| chain.split(',').next().map(|hop| hop.trim().to_string()))
        .filter(|hop| !hop.is_empty())
        .or_else(|| header_text(headers, REAL_IP_HEADER))
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, AuditQuery};
    use crate::entity::{Entity, FieldValue};
    use crate::session::SessionFactory;
    use crate::storage::{MemoryStore, Store};
    use axum::{
        http::StatusCode,
        middleware::from_fn_with_state,
        routing::{get, post},
        Extension, Json, Router,
    };
    use tower::ServiceExt;

    fn app(config: AuditConfig) -> Router {
        Router::new()
            .route("/echo", post(echo).get(echo))
            .route("/health", post(echo))
            .route("/status", get(status))
            .layer(from_fn_with_state(Arc::new(config), request_context_middleware))
    }

    async fn echo(body: String) -> Json<(RequestMetadata, String)> {
        Json((RequestContext::get(), body))
    }

    async fn status() -> StatusCode {
        RequestContext::record_status(202);
        let recorded = RequestContext::get().status_code;
        assert_eq!(recorded, Some(202));
        StatusCode::ACCEPTED
    }

    async fn send(app: Router, request: http::Request<Body>) -> (RequestMetadata, String) {
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_metadata_from_headers_and_body() {
        let request = http::Request::post("/echo")
            .header(REQUEST_ID_HEADER, "req-1")
            .header(SESSION_ID_HEADER, "sess-1")
            .header(FORWARDED_FOR_HEADER, "203.0.113.9, 10.0.0.1")
            .header("user-agent", "curl/8.0")
            .body(Body::from(r#"{"Nombre":"Juan","password":"hunter2"}"#))
            .unwrap();

        let (metadata, body) = send(app(AuditConfig::default()), request).await;

        assert_eq!(metadata.method.as_deref(), Some("POST"));
        assert_eq!(metadata.path.as_deref(), Some("/echo"));
        assert_eq!(metadata.request_id.as_deref(), Some("req-1"));
        assert_eq!(metadata.session_id.as_deref(), Some("sess-1"));
        assert_eq!(metadata.ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(metadata.user_agent.as_deref(), Some("curl/8.0"));
        assert!(metadata.request_body_sha256.is_some());

        let stored: serde_json::Value =
            serde_json::from_str(metadata.request_body_json.as_deref().unwrap()).unwrap();
        assert_eq!(stored["Nombre"], "Juan");
        assert_eq!(stored["password"], crate::context::REDACTED);

        // The handler still sees the original body
        assert!(body.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_real_ip_and_generated_request_id() {
        let request = http::Request::get("/echo")
            .header(REAL_IP_HEADER, "198.51.100.4")
            .body(Body::empty())
            .unwrap();

        let (metadata, _) = send(app(AuditConfig::default()), request).await;

        assert_eq!(metadata.ip.as_deref(), Some("198.51.100.4"));
        assert!(metadata.request_id.unwrap().starts_with("req_"));
        assert!(metadata.request_body_json.is_none());
        assert!(metadata.session_id.is_none());
    }

    #[tokio::test]
    async fn test_excluded_route_skips_body_but_sets_context() {
        let request = http::Request::post("/health")
            .body(Body::from(r#"{"probe":true}"#))
            .unwrap();

        let (metadata, body) = send(app(AuditConfig::default()), request).await;

        assert_eq!(metadata.path.as_deref(), Some("/health"));
        assert!(metadata.request_body_json.is_none());
        assert!(metadata.request_body_sha256.is_none());
        assert_eq!(body, r#"{"probe":true}"#);
    }

    #[tokio::test]
    async fn test_oversized_declared_body_is_passed_through() {
        let config = AuditConfig {
            max_body_bytes: 4,
            ..AuditConfig::default()
        };
        let request = http::Request::post("/echo")
            .header("content-length", "16")
            .body(Body::from("0123456789abcdef"))
            .unwrap();

        let (metadata, body) = send(app(config), request).await;

        assert!(metadata.request_body_json.is_none());
        assert_eq!(body, "0123456789abcdef");
    }

    #[tokio::test]
    async fn test_oversized_undeclared_body_is_passed_through() {
        let config = AuditConfig {
            max_body_bytes: 4,
            ..AuditConfig::default()
        };
        let request = http::Request::post("/echo")
            .body(Body::from("0123456789abcdef"))
            .unwrap();
        assert!(request.headers().get("content-length").is_none());

        let (metadata, body) = send(app(config), request).await;

        assert!(metadata.request_body_json.is_none());
        assert!(metadata.request_body_sha256.is_none());
        assert_eq!(metadata.method.as_deref(), Some("POST"));
        assert_eq!(body, "0123456789abcdef");
    }

    #[tokio::test]
    async fn test_actor_extension_is_recorded() {
        let app = app(AuditConfig::default()).layer(Extension(Actor::new("user-1", "juan")));
        let request = http::Request::get("/echo").body(Body::empty()).unwrap();

        let (metadata, _) = send(app, request).await;

        assert_eq!(metadata.actor_id.as_deref(), Some("user-1"));
        assert_eq!(metadata.actor_username.as_deref(), Some("juan"));
    }

    #[tokio::test]
    async fn test_handler_recorded_status_wins() {
        let request = http::Request::get("/status").body(Body::empty()).unwrap();
        let response = app(AuditConfig::default()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[derive(Clone)]
    struct Cliente {
        id: i64,
        nombre: String,
    }

    impl Entity for Cliente {
        fn resource_type(&self) -> &str {
            "Cliente"
        }

        fn primary_key(&self) -> Vec<Option<String>> {
            vec![Some(self.id.to_string())]
        }

        fn fields(&self) -> Vec<(&'static str, Box<dyn FieldValue>)> {
            vec![("id", Box::new(self.id)), ("Nombre", Box::new(self.nombre.clone()))]
        }
    }

    async fn create_cliente(
        State(factory): State<SessionFactory>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        let mut session = factory.session();
        session.add(Cliente {
            id: body["id"].as_i64().unwrap_or_default(),
            nombre: body["Nombre"].as_str().unwrap_or_default().to_string(),
        });
        match session.commit().await {
            Ok(()) => StatusCode::CREATED,
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[tokio::test]
    async fn test_commit_inside_request_stamps_audit_row() {
        let store = MemoryStore::new();
        let factory = SessionFactory::new(Arc::new(store.clone()))
            .with_change_capture(AuditConfig::default());

        let app = Router::new()
            .route("/clientes", post(create_cliente))
            .with_state(factory)
            .layer(from_fn_with_state(
                Arc::new(AuditConfig::default()),
                request_context_middleware,
            ))
            .layer(Extension(Actor::new("user-1", "juan")));

        let request = http::Request::post("/clientes")
            .header("content-type", "application/json")
            .header(REQUEST_ID_HEADER, "req-42")
            .body(Body::from(r#"{"id":7,"Nombre":"Juan"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let rows = store.query_audit(&AuditQuery::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        let entry = &rows[0];
        assert_eq!(entry.action, AuditAction::Create);
        assert_eq!(entry.resource_id.as_deref(), Some("7"));
        assert_eq!(entry.http_method.as_deref(), Some("POST"));
        assert_eq!(entry.path.as_deref(), Some("/clientes"));
        assert_eq!(entry.request_id.as_deref(), Some("req-42"));
        assert_eq!(entry.actor_username.as_deref(), Some("juan"));
        assert!(entry.request_body_sha256.is_some());
        // Written before the response existed
        assert_eq!(entry.status_code, None);
    }
}
