//! Request ID generation and propagation
//!
//! Place [`request_id_layer`] outside the request-context middleware so every
//! request reaches it with an `x-request-id` header.

use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};

use crate::ids::MakeTypedRequestId;

/// Request ID header
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Client session header
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Proxy chain header; the first hop is the client
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Single client address set by a reverse proxy
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Create a request ID layer that generates type-safe request IDs.
///
/// Request IDs use the TypeID format with a "req" prefix and UUIDv7,
/// making them human-readable, type-safe, and time-sortable.
///
/// Example format: `req_01h455vb4pex5vsknk084sn02q`
pub fn request_id_layer() -> SetRequestIdLayer<MakeTypedRequestId> {
    SetRequestIdLayer::x_request_id(MakeTypedRequestId)
}

/// Copy the request ID onto the response
pub fn request_id_propagation_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::x_request_id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::get, Router};
    use http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_generated_request_id_is_propagated() {
        let app = Router::new()
            .route(
                "/",
                get(|headers: http::HeaderMap| async move {
                    headers
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                }),
            )
            .layer(request_id_propagation_layer())
            .layer(request_id_layer());

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let header = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(header.starts_with("req_"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, header.as_bytes());
    }

    #[tokio::test]
    async fn test_client_request_id_is_kept() {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(request_id_propagation_layer())
            .layer(request_id_layer());

        let response = app
            .oneshot(
                Request::get("/")
                    .header(REQUEST_ID_HEADER, "client-7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()[REQUEST_ID_HEADER], "client-7");
    }
}
