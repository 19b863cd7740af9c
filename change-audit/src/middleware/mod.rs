//! HTTP middleware for request context capture

pub mod request_context;
pub mod request_tracking;

pub use request_context::request_context_middleware;
pub use request_tracking::{
    request_id_layer, request_id_propagation_layer, FORWARDED_FOR_HEADER, REAL_IP_HEADER,
    REQUEST_ID_HEADER, SESSION_ID_HEADER,
};
