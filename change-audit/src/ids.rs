//! Type-safe identifiers using the TypeID specification
//!
//! Both identifiers here are UUIDv7-backed, so they sort by creation time:
//!
//! - [`RequestId`] (`req_...`): correlates every audit row written while serving one request.
//! - [`AuditEntryId`] (`aud_...`): primary key of an [`AuditLogEntry`](crate::audit::AuditLogEntry).
//!
//! ```rust
//! use change_audit::ids::{AuditEntryId, RequestId};
//!
//! let request_id = RequestId::new();
//! assert!(request_id.as_str().starts_with("req_"));
//!
//! let entry_id = AuditEntryId::new();
//! assert_eq!(entry_id.prefix(), "aud");
//! ```

use mti::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Error type for typed ID parsing.
#[derive(Debug, thiserror::Error)]
pub enum TypedIdError {
    /// The ID could not be parsed as a valid TypeID.
    #[error("failed to parse typed ID: {0}")]
    Parse(#[from] MagicTypeIdError),

    /// The prefix was not the expected value.
    #[error("invalid prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        /// The expected prefix.
        expected: String,
        /// The actual prefix found.
        actual: String,
    },
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(MagicTypeId);

        impl $name {
            /// The TypeID prefix for this identifier
            pub const PREFIX: &'static str = $prefix;

            /// Creates a new identifier backed by a UUIDv7.
            #[must_use]
            pub fn new() -> Self {
                Self(Self::PREFIX.create_type_id::<V7>())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }

            /// Returns the prefix portion of the identifier.
            #[must_use]
            pub fn prefix(&self) -> &str {
                self.0.prefix().as_str()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = TypedIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mti = MagicTypeId::from_str(s)?;
                if mti.prefix().as_str() != Self::PREFIX {
                    return Err(TypedIdError::InvalidPrefix {
                        expected: Self::PREFIX.to_string(),
                        actual: mti.prefix().as_str().to_string(),
                    });
                }
                Ok(Self(mti))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0.to_string()
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

typed_id!(
    /// Correlation identifier for one inbound request, e.g. `req_01h455vb4pex5vsknk084sn02q`.
    RequestId,
    "req"
);

typed_id!(
    /// Primary key of an audit row, e.g. `aud_01h455vb4pex5vsknk084sn02q`.
    AuditEntryId,
    "aud"
);

/// A `MakeRequestId` implementation that generates [`RequestId`]s for tower-http.
///
/// Pair it with `SetRequestIdLayer` ahead of the request-context middleware so
/// every audit row carries a request id even when the client sent none.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeTypedRequestId;

#[cfg(feature = "http")]
impl tower_http::request_id::MakeRequestId for MakeTypedRequestId {
    fn make_request_id<B>(
        &mut self,
        _request: &axum::http::Request<B>,
    ) -> Option<tower_http::request_id::RequestId> {
        let id = RequestId::new();
        let header_value = axum::http::HeaderValue::from_str(id.as_str()).ok()?;
        Some(tower_http::request_id::RequestId::new(header_value))
    }
}
