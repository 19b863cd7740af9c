//! Change-tracking capability interface
//!
//! The capture engine never touches business types directly. A storage layer
//! plugs in by exposing three things through these traits:
//!
//! 1. the new, dirty and deleted instances of the current unit-of-work
//!    ([`ChangeTracked`]);
//! 2. per-field old/new history for a dirty instance ([`TrackedObject::history`]);
//! 3. the primary-key tuple of any instance ([`TrackedObject::primary_key`]).
//!
//! [`Entity`] is the domain-side trait used by the crate's own
//! [`Session`](crate::session::Session) to build those views.

use serde::Serialize;
use std::any::{Any, TypeId};
use std::fmt;

/// A persisted field value the engine can compare and encode
///
/// Implemented for every `Serialize + PartialEq + Clone + Debug` type, so
/// domain structs rarely implement it by hand. Encoding may still fail at
/// runtime (e.g. maps with non-string keys); the engine degrades such values
/// instead of failing.
pub trait FieldValue: Any + fmt::Debug + Send + Sync {
    /// Structured JSON encoding
    fn to_json(&self) -> serde_json::Result<serde_json::Value>;

    /// Equality against another value of possibly different type
    ///
    /// Values of different types are never the same. Two values that are
    /// not equal to themselves (a float NaN, or a struct holding one) are the
    /// same when their JSON encodings match.
    fn same_value(&self, other: &dyn FieldValue) -> bool;

    /// Clone into a new box
    fn clone_boxed(&self) -> Box<dyn FieldValue>;

    /// Upcast for downcasting by concrete type
    fn as_any(&self) -> &dyn Any;
}

impl<T> FieldValue for T
where
    T: Serialize + PartialEq + Clone + fmt::Debug + Send + Sync + 'static,
{
    fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    fn same_value(&self, other: &dyn FieldValue) -> bool {
        let Some(other) = other.as_any().downcast_ref::<T>() else {
            return false;
        };
        if other == self {
            return true;
        }

        // NaN-bearing values are unequal to themselves; compare their encodings.
        let reflexive = |value: &T| PartialEq::eq(value, value);
        !reflexive(self)
            && !reflexive(other)
            && matches!((self.to_json(), other.to_json()), (Ok(a), Ok(b)) if a == b)
    }

    fn clone_boxed(&self) -> Box<dyn FieldValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Clone for Box<dyn FieldValue> {
    fn clone(&self) -> Self {
        self.as_ref().clone_boxed()
    }
}

/// A domain type persisted through a [`Session`](crate::session::Session)
///
/// ```rust
/// use change_audit::entity::{Entity, FieldValue};
///
/// #[derive(Clone)]
/// struct Cliente {
///     id: Option<i64>,
///     nombre: String,
///     active: bool,
/// }
///
/// impl Entity for Cliente {
///     fn resource_type(&self) -> &str {
///         "Cliente"
///     }
///
///     fn primary_key(&self) -> Vec<Option<String>> {
///         vec![self.id.map(|id| id.to_string())]
///     }
///
///     fn fields(&self) -> Vec<(&'static str, Box<dyn FieldValue>)> {
///         vec![
///             ("id", Box::new(self.id)),
///             ("Nombre", Box::new(self.nombre.clone())),
///             ("Active", Box::new(self.active)),
///         ]
///     }
/// }
/// ```
pub trait Entity: Send + Sync + 'static {
    /// Resource type recorded in audit rows
    fn resource_type(&self) -> &str;

    /// Primary-key components in declared order, `None` where not yet known
    ///
    /// An empty vector means the type declares no primary key.
    fn primary_key(&self) -> Vec<Option<String>> {
        Vec::new()
    }

    /// Snapshot of every persistent field
    fn fields(&self) -> Vec<(&'static str, Box<dyn FieldValue>)>;
}

/// Old/new values of one field since the unit-of-work last flushed
#[derive(Debug, Clone, Default)]
pub struct FieldHistory {
    /// Value before the pending change, `None` if the field was not touched
    pub old: Option<Box<dyn FieldValue>>,
    /// Value after the pending change, `None` if the field was not touched
    pub new: Option<Box<dyn FieldValue>>,
}

impl FieldHistory {
    /// History of a field that was not touched
    pub fn untouched() -> Self {
        Self::default()
    }

    /// History of a touched field
    pub fn touched(old: Box<dyn FieldValue>, new: Box<dyn FieldValue>) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }

    /// Whether the field was touched at all
    pub fn is_touched(&self) -> bool {
        self.old.is_some() || self.new.is_some()
    }

    /// Whether old and new actually differ
    ///
    /// A field assigned its current value is touched but not changed.
    pub fn is_real_change(&self) -> bool {
        match (&self.old, &self.new) {
            (Some(old), Some(new)) => !old.same_value(new.as_ref()),
            (None, None) => false,
            _ => true,
        }
    }
}

/// One instance as seen by the unit-of-work
pub trait TrackedObject {
    /// Resource type recorded in audit rows
    fn resource_type(&self) -> &str;

    /// Concrete Rust type of the instance, used to recognise audit records
    fn entity_type(&self) -> TypeId;

    /// Primary-key components in declared order, as currently known
    fn primary_key(&self) -> Vec<Option<String>>;

    /// Current value of an attribute, if the object has it
    fn attribute(&self, name: &str) -> Option<Box<dyn FieldValue>>;

    /// Names of all persistent fields, in declaration order
    fn field_names(&self) -> Vec<String>;

    /// Pending change history for one field
    fn history(&self, field: &str) -> anyhow::Result<FieldHistory>;
}

/// A unit-of-work whose pending changes can be enumerated
///
/// The three sets are disjoint for any one flush.
pub trait ChangeTracked {
    /// Objects added in this unit-of-work and not yet persisted
    fn new_objects(&self) -> Vec<&dyn TrackedObject>;

    /// Persisted objects with pending in-place changes
    fn dirty_objects(&self) -> Vec<&dyn TrackedObject>;

    /// Persisted objects marked for deletion
    fn deleted_objects(&self) -> Vec<&dyn TrackedObject>;
}
