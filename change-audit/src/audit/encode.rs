//! Failure-tolerant JSON encoding
//!
//! Every function here returns a value; none of them can fail. A value that
//! does not serialize degrades to its `Debug` text, and a value whose `Debug`
//! text cannot be produced degrades to a neutral payload (`null`, or `{}` for
//! change sets).

use serde_json::Value;
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};

use super::record::{ChangeSet, FieldChange};
use crate::entity::FieldValue;

/// Neutral payload for an unencodable change set
pub const EMPTY_CHANGES: &str = "{}";

/// Encode one field value
pub fn encode_value(value: &dyn FieldValue) -> Value {
    match value.to_json() {
        Ok(json) => json,
        Err(err) => {
            tracing::debug!(error = %err, "Field value not serializable, using debug text");
            debug_text(value).map(Value::String).unwrap_or(Value::Null)
        }
    }
}

/// Encode an optional field value, `None` as `null`
pub fn encode_optional(value: Option<&dyn FieldValue>) -> Value {
    value.map(encode_value).unwrap_or(Value::Null)
}

/// Build the change entry for one field
pub fn field_change(old: Option<&dyn FieldValue>, new: Option<&dyn FieldValue>) -> FieldChange {
    FieldChange {
        old: encode_optional(old),
        new: encode_optional(new),
    }
}

/// Render a change set as `changes_json` text
pub fn encode_changes(changes: &ChangeSet) -> String {
    serde_json::to_string(changes).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "Change set not serializable, storing empty payload");
        EMPTY_CHANGES.to_string()
    })
}

/// Render an already-structured JSON value as text
pub fn to_json_text(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| Value::Null.to_string())
}

/// Render a key component: strings as-is, scalars by their JSON text
///
/// Returns `None` for a null value.
pub fn key_text(value: &dyn FieldValue) -> Option<String> {
    match encode_value(value) {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(to_json_text(&other)),
    }
}

fn debug_text(value: &dyn FieldValue) -> Option<String> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        let mut text = String::new();
        write!(text, "{value:?}").ok().map(|_| text)
    }))
    .ok()
    .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fmt;

    #[derive(Clone, PartialEq, serde::Serialize)]
    struct Opaque;

    impl fmt::Debug for Opaque {
        fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
            Err(fmt::Error)
        }
    }

    #[derive(Clone, PartialEq)]
    struct Hostile;

    impl serde::Serialize for Hostile {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refuses to serialize"))
        }
    }

    impl fmt::Debug for Hostile {
        fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
            Err(fmt::Error)
        }
    }

    #[test]
    fn test_structured_values_encode_directly() {
        assert_eq!(encode_value(&"Juan".to_string()), Value::from("Juan"));
        assert_eq!(encode_value(&Some(7_i64)), Value::from(7));
        assert_eq!(encode_value(&None::<i64>), Value::Null);
        assert_eq!(encode_value(&Opaque), Value::Null);
    }

    #[test]
    fn test_unencodable_value_degrades_to_debug_text() {
        let mut tuple_keys = HashMap::new();
        tuple_keys.insert((1_u8, 2_u8), 3_u8);

        let encoded = encode_value(&tuple_keys);
        assert_eq!(encoded, Value::String("{(1, 2): 3}".to_string()));
    }

    #[test]
    fn test_unrenderable_value_degrades_to_null() {
        assert_eq!(encode_value(&Hostile), Value::Null);
    }

    #[test]
    fn test_changes_round_trip() {
        let mut changes = ChangeSet::new();
        changes.insert(
            "Nombre".to_string(),
            field_change(Some(&"A".to_string()), Some(&"B".to_string())),
        );

        let text = encode_changes(&changes);
        let decoded: ChangeSet = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, changes);

        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw, serde_json::json!({"Nombre": {"old": "A", "new": "B"}}));
    }

    #[test]
    fn test_key_text() {
        assert_eq!(key_text(&42_i64).as_deref(), Some("42"));
        assert_eq!(key_text(&"abc".to_string()).as_deref(), Some("abc"));
        assert_eq!(key_text(&None::<i64>), None);
        assert_eq!(key_text(&true).as_deref(), Some("true"));
    }
}
