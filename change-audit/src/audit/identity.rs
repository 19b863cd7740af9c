//! Resource id resolution

use super::encode;
use crate::entity::TrackedObject;

/// Separator between composite key components
pub const KEY_SEPARATOR: &str = "|";

/// Attribute names probed when the primary key is unknown, in order
pub const CONVENTIONAL_ID_ATTRIBUTES: [&str; 3] = ["id", "Id", "ID"];

/// Resolve the label identifying which record changed
///
/// The primary key as currently known wins: non-null components joined with
/// `|` in declared order. When every component is null (or no key is
/// declared), the attributes `id`, `Id`, `ID` and `{TypeName}Id` are probed
/// and the first non-null one is used. Otherwise the id is `None`.
pub fn resolve_resource_id(object: &dyn TrackedObject) -> Option<String> {
    let components: Vec<String> = object.primary_key().into_iter().flatten().collect();
    if !components.is_empty() {
        return Some(components.join(KEY_SEPARATOR));
    }

    let type_attribute = format!("{}Id", object.resource_type());
    CONVENTIONAL_ID_ATTRIBUTES
        .iter()
        .copied()
        .chain(std::iter::once(type_attribute.as_str()))
        .find_map(|name| {
            object
                .attribute(name)
                .and_then(|value| encode::key_text(value.as_ref()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{FieldHistory, FieldValue};
    use std::any::TypeId;

    struct Shape {
        key: Vec<Option<String>>,
        attributes: Vec<(&'static str, Box<dyn FieldValue>)>,
    }

    impl TrackedObject for Shape {
        fn resource_type(&self) -> &str {
            "Factura"
        }

        fn entity_type(&self) -> TypeId {
            TypeId::of::<Shape>()
        }

        fn primary_key(&self) -> Vec<Option<String>> {
            self.key.clone()
        }

        fn attribute(&self, name: &str) -> Option<Box<dyn FieldValue>> {
            self.attributes
                .iter()
                .find(|(attribute, _)| *attribute == name)
                .map(|(_, value)| value.clone())
        }

        fn field_names(&self) -> Vec<String> {
            self.attributes.iter().map(|(name, _)| name.to_string()).collect()
        }

        fn history(&self, _field: &str) -> anyhow::Result<FieldHistory> {
            Ok(FieldHistory::untouched())
        }
    }

    fn keyed(key: Vec<Option<&str>>) -> Shape {
        Shape {
            key: key.into_iter().map(|c| c.map(str::to_string)).collect(),
            attributes: Vec::new(),
        }
    }

    #[test]
    fn test_composite_key_joined_in_order() {
        assert_eq!(
            resolve_resource_id(&keyed(vec![Some("1"), Some("2")])).as_deref(),
            Some("1|2")
        );
    }

    #[test]
    fn test_null_components_skipped() {
        assert_eq!(
            resolve_resource_id(&keyed(vec![Some("1"), None])).as_deref(),
            Some("1")
        );
        assert_eq!(
            resolve_resource_id(&keyed(vec![None, Some("2")])).as_deref(),
            Some("2")
        );
    }

    #[test]
    fn test_single_key() {
        assert_eq!(
            resolve_resource_id(&keyed(vec![Some("42")])).as_deref(),
            Some("42")
        );
    }

    #[test]
    fn test_fallback_probes_conventional_names_in_order() {
        let shape = Shape {
            key: vec![None],
            attributes: vec![
                ("ID", Box::new(9_i64)),
                ("Id", Box::new(None::<i64>)),
                ("FacturaId", Box::new("F-1".to_string())),
            ],
        };
        assert_eq!(resolve_resource_id(&shape).as_deref(), Some("9"));
    }

    #[test]
    fn test_fallback_type_named_attribute() {
        let shape = Shape {
            key: Vec::new(),
            attributes: vec![("FacturaId", Box::new("F-1".to_string()))],
        };
        assert_eq!(resolve_resource_id(&shape).as_deref(), Some("F-1"));
    }

    #[test]
    fn test_unresolvable_is_none() {
        let shape = Shape {
            key: vec![None, None],
            attributes: vec![("id", Box::new(None::<String>))],
        };
        assert_eq!(resolve_resource_id(&shape), None);
    }
}
