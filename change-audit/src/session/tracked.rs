//! Identity map entries and the change-tracking view over them

use std::any::{Any, TypeId};

use crate::audit::encode;
use crate::entity::{ChangeTracked, Entity, FieldHistory, FieldValue, TrackedObject};

/// Object-safe clone and downcast support for entities held by a session
pub(crate) trait AnyEntity: Entity {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clone_entity(&self) -> Box<dyn AnyEntity>;
}

impl<T: Entity + Clone> AnyEntity for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_entity(&self) -> Box<dyn AnyEntity> {
        Box::new(self.clone())
    }
}

/// Lifecycle of one identity map entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectState {
    /// Added, not yet flushed
    Pending,
    /// Has a stored row
    Persistent,
    /// Marked for deletion, not yet flushed
    Deleted,
    /// Deletion flushed
    Removed,
    /// No longer tracked
    Detached,
}

/// One identity map entry
pub(crate) struct Tracked {
    pub(crate) entity_type: TypeId,
    pub(crate) object: Box<dyn AnyEntity>,
    pub(crate) state: ObjectState,
    pub(crate) dirty: bool,
    /// Object as of the last flush (or attach)
    pub(crate) flushed: Option<Box<dyn AnyEntity>>,
    /// Lifecycle and object as of the last commit (or attach)
    pub(crate) committed: Option<(ObjectState, Box<dyn AnyEntity>)>,
    /// Key of the stored business row
    pub(crate) row_key: Option<String>,
}

impl Tracked {
    pub(crate) fn pending<T: Entity + Clone>(entity: T) -> Self {
        Self {
            entity_type: TypeId::of::<T>(),
            object: Box::new(entity),
            state: ObjectState::Pending,
            dirty: false,
            flushed: None,
            committed: None,
            row_key: None,
        }
    }

    pub(crate) fn persistent<T: Entity + Clone>(entity: T, row_key: Option<String>) -> Self {
        let snapshot = entity.clone_entity();
        Self {
            entity_type: TypeId::of::<T>(),
            committed: Some((ObjectState::Persistent, snapshot.clone_entity())),
            flushed: Some(snapshot),
            object: Box::new(entity),
            state: ObjectState::Persistent,
            dirty: false,
            row_key,
        }
    }

    /// Record the current object as flushed
    pub(crate) fn mark_flushed(&mut self) {
        self.flushed = Some(self.object.clone_entity());
        self.dirty = false;
    }

    /// Record the current lifecycle and object as committed
    pub(crate) fn mark_committed(&mut self) {
        self.committed = match self.state {
            ObjectState::Detached => None,
            state => Some((state, self.object.clone_entity())),
        };
    }

    /// Return to the last committed state
    pub(crate) fn restore(&mut self) {
        match &self.committed {
            Some((state, snapshot)) => {
                self.object = snapshot.clone_entity();
                self.flushed = Some(snapshot.clone_entity());
                self.state = *state;
            }
            None => {
                self.flushed = None;
                self.state = ObjectState::Detached;
            }
        }
        self.dirty = false;
    }

    /// Persistent fields encoded as a JSON object
    pub(crate) fn encode_fields(&self) -> serde_json::Value {
        let fields = self
            .object
            .fields()
            .into_iter()
            .map(|(name, value)| (name.to_string(), encode::encode_value(value.as_ref())))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(fields)
    }
}

fn find_field(entity: &dyn AnyEntity, name: &str) -> Option<Box<dyn FieldValue>> {
    entity
        .fields()
        .into_iter()
        .find(|(field, _)| *field == name)
        .map(|(_, value)| value)
}

impl TrackedObject for Tracked {
    fn resource_type(&self) -> &str {
        self.object.resource_type()
    }

    fn entity_type(&self) -> TypeId {
        self.entity_type
    }

    fn primary_key(&self) -> Vec<Option<String>> {
        self.object.primary_key()
    }

    fn attribute(&self, name: &str) -> Option<Box<dyn FieldValue>> {
        find_field(self.object.as_ref(), name)
    }

    fn field_names(&self) -> Vec<String> {
        self.object
            .fields()
            .into_iter()
            .map(|(name, _)| name.to_string())
            .collect()
    }

    fn history(&self, field: &str) -> anyhow::Result<FieldHistory> {
        let baseline = self
            .flushed
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("object has no flushed state"))?;
        let old = find_field(baseline, field)
            .ok_or_else(|| anyhow::anyhow!("field '{field}' missing from flushed state"))?;
        let new = find_field(self.object.as_ref(), field)
            .ok_or_else(|| anyhow::anyhow!("field '{field}' missing from object"))?;

        if old.same_value(new.as_ref()) {
            Ok(FieldHistory::untouched())
        } else {
            Ok(FieldHistory::touched(old, new))
        }
    }
}

/// [`ChangeTracked`] view over a session's identity map
pub(crate) struct TrackedView<'a> {
    objects: &'a [Tracked],
}

impl<'a> TrackedView<'a> {
    pub(crate) fn new(objects: &'a [Tracked]) -> Self {
        Self { objects }
    }

    fn select(&self, keep: impl Fn(&Tracked) -> bool) -> Vec<&dyn TrackedObject> {
        self.objects
            .iter()
            .filter(|tracked| keep(tracked))
            .map(|tracked| tracked as &dyn TrackedObject)
            .collect()
    }

    /// Whether a flush has anything to write
    pub(crate) fn has_changes(&self) -> bool {
        self.objects.iter().any(|tracked| {
            matches!(tracked.state, ObjectState::Pending | ObjectState::Deleted)
                || (tracked.state == ObjectState::Persistent && tracked.dirty)
        })
    }
}

impl ChangeTracked for TrackedView<'_> {
    fn new_objects(&self) -> Vec<&dyn TrackedObject> {
        self.select(|tracked| tracked.state == ObjectState::Pending)
    }

    fn dirty_objects(&self) -> Vec<&dyn TrackedObject> {
        self.select(|tracked| tracked.state == ObjectState::Persistent && tracked.dirty)
    }

    fn deleted_objects(&self) -> Vec<&dyn TrackedObject> {
        self.select(|tracked| tracked.state == ObjectState::Deleted)
    }
}
