//! Actor attribution for a unit-of-work
//!
//! The actor is bound to the unit-of-work rather than to the request, so
//! batch jobs and other non-HTTP callers can attribute their changes too.

use serde::{Deserialize, Serialize};

/// Identity (human or system) attributed as the cause of a change
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    /// Stable actor identifier (user id, service account, job name)
    pub id: Option<String>,
    /// Display name
    pub username: Option<String>,
}

impl Actor {
    /// Create a fully identified actor
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            username: Some(username.into()),
        }
    }

    /// Actor for a background job or other system process
    pub fn system(job: impl Into<String>) -> Self {
        let job = job.into();
        Self {
            id: Some(format!("system:{job}")),
            username: Some(job),
        }
    }

    /// The actor reported when nothing was bound
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Whether any identity is present
    pub fn is_known(&self) -> bool {
        self.id.is_some() || self.username.is_some()
    }
}

/// Holds the actor bound to one unit-of-work
///
/// Created and dropped with its unit-of-work and never shared between
/// units-of-work. Reading an unbound binder yields [`Actor::unknown`].
#[derive(Debug, Clone, Default)]
pub struct ActorBinder {
    bound: Option<Actor>,
}

impl ActorBinder {
    /// Bind an actor, replacing any previous binding
    pub fn bind(&mut self, actor: Actor) {
        tracing::debug!(actor_id = ?actor.id, "Actor bound to unit-of-work");
        self.bound = Some(actor);
    }

    /// Remove the binding
    pub fn unbind(&mut self) -> Option<Actor> {
        self.bound.take()
    }

    /// The bound actor, or `None`
    pub fn bound(&self) -> Option<&Actor> {
        self.bound.as_ref()
    }

    /// The bound actor, or [`Actor::unknown`]
    pub fn current(&self) -> Actor {
        self.bound.clone().unwrap_or_else(Actor::unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbound_reads_unknown() {
        let binder = ActorBinder::default();
        assert!(binder.bound().is_none());
        assert_eq!(binder.current(), Actor::unknown());
        assert!(!binder.current().is_known());
    }

    #[test]
    fn test_bind_and_unbind() {
        let mut binder = ActorBinder::default();
        binder.bind(Actor::new("u-7", "maria"));
        assert_eq!(binder.current().username.as_deref(), Some("maria"));

        assert_eq!(binder.unbind(), Some(Actor::new("u-7", "maria")));
        assert_eq!(binder.current(), Actor::unknown());
    }

    #[test]
    fn test_system_actor() {
        let actor = Actor::system("nightly-import");
        assert_eq!(actor.id.as_deref(), Some("system:nightly-import"));
        assert_eq!(actor.username.as_deref(), Some("nightly-import"));
        assert!(actor.is_known());
    }
}
