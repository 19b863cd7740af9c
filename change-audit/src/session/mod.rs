//! Unit-of-work sessions
//!
//! A [`Session`] tracks the entities a piece of work adds, modifies and
//! deletes, and writes them in one store transaction. Before each flush it
//! runs the [`FlushListener`]s registered on its [`SessionFactory`]; rows they
//! enroll are written into the same transaction, so they commit and roll back
//! together with the business rows.
//!
//! ```rust,no_run
//! use change_audit::prelude::*;
//!
//! # #[derive(Clone, serde::Deserialize)]
//! # struct Cliente { id: i64, nombre: String }
//! # impl Entity for Cliente {
//! #     fn resource_type(&self) -> &str { "Cliente" }
//! #     fn primary_key(&self) -> Vec<Option<String>> { vec![Some(self.id.to_string())] }
//! #     fn fields(&self) -> Vec<(&'static str, Box<dyn FieldValue>)> {
//! #         vec![("id", Box::new(self.id)), ("Nombre", Box::new(self.nombre.clone()))]
//! #     }
//! # }
//! # async fn example() -> change_audit::Result<()> {
//! let factory = SessionFactory::new(std::sync::Arc::new(MemoryStore::new()))
//!     .with_change_capture(AuditConfig::default());
//!
//! let mut session = factory.session();
//! let cliente = session.add(Cliente { id: 7, nombre: "Juan".to_string() });
//! session.commit().await?;
//!
//! session.modify(cliente, |c| c.nombre = "Juan Pablo".to_string())?;
//! session.commit().await?;
//! # Ok(())
//! # }
//! ```

mod listener;
mod tracked;

pub use listener::{FlushListener, PendingFlush, SessionInfo};

use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

use crate::actor::Actor;
use crate::audit::{resolve_resource_id, AuditLogEntry, ChangeCaptureEngine, FlushDiagnostics};
use crate::config::{AuditConfig, Config};
use crate::entity::Entity;
use crate::error::{CaptureError, Error, Result};
use crate::storage::{self, EntityRow, Store, StoreTransaction};
use tracked::{ObjectState, Tracked, TrackedView};

/// Opens sessions against one store with one set of flush listeners
#[derive(Clone)]
pub struct SessionFactory {
    store: Arc<dyn Store>,
    listeners: Arc<[Arc<dyn FlushListener>]>,
}

impl SessionFactory {
    /// Factory without listeners
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            listeners: Arc::from(Vec::new()),
        }
    }

    /// Register a listener, run after those registered before it
    pub fn with_listener(mut self, listener: impl FlushListener + 'static) -> Self {
        let mut listeners = self.listeners.to_vec();
        listeners.push(Arc::new(listener));
        self.listeners = listeners.into();
        self
    }

    /// Register the change capture engine
    pub fn with_change_capture(self, config: AuditConfig) -> Self {
        self.with_listener(ChangeCaptureEngine::new(config))
    }

    /// Open the configured store and register the change capture engine
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = storage::open(&config.store).await?;
        tracing::info!(
            backend = store.backend(),
            audit_enabled = config.audit.enabled,
            "Session factory ready"
        );
        Ok(Self::new(store).with_change_capture(config.audit.clone()))
    }

    /// Store shared by every session of this factory
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// Names of the registered listeners, in run order
    pub fn listener_names(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.name().to_string()).collect()
    }

    /// Open a new, empty unit-of-work
    pub fn session(&self) -> Session {
        Session {
            store: Arc::clone(&self.store),
            listeners: Arc::clone(&self.listeners),
            objects: Vec::new(),
            info: SessionInfo::default(),
            transaction: None,
            enrolled_since_commit: 0,
        }
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("backend", &self.store.backend())
            .field("listeners", &self.listener_names())
            .finish()
    }
}

/// Typed reference to an object tracked by one [`Session`]
pub struct EntityHandle<T> {
    index: usize,
    _entity: PhantomData<fn() -> T>,
}

impl<T> EntityHandle<T> {
    fn new(index: usize) -> Self {
        Self {
            index,
            _entity: PhantomData,
        }
    }
}

impl<T> Clone for EntityHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for EntityHandle<T> {}

impl<T> fmt::Debug for EntityHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityHandle<{}>({})", std::any::type_name::<T>(), self.index)
    }
}

/// One unit-of-work
///
/// Not shared between tasks. Dropping a session with an open transaction
/// discards its uncommitted writes.
pub struct Session {
    store: Arc<dyn Store>,
    listeners: Arc<[Arc<dyn FlushListener>]>,
    objects: Vec<Tracked>,
    info: SessionInfo,
    transaction: Option<Box<dyn StoreTransaction>>,
    enrolled_since_commit: usize,
}

impl Session {
    /// Track a new object, written as a create on the next flush
    pub fn add<T: Entity + Clone>(&mut self, entity: T) -> EntityHandle<T> {
        self.track(Tracked::pending(entity))
    }

    /// Track an object that already has a stored row
    pub fn attach<T: Entity + Clone>(&mut self, entity: T) -> EntityHandle<T> {
        let mut tracked = Tracked::persistent(entity, None);
        tracked.row_key = resolve_resource_id(&tracked);
        self.track(tracked)
    }

    /// Load a committed row and track it
    pub async fn load<T>(&mut self, resource_type: &str, key: &str) -> Result<Option<EntityHandle<T>>>
    where
        T: Entity + Clone + DeserializeOwned,
    {
        let Some(row) = self.store.load_row(resource_type, key).await? else {
            return Ok(None);
        };
        let entity: T = serde_json::from_value(row.data)?;
        Ok(Some(self.track(Tracked::persistent(entity, Some(row.key)))))
    }

    fn track<T>(&mut self, tracked: Tracked) -> EntityHandle<T> {
        self.objects.push(tracked);
        EntityHandle::new(self.objects.len() - 1)
    }

    /// Current value of a tracked object
    ///
    /// `None` once the object is deleted or detached.
    pub fn get<T: Entity>(&self, handle: EntityHandle<T>) -> Option<&T> {
        let tracked = self.objects.get(handle.index)?;
        match tracked.state {
            ObjectState::Pending | ObjectState::Persistent => {
                tracked.object.as_any().downcast_ref::<T>()
            }
            ObjectState::Deleted | ObjectState::Removed | ObjectState::Detached => None,
        }
    }

    /// Change a tracked object in place
    pub fn modify<T: Entity, R>(
        &mut self,
        handle: EntityHandle<T>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        let tracked = self.slot(handle.index)?;
        match tracked.state {
            ObjectState::Pending => {}
            ObjectState::Persistent if AuditLogEntry::is_audit_type(tracked.entity_type) => {
                return Err(Error::InvalidState(
                    "stored audit rows are append-only".to_string(),
                ));
            }
            ObjectState::Persistent => tracked.dirty = true,
            state => {
                return Err(Error::InvalidState(format!(
                    "cannot modify an object in state {state:?}"
                )));
            }
        }

        let object = tracked
            .object
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| Error::InvalidState("entity handle type mismatch".to_string()))?;
        Ok(f(object))
    }

    /// Mark a tracked object for deletion
    ///
    /// An object that was never flushed is simply forgotten.
    pub fn delete<T: Entity>(&mut self, handle: EntityHandle<T>) -> Result<()> {
        let tracked = self.slot(handle.index)?;
        match tracked.state {
            ObjectState::Pending => tracked.state = ObjectState::Detached,
            ObjectState::Persistent if AuditLogEntry::is_audit_type(tracked.entity_type) => {
                return Err(Error::InvalidState(
                    "stored audit rows are append-only".to_string(),
                ));
            }
            ObjectState::Persistent => tracked.state = ObjectState::Deleted,
            ObjectState::Deleted => {}
            state => {
                return Err(Error::InvalidState(format!(
                    "cannot delete an object in state {state:?}"
                )));
            }
        }
        Ok(())
    }

    fn slot(&mut self, index: usize) -> Result<&mut Tracked> {
        self.objects
            .get_mut(index)
            .ok_or_else(|| Error::InvalidState(format!("no tracked object at {index}")))
    }

    /// Attribute every following change of this session to `actor`
    pub fn bind_actor(&mut self, actor: Actor) {
        self.info.actor_mut().bind(actor);
    }

    /// Side-channel of this session
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Mutable side-channel of this session
    pub fn info_mut(&mut self) -> &mut SessionInfo {
        &mut self.info
    }

    /// Faults absorbed by listeners during the most recent flush
    pub fn diagnostics(&self) -> &FlushDiagnostics {
        self.info.diagnostics()
    }

    /// Whether the next flush has anything to write
    pub fn has_pending_changes(&self) -> bool {
        TrackedView::new(&self.objects).has_changes()
    }

    /// Whether a store transaction is open
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Run listeners and write pending changes into the open transaction
    ///
    /// Opens a transaction if none is open. Nothing becomes durable until
    /// [`Session::commit`]. On error the session must be rolled back.
    pub async fn flush(&mut self) -> Result<()> {
        let flush_id = self.info.begin_flush();
        let audit_rows = self.run_listeners(flush_id);

        if !self.has_pending_changes() && audit_rows.is_empty() {
            tracing::trace!(%flush_id, "Nothing to flush");
            return Ok(());
        }

        if self.transaction.is_none() {
            self.transaction = Some(self.store.begin().await?);
        }

        match self.write_pending(audit_rows).await {
            Ok((objects, audit_rows)) => {
                self.enrolled_since_commit += audit_rows;
                tracing::debug!(%flush_id, objects, audit_rows, "Flush written");
                Ok(())
            }
            Err(err) => {
                tracing::error!(%flush_id, error = %err, "Flush failed");
                Err(err)
            }
        }
    }

    fn run_listeners(&mut self, flush_id: Uuid) -> Vec<AuditLogEntry> {
        let mut enrolled = Vec::new();
        let view = TrackedView::new(&self.objects);

        for listener in self.listeners.iter() {
            let mut flush = PendingFlush::new(&view, &mut self.info, &mut enrolled);
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| listener.before_flush(&mut flush)));

            if let Err(payload) = outcome {
                let err = CaptureError::from_panic(payload);
                tracing::warn!(
                    %flush_id,
                    listener = listener.name(),
                    error = %err,
                    "Flush listener panicked, continuing"
                );
                self.info.diagnostics_mut().record(flush_id, None, &err);
            }
        }

        enrolled
    }

    async fn write_pending(&mut self, audit_rows: Vec<AuditLogEntry>) -> Result<(usize, usize)> {
        let tx = self
            .transaction
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no open transaction".to_string()))?;
        let mut objects = 0;

        for tracked in self.objects.iter_mut() {
            match tracked.state {
                ObjectState::Pending => {
                    if AuditLogEntry::is_audit_type(tracked.entity_type) {
                        if let Some(entry) = tracked.object.as_any().downcast_ref::<AuditLogEntry>() {
                            tx.insert_audit(entry).await?;
                        }
                    } else {
                        tx.upsert(&entity_row(tracked)).await?;
                    }
                    tracked.state = ObjectState::Persistent;
                    tracked.mark_flushed();
                }
                ObjectState::Persistent if tracked.dirty => {
                    tx.upsert(&entity_row(tracked)).await?;
                    tracked.mark_flushed();
                }
                ObjectState::Deleted => {
                    if let Some(key) = tracked.row_key.clone().or_else(|| resolve_resource_id(&*tracked)) {
                        tx.remove(tracked.object.resource_type(), &key).await?;
                    }
                    tracked.state = ObjectState::Removed;
                }
                _ => continue,
            }
            objects += 1;
        }

        let enrolled = audit_rows.len();
        for entry in &audit_rows {
            tx.insert_audit(entry).await?;
        }

        Ok((objects, enrolled))
    }

    /// Flush, then make every write of this unit-of-work durable
    ///
    /// If the flush or the commit fails, the transaction is rolled back and
    /// the session returns to its last committed state.
    pub async fn commit(&mut self) -> Result<()> {
        if let Err(err) = self.flush().await {
            self.discard().await;
            return Err(err);
        }

        if let Some(mut tx) = self.transaction.take() {
            if let Err(err) = tx.commit().await {
                tracing::error!(error = %err, "Commit failed, discarding unit-of-work changes");
                self.discard().await;
                return Err(err);
            }
        }

        for tracked in self.objects.iter_mut() {
            tracked.mark_committed();
        }

        tracing::info!(
            backend = self.store.backend(),
            audit_rows = self.enrolled_since_commit,
            "Unit-of-work committed"
        );
        self.enrolled_since_commit = 0;
        Ok(())
    }

    /// Discard the open transaction and every uncommitted change
    ///
    /// Objects added since the last commit become detached.
    pub async fn rollback(&mut self) -> Result<()> {
        let result = match self.transaction.take() {
            Some(mut tx) => tx.rollback().await,
            None => Ok(()),
        };
        self.restore();
        tracing::debug!(discarded_audit_rows = self.enrolled_since_commit, "Unit-of-work rolled back");
        self.enrolled_since_commit = 0;
        result
    }

    async fn discard(&mut self) {
        if let Err(err) = self.rollback().await {
            tracing::error!(error = %err, "Rollback after failed commit also failed");
        }
    }

    fn restore(&mut self) {
        for tracked in self.objects.iter_mut() {
            tracked.restore();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.store.backend())
            .field("objects", &self.objects.len())
            .field("in_transaction", &self.transaction.is_some())
            .finish()
    }
}

/// Business row for a tracked object, assigning a row key on first write
fn entity_row(tracked: &mut Tracked) -> EntityRow {
    let key = match &tracked.row_key {
        Some(key) => key.clone(),
        None => {
            let key = resolve_resource_id(&*tracked).unwrap_or_else(|| Uuid::now_v7().to_string());
            tracked.row_key = Some(key.clone());
            key
        }
    };

    EntityRow {
        resource_type: tracked.object.resource_type().to_string(),
        key,
        data: tracked.encode_fields(),
    }
}
