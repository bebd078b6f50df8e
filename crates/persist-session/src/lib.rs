//! Unit-of-work session for persist.
//!
//! `persist-session` is the **persistence context**. One [`Session`] is one
//! unit of work against a [`Storage`] engine:
//!
//! - **Identity map**: at most one managed instance per table and key.
//! - **Change tracking**: snapshots taken at load are diffed at flush, so
//!   mutating a managed entity is enough to have it written.
//! - **Lazy references**: [`Lazy`](persist_core::Lazy) fields are resolved
//!   on demand through the identity map, or joined eagerly by a query.
//! - **Bulk operations**: set-based writes that bypass the context, followed
//!   by eviction of the affected table.
//! - **Locks**: pessimistic row locks held until commit or discard.
//! - **Auditing**: creation and modification stamps written at flush.
//!
//! Every storage-touching operation takes a `&Cx` and returns an
//! [`Outcome`], so cancellation propagates the way it does everywhere else
//! in the asupersync stack.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::begin(&cx, Arc::clone(&storage)).await.unwrap();
//!
//! let team = session.persist(Team::new(None, "teamA"))?;
//! let member = session.persist(Member::new(None, "member1", 10, Some(&team)))?;
//! session.flush(&cx).await.unwrap();
//!
//! // same instance, no fetch
//! let id = read_model(&member).id.unwrap();
//! let again = session.find::<Member>(&cx, id).await.unwrap().unwrap();
//!
//! write_model(&member).age = 11;   // written at commit
//! session.commit(&cx).await.unwrap();
//! ```

/// Unwrap an `Outcome`, returning early from the enclosing async body on
/// anything but `Ok`.
macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            ::asupersync::Outcome::Ok(v) => v,
            ::asupersync::Outcome::Err(e) => return ::asupersync::Outcome::Err(e),
            ::asupersync::Outcome::Cancelled(r) => return ::asupersync::Outcome::Cancelled(r),
            ::asupersync::Outcome::Panicked(p) => return ::asupersync::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`.
macro_rules! try_result {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return ::asupersync::Outcome::Err(e),
        }
    };
}

pub mod audit;
pub mod bulk;
pub mod change_tracker;
pub mod config;
mod executor;
pub mod flush;
pub mod identity_map;
mod lazy;
pub mod lock;
pub mod n1_detection;

#[cfg(test)]
mod fixtures;

pub use audit::{AuditInterceptor, Clock, CurrentActorProvider, FixedActor, FixedClock, NoActor, SystemClock};
pub use bulk::{BulkMutation, InvalidationMode};
pub use change_tracker::{ChangeTracker, DirtyEntity, ObjectSnapshot};
pub use config::SessionConfig;
pub use executor::Fetched;
pub use flush::FlushResult;
pub use identity_map::{IdentityMap, ObjectKey};
pub use lock::LockCoordinator;
pub use n1_detection::{CallSite, N1QueryTracker, N1Stats};

use asupersync::{Cx, Outcome};
use persist_core::{
    EntityRegistry, Error, Managed, ManagedEntity, Model, ModelRef, Result, Row, Value, adopt_row,
};
use persist_query::{Storage, UnitId};
use std::collections::HashSet;
use std::sync::Arc;

/// One unit of work.
///
/// Dropping a session without [`commit`](Session::commit) or
/// [`discard`](Session::discard) abandons the storage unit and releases its
/// locks.
pub struct Session<S: Storage> {
    storage: Arc<S>,
    unit: UnitId,
    config: SessionConfig,
    identity_map: IdentityMap,
    tracker: ChangeTracker,
    /// Entities to insert at the next flush, in persist order
    pending_insert: Vec<Arc<dyn ManagedEntity>>,
    /// Managed entities to delete at the next flush
    pending_delete: Vec<ObjectKey>,
    locks: LockCoordinator,
    /// Tables bulk-mutated without eviction
    stale_tables: HashSet<&'static str>,
    audit: AuditInterceptor,
    n1_tracker: Option<N1QueryTracker>,
    finished: bool,
}

impl<S: Storage> Session<S> {
    /// Open a unit of work with the default configuration, no actor and the
    /// system clock.
    pub async fn begin(cx: &Cx, storage: Arc<S>) -> Outcome<Self, Error> {
        Self::begin_with(cx, storage, SessionConfig::default(), AuditInterceptor::default()).await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn begin_with(
        cx: &Cx,
        storage: Arc<S>,
        config: SessionConfig,
        audit: AuditInterceptor,
    ) -> Outcome<Self, Error> {
        let unit = try_outcome!(storage.begin_unit(cx).await);
        tracing::debug!(%unit, auto_flush = config.auto_flush, "unit of work started");
        Outcome::Ok(Self {
            storage,
            unit,
            locks: LockCoordinator::new(config.lock_timeout),
            n1_tracker: config.n1_threshold.map(N1QueryTracker::new),
            config,
            identity_map: IdentityMap::new(),
            tracker: ChangeTracker::new(),
            pending_insert: Vec::new(),
            pending_delete: Vec::new(),
            stale_tables: HashSet::new(),
            audit,
            finished: false,
        })
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flush, then make the unit durable. Locks are released either way.
    ///
    /// A failed flush has already aborted the unit, so nothing is committed.
    #[tracing::instrument(level = "debug", skip_all, fields(unit = %self.unit))]
    pub async fn commit(mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let flushed = try_outcome!(self.flush(cx).await);

        let committed = self.storage.commit(cx, self.unit).await;
        if !matches!(committed, Outcome::Ok(())) {
            self.storage.abandon_unit(self.unit);
        }
        let released = self.end_unit();
        match committed {
            Outcome::Ok(()) => {
                tracing::info!(
                    unit = %self.unit,
                    inserted = flushed.inserted,
                    updated = flushed.updated,
                    deleted = flushed.deleted,
                    locks_released = released,
                    "unit of work committed"
                );
                Outcome::Ok(flushed)
            }
            other => map_outcome(other, |()| flushed),
        }
    }

    /// Drop every unflushed change and every staged write of the unit.
    #[tracing::instrument(level = "debug", skip_all, fields(unit = %self.unit))]
    pub async fn discard(mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.finished {
            tracing::debug!(unit = %self.unit, "discarding an aborted unit; nothing left to drop");
            return Outcome::Ok(());
        }
        let dropped = self.pending_insert.len() + self.pending_delete.len();
        let result = self.storage.discard(cx, self.unit).await;
        if !matches!(result, Outcome::Ok(())) {
            self.storage.abandon_unit(self.unit);
        }
        let released = self.end_unit();
        tracing::info!(unit = %self.unit, dropped, locks_released = released, "unit of work discarded");
        result
    }

    /// Clear all in-memory state after the storage unit ended.
    fn end_unit(&mut self) -> usize {
        self.finished = true;
        self.identity_map.evict_all();
        self.tracker.clear_all();
        self.pending_insert.clear();
        self.pending_delete.clear();
        self.stale_tables.clear();
        self.locks.release_all()
    }

    /// Abandon the storage unit after a lock or storage failure.
    ///
    /// Everything the unit staged is dropped and its locks are released.
    /// Every later operation fails with `Aborted`.
    fn abort(&mut self, cause: &str) {
        if self.finished {
            return;
        }
        self.storage.abandon_unit(self.unit);
        let released = self.end_unit();
        tracing::warn!(unit = %self.unit, cause, locks_released = released, "unit of work aborted");
    }

    /// Pass `outcome` through, aborting the unit when it is an error.
    fn abort_on_err<T>(&mut self, outcome: Outcome<T, Error>) -> Outcome<T, Error> {
        if let Outcome::Err(e) = &outcome {
            let cause = e.to_string();
            self.abort(&cause);
        }
        outcome
    }

    #[allow(clippy::result_large_err)]
    fn ensure_active(&self) -> Result<()> {
        if self.finished {
            Err(Error::unit_aborted(self.unit))
        } else {
            Ok(())
        }
    }

    /// Whether a lock or storage failure ended this unit of work.
    pub fn is_aborted(&self) -> bool {
        self.finished
    }

    // ========================================================================
    // Entity Operations
    // ========================================================================

    /// Make a transient entity managed; it is inserted at the next flush.
    ///
    /// An entity that already carries its key is registered in the identity
    /// map immediately, one with a generated key once flush assigns it.
    #[allow(clippy::result_large_err)]
    pub fn persist<M: Model>(&mut self, model: M) -> Result<ModelRef<M>> {
        self.ensure_active()?;
        let managed = Managed::new(model);
        let handle = managed.handle();
        let entity: Arc<dyn ManagedEntity> = Arc::new(managed);
        if !entity.is_new() {
            self.identity_map.register(Arc::clone(&entity))?;
        }
        tracing::debug!(table = M::TABLE_NAME, pending = self.pending_insert.len() + 1, "entity persisted");
        self.pending_insert.push(entity);
        Ok(handle)
    }

    /// Schedule a managed entity for deletion at the next flush.
    ///
    /// Removing an entity that was persisted but not yet flushed simply
    /// cancels the insert.
    #[allow(clippy::result_large_err)]
    pub fn remove<M: Model>(&mut self, entity: &ModelRef<M>) -> Result<()> {
        self.ensure_active()?;
        let view = Managed::from_ref(Arc::clone(entity));
        if let Some(pos) = self.pending_insert.iter().position(|e| e.same_instance(&view)) {
            let cancelled = self.pending_insert.remove(pos);
            if let Some(key) = self.identity_map.key_of(&*cancelled) {
                self.identity_map.evict(&key);
            }
            return Ok(());
        }
        match self.identity_map.key_of(&view) {
            Some(key) => {
                if !self.pending_delete.contains(&key) {
                    self.pending_delete.push(key);
                }
                Ok(())
            }
            None => Err(Error::Custom(format!(
                "{} entity is not managed by this session",
                M::TABLE_NAME
            ))),
        }
    }

    /// Look up an entity by single-column primary key.
    pub async fn find<M: Model>(
        &mut self,
        cx: &Cx,
        pk: impl Into<Value>,
    ) -> Outcome<Option<ModelRef<M>>, Error> {
        self.find_by_key::<M>(cx, vec![pk.into()]).await
    }

    /// Look up an entity by primary key, consulting the identity map first.
    ///
    /// A hit returns the managed instance unchanged without touching
    /// storage. Entities scheduled for deletion are not found.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(table = M::TABLE_NAME))]
    pub async fn find_by_key<M: Model>(
        &mut self,
        cx: &Cx,
        pk: Vec<Value>,
    ) -> Outcome<Option<ModelRef<M>>, Error> {
        try_result!(self.ensure_active());
        if self.pending_delete.contains(&ObjectKey::of::<M>(&pk)) {
            return Outcome::Ok(None);
        }
        if let Some(hit) = try_result!(self.cached::<M>(&pk)) {
            tracing::debug!(found = true, "identity map hit");
            return Outcome::Ok(Some(hit));
        }

        let loaded = self.storage.load(cx, self.unit, M::TABLE_NAME, &pk).await;
        let row = try_outcome!(self.abort_on_err(loaded));
        let Some(row) = row else {
            tracing::debug!(found = false, "row not found");
            return Outcome::Ok(None);
        };
        let entity = try_result!(adopt_row::<M>(&mut self.registry(false, false), &row));
        tracing::debug!(found = true, "loaded from storage");
        Outcome::Ok(Some(entity))
    }

    /// The managed instance for `pk`, failing on a stale table.
    #[allow(clippy::result_large_err)]
    fn cached<M: Model>(&self, pk: &[Value]) -> Result<Option<ModelRef<M>>> {
        match self.identity_map.get::<M>(pk) {
            Some(_) if self.stale_tables.contains(M::TABLE_NAME) => {
                Err(Error::stale_read(M::TABLE_NAME, pk.to_vec()))
            }
            hit => Ok(hit),
        }
    }

    /// Registry that routes loaded rows through the identity map.
    ///
    /// New entities are tracked, read-only when asked. With `refresh`, a
    /// clean managed instance is overwritten with the loaded row.
    fn registry(&mut self, read_only: bool, refresh: bool) -> SessionRegistry<'_> {
        SessionRegistry {
            map: &mut self.identity_map,
            tracker: &mut self.tracker,
            stale: &self.stale_tables,
            read_only,
            refresh,
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Whether this exact instance is managed by the session.
    pub fn contains<M: Model>(&self, entity: &ModelRef<M>) -> bool {
        let view = Managed::from_ref(Arc::clone(entity));
        self.identity_map.key_of(&view).is_some()
            || self.pending_insert.iter().any(|e| e.same_instance(&view))
    }

    /// Whether a managed entity has unflushed column changes.
    pub fn is_dirty<M: Model>(&self, entity: &ModelRef<M>) -> bool {
        let view = Managed::from_ref(Arc::clone(entity));
        self.identity_map
            .key_of(&view)
            .is_some_and(|key| self.tracker.is_dirty(&key, &view))
    }

    /// Whether a managed entity is exempt from dirty checking.
    pub fn is_read_only<M: Model>(&self, entity: &ModelRef<M>) -> bool {
        let view = Managed::from_ref(Arc::clone(entity));
        self.identity_map
            .key_of(&view)
            .is_some_and(|key| self.tracker.is_read_only(&key))
    }

    /// Number of instances in the identity map.
    pub fn managed_count(&self) -> usize {
        self.identity_map.len()
    }

    pub fn pending_insert_count(&self) -> usize {
        self.pending_insert.len()
    }

    pub fn pending_delete_count(&self) -> usize {
        self.pending_delete.len()
    }

    // ========================================================================
    // N+1 Detection
    // ========================================================================

    /// Warn once `threshold` lazy fetches hit one association.
    pub fn enable_n1_detection(&mut self, threshold: usize) {
        self.n1_tracker = Some(N1QueryTracker::new(threshold));
    }

    pub fn disable_n1_detection(&mut self) {
        self.n1_tracker = None;
    }

    #[must_use]
    pub fn n1_detection_enabled(&self) -> bool {
        self.n1_tracker.is_some()
    }

    #[must_use]
    pub fn n1_stats(&self) -> Option<N1Stats> {
        self.n1_tracker.as_ref().map(N1QueryTracker::stats)
    }

    pub fn reset_n1_tracking(&mut self) {
        if let Some(tracker) = &mut self.n1_tracker {
            tracker.reset();
        }
    }

    #[track_caller]
    fn record_lazy_load(&mut self, table: &'static str, association: &'static str) {
        if let Some(tracker) = &mut self.n1_tracker {
            tracker.record_load(table, association);
        }
    }
}

impl<S: Storage> Drop for Session<S> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                unit = %self.unit,
                pending = self.pending_insert.len() + self.pending_delete.len(),
                "session dropped without commit or discard; abandoning unit"
            );
            self.storage.abandon_unit(self.unit);
        }
    }
}

/// Convert the `Ok` payload of an outcome, passing every other variant through.
pub(crate) fn map_outcome<T, U>(outcome: Outcome<T, Error>, f: impl FnOnce(T) -> U) -> Outcome<U, Error> {
    match outcome {
        Outcome::Ok(v) => Outcome::Ok(f(v)),
        Outcome::Err(e) => Outcome::Err(e),
        Outcome::Cancelled(r) => Outcome::Cancelled(r),
        Outcome::Panicked(p) => Outcome::Panicked(p),
    }
}

struct SessionRegistry<'a> {
    map: &'a mut IdentityMap,
    tracker: &'a mut ChangeTracker,
    stale: &'a HashSet<&'static str>,
    read_only: bool,
    refresh: bool,
}

impl EntityRegistry for SessionRegistry<'_> {
    fn adopt(&mut self, candidate: Arc<dyn ManagedEntity>) -> Result<Arc<dyn ManagedEntity>> {
        let pk = candidate.primary_key();
        let key = ObjectKey::new(candidate.table(), &pk);
        if let Some(existing) = self.map.entity(&key) {
            let existing = Arc::clone(existing);
            if self.stale.contains(key.table()) {
                return Err(Error::stale_read(key.table(), pk));
            }
            if self.refresh && self.tracker.is_tracked(&key) && !self.tracker.is_dirty(&key, &*existing) {
                existing.refresh_from(&Row::from_pairs(candidate.current_row()))?;
                self.tracker.resnapshot(&key, existing.current_row());
                tracing::trace!(table = key.table(), "refreshed clean instance from storage");
            }
            return Ok(existing);
        }
        self.map.register(Arc::clone(&candidate))?;
        self.tracker.track(key, candidate.current_row(), self.read_only);
        Ok(candidate)
    }
}

#[cfg(test)]
#[allow(clippy::manual_async_fn)]
mod tests {
    use super::*;
    use crate::fixtures::{Member, Team, seeded_storage, unwrap_outcome};
    use asupersync::runtime::RuntimeBuilder;
    use persist_core::{read_model, write_model};

    #[test]
    fn test_find_returns_same_instance() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let storage = seeded_storage();
            let mut session = unwrap_outcome(Session::begin(&cx, Arc::clone(&storage)).await);

            let a = unwrap_outcome(session.find::<Member>(&cx, 1_i64).await).unwrap();
            let fetches = storage.stats().fetches();
            let b = unwrap_outcome(session.find::<Member>(&cx, 1_i64).await).unwrap();
            assert!(Arc::ptr_eq(&a, &b));
            assert_eq!(storage.stats().fetches(), fetches);
            assert!(session.contains(&a));
            assert!(unwrap_outcome(session.find::<Member>(&cx, 99_i64).await).is_none());
            unwrap_outcome(session.discard(&cx).await);
        });
    }

    #[test]
    fn test_persist_with_key_is_managed_immediately() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let storage = seeded_storage();
            let mut session = unwrap_outcome(Session::begin(&cx, Arc::clone(&storage)).await);

            let team = session.persist(Team::new(Some(50), "teamZ")).unwrap();
            let found = unwrap_outcome(session.find::<Team>(&cx, 50_i64).await).unwrap();
            assert!(Arc::ptr_eq(&team, &found));
            assert_eq!(storage.stats().fetches(), 0);

            let err = session.persist(Team::new(Some(50), "twin")).unwrap_err();
            assert!(err.is_duplicate_identity());
            unwrap_outcome(session.discard(&cx).await);
        });
    }

    #[test]
    fn test_remove_cancels_pending_insert() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let storage = seeded_storage();
            let mut session = unwrap_outcome(Session::begin(&cx, Arc::clone(&storage)).await);

            let team = session.persist(Team::new(None, "transient")).unwrap();
            session.remove(&team).unwrap();
            assert_eq!(session.pending_insert_count(), 0);
            let flushed = unwrap_outcome(session.flush(&cx).await);
            assert!(flushed.is_empty());

            let stranger = Arc::new(std::sync::RwLock::new(Team::new(Some(1), "teamA")));
            assert!(session.remove(&stranger).is_err());
            unwrap_outcome(session.discard(&cx).await);
        });
    }

    #[test]
    fn test_removed_entity_is_not_found() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let storage = seeded_storage();
            let mut session = unwrap_outcome(Session::begin(&cx, Arc::clone(&storage)).await);

            let member = unwrap_outcome(session.find::<Member>(&cx, 2_i64).await).unwrap();
            session.remove(&member).unwrap();
            assert!(unwrap_outcome(session.find::<Member>(&cx, 2_i64).await).is_none());
            let flushed = unwrap_outcome(session.commit(&cx).await);
            assert_eq!(flushed.deleted, 1);
            assert!(
                storage
                    .committed_rows("member")
                    .iter()
                    .all(|row| row.get_named::<i64>("member_id").unwrap() != 2)
            );
        });
    }

    #[test]
    fn test_dirty_tracking_is_visible() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let storage = seeded_storage();
            let mut session = unwrap_outcome(Session::begin(&cx, Arc::clone(&storage)).await);

            let member = unwrap_outcome(session.find::<Member>(&cx, 1_i64).await).unwrap();
            assert!(!session.is_dirty(&member));
            write_model(&member).age += 1;
            assert!(session.is_dirty(&member));
            let flushed = unwrap_outcome(session.flush(&cx).await);
            assert_eq!(flushed.updated, 1);
            assert!(!session.is_dirty(&member));
            assert_eq!(read_model(&member).age, 11);
            unwrap_outcome(session.discard(&cx).await);
        });
    }

    #[test]
    fn test_drop_without_commit_abandons_unit() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let storage = seeded_storage();
            {
                let mut session = unwrap_outcome(Session::begin(&cx, Arc::clone(&storage)).await);
                session.persist(Team::new(None, "lost")).unwrap();
                unwrap_outcome(session.flush(&cx).await);
                assert_eq!(storage.open_units(), 1);
            }
            assert_eq!(storage.open_units(), 0);
            assert_eq!(storage.committed_rows("team").len(), 2);
        });
    }

    #[test]
    fn test_n1_detection_toggles() {
        let rt = RuntimeBuilder::current_thread().build().expect("create asupersync runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let storage = seeded_storage();
            let mut session = unwrap_outcome(Session::begin(&cx, storage).await);
            assert!(!session.n1_detection_enabled());
            session.enable_n1_detection(2);
            session.record_lazy_load("team", "team");
            assert_eq!(session.n1_stats().unwrap().total_loads, 1);
            session.reset_n1_tracking();
            assert_eq!(session.n1_stats().unwrap().total_loads, 0);
            session.disable_n1_detection();
            assert!(session.n1_stats().is_none());
            unwrap_outcome(session.discard(&cx).await);
        });
    }
}
