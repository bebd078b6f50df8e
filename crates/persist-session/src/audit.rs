//! Audit stamping at flush.
//!
//! Entities that expose [`AuditFields`] get `created_*` written once before
//! insert and `last_modified_*` rewritten before every insert or update. The
//! actor comes from a [`CurrentActorProvider`] and the time from a [`Clock`],
//! both consulted per flush.

use persist_core::{ActorId, AuditFields, ManagedEntity};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Supplies the identity recorded in audit columns.
pub trait CurrentActorProvider: Send + Sync {
    /// `None` records a NULL actor.
    fn current(&self) -> Option<ActorId>;
}

impl<F> CurrentActorProvider for F
where
    F: Fn() -> Option<ActorId> + Send + Sync,
{
    fn current(&self) -> Option<ActorId> {
        self()
    }
}

/// Always the same actor.
#[derive(Debug, Clone)]
pub struct FixedActor(ActorId);

impl FixedActor {
    pub fn new(actor: impl Into<ActorId>) -> Self {
        Self(actor.into())
    }
}

impl CurrentActorProvider for FixedActor {
    fn current(&self) -> Option<ActorId> {
        Some(self.0.clone())
    }
}

/// No actor; audit actor columns stay NULL.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoActor;

impl CurrentActorProvider for NoActor {
    fn current(&self) -> Option<ActorId> {
        None
    }
}

/// Time source for audit timestamps, in microseconds since the epoch.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicI64);

impl FixedClock {
    pub fn new(micros: i64) -> Self {
        Self(AtomicI64::new(micros))
    }

    pub fn set(&self, micros: i64) {
        self.0.store(micros, Ordering::SeqCst);
    }

    pub fn advance(&self, micros: i64) {
        self.0.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_micros(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_micros(&self) -> i64 {
        (**self).now_micros()
    }
}

/// Stamps audit fields on entities about to be written.
#[derive(Clone)]
pub struct AuditInterceptor {
    actor: Arc<dyn CurrentActorProvider>,
    clock: Arc<dyn Clock>,
}

impl AuditInterceptor {
    pub fn new(actor: impl CurrentActorProvider + 'static, clock: impl Clock + 'static) -> Self {
        Self {
            actor: Arc::new(actor),
            clock: Arc::new(clock),
        }
    }

    /// Stamp creation and modification fields. Returns `false` for
    /// entities that are not audited.
    pub fn before_insert(&self, entity: &dyn ManagedEntity) -> bool {
        let actor = self.actor.current();
        let now = self.clock.now_micros();
        entity.stamp_audit(&mut |audit: &mut AuditFields| {
            audit.created_by.clone_from(&actor);
            audit.created_at = Some(now);
            audit.last_modified_by.clone_from(&actor);
            audit.last_modified_at = Some(now);
        })
    }

    /// Stamp modification fields only.
    pub fn before_update(&self, entity: &dyn ManagedEntity) -> bool {
        let actor = self.actor.current();
        let now = self.clock.now_micros();
        entity.stamp_audit(&mut |audit: &mut AuditFields| {
            audit.last_modified_by.clone_from(&actor);
            audit.last_modified_at = Some(now);
        })
    }
}

impl Default for AuditInterceptor {
    fn default() -> Self {
        Self::new(NoActor, SystemClock)
    }
}

impl std::fmt::Debug for AuditInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditInterceptor")
            .field("actor", &self.actor.current())
            .finish_non_exhaustive()
    }
}
