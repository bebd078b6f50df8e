//! Pessimistic row locks held by one unit of work.
//!
//! Storage owns the locks and does the waiting; the coordinator remembers
//! which rows this unit already holds so that a repeated request costs no
//! storage call. Every lock is released by storage when the unit commits or
//! is discarded.

use crate::identity_map::ObjectKey;
use asupersync::{Cx, Outcome};
use persist_core::{Error, Value};
use persist_query::{LockMode, Storage, UnitId};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug)]
pub struct LockCoordinator {
    held: HashSet<ObjectKey>,
    timeout: Duration,
}

impl LockCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: HashSet::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_held(&self, key: &ObjectKey) -> bool {
        self.held.contains(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Forget every held lock; returns how many there were.
    pub fn release_all(&mut self) -> usize {
        let count = self.held.len();
        self.held.clear();
        count
    }

    /// Acquire the row lock `mode` asks for.
    ///
    /// Returns `true` when storage granted a new lock, `false` for modes that
    /// take no lock and rows this unit already holds.
    pub async fn acquire<S: Storage>(
        &mut self,
        cx: &Cx,
        storage: &S,
        unit: UnitId,
        table: &'static str,
        key: &[Value],
        mode: LockMode,
    ) -> Outcome<bool, Error> {
        if mode != LockMode::PessimisticWrite {
            return Outcome::Ok(false);
        }
        let object = ObjectKey::new(table, key);
        if self.held.contains(&object) {
            tracing::trace!(table, pk_hash = object.pk_hash(), "row lock already held");
            return Outcome::Ok(false);
        }
        try_outcome!(
            storage
                .acquire_lock(cx, unit, table, key, mode, self.timeout)
                .await
        );
        self.held.insert(object);
        tracing::debug!(table, %unit, held = self.held.len(), "row lock acquired");
        Outcome::Ok(true)
    }
}
