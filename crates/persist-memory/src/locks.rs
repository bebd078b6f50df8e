//! Row-level write locks shared by all units of one `MemoryStorage`.

use persist_core::{Error, Result, Value, hash_key};
use persist_query::UnitId;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

type RowId = (&'static str, u64);

#[derive(Default)]
pub(crate) struct LockTable {
    held: Mutex<HashMap<RowId, UnitId>>,
    released: Condvar,
}

/// How a granted lock was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Grant {
    Immediate,
    AlreadyHeld,
    AfterWait,
}

impl LockTable {
    /// Block until `unit` holds the row lock or `timeout` elapses.
    #[allow(clippy::result_large_err)]
    pub(crate) fn acquire(
        &self,
        unit: UnitId,
        table: &'static str,
        key: &[Value],
        timeout: Duration,
    ) -> Result<Grant> {
        let row = (table, hash_key(key));
        let started = Instant::now();
        let deadline = started + timeout;
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let mut waited = false;
        loop {
            match held.get(&row).copied() {
                None => {
                    held.insert(row, unit);
                    return Ok(if waited { Grant::AfterWait } else { Grant::Immediate });
                }
                Some(owner) if owner == unit => return Ok(Grant::AlreadyHeld),
                Some(owner) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::lock_timeout(table, key.to_vec(), started.elapsed()));
                    }
                    if !waited {
                        tracing::debug!(table, %unit, holder = %owner, "waiting for row lock");
                    }
                    waited = true;
                    let (guard, _) = self
                        .released
                        .wait_timeout(held, deadline.saturating_duration_since(now))
                        .unwrap_or_else(PoisonError::into_inner);
                    held = guard;
                }
            }
        }
    }

    /// Release every lock held by `unit`. Returns how many were released.
    pub(crate) fn release_unit(&self, unit: UnitId) -> usize {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let before = held.len();
        held.retain(|_, owner| *owner != unit);
        let released = before - held.len();
        drop(held);
        if released > 0 {
            self.released.notify_all();
        }
        released
    }

    pub(crate) fn holder(&self, table: &'static str, key: &[Value]) -> Option<UnitId> {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.get(&(table, hash_key(key))).copied()
    }
}
