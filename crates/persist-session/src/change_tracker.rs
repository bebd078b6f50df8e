//! Snapshot-based dirty checking.
//!
//! Every managed entity gets a snapshot of its persisted columns when it is
//! loaded or flushed. At flush the current columns are diffed against the
//! snapshot, in the order entities started being tracked.

use crate::identity_map::{IdentityMap, ObjectKey};
use persist_core::{FieldInfo, ManagedEntity, Value, find_field};
use std::collections::HashMap;
use std::time::Instant;

/// Column values of one entity at load or last flush.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    values: Vec<(&'static str, Value)>,
    taken_at: Instant,
}

impl ObjectSnapshot {
    pub fn new(values: Vec<(&'static str, Value)>) -> Self {
        Self {
            values,
            taken_at: Instant::now(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.iter().find(|(c, _)| *c == column).map(|(_, v)| v)
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

struct Tracked {
    snapshot: ObjectSnapshot,
    read_only: bool,
}

/// An entity with pending column changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyEntity {
    pub key: ObjectKey,
    pub changed: Vec<&'static str>,
}

#[derive(Default)]
pub struct ChangeTracker {
    entries: HashMap<ObjectKey, Tracked>,
    order: Vec<ObjectKey>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `key`, or replace its snapshot if already tracked.
    #[tracing::instrument(level = "trace", skip(self, values))]
    pub fn track(&mut self, key: ObjectKey, values: Vec<(&'static str, Value)>, read_only: bool) {
        tracing::trace!(pk_hash = key.pk_hash(), "taking object snapshot");
        let tracked = Tracked {
            snapshot: ObjectSnapshot::new(values),
            read_only,
        };
        if self.entries.insert(key.clone(), tracked).is_none() {
            self.order.push(key);
        }
    }

    /// Replace the snapshot, keeping the read-only flag and tracking order.
    pub fn resnapshot(&mut self, key: &ObjectKey, values: Vec<(&'static str, Value)>) {
        if let Some(tracked) = self.entries.get_mut(key) {
            tracked.snapshot = ObjectSnapshot::new(values);
        }
    }

    pub fn untrack(&mut self, key: &ObjectKey) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    pub fn untrack_table(&mut self, table: &str) {
        self.entries.retain(|k, _| k.table() != table);
        self.order.retain(|k| k.table() != table);
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn is_tracked(&self, key: &ObjectKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_read_only(&self, key: &ObjectKey) -> bool {
        self.entries.get(key).is_some_and(|t| t.read_only)
    }

    pub fn snapshot(&self, key: &ObjectKey) -> Option<&ObjectSnapshot> {
        self.entries.get(key).map(|t| &t.snapshot)
    }

    /// Updatable columns of `entity` that differ from its snapshot.
    pub fn changed_columns(&self, key: &ObjectKey, entity: &dyn ManagedEntity) -> Vec<&'static str> {
        match self.entries.get(key) {
            Some(tracked) => diff(entity.fields(), &tracked.snapshot, &entity.current_row()),
            None => Vec::new(),
        }
    }

    pub fn is_dirty(&self, key: &ObjectKey, entity: &dyn ManagedEntity) -> bool {
        !self.changed_columns(key, entity).is_empty()
    }

    /// Dirty entities in tracking order. Read-only entities are skipped.
    pub fn compute_dirty(&self, map: &IdentityMap) -> Vec<DirtyEntity> {
        self.order
            .iter()
            .filter_map(|key| {
                let tracked = self.entries.get(key)?;
                if tracked.read_only {
                    return None;
                }
                let entity = map.entity(key)?;
                let changed = diff(entity.fields(), &tracked.snapshot, &entity.current_row());
                (!changed.is_empty()).then(|| DirtyEntity { key: key.clone(), changed })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn diff(
    fields: &[FieldInfo],
    snapshot: &ObjectSnapshot,
    current: &[(&'static str, Value)],
) -> Vec<&'static str> {
    current
        .iter()
        .filter(|(column, _)| find_field(fields, column).is_none_or(|f| f.updatable))
        .filter(|(column, value)| {
            snapshot
                .get(column)
                .is_none_or(|old| !old.same_as(value))
        })
        .map(|(column, _)| *column)
        .collect()
}
