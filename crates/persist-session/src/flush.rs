//! Flush: write pending inserts, dirty entities and deletes to storage.
//!
//! Writes are issued in a fixed order: inserts in persist order, then
//! updates of dirty entities in tracking order, then deletes. Audit fields
//! are stamped right before each insert or update. Every written entity is
//! re-snapshotted, so a second flush with no intervening change writes
//! nothing.

use crate::Session;
use crate::identity_map::ObjectKey;
use asupersync::{Cx, Outcome};
use persist_core::{Error, ManagedEntity};
use persist_query::{Storage, WriteOp};
use std::sync::Arc;

/// Counts of rows written by one flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl FlushResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl<S: Storage> Session<S> {
    /// Write every pending change of the unit to storage.
    ///
    /// A flush that does not complete aborts the unit of work: the storage
    /// unit is abandoned with everything it staged, so no partial flush can
    /// become durable.
    #[tracing::instrument(level = "debug", skip_all, fields(unit = %self.unit))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        try_result!(self.ensure_active());
        let flushed = self.write_pending(cx).await;
        match &flushed {
            Outcome::Ok(_) => {}
            Outcome::Err(_) => return self.abort_on_err(flushed),
            Outcome::Cancelled(_) | Outcome::Panicked(_) => self.abort("flush interrupted"),
        }
        flushed
    }

    async fn write_pending(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let mut result = FlushResult::default();

        // 1. Inserts
        let inserts: Vec<Arc<dyn ManagedEntity>> = std::mem::take(&mut self.pending_insert);
        for entity in &inserts {
            try_outcome!(self.insert_one(cx, entity).await);
            result.inserted += 1;
        }

        // 2. Updates
        let dirty = self.tracker.compute_dirty(&self.identity_map);
        for entry in dirty {
            if self.pending_delete.contains(&entry.key) {
                continue;
            }
            if try_outcome!(self.update_one(cx, entry.key).await) {
                result.updated += 1;
            }
        }

        // 3. Deletes
        let deletes: Vec<ObjectKey> = std::mem::take(&mut self.pending_delete);
        for key in &deletes {
            try_outcome!(self.delete_one(cx, key).await);
            result.deleted += 1;
        }

        if result.is_empty() {
            tracing::trace!("flush found nothing to write");
        } else {
            tracing::debug!(
                inserted = result.inserted,
                updated = result.updated,
                deleted = result.deleted,
                "flush complete"
            );
        }
        Outcome::Ok(result)
    }

    async fn insert_one(&mut self, cx: &Cx, entity: &Arc<dyn ManagedEntity>) -> Outcome<(), Error> {
        self.audit.before_insert(&**entity);
        let op = WriteOp::Insert {
            table: entity.table(),
            primary_key: entity.primary_key_columns(),
            values: entity.current_row(),
        };
        let written = try_outcome!(self.storage.write(cx, self.unit, op).await);
        if let Some(key) = &written.generated_key {
            entity.assign_generated_key(key);
        }
        let key = try_result!(self.identity_map.register(Arc::clone(entity)));
        tracing::trace!(table = entity.table(), pk_hash = key.pk_hash(), "inserted");
        self.tracker.track(key, entity.current_row(), false);
        Outcome::Ok(())
    }

    /// Write the changed columns of one dirty entity. Returns `false` when
    /// nothing was left to write.
    async fn update_one(&mut self, cx: &Cx, key: ObjectKey) -> Outcome<bool, Error> {
        let Some(entity) = self.identity_map.entity(&key).cloned() else {
            return Outcome::Ok(false);
        };
        let Some(pk) = self.identity_map.pk_values(&key).map(<[_]>::to_vec) else {
            return Outcome::Ok(false);
        };
        self.audit.before_update(&*entity);

        // Re-diff so the fresh modification stamps are written too.
        let changed = self.tracker.changed_columns(&key, &*entity);
        if changed.is_empty() {
            return Outcome::Ok(false);
        }
        let current = entity.current_row();
        let values: Vec<_> = current
            .into_iter()
            .filter(|(column, _)| changed.contains(column))
            .collect();
        tracing::trace!(table = key.table(), columns = ?changed, "updating dirty entity");

        let op = WriteOp::Update {
            table: entity.table(),
            primary_key: entity.primary_key_columns(),
            key: pk,
            values,
        };
        try_outcome!(self.storage.write(cx, self.unit, op).await);
        self.tracker.resnapshot(&key, entity.current_row());
        Outcome::Ok(true)
    }

    async fn delete_one(&mut self, cx: &Cx, key: &ObjectKey) -> Outcome<(), Error> {
        let (Some(entity), Some(pk)) = (
            self.identity_map.entity(key).cloned(),
            self.identity_map.pk_values(key).map(<[_]>::to_vec),
        ) else {
            return Outcome::Ok(());
        };
        let op = WriteOp::Delete {
            table: entity.table(),
            primary_key: entity.primary_key_columns(),
            key: pk,
        };
        try_outcome!(self.storage.write(cx, self.unit, op).await);
        self.identity_map.evict(key);
        self.tracker.untrack(key);
        Outcome::Ok(())
    }
}
