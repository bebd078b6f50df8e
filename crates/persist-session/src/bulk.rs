//! Set-based writes that bypass the persistence context.
//!
//! A bulk update or delete runs directly in storage, so instances already in
//! the identity map no longer reflect their rows. By default the whole
//! persistence context is cleared afterwards: instances of other tables may
//! hold resolved references to the mutated rows, so evicting one table is
//! not enough. With [`InvalidationMode::Retain`] the cached instances stay,
//! and reading any of them fails with `StaleReadHazard` until the table is
//! evicted or the context cleared.

use crate::Session;
use asupersync::{Cx, Outcome};
use persist_core::{Error, Model, Result};
use persist_query::{Assignment, Expr, Storage};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// What happens to managed instances after a bulk mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvalidationMode {
    /// Clear the persistence context.
    #[default]
    Evict,
    /// Keep them, and reject reads of them as stale.
    Retain,
}

/// `UPDATE {table} SET ... WHERE ...` for model `M`.
#[derive(Debug, Clone)]
pub struct BulkMutation<M: Model> {
    filter: Option<Expr>,
    assignments: Vec<Assignment>,
    _marker: PhantomData<M>,
}

impl<M: Model> BulkMutation<M> {
    pub fn new() -> Self {
        Self {
            filter: None,
            assignments: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Restrict to matching rows; repeated calls are ANDed.
    #[must_use]
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// `column = value`, where `value` may reference the row's old values.
    #[must_use]
    pub fn set(mut self, column: &'static str, value: impl Into<Expr>) -> Self {
        self.assignments.push(Assignment::set(column, value));
        self
    }

    pub fn filter_expr(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.assignments.is_empty() {
            return Err(Error::invalid_descriptor(M::TABLE_NAME, "bulk update sets no column"));
        }
        let referenced = self
            .assignments
            .iter()
            .flat_map(|a| std::iter::once(a.column).chain(a.value.columns()))
            .chain(self.filter.iter().flat_map(Expr::columns));
        for column in referenced {
            if !M::fields().iter().any(|f| f.column_name == column) {
                return Err(Error::invalid_descriptor(
                    M::TABLE_NAME,
                    format!("unknown column '{column}' in bulk update"),
                ));
            }
        }
        Ok(())
    }
}

impl<M: Model> Default for BulkMutation<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Storage> Session<S> {
    /// Apply a bulk update in storage; returns the number of rows changed.
    ///
    /// Pending changes are flushed first so the update sees them.
    #[tracing::instrument(level = "debug", skip(self, cx, mutation), fields(table = M::TABLE_NAME))]
    pub async fn bulk_update<M: Model>(
        &mut self,
        cx: &Cx,
        mutation: BulkMutation<M>,
        mode: InvalidationMode,
    ) -> Outcome<u64, Error> {
        try_result!(self.ensure_active());
        try_result!(mutation.validate());
        try_outcome!(self.flush(cx).await);
        let mutated = self
            .storage
            .bulk_mutate(cx, self.unit, M::TABLE_NAME, mutation.filter_expr(), mutation.assignments())
            .await;
        let changed = try_outcome!(self.abort_on_err(mutated));
        self.invalidate(M::TABLE_NAME, mode);
        tracing::info!(changed, ?mode, "bulk update applied");
        Outcome::Ok(changed)
    }

    /// [`bulk_update`](Self::bulk_update) with the configured invalidation.
    pub async fn bulk_update_default<M: Model>(
        &mut self,
        cx: &Cx,
        mutation: BulkMutation<M>,
    ) -> Outcome<u64, Error> {
        let mode = self.config.default_invalidation;
        self.bulk_update(cx, mutation, mode).await
    }

    /// Delete matching rows in storage; returns the number removed.
    #[tracing::instrument(level = "debug", skip(self, cx, filter), fields(table = M::TABLE_NAME))]
    pub async fn bulk_delete<M: Model>(
        &mut self,
        cx: &Cx,
        filter: Option<Expr>,
        mode: InvalidationMode,
    ) -> Outcome<u64, Error> {
        try_result!(self.ensure_active());
        if let Some(expr) = &filter {
            if let Some(column) = expr
                .columns()
                .into_iter()
                .find(|c| !M::fields().iter().any(|f| f.column_name == *c))
            {
                return Outcome::Err(Error::invalid_descriptor(
                    M::TABLE_NAME,
                    format!("unknown column '{column}' in bulk delete"),
                ));
            }
        }
        try_outcome!(self.flush(cx).await);
        let deleted = self
            .storage
            .bulk_delete(cx, self.unit, M::TABLE_NAME, filter.as_ref())
            .await;
        let removed = try_outcome!(self.abort_on_err(deleted));
        self.invalidate(M::TABLE_NAME, mode);
        tracing::info!(removed, ?mode, "bulk delete applied");
        Outcome::Ok(removed)
    }

    fn invalidate(&mut self, table: &'static str, mode: InvalidationMode) {
        match mode {
            InvalidationMode::Evict => {
                tracing::debug!(table, "bulk-mutated; clearing the persistence context");
                self.clear();
            }
            InvalidationMode::Retain => {
                tracing::debug!(table, "cached instances retained; marked stale");
                self.stale_tables.insert(table);
            }
        }
    }

    /// Detach every cached instance of `M` and clear its stale mark.
    pub fn evict_table<M: Model>(&mut self) {
        let table = M::TABLE_NAME;
        let evicted = self.identity_map.evict_table(table);
        self.tracker.untrack_table(table);
        self.pending_delete.retain(|k| k.table() != table);
        self.stale_tables.remove(table);
        tracing::debug!(table, evicted = evicted.len(), "table evicted from identity map");
    }

    /// Detach every managed instance and drop unflushed changes.
    ///
    /// Staged writes already flushed to the unit and held locks remain.
    pub fn clear(&mut self) {
        let managed = self.identity_map.len();
        self.identity_map.evict_all();
        self.tracker.clear_all();
        self.pending_insert.clear();
        self.pending_delete.clear();
        self.stale_tables.clear();
        tracing::debug!(managed, "persistence context cleared");
    }
}
