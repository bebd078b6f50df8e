//! Lazy reference resolution.
//!
//! An unresolved [`Lazy`] holds only a foreign key. Resolving it consults the
//! identity map first and fetches from storage only on a miss; either way the
//! reference ends up pointing at the managed instance. Resolution is
//! idempotent: a resolved reference never touches storage again.

use crate::identity_map::ObjectKey;
use crate::Session;
use asupersync::{Cx, Outcome};
use persist_core::{
    Error, Lazy, LazyMany, LazyManyState, LazyState, Model, ModelRef, Value, adopt_row, hash_key,
    read_model,
};
use persist_query::{Expr, FetchRequest, OrderBy, Storage};
use std::collections::HashMap;

impl<S: Storage> Session<S> {
    /// Resolve a to-one reference to its managed target.
    ///
    /// A NULL reference, or one whose row does not exist, fails with
    /// `DanglingReference`.
    #[tracing::instrument(level = "debug", skip(self, cx, lazy), fields(table = T::TABLE_NAME))]
    pub async fn resolve<T: Model>(&mut self, cx: &Cx, lazy: &Lazy<T>) -> Outcome<ModelRef<T>, Error> {
        let fk = match lazy.state() {
            LazyState::Resolved(target) => return Outcome::Ok(ModelRef::clone(target)),
            LazyState::Empty => {
                return Outcome::Err(Error::dangling_reference(T::TABLE_NAME, vec![Value::Null]));
            }
            LazyState::Unresolved(fk) => fk.clone(),
        };
        try_result!(self.ensure_active());
        let pk = vec![fk];

        if let Some(hit) = try_result!(self.cached::<T>(&pk)) {
            tracing::debug!(source = "identity_map", "reference resolved");
            lazy.resolve_with(hit);
            return resolved(lazy, &pk);
        }

        self.record_lazy_load(T::TABLE_NAME, "to-one");
        let loaded = self.storage.load(cx, self.unit, T::TABLE_NAME, &pk).await;
        let Some(row) = try_outcome!(self.abort_on_err(loaded)) else {
            return Outcome::Err(Error::dangling_reference(T::TABLE_NAME, pk));
        };
        let target = try_result!(adopt_row::<T>(&mut self.registry(false, false), &row));
        tracing::debug!(source = "storage", "reference resolved");
        lazy.resolve_with(target);
        resolved(lazy, &pk)
    }

    /// Resolve a to-many collection with one fetch of the child table.
    #[tracing::instrument(level = "debug", skip(self, cx, many), fields(table = T::TABLE_NAME))]
    pub async fn resolve_many<T: Model>(
        &mut self,
        cx: &Cx,
        many: &LazyMany<T>,
    ) -> Outcome<Vec<ModelRef<T>>, Error> {
        let parent_key = match many.state() {
            LazyManyState::Resolved(items) => return Outcome::Ok(items.to_vec()),
            LazyManyState::Unresolved(key) => key.clone(),
        };
        try_result!(self.ensure_active());
        if parent_key.is_null() {
            many.resolve_with(Vec::new());
            return Outcome::Ok(Vec::new());
        }

        self.record_lazy_load(T::TABLE_NAME, many.remote_key());
        let mut request = FetchRequest::new(T::TABLE_NAME).filter(Expr::col(many.remote_key()).eq(parent_key));
        request.order = T::PRIMARY_KEY.iter().map(|c| OrderBy::asc(*c)).collect();
        let queried = self.storage.query(cx, self.unit, &request).await;
        let rows = try_outcome!(self.abort_on_err(queried));

        let mut registry = self.registry(false, false);
        let items = try_result!(
            rows.iter()
                .map(|row| adopt_row::<T>(&mut registry, row))
                .collect::<persist_core::Result<Vec<_>>>()
        );
        tracing::debug!(count = items.len(), "collection resolved");
        many.resolve_with(items);
        Outcome::Ok(many.get().map(<[_]>::to_vec).unwrap_or_default())
    }

    /// Resolve one to-one reference on every parent with a single fetch.
    ///
    /// Targets already managed are taken from the identity map; the rest are
    /// fetched together by key. Returns how many references were resolved.
    /// If some target rows do not exist, every other reference is still
    /// resolved and the call fails with `DanglingReference` naming the
    /// missing keys.
    #[tracing::instrument(level = "debug", skip_all, fields(table = T::TABLE_NAME))]
    pub async fn resolve_batch<P, T, F>(
        &mut self,
        cx: &Cx,
        parents: &[ModelRef<P>],
        accessor: F,
    ) -> Outcome<usize, Error>
    where
        P: Model,
        T: Model,
        F: Fn(&P) -> &Lazy<T>,
    {
        try_result!(self.ensure_active());
        let [pk_column] = T::PRIMARY_KEY else {
            return Outcome::Err(Error::invalid_descriptor(
                T::TABLE_NAME,
                "batch resolution needs a single-column primary key",
            ));
        };

        let mut resolved_count = 0;
        let mut waiting: Vec<(Value, Lazy<T>)> = Vec::new();
        for parent in parents {
            let lazy = accessor(&read_model(parent)).clone();
            let LazyState::Unresolved(fk) = lazy.state() else {
                continue;
            };
            let fk = fk.clone();
            match try_result!(self.cached::<T>(std::slice::from_ref(&fk))) {
                Some(hit) => {
                    lazy.resolve_with(hit);
                    resolved_count += 1;
                }
                None => waiting.push((fk, lazy)),
            }
        }

        let mut keys: Vec<Value> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (fk, _) in &waiting {
            if seen.insert(hash_key(std::slice::from_ref(fk))) {
                keys.push(fk.clone());
            }
        }
        if keys.is_empty() {
            return Outcome::Ok(resolved_count);
        }
        tracing::info!(parent_count = parents.len(), fk_count = keys.len(), "batch resolving references");

        let request = FetchRequest::new(T::TABLE_NAME).filter(Expr::col(*pk_column).in_list(keys.clone()));
        let queried = self.storage.query(cx, self.unit, &request).await;
        let rows = try_outcome!(self.abort_on_err(queried));

        let mut by_key: HashMap<u64, ModelRef<T>> = HashMap::new();
        {
            let mut registry = self.registry(false, false);
            for row in &rows {
                let target = try_result!(adopt_row::<T>(&mut registry, row));
                let key = read_model(&target).primary_key_value();
                by_key.insert(hash_key(&key), target);
            }
        }

        let mut missing = Vec::new();
        for (fk, lazy) in &waiting {
            match by_key.get(&hash_key(std::slice::from_ref(fk))) {
                Some(target) => {
                    lazy.resolve_with(ModelRef::clone(target));
                    resolved_count += 1;
                }
                None => {
                    if !missing.iter().any(|m: &Value| m.same_as(fk)) {
                        missing.push(fk.clone());
                    }
                }
            }
        }
        if missing.is_empty() {
            Outcome::Ok(resolved_count)
        } else {
            tracing::warn!(missing = missing.len(), "batch resolution found dangling references");
            Outcome::Err(Error::dangling_reference(T::TABLE_NAME, missing))
        }
    }

    /// Whether `lazy` points at the instance managed under its key.
    pub fn is_resolved_to_managed<T: Model>(&self, lazy: &Lazy<T>) -> bool {
        lazy.get().is_some_and(|target| {
            let key = ObjectKey::of::<T>(&read_model(target).primary_key_value());
            self.identity_map
                .entity(&key)
                .is_some_and(|managed| managed.instance_ptr() == std::sync::Arc::as_ptr(target).cast::<()>())
        })
    }
}

fn resolved<T: Model>(lazy: &Lazy<T>, pk: &[Value]) -> Outcome<ModelRef<T>, Error> {
    match lazy.get() {
        Some(target) => Outcome::Ok(ModelRef::clone(target)),
        None => Outcome::Err(Error::dangling_reference(T::TABLE_NAME, pk.to_vec())),
    }
}
