//! Query execution: turn a [`Select`] into managed entities.
//!
//! Every fetched row goes through the identity map, so an entity already
//! managed comes back as the same instance. Paged fetches issue a windowed
//! content fetch plus an independent count; sliced fetches read one extra
//! row instead of counting. Eager joins are split back into parent and
//! association rows, with parents deduplicated in first-seen order.

use crate::{Session, map_outcome};
use asupersync::{Cx, Outcome};
use persist_core::{
    EntityRegistry, Error, Managed, ManagedEntity, Model, ModelRef, QueryError, QueryErrorKind,
    RelationshipInfo, Result, Row, Value, adopt_row, hash_key,
};
use persist_query::{Expr, LockMode, Page, PageRequest, Pagination, Select, Storage};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Result of executing a query descriptor.
#[derive(Debug)]
pub enum Fetched<M> {
    /// A paged or sliced fetch
    Page(Page<ModelRef<M>>),
    /// An unpaginated fetch
    All(Vec<ModelRef<M>>),
}

impl<M> Fetched<M> {
    pub fn content(&self) -> &[ModelRef<M>] {
        match self {
            Fetched::Page(page) => &page.content,
            Fetched::All(all) => all,
        }
    }

    pub fn into_content(self) -> Vec<ModelRef<M>> {
        match self {
            Fetched::Page(page) => page.content,
            Fetched::All(all) => all,
        }
    }

    pub fn into_page(self) -> Option<Page<ModelRef<M>>> {
        match self {
            Fetched::Page(page) => Some(page),
            Fetched::All(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.content().len()
    }

    pub fn is_empty(&self) -> bool {
        self.content().is_empty()
    }
}

impl<S: Storage> Session<S> {
    /// Validate and run a query descriptor.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(table = M::TABLE_NAME))]
    pub async fn execute<M: Model>(&mut self, cx: &Cx, query: &Select<M>) -> Outcome<Fetched<M>, Error> {
        try_result!(self.ensure_active());
        try_result!(query.validate());
        try_outcome!(self.auto_flush(cx).await);

        match query.pagination() {
            Some(Pagination::Paged(request)) => {
                let content = try_outcome!(self.fetch_content(cx, query).await);
                let counted = self
                    .storage
                    .count(cx, self.unit, M::TABLE_NAME, query.count_expr())
                    .await;
                let total = try_outcome!(self.abort_on_err(counted));
                tracing::debug!(rows = content.len(), total, page = request.page, "page fetched");
                Outcome::Ok(Fetched::Page(Page::counted(content, request, total)))
            }
            Some(Pagination::Sliced(request)) => {
                let mut content = try_outcome!(self.fetch_content(cx, query).await);
                let size = usize::try_from(request.size).unwrap_or(usize::MAX);
                let has_next = content.len() > size;
                content.truncate(size);
                tracing::debug!(rows = content.len(), has_next, page = request.page, "slice fetched");
                Outcome::Ok(Fetched::Page(Page::sliced(content, request, has_next)))
            }
            None => {
                let content = try_outcome!(self.fetch_content(cx, query).await);
                tracing::debug!(rows = content.len(), "fetched");
                Outcome::Ok(Fetched::All(content))
            }
        }
    }

    /// Every entity the query matches. A paginated query yields its page.
    pub async fn fetch_all<M: Model>(&mut self, cx: &Cx, query: Select<M>) -> Outcome<Vec<ModelRef<M>>, Error> {
        map_outcome(self.execute(cx, &query).await, Fetched::into_content)
    }

    /// One counted page of the query.
    pub async fn fetch_page<M: Model>(
        &mut self,
        cx: &Cx,
        query: Select<M>,
        request: PageRequest,
    ) -> Outcome<Page<ModelRef<M>>, Error> {
        let query = query.paged(request);
        map_outcome(self.execute(cx, &query).await, into_page)
    }

    /// One uncounted slice of the query.
    pub async fn fetch_slice<M: Model>(
        &mut self,
        cx: &Cx,
        query: Select<M>,
        request: PageRequest,
    ) -> Outcome<Page<ModelRef<M>>, Error> {
        let query = query.sliced(request);
        map_outcome(self.execute(cx, &query).await, into_page)
    }

    /// At most one entity; more than one match is `NonUniqueResult`.
    pub async fn fetch_optional<M: Model>(
        &mut self,
        cx: &Cx,
        query: Select<M>,
    ) -> Outcome<Option<ModelRef<M>>, Error> {
        let mut all = try_outcome!(self.fetch_all(cx, query).await);
        if all.len() > 1 {
            return Outcome::Err(Error::Query(QueryError {
                kind: QueryErrorKind::NonUniqueResult,
                table: Some(M::TABLE_NAME),
                message: format!("expected at most one {} row, found {}", M::TABLE_NAME, all.len()),
            }));
        }
        Outcome::Ok(all.pop())
    }

    /// Exactly one entity; no match is `NotFound`.
    pub async fn fetch_one<M: Model>(&mut self, cx: &Cx, query: Select<M>) -> Outcome<ModelRef<M>, Error> {
        match try_outcome!(self.fetch_optional(cx, query).await) {
            Some(entity) => Outcome::Ok(entity),
            None => Outcome::Err(Error::Query(QueryError {
                kind: QueryErrorKind::NotFound,
                table: Some(M::TABLE_NAME),
                message: format!("no {} row matched", M::TABLE_NAME),
            })),
        }
    }

    /// Fetch with a lock mode applied to every matched row.
    pub async fn fetch_with_lock<M: Model>(
        &mut self,
        cx: &Cx,
        query: Select<M>,
        mode: LockMode,
    ) -> Outcome<Vec<ModelRef<M>>, Error> {
        self.fetch_all(cx, query.lock(mode)).await
    }

    /// Number of rows matching `filter`.
    pub async fn count<M: Model>(&mut self, cx: &Cx, filter: Option<Expr>) -> Outcome<u64, Error> {
        let query = match filter {
            Some(expr) => Select::<M>::new().filter(expr),
            None => Select::new(),
        };
        try_result!(self.ensure_active());
        try_result!(query.validate());
        try_outcome!(self.auto_flush(cx).await);
        let counted = self
            .storage
            .count(cx, self.unit, M::TABLE_NAME, query.filter_expr())
            .await;
        self.abort_on_err(counted)
    }

    pub async fn exists<M: Model>(&mut self, cx: &Cx, filter: Option<Expr>) -> Outcome<bool, Error> {
        map_outcome(self.count::<M>(cx, filter).await, |n| n > 0)
    }

    /// One column of every matching row, without managing any entity.
    pub async fn pluck<M: Model>(
        &mut self,
        cx: &Cx,
        query: Select<M>,
        column: &'static str,
    ) -> Outcome<Vec<Value>, Error> {
        try_result!(self.ensure_active());
        try_result!(query.validate());
        if !M::fields().iter().any(|f| f.column_name == column) {
            return Outcome::Err(Error::invalid_descriptor(
                M::TABLE_NAME,
                format!("unknown column '{column}'"),
            ));
        }
        try_outcome!(self.auto_flush(cx).await);
        let mut request = try_result!(query.fetch_request());
        request.joins.clear();
        let queried = self.storage.query(cx, self.unit, &request).await;
        let rows = try_outcome!(self.abort_on_err(queried));
        Outcome::Ok(
            rows.iter()
                .map(|row| row.get_by_name(column).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// Find by key under a lock mode.
    ///
    /// `PESSIMISTIC_WRITE` locks the row first and then reads it, refreshing
    /// a clean managed instance. A lock timeout aborts the unit of work.
    /// `READ_ONLY` exempts a newly loaded entity from dirty checking.
    #[tracing::instrument(level = "debug", skip(self, cx, pk), fields(table = M::TABLE_NAME))]
    pub async fn find_with_lock<M: Model>(
        &mut self,
        cx: &Cx,
        pk: impl Into<Value>,
        mode: LockMode,
    ) -> Outcome<Option<ModelRef<M>>, Error> {
        try_result!(self.ensure_active());
        let pk = vec![pk.into()];
        match mode {
            LockMode::None => self.find_by_key::<M>(cx, pk).await,
            LockMode::ReadOnly => {
                if let Some(hit) = try_result!(self.cached::<M>(&pk)) {
                    return Outcome::Ok(Some(hit));
                }
                let loaded = self.storage.load(cx, self.unit, M::TABLE_NAME, &pk).await;
                let Some(row) = try_outcome!(self.abort_on_err(loaded)) else {
                    return Outcome::Ok(None);
                };
                let entity = try_result!(adopt_row::<M>(&mut self.registry(true, false), &row));
                Outcome::Ok(Some(entity))
            }
            LockMode::PessimisticWrite => {
                if self.pending_delete.contains(&crate::ObjectKey::of::<M>(&pk)) {
                    return Outcome::Ok(None);
                }
                let acquired = self
                    .locks
                    .acquire(cx, &*self.storage, self.unit, M::TABLE_NAME, &pk, mode)
                    .await;
                try_outcome!(self.abort_on_err(acquired));
                let loaded = self.storage.load(cx, self.unit, M::TABLE_NAME, &pk).await;
                let Some(row) = try_outcome!(self.abort_on_err(loaded)) else {
                    return Outcome::Ok(None);
                };
                let entity = try_result!(adopt_row::<M>(&mut self.registry(false, true), &row));
                Outcome::Ok(Some(entity))
            }
        }
    }

    /// Number of row locks this unit holds.
    pub fn held_lock_count(&self) -> usize {
        self.locks.held_count()
    }

    async fn auto_flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.config.auto_flush {
            try_outcome!(self.flush(cx).await);
        }
        Outcome::Ok(())
    }

    async fn fetch_content<M: Model>(&mut self, cx: &Cx, query: &Select<M>) -> Outcome<Vec<ModelRef<M>>, Error> {
        let request = try_result!(query.fetch_request());
        let relationships = try_result!(query.eager_loader().relationships());
        let joined = !request.joins.is_empty();
        let queried = self.storage.query(cx, self.unit, &request).await;
        let mut rows = try_outcome!(self.abort_on_err(queried));

        // Lock every matched row, then read again. A row that started
        // matching while this unit waited is locked on the next pass, so
        // only rows read under a held lock are returned.
        let locking = query.lock_mode() == LockMode::PessimisticWrite;
        if locking {
            loop {
                let mut newly_locked = 0_usize;
                for key in parent_keys::<M>(&rows, joined) {
                    let acquired = self
                        .locks
                        .acquire(cx, &*self.storage, self.unit, M::TABLE_NAME, &key, LockMode::PessimisticWrite)
                        .await;
                    if try_outcome!(self.abort_on_err(acquired)) {
                        newly_locked += 1;
                    }
                }
                if newly_locked == 0 {
                    break;
                }
                let requeried = self.storage.query(cx, self.unit, &request).await;
                rows = try_outcome!(self.abort_on_err(requeried));
            }
        }

        let mut registry = self.registry(query.effective_read_only(), locking);
        Outcome::Ok(try_result!(hydrate::<M>(&mut registry, &rows, &relationships)))
    }
}

fn into_page<M>(fetched: Fetched<M>) -> Page<ModelRef<M>> {
    match fetched {
        Fetched::Page(page) => page,
        Fetched::All(all) => {
            let total = u64::try_from(all.len()).unwrap_or(u64::MAX);
            Page::counted(all, &PageRequest::of(0, total), total)
        }
    }
}

fn key_values(row: &Row, columns: &[&str]) -> Vec<Value> {
    columns
        .iter()
        .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
        .collect()
}

fn parent_keys<M: Model>(rows: &[Row], joined: bool) -> Vec<Vec<Value>> {
    let mut seen = HashSet::new();
    rows.iter()
        .map(|row| {
            if joined {
                key_values(&row.subset_by_prefix(M::TABLE_NAME), M::PRIMARY_KEY)
            } else {
                key_values(row, M::PRIMARY_KEY)
            }
        })
        .filter(|key| seen.insert(hash_key(key)))
        .collect()
}

/// Build managed parents from fetched rows, attaching joined associations.
#[allow(clippy::result_large_err)]
fn hydrate<M: Model>(
    registry: &mut dyn EntityRegistry,
    rows: &[Row],
    relationships: &[&'static RelationshipInfo],
) -> Result<Vec<ModelRef<M>>> {
    if relationships.is_empty() {
        return rows.iter().map(|row| adopt_row::<M>(registry, row)).collect();
    }

    let mut groups: Vec<(Row, Vec<&Row>)> = Vec::new();
    let mut index: HashMap<u64, usize> = HashMap::new();
    for row in rows {
        let parent = row.subset_by_prefix(M::TABLE_NAME);
        let key = hash_key(&key_values(&parent, M::PRIMARY_KEY));
        match index.get(&key) {
            Some(&i) => groups[i].1.push(row),
            None => {
                index.insert(key, groups.len());
                groups.push((parent, vec![row]));
            }
        }
    }

    let mut parents = Vec::with_capacity(groups.len());
    for (parent_row, joined) in &groups {
        let parent = adopt_row::<M>(registry, parent_row)?;
        let view = Managed::from_ref(Arc::clone(&parent));
        for rel in relationships {
            let related = related_rows(joined, rel.name);
            view.attach_joined(rel.name, &related, registry)?;
        }
        parents.push(parent);
    }
    tracing::trace!(rows = rows.len(), parents = parents.len(), "joined rows deduplicated");
    Ok(parents)
}

/// Distinct association rows under `alias`; unmatched left joins are skipped.
fn related_rows(joined: &[&Row], alias: &str) -> Vec<Row> {
    let mut related: Vec<Row> = Vec::new();
    for row in joined {
        let sub = row.subset_by_prefix(alias);
        if sub.is_empty() || sub.is_all_null() {
            continue;
        }
        let duplicate = related.iter().any(|seen| {
            seen.len() == sub.len()
                && seen
                    .iter()
                    .zip(sub.iter())
                    .all(|((c1, v1), (c2, v2))| c1 == c2 && v1.same_as(v2))
        });
        if !duplicate {
            related.push(sub);
        }
    }
    related
}
