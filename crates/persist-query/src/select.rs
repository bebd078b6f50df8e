//! Query descriptors.
//!
//! A [`Select`] describes what to fetch: predicate, ordering, windowing,
//! associations to join eagerly, and the lock mode. It is inert until the
//! session executes it; [`Select::validate`] rejects combinations that cannot
//! be executed correctly before any storage call is made.

use crate::clause::{OrderBy, Window};
use crate::eager::EagerLoader;
use crate::expr::Expr;
use crate::page::{PageRequest, Pagination};
use crate::storage::{FetchRequest, LockMode};
use persist_core::{Error, Model, Result};
use std::marker::PhantomData;

/// A query descriptor for model `M`.
#[derive(Debug, Clone)]
pub struct Select<M: Model> {
    /// WHERE predicate
    filter: Option<Expr>,
    /// Predicate of the independent count fetch, when it differs
    count_filter: Option<Expr>,
    order: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
    pagination: Option<Pagination>,
    eager: EagerLoader<M>,
    lock: LockMode,
    /// Read-only hint without a lock mode
    read_only: bool,
    _marker: PhantomData<M>,
}

impl<M: Model> Select<M> {
    pub fn new() -> Self {
        Self {
            filter: None,
            count_filter: None,
            order: Vec::new(),
            limit: None,
            offset: None,
            pagination: None,
            eager: EagerLoader::new(),
            lock: LockMode::None,
            read_only: false,
            _marker: PhantomData,
        }
    }

    /// Add a WHERE condition; repeated calls are ANDed.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Use a separate predicate for the total count of a paged fetch.
    pub fn count_filter(mut self, expr: Expr) -> Self {
        self.count_filter = Some(expr);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    /// Fetch one counted page. The request's sort is appended to the order.
    pub fn paged(self, request: PageRequest) -> Self {
        self.paginate(Pagination::Paged(request))
    }

    /// Fetch one uncounted slice. The request's sort is appended to the order.
    pub fn sliced(self, request: PageRequest) -> Self {
        self.paginate(Pagination::Sliced(request))
    }

    fn paginate(mut self, pagination: Pagination) -> Self {
        for term in &pagination.request().sort {
            if !self.order.iter().any(|o| o.column == term.column) {
                self.order.push(term.clone());
            }
        }
        self.pagination = Some(pagination);
        self
    }

    pub fn eager(mut self, loader: EagerLoader<M>) -> Self {
        self.eager = loader;
        self
    }

    /// Join one association eagerly.
    pub fn include(mut self, relationship: &'static str) -> Self {
        self.eager = self.eager.include(relationship);
        self
    }

    pub fn lock(mut self, mode: LockMode) -> Self {
        self.lock = mode;
        self
    }

    /// Exempt fetched entities from dirty checking.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn filter_expr(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    /// Predicate of the count fetch.
    pub fn count_expr(&self) -> Option<&Expr> {
        self.count_filter.as_ref().or(self.filter.as_ref())
    }

    pub fn order(&self) -> &[OrderBy] {
        &self.order
    }

    pub fn pagination(&self) -> Option<&Pagination> {
        self.pagination.as_ref()
    }

    pub fn eager_loader(&self) -> &EagerLoader<M> {
        &self.eager
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock
    }

    pub fn effective_read_only(&self) -> bool {
        self.read_only || self.lock == LockMode::ReadOnly
    }

    /// Window over parent rows for the content fetch.
    ///
    /// A slice reads one row past the page to learn whether another follows.
    pub fn content_window(&self) -> Option<Window> {
        match &self.pagination {
            Some(Pagination::Paged(request)) => Some(request.window()),
            Some(Pagination::Sliced(request)) => Some(request.lookahead_window()),
            None if self.limit.is_some() || self.offset.is_some() => Some(Window::new(
                self.offset.unwrap_or(0),
                self.limit.unwrap_or(u64::MAX),
            )),
            None => None,
        }
    }

    /// Reject descriptors that cannot be executed as described.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::invalid_descriptor(M::TABLE_NAME, message));

        for expr in [self.filter.as_ref(), self.count_filter.as_ref()]
            .into_iter()
            .flatten()
        {
            for column in expr.columns() {
                if !is_column::<M>(column) {
                    return invalid(format!("unknown column '{column}' in predicate"));
                }
            }
        }
        for term in &self.order {
            if !is_column::<M>(&term.column) {
                return invalid(format!("unknown sort column '{}'", term.column));
            }
        }

        let to_many = self.eager.has_to_many()?;
        if let Some(pagination) = &self.pagination {
            if pagination.request().size == 0 {
                return invalid("page size must be at least 1".to_string());
            }
            if self.limit.is_some() || self.offset.is_some() {
                return invalid("limit/offset cannot be combined with pagination".to_string());
            }
            if to_many {
                return invalid(
                    "pagination cannot be combined with an eager to-many join".to_string(),
                );
            }
        } else if to_many && (self.limit.is_some() || self.offset.is_some()) {
            return invalid("limit/offset cannot be combined with an eager to-many join".to_string());
        }

        if self.read_only && self.lock == LockMode::PessimisticWrite {
            return invalid("a read-only fetch cannot take a write lock".to_string());
        }
        Ok(())
    }

    /// The storage request for the content fetch.
    #[allow(clippy::result_large_err)]
    pub fn fetch_request(&self) -> Result<FetchRequest> {
        Ok(FetchRequest {
            table: M::TABLE_NAME,
            filter: self.filter.clone(),
            order: self.order.clone(),
            window: self.content_window(),
            joins: self.eager.joins()?,
        })
    }
}

impl<M: Model> Default for Select<M> {
    fn default() -> Self {
        Self::new()
    }
}

fn is_column<M: Model>(name: &str) -> bool {
    M::fields().iter().any(|f| f.column_name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{Member, Team};

    #[test]
    fn filters_are_anded() {
        let q = Select::<Member>::new()
            .filter(Expr::col("username").eq("AAA"))
            .filter(Expr::col("age").gt(10));
        assert_eq!(
            q.filter_expr(),
            Some(&Expr::col("username").eq("AAA").and(Expr::col("age").gt(10)))
        );
        assert_eq!(q.count_expr(), q.filter_expr());
    }

    #[test]
    fn count_filter_overrides() {
        let q = Select::<Member>::new()
            .filter(Expr::col("age").eq(10))
            .count_filter(Expr::col("age").ge(0));
        assert_eq!(q.count_expr(), Some(&Expr::col("age").ge(0)));
    }

    #[test]
    fn paged_merges_sort_and_windows() {
        let q = Select::<Member>::new()
            .filter(Expr::col("age").eq(10))
            .paged(PageRequest::of(0, 3).with_sort(OrderBy::desc("username")));
        assert!(q.validate().is_ok());
        assert_eq!(q.order(), [OrderBy::desc("username")]);
        assert_eq!(q.content_window(), Some(Window::new(0, 3)));

        let slice = Select::<Member>::new().sliced(PageRequest::of(1, 3));
        assert_eq!(slice.content_window(), Some(Window::new(3, 4)));
    }

    #[test]
    fn limit_and_offset_window() {
        let q = Select::<Member>::new().order_by(OrderBy::desc("age")).limit(3);
        assert_eq!(q.content_window(), Some(Window::new(0, 3)));
        assert_eq!(Select::<Member>::new().content_window(), None);
    }

    #[test]
    fn to_many_join_with_pagination_is_rejected() {
        let err = Select::<Team>::new()
            .include("members")
            .paged(PageRequest::of(0, 2))
            .validate()
            .unwrap_err();
        assert!(err.is_invalid_descriptor());

        let err = Select::<Team>::new().include("members").limit(2).validate().unwrap_err();
        assert!(err.is_invalid_descriptor());

        // a to-one join keeps one row per parent, so paging is fine
        assert!(
            Select::<Member>::new()
                .include("team")
                .paged(PageRequest::of(0, 2))
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn rejects_unknown_columns_and_bad_combinations() {
        let unknown = Select::<Member>::new().filter(Expr::col("nickname").eq("x"));
        assert!(unknown.validate().unwrap_err().is_invalid_descriptor());

        let sort = Select::<Member>::new().order_by(OrderBy::asc("rank"));
        assert!(sort.validate().is_err());

        let zero = Select::<Member>::new().paged(PageRequest::of(0, 0));
        assert!(zero.validate().is_err());

        let both = Select::<Member>::new().limit(1).paged(PageRequest::of(0, 2));
        assert!(both.validate().is_err());

        let locked = Select::<Member>::new()
            .read_only()
            .lock(LockMode::PessimisticWrite);
        assert!(locked.validate().is_err());

        assert!(Select::<Member>::new().include("owner").validate().is_err());
    }

    #[test]
    fn read_only_lock_mode_is_read_only() {
        assert!(Select::<Member>::new().lock(LockMode::ReadOnly).effective_read_only());
        assert!(Select::<Member>::new().read_only().effective_read_only());
        assert!(!Select::<Member>::new().effective_read_only());
    }

    #[test]
    fn fetch_request_carries_joins() {
        let request = Select::<Member>::new()
            .include("team")
            .order_by(OrderBy::asc("member_id"))
            .fetch_request()
            .unwrap();
        assert_eq!(request.table, "member");
        assert_eq!(request.joins.len(), 1);
        assert_eq!(request.joins[0].alias, "team");
        assert!(request.window.is_none());
    }
}
