//! The storage boundary.
//!
//! A [`Storage`] engine owns rows, transactions and row locks. The session
//! talks to it only through this trait: every fetch, write, bulk mutation
//! and lock request of a unit of work carries the [`UnitId`] returned by
//! [`Storage::begin_unit`].

use crate::clause::{OrderBy, Window};
use crate::expr::Expr;
use asupersync::{Cx, Outcome};
use persist_core::{Error, RelationshipInfo, Row, Value};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Identifier of one storage-side unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Locking requested for a fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockMode {
    #[default]
    None,
    /// No storage lock; fetched entities are exempt from dirty checking.
    ReadOnly,
    /// Row-level write lock held until the unit of work ends.
    PessimisticWrite,
}

/// A left join folded into a fetch.
///
/// Joined rows name parent columns `{table}__{column}` and related columns
/// `{alias}__{column}`. An unmatched parent yields one row without any
/// `{alias}__` columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSpec {
    /// Relationship name, used as the column prefix
    pub alias: &'static str,
    pub table: &'static str,
    /// Column on the parent row
    pub local_key: &'static str,
    /// Column on the joined row
    pub remote_key: &'static str,
}

impl From<&RelationshipInfo> for JoinSpec {
    fn from(rel: &RelationshipInfo) -> Self {
        Self {
            alias: rel.name,
            table: rel.related_table,
            local_key: rel.local_key,
            remote_key: rel.remote_key,
        }
    }
}

/// Everything a content fetch needs.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub table: &'static str,
    pub filter: Option<Expr>,
    pub order: Vec<OrderBy>,
    /// Applied to parent rows before any join
    pub window: Option<Window>,
    pub joins: Vec<JoinSpec>,
}

impl FetchRequest {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            filter: None,
            order: Vec::new(),
            window: None,
            joins: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn window(mut self, window: Window) -> Self {
        self.window = Some(window);
        self
    }
}

/// One entity-level write issued at flush.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert a row. A NULL auto-increment key is assigned by storage.
    Insert {
        table: &'static str,
        primary_key: &'static [&'static str],
        values: Vec<(&'static str, Value)>,
    },
    /// Overwrite the given columns of one row.
    Update {
        table: &'static str,
        primary_key: &'static [&'static str],
        key: Vec<Value>,
        values: Vec<(&'static str, Value)>,
    },
    Delete {
        table: &'static str,
        primary_key: &'static [&'static str],
        key: Vec<Value>,
    },
}

impl WriteOp {
    pub fn table(&self) -> &'static str {
        match self {
            WriteOp::Insert { table, .. }
            | WriteOp::Update { table, .. }
            | WriteOp::Delete { table, .. } => table,
        }
    }
}

/// Outcome of a single write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResult {
    pub affected: u64,
    /// Key assigned by storage on insert
    pub generated_key: Option<Value>,
}

/// `column = expr` applied by a bulk mutation; `expr` is evaluated against
/// the row before the mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: &'static str,
    pub value: Expr,
}

impl Assignment {
    pub fn set(column: &'static str, value: impl Into<Expr>) -> Self {
        Self {
            column,
            value: value.into(),
        }
    }
}

/// A storage engine seen from the persistence context.
pub trait Storage: Send + Sync {
    /// Open a storage-side unit of work.
    fn begin_unit(&self, cx: &Cx) -> impl Future<Output = Outcome<UnitId, Error>> + Send;

    /// Make the unit's writes durable and release its locks.
    fn commit(&self, cx: &Cx, unit: UnitId) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Drop the unit's writes and release its locks.
    fn discard(&self, cx: &Cx, unit: UnitId) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Synchronous discard for handles dropped without commit or discard.
    fn abandon_unit(&self, unit: UnitId);

    /// Load one row by primary key.
    fn load(
        &self,
        cx: &Cx,
        unit: UnitId,
        table: &'static str,
        key: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;

    /// Fetch rows matching a request.
    fn query(
        &self,
        cx: &Cx,
        unit: UnitId,
        request: &FetchRequest,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Count rows matching a predicate.
    fn count(
        &self,
        cx: &Cx,
        unit: UnitId,
        table: &'static str,
        filter: Option<&Expr>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Apply one entity-level write.
    fn write(
        &self,
        cx: &Cx,
        unit: UnitId,
        op: WriteOp,
    ) -> impl Future<Output = Outcome<WriteResult, Error>> + Send;

    /// Set-based update; returns the number of rows changed.
    fn bulk_mutate(
        &self,
        cx: &Cx,
        unit: UnitId,
        table: &'static str,
        filter: Option<&Expr>,
        assignments: &[Assignment],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Set-based delete; returns the number of rows removed.
    fn bulk_delete(
        &self,
        cx: &Cx,
        unit: UnitId,
        table: &'static str,
        filter: Option<&Expr>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Acquire a row lock for the rest of the unit, waiting up to `timeout`.
    fn acquire_lock(
        &self,
        cx: &Cx,
        unit: UnitId,
        table: &'static str,
        key: &[Value],
        mode: LockMode,
        timeout: Duration,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;
}
