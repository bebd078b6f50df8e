//! Query descriptors and the storage boundary for persist.
//!
//! `persist-query` is the **description layer**. It turns `Model` metadata
//! into inert descriptors that the session executes:
//!
//! - **Expressions**: `Expr` predicates, evaluated against rows by storage engines.
//! - **Descriptors**: `Select` with ordering, pagination, eager joins and lock mode.
//! - **Pages**: `PageRequest` in, `Page<T>` out.
//! - **Storage**: the `Storage` trait every engine implements.

pub mod clause;
pub mod eager;
pub mod expr;
pub mod page;
pub mod select;
pub mod storage;

#[cfg(test)]
mod fixtures;

pub use clause::{OrderBy, OrderDirection, Window, compare_rows};
pub use eager::EagerLoader;
pub use expr::{BinaryOp, Expr, UnaryOp};
pub use page::{Page, PageRequest, Pagination};
pub use select::Select;
pub use storage::{
    Assignment, FetchRequest, JoinSpec, LockMode, Storage, UnitId, WriteOp, WriteResult,
};

/// Create a query descriptor for a model.
///
/// # Example
///
/// ```ignore
/// let adults = select!(Member).filter(Expr::col("age").ge(18));
/// ```
#[macro_export]
macro_rules! select {
    ($model:ty) => {
        $crate::Select::<$model>::new()
    };
}
