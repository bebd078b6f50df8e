//! Core types and traits for the persist unit-of-work layer.
//!
//! - `Model` trait mapping structs to storage rows
//! - `Lazy` / `LazyMany` association references
//! - `ManagedEntity` type erasure used by the session
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

pub use asupersync::{Cx, Outcome};

pub mod audit;
pub mod error;
pub mod field;
pub mod model;
pub mod relationship;
pub mod row;
pub mod value;

pub use audit::{AUDIT_FIELDS, ActorId, AuditFields};
pub use error::{
    DescriptorError, Error, IdentityError, IdentityErrorKind, LockError, LockErrorKind,
    QueryError, QueryErrorKind, Result, TransactionError, TransactionErrorKind, TypeError,
};
pub use field::{FieldInfo, SqlType, find_field};
pub use model::{
    EntityRegistry, Managed, ManagedEntity, Model, ModelRef, adopt_row, downcast, read_model,
    write_model,
};
pub use relationship::{
    Lazy, LazyMany, LazyManyState, LazyState, RelationshipInfo, RelationshipKind,
    find_relationship,
};
pub use row::{FromValue, Row};
pub use value::{Value, hash_key, same_key};
