//! persist - a unit-of-work persistence context for Rust.
//!
//! persist keeps one managed instance per table row for the life of a unit
//! of work and writes back whatever changed when the unit commits:
//!
//! - Identity map: repeated lookups return the same instance
//! - Dirty checking against load-time snapshots, with read-only exemption
//! - Lazy to-one and to-many references, or eager joins in one fetch
//! - Counted pages and uncounted slices
//! - Bulk updates that evict the affected table
//! - Pessimistic row locks released at commit or discard
//! - Creation and modification audit stamps
//!
//! # Quick Start
//!
//! ```ignore
//! use persist::prelude::*;
//!
//! async fn rename(cx: &Cx, storage: Arc<MemoryStorage>) {
//!     let mut session = Session::begin(cx, storage).await.unwrap();
//!
//!     let member = session.find::<Member>(cx, 1).await.unwrap().unwrap();
//!     write_model(&member).username = "renamed".into();
//!
//!     // one UPDATE, written at commit
//!     session.commit(cx).await.unwrap();
//! }
//! ```
//!
//! Storage engines implement [`Storage`]; [`MemoryStorage`] is the bundled
//! in-memory engine.

pub use persist_core::{
    AUDIT_FIELDS, ActorId, AuditFields, Cx, DescriptorError, EntityRegistry, Error, FieldInfo,
    FromValue, IdentityError, IdentityErrorKind, Lazy, LazyMany, LazyManyState, LazyState,
    LockError, LockErrorKind, Managed, ManagedEntity, Model, ModelRef, Outcome, QueryError,
    QueryErrorKind, RelationshipInfo, RelationshipKind, Result, Row, SqlType, TransactionError,
    TransactionErrorKind, TypeError, Value, adopt_row, downcast, read_model, write_model,
};

pub use persist_query::{
    Assignment, BinaryOp, EagerLoader, Expr, FetchRequest, JoinSpec, LockMode, OrderBy,
    OrderDirection, Page, PageRequest, Pagination, Select, Storage, UnaryOp, UnitId, Window,
    WriteOp, WriteResult, select,
};

pub use persist_session::{
    AuditInterceptor, BulkMutation, CallSite, Clock, CurrentActorProvider, Fetched, FixedActor,
    FixedClock, FlushResult, InvalidationMode, N1Stats, NoActor, Session, SessionConfig,
    SystemClock,
};

pub use persist_memory::{MemoryStorage, StorageStats};

/// Everything needed to define models and run a unit of work.
pub mod prelude {
    pub use crate::{
        AUDIT_FIELDS, AuditFields, AuditInterceptor, BulkMutation, Cx, EntityRegistry, Error,
        Expr, FieldInfo, InvalidationMode, Lazy, LazyMany, LockMode, MemoryStorage, Model,
        ModelRef, OrderBy, Outcome, Page, PageRequest, RelationshipInfo, Result, Row, Select,
        Session, SessionConfig, SqlType, Storage, Value, adopt_row, read_model, select,
        write_model,
    };
    pub use std::sync::Arc;
}
