//! Association metadata and lazy association references.
//!
//! Associations are described statically on each `Model` through
//! [`RelationshipInfo`]. At runtime an association field is either a
//! to-one [`Lazy<T>`] or a to-many [`LazyMany<T>`]. Both are tagged unions:
//! unresolved (only the key is known) or resolved (the live entities). The
//! session resolves them on first access or the query executor resolves
//! them up front for eager joins. A reference never goes back to unresolved.

use crate::model::{Model, ModelRef, read_model};
use crate::value::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// The type of relationship between two models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationshipKind {
    /// Many-to-one: many `Member`s belong to one `Team`.
    #[default]
    ManyToOne,
    /// One-to-one through a foreign key on the owning side.
    OneToOne,
    /// One-to-many: one `Team` has many `Member`s.
    OneToMany,
}

/// Static description of an association.
///
/// Rows are related when `parent.local_key == related.remote_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipInfo {
    /// Name of the association field.
    pub name: &'static str,

    /// The related model's table name.
    pub related_table: &'static str,

    pub kind: RelationshipKind,

    /// Column on the parent side of the join.
    /// For `ManyToOne` this is the foreign key (`"team_id"` on `member`).
    pub local_key: &'static str,

    /// Column on the related side of the join.
    /// For `OneToMany` this is the foreign key (`"team_id"` on `member`).
    pub remote_key: &'static str,
}

impl RelationshipInfo {
    /// A to-one association through a foreign key on this table.
    pub const fn many_to_one(
        name: &'static str,
        related_table: &'static str,
        foreign_key: &'static str,
        related_key: &'static str,
    ) -> Self {
        Self {
            name,
            related_table,
            kind: RelationshipKind::ManyToOne,
            local_key: foreign_key,
            remote_key: related_key,
        }
    }

    /// A to-many association through a foreign key on the related table.
    pub const fn one_to_many(
        name: &'static str,
        related_table: &'static str,
        local_key: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self {
            name,
            related_table,
            kind: RelationshipKind::OneToMany,
            local_key,
            remote_key: foreign_key,
        }
    }

    /// Does a join over this association fan out parent rows?
    pub const fn is_to_many(&self) -> bool {
        matches!(self.kind, RelationshipKind::OneToMany)
    }
}

/// Find a relationship by field name.
pub fn find_relationship(
    relationships: &'static [RelationshipInfo],
    name: &str,
) -> Option<&'static RelationshipInfo> {
    relationships.iter().find(|r| r.name == name)
}

/// Observable state of a to-one reference.
#[derive(Debug)]
pub enum LazyState<'a, T> {
    /// No foreign key (NULL association).
    Empty,
    /// Only the foreign key is known.
    Unresolved(&'a Value),
    /// The related entity has been loaded.
    Resolved(&'a ModelRef<T>),
}

/// A to-one association reference.
///
/// Clones share one resolution cell: resolving a clone taken out of an
/// entity resolves the entity's own field too.
pub struct Lazy<T> {
    fk: Option<Value>,
    cell: Arc<OnceLock<ModelRef<T>>>,
}

impl<T: Model> Lazy<T> {
    /// Unresolved reference to the row keyed by `fk`. NULL gives an empty
    /// reference.
    pub fn from_fk(fk: impl Into<Value>) -> Self {
        let fk = fk.into();
        Self {
            fk: (!fk.is_null()).then_some(fk),
            cell: Arc::new(OnceLock::new()),
        }
    }

    /// Reference with no related row.
    pub fn empty() -> Self {
        Self {
            fk: None,
            cell: Arc::new(OnceLock::new()),
        }
    }

    /// Reference already pointing at a managed or transient entity.
    ///
    /// The foreign key follows the target, so a transient target inserted
    /// earlier in the same flush contributes its generated key.
    pub fn to(target: &ModelRef<T>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Arc::clone(target));
        Self {
            fk: None,
            cell: Arc::new(cell),
        }
    }

    pub fn state(&self) -> LazyState<'_, T> {
        match (self.cell.get(), &self.fk) {
            (Some(target), _) => LazyState::Resolved(target),
            (None, Some(fk)) => LazyState::Unresolved(fk),
            (None, None) => LazyState::Empty,
        }
    }

    /// The resolved entity, if any. Never touches storage.
    pub fn get(&self) -> Option<&ModelRef<T>> {
        self.cell.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }

    /// The foreign key column value as it would be persisted now.
    pub fn fk_value(&self) -> Value {
        match self.cell.get() {
            Some(target) => read_model(target)
                .primary_key_value()
                .into_iter()
                .next()
                .unwrap_or(Value::Null),
            None => self.fk.clone().unwrap_or(Value::Null),
        }
    }

    /// Transition to resolved. Returns `false` (and keeps the first value)
    /// when the reference was already resolved.
    pub fn resolve_with(&self, target: ModelRef<T>) -> bool {
        let fresh = self.cell.set(target).is_ok();
        if !fresh {
            tracing::trace!(table = T::TABLE_NAME, "reference already resolved; keeping first value");
        }
        fresh
    }
}

impl<T> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            fk: self.fk.clone(),
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Model> Default for Lazy<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy")
            .field("fk", &self.fk)
            .field("resolved", &self.cell.get().is_some())
            .finish()
    }
}

/// Observable state of a to-many reference.
#[derive(Debug)]
pub enum LazyManyState<'a, T> {
    /// Only the parent key is known.
    Unresolved(&'a Value),
    /// The related collection has been loaded.
    Resolved(&'a [ModelRef<T>]),
}

/// A to-many association reference (the inverse, non-owning side).
pub struct LazyMany<T> {
    remote_key: &'static str,
    parent_key: Value,
    cell: Arc<OnceLock<Vec<ModelRef<T>>>>,
}

impl<T: Model> LazyMany<T> {
    /// Unresolved collection of `T` rows whose `remote_key` equals `parent_key`.
    pub fn new(remote_key: &'static str, parent_key: impl Into<Value>) -> Self {
        Self {
            remote_key,
            parent_key: parent_key.into(),
            cell: Arc::new(OnceLock::new()),
        }
    }

    /// An already-resolved empty collection, for transient parents.
    pub fn transient(remote_key: &'static str) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Vec::new());
        Self {
            remote_key,
            parent_key: Value::Null,
            cell: Arc::new(cell),
        }
    }

    pub fn remote_key(&self) -> &'static str {
        self.remote_key
    }

    pub fn parent_key(&self) -> &Value {
        &self.parent_key
    }

    pub fn state(&self) -> LazyManyState<'_, T> {
        match self.cell.get() {
            Some(items) => LazyManyState::Resolved(items),
            None => LazyManyState::Unresolved(&self.parent_key),
        }
    }

    pub fn get(&self) -> Option<&[ModelRef<T>]> {
        self.cell.get().map(Vec::as_slice)
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Transition to resolved; a second call is ignored and returns `false`.
    pub fn resolve_with(&self, items: Vec<ModelRef<T>>) -> bool {
        self.cell.set(items).is_ok()
    }
}

impl<T> Clone for LazyMany<T> {
    fn clone(&self) -> Self {
        Self {
            remote_key: self.remote_key,
            parent_key: self.parent_key.clone(),
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for LazyMany<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyMany")
            .field("remote_key", &self.remote_key)
            .field("parent_key", &self.parent_key)
            .field("resolved", &self.cell.get().map(Vec::len))
            .finish()
    }
}
