//! Model trait and type-erased managed entities.
//!
//! A `Model` maps a Rust struct to a table. Inside a unit of work every
//! loaded model lives behind a [`ModelRef`], and the session keeps a
//! type-erased [`ManagedEntity`] view of the same allocation so that flush
//! can diff, stamp and write entities of any type.

use crate::Result;
use crate::audit::AuditFields;
use crate::error::Error;
use crate::field::FieldInfo;
use crate::relationship::RelationshipInfo;
use crate::row::Row;
use crate::value::Value;
use std::any::Any;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared handle to a managed model. Two handles to the same entity within
/// one unit of work are `Arc::ptr_eq`.
pub type ModelRef<M> = Arc<RwLock<M>>;

/// Read-lock a model handle, recovering from poisoning.
pub fn read_model<M>(model: &ModelRef<M>) -> RwLockReadGuard<'_, M> {
    model.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-lock a model handle, recovering from poisoning.
pub fn write_model<M>(model: &ModelRef<M>) -> RwLockWriteGuard<'_, M> {
    model.write().unwrap_or_else(PoisonError::into_inner)
}

/// Trait for types that can be mapped to storage tables.
///
/// # Example
///
/// ```ignore
/// impl Model for Team {
///     const TABLE_NAME: &'static str = "team";
///     const PRIMARY_KEY: &'static [&'static str] = &["team_id"];
///
///     fn fields() -> &'static [FieldInfo] { &TEAM_FIELDS }
///     fn to_row(&self) -> Vec<(&'static str, Value)> {
///         vec![("team_id", self.id.into()), ("name", self.name.clone().into())]
///     }
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Team { id: row.get_named("team_id")?, name: row.get_named("name")? })
///     }
///     fn primary_key_value(&self) -> Vec<Value> { vec![self.id.into()] }
/// }
/// ```
pub trait Model: Sized + Send + Sync + 'static {
    /// The name of the storage table.
    const TABLE_NAME: &'static str;

    /// The primary key column name(s).
    const PRIMARY_KEY: &'static [&'static str];

    /// Association metadata for this model.
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[];

    /// Get field metadata for all persisted columns.
    fn fields() -> &'static [FieldInfo];

    /// Convert this model instance to persisted column values.
    ///
    /// To-one associations contribute their foreign key column.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Construct a model instance from a storage row.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;

    /// Get the value of the primary key field(s).
    fn primary_key_value(&self) -> Vec<Value>;

    /// Check if this is a transient record (no identity assigned yet).
    fn is_new(&self) -> bool {
        self.primary_key_value().iter().any(Value::is_null)
    }

    /// Receive the key storage generated on insert.
    fn assign_generated_key(&mut self, _key: &Value) {}

    /// Audit stamps for auditable models; `None` opts out of auditing.
    fn audit_fields_mut(&mut self) -> Option<&mut AuditFields> {
        None
    }

    /// Populate an eagerly joined association from the joined rows.
    ///
    /// `rows` holds the related rows for this parent with the join prefix
    /// stripped; it is empty when the left join found nothing. Related
    /// entities must be obtained through `registry` (see [`adopt_row`]) so
    /// that the identity-map invariant holds.
    #[allow(clippy::result_large_err)]
    fn attach_joined(
        &self,
        relationship: &str,
        _rows: &[Row],
        _registry: &mut dyn EntityRegistry,
    ) -> Result<()> {
        Err(Error::invalid_descriptor(
            Self::TABLE_NAME,
            format!("'{relationship}' cannot be eagerly joined"),
        ))
    }
}

/// Type-erased view of a managed entity.
pub trait ManagedEntity: Send + Sync {
    fn table(&self) -> &'static str;

    fn fields(&self) -> &'static [FieldInfo];

    /// Primary key column names, in key order.
    fn primary_key_columns(&self) -> &'static [&'static str];

    fn primary_key(&self) -> Vec<Value>;

    /// Current persisted column values of the entity.
    fn current_row(&self) -> Vec<(&'static str, Value)>;

    fn is_new(&self) -> bool;

    fn assign_generated_key(&self, key: &Value);

    /// Run `stamp` against the audit fields. Returns `false` for entities
    /// that are not audited.
    fn stamp_audit(&self, stamp: &mut dyn FnMut(&mut AuditFields)) -> bool;

    /// Overwrite the entity in place with a freshly loaded row.
    #[allow(clippy::result_large_err)]
    fn refresh_from(&self, row: &Row) -> Result<()>;

    #[allow(clippy::result_large_err)]
    fn attach_joined(
        &self,
        relationship: &str,
        rows: &[Row],
        registry: &mut dyn EntityRegistry,
    ) -> Result<()>;

    /// True when both views point at the same allocation.
    fn same_instance(&self, other: &dyn ManagedEntity) -> bool {
        std::ptr::addr_eq(self.instance_ptr(), other.instance_ptr())
    }

    fn instance_ptr(&self) -> *const ();

    fn as_any(&self) -> &dyn Any;
}

/// A `ModelRef` wrapped for type erasure.
pub struct Managed<M> {
    inner: ModelRef<M>,
}

impl<M: Model> Managed<M> {
    pub fn new(model: M) -> Self {
        Self {
            inner: Arc::new(RwLock::new(model)),
        }
    }

    pub fn from_ref(inner: ModelRef<M>) -> Self {
        Self { inner }
    }

    /// A new strong handle to the same entity.
    pub fn handle(&self) -> ModelRef<M> {
        Arc::clone(&self.inner)
    }
}

impl<M: Model> ManagedEntity for Managed<M> {
    fn table(&self) -> &'static str {
        M::TABLE_NAME
    }

    fn fields(&self) -> &'static [FieldInfo] {
        M::fields()
    }

    fn primary_key_columns(&self) -> &'static [&'static str] {
        M::PRIMARY_KEY
    }

    fn primary_key(&self) -> Vec<Value> {
        read_model(&self.inner).primary_key_value()
    }

    fn current_row(&self) -> Vec<(&'static str, Value)> {
        read_model(&self.inner).to_row()
    }

    fn is_new(&self) -> bool {
        read_model(&self.inner).is_new()
    }

    fn assign_generated_key(&self, key: &Value) {
        write_model(&self.inner).assign_generated_key(key);
    }

    fn stamp_audit(&self, stamp: &mut dyn FnMut(&mut AuditFields)) -> bool {
        let mut guard = write_model(&self.inner);
        match guard.audit_fields_mut() {
            Some(audit) => {
                stamp(audit);
                true
            }
            None => false,
        }
    }

    fn refresh_from(&self, row: &Row) -> Result<()> {
        let fresh = M::from_row(row)?;
        *write_model(&self.inner) = fresh;
        Ok(())
    }

    fn attach_joined(
        &self,
        relationship: &str,
        rows: &[Row],
        registry: &mut dyn EntityRegistry,
    ) -> Result<()> {
        read_model(&self.inner).attach_joined(relationship, rows, registry)
    }

    fn instance_ptr(&self) -> *const () {
        Arc::as_ptr(&self.inner).cast::<()>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sink through which loaded rows become managed entities.
///
/// The session implements this over its identity map and change tracker.
pub trait EntityRegistry {
    /// Return the instance already managed under the candidate's key, or
    /// start managing the candidate and return it.
    #[allow(clippy::result_large_err)]
    fn adopt(&mut self, candidate: Arc<dyn ManagedEntity>) -> Result<Arc<dyn ManagedEntity>>;
}

/// Recover the typed handle from a type-erased entity.
pub fn downcast<M: Model>(entity: &dyn ManagedEntity) -> Option<ModelRef<M>> {
    entity.as_any().downcast_ref::<Managed<M>>().map(Managed::handle)
}

/// Build `M` from `row` and route it through `registry`.
#[allow(clippy::result_large_err)]
pub fn adopt_row<M: Model>(registry: &mut dyn EntityRegistry, row: &Row) -> Result<ModelRef<M>> {
    let candidate: Arc<dyn ManagedEntity> = Arc::new(Managed::new(M::from_row(row)?));
    let managed = registry.adopt(candidate)?;
    downcast::<M>(&*managed).ok_or_else(|| {
        Error::Custom(format!(
            "entity managed under table '{}' is not a {}",
            M::TABLE_NAME,
            std::any::type_name::<M>()
        ))
    })
}
