//! Audit columns carried by auditable entities.

use crate::Result;
use crate::field::{FieldInfo, SqlType};
use crate::row::Row;
use crate::value::Value;

/// Actor identifier stamped into audit columns.
pub type ActorId = String;

pub const CREATED_BY: &str = "created_by";
pub const CREATED_AT: &str = "created_at";
pub const LAST_MODIFIED_BY: &str = "last_modified_by";
pub const LAST_MODIFIED_AT: &str = "last_modified_at";

/// Field metadata for the four audit columns.
///
/// The creation columns are not updatable: once inserted, flushes never
/// write them again.
pub const AUDIT_FIELDS: [FieldInfo; 4] = [
    FieldInfo::new("created_by", CREATED_BY, SqlType::Text)
        .nullable(true)
        .updatable(false),
    FieldInfo::new("created_at", CREATED_AT, SqlType::Timestamp)
        .nullable(true)
        .updatable(false),
    FieldInfo::new("last_modified_by", LAST_MODIFIED_BY, SqlType::Text).nullable(true),
    FieldInfo::new("last_modified_at", LAST_MODIFIED_AT, SqlType::Timestamp).nullable(true),
];

/// Creation and modification stamps embedded in an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFields {
    pub created_by: Option<ActorId>,
    /// Microseconds since epoch
    pub created_at: Option<i64>,
    pub last_modified_by: Option<ActorId>,
    pub last_modified_at: Option<i64>,
}

impl AuditFields {
    /// Read the audit columns from a row. Missing columns read as NULL.
    #[allow(clippy::result_large_err)]
    pub fn from_row(row: &Row) -> Result<Self> {
        let text = |column: &str| -> Result<Option<String>> {
            match row.get_by_name(column) {
                Some(_) => row.get_named(column),
                None => Ok(None),
            }
        };
        let stamp = |column: &str| -> Result<Option<i64>> {
            match row.get_by_name(column) {
                Some(_) => row.get_named(column),
                None => Ok(None),
            }
        };
        Ok(Self {
            created_by: text(CREATED_BY)?,
            created_at: stamp(CREATED_AT)?,
            last_modified_by: text(LAST_MODIFIED_BY)?,
            last_modified_at: stamp(LAST_MODIFIED_AT)?,
        })
    }

    /// Column/value pairs to append to `Model::to_row`.
    pub fn to_row(&self) -> [(&'static str, Value); 4] {
        [
            (CREATED_BY, Value::from(self.created_by.clone())),
            (CREATED_AT, self.created_at.map_or(Value::Null, Value::Timestamp)),
            (LAST_MODIFIED_BY, Value::from(self.last_modified_by.clone())),
            (
                LAST_MODIFIED_AT,
                self.last_modified_at.map_or(Value::Null, Value::Timestamp),
            ),
        ]
    }
}
