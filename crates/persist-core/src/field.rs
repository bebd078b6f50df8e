//! Field and column definitions.

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Boolean,
    Integer,
    BigInt,
    Double,
    Text,
    Blob,
    Timestamp,
    Json,
}

/// Metadata about a model field/column.
#[derive(Debug, Clone, Copy)]
pub struct FieldInfo {
    /// Rust field name
    pub name: &'static str,
    /// Column name in storage (may differ from field name)
    pub column_name: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    /// Whether storage assigns the value on insert
    pub auto_increment: bool,
    /// Whether an UPDATE may change the column. Changes to non-updatable
    /// columns are dropped at flush without error.
    pub updatable: bool,
    /// Foreign key reference (table.column)
    pub foreign_key: Option<&'static str>,
}

impl FieldInfo {
    /// Create a new field info with minimal required data.
    pub const fn new(name: &'static str, column_name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column_name,
            sql_type,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            updatable: true,
            foreign_key: None,
        }
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    /// Mark the column as written once on insert and never updated.
    pub const fn updatable(mut self, value: bool) -> Self {
        self.updatable = value;
        self
    }

    pub const fn foreign_key(mut self, reference: &'static str) -> Self {
        self.foreign_key = Some(reference);
        self
    }
}

/// Look up a field by its column name.
pub fn find_field<'a>(fields: &'a [FieldInfo], column: &str) -> Option<&'a FieldInfo> {
    fields.iter().find(|f| f.column_name == column)
}
