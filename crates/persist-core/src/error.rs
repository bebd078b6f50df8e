//! Error types for persistence-context operations.

use crate::value::Value;
use std::fmt;
use std::time::Duration;

/// The primary error type for all persist operations.
#[derive(Debug)]
pub enum Error {
    /// Identity map and association integrity errors
    Identity(IdentityError),
    /// Row lock acquisition errors
    Lock(LockError),
    /// A query descriptor was rejected before execution
    Descriptor(DescriptorError),
    /// Query execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Unit-of-work lifecycle errors
    Transaction(TransactionError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct IdentityError {
    pub kind: IdentityErrorKind,
    pub table: &'static str,
    pub key: Vec<Value>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityErrorKind {
    /// A different instance is already registered under the same key
    DuplicateIdentity,
    /// The referenced row does not exist in storage
    DanglingReference,
    /// A cached instance was read after a non-evicting bulk mutation
    StaleReadHazard,
}

#[derive(Debug)]
pub struct LockError {
    pub kind: LockErrorKind,
    pub table: &'static str,
    pub key: Vec<Value>,
    pub waited: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockErrorKind {
    /// The row lock was not granted within the configured bound
    Timeout,
}

#[derive(Debug)]
pub struct DescriptorError {
    pub table: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub table: Option<&'static str>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Table or column not found
    NotFound,
    /// A single-result fetch matched more than one row
    NonUniqueResult,
    /// Constraint violation (duplicate primary key, etc.)
    Constraint,
    /// Other storage failure
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The storage unit id is unknown or already finished
    UnknownUnit,
    /// The write could not be applied at commit
    CommitFailed,
    /// A lock or storage failure ended the unit of work
    Aborted,
}

impl Error {
    pub fn duplicate_identity(table: &'static str, key: Vec<Value>) -> Self {
        Error::Identity(IdentityError {
            kind: IdentityErrorKind::DuplicateIdentity,
            message: format!(
                "another instance of {table} is already managed under key {}",
                KeyDisplay(&key)
            ),
            table,
            key,
        })
    }

    pub fn dangling_reference(table: &'static str, key: Vec<Value>) -> Self {
        Error::Identity(IdentityError {
            kind: IdentityErrorKind::DanglingReference,
            message: format!("referenced {table} row {} does not exist", KeyDisplay(&key)),
            table,
            key,
        })
    }

    pub fn stale_read(table: &'static str, key: Vec<Value>) -> Self {
        Error::Identity(IdentityError {
            kind: IdentityErrorKind::StaleReadHazard,
            message: format!(
                "{table} row {} is cached but {table} was bulk-mutated without eviction",
                KeyDisplay(&key)
            ),
            table,
            key,
        })
    }

    pub fn lock_timeout(table: &'static str, key: Vec<Value>, waited: Duration) -> Self {
        Error::Lock(LockError {
            kind: LockErrorKind::Timeout,
            table,
            key,
            waited,
        })
    }

    pub fn invalid_descriptor(table: &'static str, message: impl Into<String>) -> Self {
        Error::Descriptor(DescriptorError {
            table,
            message: message.into(),
        })
    }

    pub fn unit_aborted(unit: impl fmt::Display) -> Self {
        Error::Transaction(TransactionError {
            kind: TransactionErrorKind::Aborted,
            message: format!("unit of work {unit} was aborted after a lock or storage failure"),
        })
    }

    pub fn is_duplicate_identity(&self) -> bool {
        self.identity_kind() == Some(IdentityErrorKind::DuplicateIdentity)
    }

    pub fn is_dangling_reference(&self) -> bool {
        self.identity_kind() == Some(IdentityErrorKind::DanglingReference)
    }

    pub fn is_stale_read_hazard(&self) -> bool {
        self.identity_kind() == Some(IdentityErrorKind::StaleReadHazard)
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Error::Lock(e) if e.kind == LockErrorKind::Timeout)
    }

    pub fn is_invalid_descriptor(&self) -> bool {
        matches!(self, Error::Descriptor(_))
    }

    pub fn is_unit_aborted(&self) -> bool {
        matches!(self, Error::Transaction(e) if e.kind == TransactionErrorKind::Aborted)
    }

    /// Is this a retryable error? The caller may rerun the unit of work.
    pub fn is_retryable(&self) -> bool {
        self.is_lock_timeout()
    }

    fn identity_kind(&self) -> Option<IdentityErrorKind> {
        match self {
            Error::Identity(e) => Some(e.kind),
            _ => None,
        }
    }
}

struct KeyDisplay<'a>(&'a [Value]);

impl fmt::Display for KeyDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            [single] => write!(f, "{single}"),
            many => {
                f.write_str("(")?;
                for (i, v) in many.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Identity(e) => write!(f, "Identity error: {}", e.message),
            Error::Lock(e) => write!(
                f,
                "Lock timeout on {} row {} after {:?}",
                e.table,
                KeyDisplay(&e.key),
                e.waited
            ),
            Error::Descriptor(e) => write!(f, "Invalid descriptor for {}: {}", e.table, e.message),
            Error::Query(e) => match e.table {
                Some(table) => write!(f, "Query error on {}: {}", table, e.message),
                None => write!(f, "Query error: {}", e.message),
            },
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<IdentityError> for Error {
    fn from(err: IdentityError) -> Self {
        Error::Identity(err)
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        Error::Lock(err)
    }
}

impl From<DescriptorError> for Error {
    fn from(err: DescriptorError) -> Self {
        Error::Descriptor(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for persist operations.
pub type Result<T> = std::result::Result<T, Error>;
