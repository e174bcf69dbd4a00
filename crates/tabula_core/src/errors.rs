use crate::hash::Address;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TabulaError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Persist: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Bad magic or version")]
    BadHeader,

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Codec: {0}")]
    Codec(String),

    #[error("Chunk not found: {0}")]
    ChunkNotFound(Address),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Name is reserved for system use: {0}")]
    ReservedName(String),

    #[error("Column {column} is still referenced by index {index}")]
    ColumnInUse { column: String, index: String },

    #[error("Duplicate primary key in table {table}: {key}")]
    DuplicateKey { table: String, key: String },

    #[error("Unique index {index} on table {table} violated by {key}")]
    UniqueViolation { table: String, index: String, key: String },

    #[error("Column {table}.{column} cannot be null")]
    NotNull { table: String, column: String },

    #[error("Column {table}.{column} expects {expected}, got {found}")]
    TypeMismatch { table: String, column: String, expected: String, found: String },

    #[error("Table {0} has no auto-increment column")]
    NoAutoIncrement(String),

    #[error("Editor for table {0} is already committed")]
    EditorClosed(String),

    #[error("Root moved since the session began: expected {expected}, found {found}")]
    Conflict { expected: Address, found: Address },

    #[error("Operation cancelled")]
    Cancelled,
}

impl TabulaError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        TabulaError::NotFound { kind, name: name.into() }
    }

    pub fn exists(kind: &'static str, name: impl Into<String>) -> Self {
        TabulaError::AlreadyExists { kind, name: name.into() }
    }

    /// True for failures of the `NotFound` family, which callers usually
    /// want to tell apart from corruption.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TabulaError::NotFound { .. } | TabulaError::ChunkNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, TabulaError>;
