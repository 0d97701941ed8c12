//! Error types for the schema management layer.

/// A row reported by `PRAGMA foreign_key_check` after a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FkViolation {
    /// Table containing the dangling reference.
    pub table: String,
    /// Rowid of the offending row, if the table has one.
    pub rowid: Option<i64>,
    /// The parent table the reference points into.
    pub parent: String,
}

/// Errors that can occur while building, diffing, or migrating schemas.
#[derive(Debug, thiserror::Error)]
pub enum IsqliteError {
    /// An identifier contains characters outside `[A-Za-z0-9_]` or starts
    /// with a digit.
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    /// Invalid Column/Table/Schema construction. Raised at build time,
    /// before any I/O.
    #[error("schema error: {0}")]
    SchemaBuild(String),

    /// The live database contains SQL the parser cannot understand, or
    /// `sqlite_master` is missing expected rows.
    #[error("could not introspect table {table:?}: {message}")]
    Introspection {
        /// The table whose stored SQL failed to translate.
        table: String,
        /// Parser or catalog error detail.
        message: String,
    },

    /// Rename detection found multiple plausible sources for a column and
    /// the caller configured strict mode. Outside strict mode the differ
    /// logs a warning and falls back to drop+add instead.
    #[error("ambiguous rename candidates for column {column:?} in table {table:?}")]
    DiffAmbiguity {
        /// Table being diffed.
        table: String,
        /// The added column with more than one plausible source.
        column: String,
    },

    /// DDL or DML failure while applying a diff. The transaction has been
    /// rolled back and foreign-key enforcement restored.
    #[error("migration failed while applying '{operation}': {source}")]
    MigrationExecution {
        /// Human-readable description of the failing operation.
        operation: String,
        /// The underlying failure.
        #[source]
        source: Box<IsqliteError>,
    },

    /// `PRAGMA foreign_key_check` reported rows after the migration
    /// committed.
    #[error("foreign key check reported {} violation(s) after migration", .0.len())]
    IntegrityViolation(Vec<FkViolation>),

    /// A precondition of an operation does not hold (temporary-name
    /// collision, rename target already exists, ...). Raised before any
    /// mutation.
    #[error("{0}")]
    Precondition(String),

    /// A named table does not exist.
    #[error("table {0:?} does not exist")]
    TableNotFound(String),

    /// A named column does not exist in the given table.
    #[error("column {1:?} does not exist in table {0:?}")]
    ColumnNotFound(String, String),

    /// Error from the underlying SQLite driver.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for schema and migration operations.
pub type Result<T> = std::result::Result<T, IsqliteError>;
