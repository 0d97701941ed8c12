//! Declarative schema management for SQLite.
//!
//! `isqlite` lets you describe the schema you want in Rust, compare it
//! against what a database actually contains, and apply the difference as a
//! minimal, ordered, data-preserving migration. This includes the operations
//! SQLite's restricted `ALTER TABLE` cannot express (dropping, altering,
//! and reordering columns), which go through the standard table rebuild
//! protocol with foreign keys preserved.
//!
//! # Architecture
//!
//! - **Schema model** ([`schema`]) - [`Column`], [`Table`], [`AutoTable`],
//!   and [`Schema`] value types with canonical SQL rendering.
//! - **Introspector** ([`introspect`]) - recovers a [`Schema`] from
//!   `sqlite_master`, delegating SQL parsing to the `sqlparser` crate.
//! - **Diff engine** ([`diff`]) - pure function from (live, declared)
//!   schemas to an ordered [`Operation`] list, with column rename
//!   detection.
//! - **Executor** ([`executor`]) - applies an operation list atomically,
//!   rebuilding tables where necessary and re-checking foreign keys.
//! - **Database** ([`database`]) - the user-facing surface tying the
//!   pieces together, plus a small row-level convenience layer.
//!
//! # Example
//!
//! ```no_run
//! use isqlite::prelude::*;
//!
//! fn main() -> isqlite::Result<()> {
//!     let schema = Schema::new(vec![
//!         Table::new(
//!             "people",
//!             vec![
//!                 Column::new("id", "INTEGER").primary_key(),
//!                 Column::new("name", "TEXT").required(),
//!                 Column::new("age", "INTEGER"),
//!             ],
//!         )?,
//!     ])?;
//!
//!     let mut db = Database::open("app.sqlite3", OpenOptions::new())?;
//!     // Prints what would change, then applies it.
//!     for op in db.diff(&schema, &DiffOptions::default())? {
//!         println!("{op}");
//!     }
//!     db.migrate(&schema, &DiffOptions::default())?;
//!     db.close()
//! }
//! ```

pub mod connection;
pub mod database;
pub mod diff;
pub mod error;
pub mod executor;
pub mod introspect;
pub mod operations;
pub mod schema;

pub use error::{FkViolation, IsqliteError, Result};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::connection::{Connection, Row, Value};
    pub use crate::database::{Database, OpenOptions};
    pub use crate::diff::DiffOptions;
    pub use crate::error::{FkViolation, IsqliteError, Result};
    pub use crate::operations::Operation;
    pub use crate::schema::{
        AutoTable, Column, ForeignKey, Literal, OnDeleteAction, Schema, Table, TimestampKind,
    };
}
