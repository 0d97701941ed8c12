//! Migration operations.
//!
//! An [`Operation`] is a single structural change to the database schema.
//! Operations are plain data: they are produced by the diff engine (or
//! constructed explicitly for single-op commands) and consumed once by the
//! executor.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::{Column, Table};

/// A single schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Create a new table.
    CreateTable {
        /// Full declaration of the table to create.
        table: Table,
    },

    /// Drop a table.
    DropTable {
        /// Table name.
        name: String,
    },

    /// Add a column to an existing table.
    AddColumn {
        /// Table name.
        table: String,
        /// Declaration of the column to add.
        column: Column,
    },

    /// Drop a column from a table.
    DropColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// Replace a column's definition, keeping its data.
    AlterColumn {
        /// Table name.
        table: String,
        /// Name of the column to alter.
        column: String,
        /// The new declaration of the column.
        new_column: Column,
    },

    /// Rename a column.
    RenameColumn {
        /// Table name.
        table: String,
        /// Current column name.
        old_name: String,
        /// New column name.
        new_name: String,
    },

    /// Reorder the columns of a table.
    ReorderColumns {
        /// Table name.
        table: String,
        /// The complete new column order.
        order: Vec<String>,
    },

    /// Rename a table. Never inferred by the diff engine; produced only on
    /// explicit request.
    RenameTable {
        /// Current table name.
        old_name: String,
        /// New table name.
        new_name: String,
    },
}

impl Operation {
    /// Creates a `CreateTable` operation.
    #[must_use]
    pub fn create_table(table: Table) -> Self {
        Self::CreateTable { table }
    }

    /// Creates a `DropTable` operation.
    #[must_use]
    pub fn drop_table(name: impl Into<String>) -> Self {
        Self::DropTable { name: name.into() }
    }

    /// Creates an `AddColumn` operation.
    #[must_use]
    pub fn add_column(table: impl Into<String>, column: Column) -> Self {
        Self::AddColumn {
            table: table.into(),
            column,
        }
    }

    /// Creates a `DropColumn` operation.
    #[must_use]
    pub fn drop_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::DropColumn {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Creates an `AlterColumn` operation.
    #[must_use]
    pub fn alter_column(table: impl Into<String>, new_column: Column) -> Self {
        Self::AlterColumn {
            table: table.into(),
            column: new_column.name.clone(),
            new_column,
        }
    }

    /// Creates a `RenameColumn` operation.
    #[must_use]
    pub fn rename_column(
        table: impl Into<String>,
        old_name: impl Into<String>,
        new_name: impl Into<String>,
    ) -> Self {
        Self::RenameColumn {
            table: table.into(),
            old_name: old_name.into(),
            new_name: new_name.into(),
        }
    }

    /// Creates a `ReorderColumns` operation.
    #[must_use]
    pub fn reorder_columns(table: impl Into<String>, order: Vec<String>) -> Self {
        Self::ReorderColumns {
            table: table.into(),
            order,
        }
    }

    /// Creates a `RenameTable` operation.
    #[must_use]
    pub fn rename_table(old_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        Self::RenameTable {
            old_name: old_name.into(),
            new_name: new_name.into(),
        }
    }

    /// The name of the table this operation touches. For `RenameTable` this
    /// is the old name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        match self {
            Self::CreateTable { table } => &table.name,
            Self::DropTable { name } => name,
            Self::AddColumn { table, .. }
            | Self::DropColumn { table, .. }
            | Self::AlterColumn { table, .. }
            | Self::RenameColumn { table, .. }
            | Self::ReorderColumns { table, .. } => table,
            Self::RenameTable { old_name, .. } => old_name,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateTable { table } => write!(f, "Create table {}", table.name),
            Self::DropTable { name } => write!(f, "Drop table {}", name),
            Self::AddColumn { table, column } => {
                write!(f, "Add column to {}: {}", table, column.to_sql())
            }
            Self::DropColumn { table, column } => {
                write!(f, "Drop column {} from {}", column, table)
            }
            Self::AlterColumn {
                table, new_column, ..
            } => write!(f, "Alter column in {}: {}", table, new_column.to_sql()),
            Self::RenameColumn {
                table,
                old_name,
                new_name,
            } => write!(f, "Rename column in {}: {} => {}", table, old_name, new_name),
            Self::ReorderColumns { table, order } => {
                write!(f, "Reorder columns of {}: {}", table, order.join(", "))
            }
            Self::RenameTable { old_name, new_name } => {
                write!(f, "Rename table {} => {}", old_name, new_name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;

    #[test]
    fn display_describes_operations() {
        let op = Operation::rename_column("people", "name", "legal_name");
        assert_eq!(
            op.to_string(),
            "Rename column in people: name => legal_name"
        );

        let op = Operation::add_column("people", Column::new("age", "INTEGER"));
        assert_eq!(op.to_string(), "Add column to people: \"age\" INTEGER");
    }

    #[test]
    fn table_name_reports_touched_table() {
        assert_eq!(Operation::drop_table("old").table_name(), "old");
        assert_eq!(
            Operation::rename_table("old", "new").table_name(),
            "old"
        );
        assert_eq!(
            Operation::drop_column("t", "c").table_name(),
            "t"
        );
    }

    #[test]
    fn operations_round_trip_through_json() {
        let op = Operation::alter_column("t", Column::new("n", "TEXT").required());
        let json = serde_json::to_string(&op).unwrap();
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(op, back);
    }
}
