//! The schema diff engine.
//!
//! [`diff_schemas`] compares a live schema against a declared schema and
//! produces the ordered list of [`Operation`]s that transforms the live
//! schema into the declared one. The engine is pure and deterministic: it
//! never touches the database, and identical inputs yield identical
//! outputs.
//!
//! Rename detection treats a (dropped, added) column pair as a rename when
//! the two definitions are equal modulo name and the column occupies the
//! same position on both sides. The match is abandoned (with a warning, or
//! an error in strict mode) when another live column of the table shares
//! the same definition, because the engine then cannot tell which column
//! the survivor actually is.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{IsqliteError, Result};
use crate::operations::Operation;
use crate::schema::{Schema, Table};

/// Options for the diff engine.
#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
    /// Whether to detect column renames. When false, a renamed column is
    /// reported as a drop plus an add, and its data is lost on apply.
    pub detect_renaming: bool,
    /// Treat ambiguous rename candidates as errors instead of falling back
    /// to drop+add with a warning.
    pub strict: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            detect_renaming: true,
            strict: false,
        }
    }
}

/// Compares two schemas and returns the operations that transform `live`
/// into `declared`.
///
/// Operation order: `CreateTable` first (in declared order), then per-table
/// modifications, then `DropTable` last.
///
/// # Errors
///
/// Fails only in strict mode, when rename detection finds an ambiguous
/// candidate.
pub fn diff_schemas(live: &Schema, declared: &Schema, options: &DiffOptions) -> Result<Vec<Operation>> {
    let mut operations = Vec::new();

    for table in declared.tables() {
        if live.get(&table.name).is_none() {
            operations.push(Operation::create_table(table.clone()));
        }
    }

    for table in declared.tables() {
        if let Some(live_table) = live.get(&table.name) {
            operations.extend(diff_tables(live_table, table, options)?);
        }
    }

    for table in live.tables() {
        if declared.get(&table.name).is_none() {
            operations.push(Operation::drop_table(&table.name));
        }
    }

    debug!(count = operations.len(), "schema diff computed");
    Ok(operations)
}

/// Compares two versions of one table and returns the operations that
/// transform `live` into `declared`.
///
/// Operation order within the table: `AlterColumn`, `RenameColumn`,
/// `DropColumn`, `AddColumn`, `ReorderColumns`.
pub fn diff_tables(live: &Table, declared: &Table, options: &DiffOptions) -> Result<Vec<Operation>> {
    let table_name = &declared.name;

    let live_index: HashMap<&str, usize> = live
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.as_str(), i))
        .collect();
    let declared_index: HashMap<&str, usize> = declared
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.as_str(), i))
        .collect();

    // Columns present on both sides whose definitions differ.
    let mut alters = Vec::new();
    for column in &declared.columns {
        if let Some(&i) = live_index.get(column.name.as_str()) {
            if &live.columns[i] != column {
                alters.push(Operation::alter_column(table_name, column.clone()));
            }
        }
    }

    let mut dropped: Vec<&str> = live
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .filter(|name| !declared_index.contains_key(name))
        .collect();
    let mut added: Vec<&str> = declared
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .filter(|name| !live_index.contains_key(name))
        .collect();

    let mut renames = Vec::new();
    if options.detect_renaming && !dropped.is_empty() && !added.is_empty() {
        let mut matched: Vec<(&str, &str)> = Vec::new();
        for &old_name in &dropped {
            let old_index = live_index[old_name];
            let old_column = &live.columns[old_index];

            // The survivor must sit at the same position in the declared
            // table and carry the same definition.
            let candidate = added.iter().copied().find(|&new_name| {
                declared_index[new_name] == old_index
                    && old_column.same_definition(&declared.columns[declared_index[new_name]])
            });
            let Some(new_name) = candidate else {
                continue;
            };

            // If any other live column shares the dropped column's
            // definition, the pairing is guesswork; refuse it.
            let has_twin = live
                .columns
                .iter()
                .any(|c| c.name != old_name && c.same_definition(old_column));
            if has_twin {
                warn!(
                    table = %table_name,
                    old = %old_name,
                    new = %new_name,
                    "ambiguous rename candidate; emitting drop+add instead"
                );
                if options.strict {
                    return Err(IsqliteError::DiffAmbiguity {
                        table: table_name.clone(),
                        column: new_name.to_string(),
                    });
                }
                continue;
            }

            matched.push((old_name, new_name));
        }

        for (old_name, new_name) in matched {
            renames.push(Operation::rename_column(table_name, old_name, new_name));
            dropped.retain(|&n| n != old_name);
            added.retain(|&n| n != new_name);
        }
    }

    let renamed_to: HashMap<&str, &str> = renames
        .iter()
        .filter_map(|op| match op {
            Operation::RenameColumn {
                old_name, new_name, ..
            } => Some((old_name.as_str(), new_name.as_str())),
            _ => None,
        })
        .collect();

    let drops: Vec<Operation> = dropped
        .iter()
        .map(|&name| Operation::drop_column(table_name, name))
        .collect();
    let adds: Vec<Operation> = added
        .iter()
        .map(|&name| {
            let column = &declared.columns[declared_index[name]];
            Operation::add_column(table_name, column.clone())
        })
        .collect();

    // Imagine the operations applied: renames in place, drops removed, adds
    // appended. If the resulting order differs from the declared order, a
    // reorder is needed.
    let mut simulated: Vec<&str> = live
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .filter(|name| !dropped.contains(name))
        .map(|name| renamed_to.get(name).copied().unwrap_or(name))
        .collect();
    simulated.extend(added.iter().copied());

    let declared_order: Vec<&str> = declared.columns.iter().map(|c| c.name.as_str()).collect();

    let needs_reorder = simulated != declared_order;

    let mut operations = alters;
    operations.extend(renames);
    operations.extend(drops);
    operations.extend(adds);
    if needs_reorder {
        operations.push(Operation::reorder_columns(
            table_name,
            declared_order.iter().map(|s| s.to_string()).collect(),
        ));
    }

    Ok(operations)
}
