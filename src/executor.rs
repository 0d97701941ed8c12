//! The migration executor.
//!
//! Applies an [`Operation`] list to a live database, atomically. Simple
//! operations map to single DDL statements; everything SQLite's restricted
//! `ALTER TABLE` cannot express goes through the table rebuild protocol
//! from <https://sqlite.org/lang_altertable.html>: create the target table
//! under a temporary name, copy the data across, drop the original, rename
//! the temporary into place, and recreate dependent indexes and triggers.
//!
//! Foreign-key enforcement is disabled for the duration of the migration
//! and re-checked with `PRAGMA foreign_key_check` after commit. The pragma
//! toggles must happen outside a transaction (SQLite silently ignores them
//! inside one), so any in-flight transaction is committed first and
//! re-opened afterwards.

use std::collections::HashSet;

use rusqlite::types::Value;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::{FkViolation, IsqliteError, Result};
use crate::introspect;
use crate::operations::Operation;
use crate::schema::{quote, validate_identifier, Column, Table};

/// Suffix of the temporary table name used during a rebuild.
pub const TMP_SUFFIX: &str = "_isqlite_tmp";

/// SQLite version that introduced `ALTER TABLE ... RENAME COLUMN`.
const RENAME_COLUMN_VERSION: i32 = 3_025_000;

/// Applies an operation list atomically.
///
/// On success every operation is visible; on failure none are, the
/// transaction has been rolled back, and foreign-key enforcement has been
/// restored to its prior state. If a transaction was already open when this
/// is called, it is committed first (the pragma toggles require it) and a
/// fresh one is opened before returning.
///
/// # Errors
///
/// [`IsqliteError::MigrationExecution`] identifies the failing operation;
/// [`IsqliteError::IntegrityViolation`] reports rows flagged by the
/// post-commit foreign-key check.
pub fn apply(conn: &Connection, operations: &[Operation]) -> Result<()> {
    if operations.is_empty() {
        return Ok(());
    }

    info!(count = operations.len(), "applying migration");

    let fk_enabled = foreign_keys_enabled(conn)?;
    let had_transaction = conn.in_transaction();
    if had_transaction {
        conn.commit()?;
    }
    if fk_enabled {
        conn.set_pragma("foreign_keys", "OFF")?;
    }

    let applied = apply_in_transaction(conn, operations);

    if fk_enabled {
        conn.set_pragma("foreign_keys", "ON")?;
    }

    let result = match applied {
        Ok(()) if fk_enabled => {
            let violations = foreign_key_check(conn)?;
            if violations.is_empty() {
                Ok(())
            } else {
                Err(IsqliteError::IntegrityViolation(violations))
            }
        }
        other => other,
    };

    if had_transaction {
        conn.begin()?;
    }

    if result.is_ok() {
        info!("migration applied");
    }
    result
}

fn apply_in_transaction(conn: &Connection, operations: &[Operation]) -> Result<()> {
    conn.begin()?;
    for operation in operations {
        if let Err(e) = execute_operation(conn, operation) {
            let _ = conn.rollback();
            return Err(IsqliteError::MigrationExecution {
                operation: operation.to_string(),
                source: Box::new(e),
            });
        }
    }
    conn.commit()?;
    Ok(())
}

fn execute_operation(conn: &Connection, operation: &Operation) -> Result<()> {
    debug!(%operation, "executing");
    match operation {
        Operation::CreateTable { table } => {
            conn.execute(&table.create_table_sql(), &[])?;
        }

        Operation::DropTable { name } => {
            conn.execute(&format!("DROP TABLE {}", quote(name)), &[])?;
        }

        Operation::AddColumn { table, column } => {
            if column.addable_in_place() {
                conn.execute(
                    &format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        quote(table),
                        column.to_sql()
                    ),
                    &[],
                )?;
            } else {
                let live = introspect::introspect_table(conn, table)?;
                let mut target = live.columns.clone();
                target.push(column.clone());
                let copy = same_name_copy(&live.columns);
                rebuild_table(conn, &live, target, copy)?;
            }
        }

        Operation::DropColumn { table, column } => {
            let live = introspect::introspect_table(conn, table)?;
            if live.get_column(column).is_none() {
                return Err(IsqliteError::ColumnNotFound(table.clone(), column.clone()));
            }
            let target: Vec<Column> = live
                .columns
                .iter()
                .filter(|c| &c.name != column)
                .cloned()
                .collect();
            let copy = same_name_copy(&target);
            rebuild_table(conn, &live, target, copy)?;
        }

        Operation::AlterColumn {
            table,
            column,
            new_column,
        } => {
            let live = introspect::introspect_table(conn, table)?;
            if live.get_column(column).is_none() {
                return Err(IsqliteError::ColumnNotFound(table.clone(), column.clone()));
            }
            let target: Vec<Column> = live
                .columns
                .iter()
                .map(|c| {
                    if &c.name == column {
                        new_column.clone()
                    } else {
                        c.clone()
                    }
                })
                .collect();
            // Values of the altered column are copied by name and cast by
            // SQLite's type affinity on the target side.
            let copy: Vec<(String, String)> = live
                .columns
                .iter()
                .map(|c| {
                    if &c.name == column {
                        (column.clone(), new_column.name.clone())
                    } else {
                        (c.name.clone(), c.name.clone())
                    }
                })
                .collect();
            rebuild_table(conn, &live, target, copy)?;
        }

        Operation::RenameColumn {
            table,
            old_name,
            new_name,
        } => {
            let live = introspect::introspect_table(conn, table)?;
            if live.get_column(old_name).is_none() {
                return Err(IsqliteError::ColumnNotFound(
                    table.clone(),
                    old_name.clone(),
                ));
            }
            if live.get_column(new_name).is_some() {
                return Err(IsqliteError::Precondition(format!(
                    "column {:?} already exists in table {:?}",
                    new_name, table
                )));
            }
            validate_identifier(new_name)?;

            if Connection::sqlite_version() >= RENAME_COLUMN_VERSION {
                conn.execute(
                    &format!(
                        "ALTER TABLE {} RENAME COLUMN {} TO {}",
                        quote(table),
                        quote(old_name),
                        quote(new_name)
                    ),
                    &[],
                )?;
            } else {
                let target: Vec<Column> = live
                    .columns
                    .iter()
                    .map(|c| {
                        if &c.name == old_name {
                            c.renamed(new_name)
                        } else {
                            c.clone()
                        }
                    })
                    .collect();
                let copy: Vec<(String, String)> = live
                    .columns
                    .iter()
                    .map(|c| {
                        if &c.name == old_name {
                            (old_name.clone(), new_name.clone())
                        } else {
                            (c.name.clone(), c.name.clone())
                        }
                    })
                    .collect();
                rebuild_table(conn, &live, target, copy)?;
            }
        }

        Operation::ReorderColumns { table, order } => {
            let live = introspect::introspect_table(conn, table)?;
            let live_names: HashSet<&str> = live.column_names().collect();
            let order_names: HashSet<&str> = order.iter().map(String::as_str).collect();
            if live_names != order_names || order.len() != live.columns.len() {
                return Err(IsqliteError::Precondition(format!(
                    "the reordered column set does not match the columns of table {:?}",
                    table
                )));
            }
            let mut target = Vec::with_capacity(order.len());
            for name in order {
                match live.get_column(name) {
                    Some(column) => target.push(column.clone()),
                    None => {
                        return Err(IsqliteError::ColumnNotFound(table.clone(), name.clone()))
                    }
                }
            }
            let copy = same_name_copy(&target);
            rebuild_table(conn, &live, target, copy)?;
        }

        Operation::RenameTable { old_name, new_name } => {
            if !table_exists(conn, old_name)? {
                return Err(IsqliteError::TableNotFound(old_name.clone()));
            }
            if table_exists(conn, new_name)? {
                return Err(IsqliteError::Precondition(format!(
                    "table {:?} already exists",
                    new_name
                )));
            }
            validate_identifier(new_name)?;
            conn.execute(
                &format!(
                    "ALTER TABLE {} RENAME TO {}",
                    quote(old_name),
                    quote(new_name)
                ),
                &[],
            )?;
        }
    }
    Ok(())
}

/// Rebuilds `live` into the given target columns, copying data according to
/// the `(old, new)` column name pairs.
fn rebuild_table(
    conn: &Connection,
    live: &Table,
    target_columns: Vec<Column>,
    copy: Vec<(String, String)>,
) -> Result<()> {
    let name = &live.name;
    let tmp_name = format!("{}{}", name, TMP_SUFFIX);
    if table_exists(conn, &tmp_name)? {
        return Err(IsqliteError::Precondition(format!(
            "temporary table {:?} already exists; drop it before migrating",
            tmp_name
        )));
    }

    // Indexes and triggers on the table vanish with the DROP below, so
    // capture their SQL first. Automatic indexes have no SQL and are
    // excluded; SQLite recreates them from the table definition.
    let artifacts = dependent_sql(conn, name)?;

    let target = Table {
        name: tmp_name.clone(),
        columns: target_columns,
        constraints: live.constraints.clone(),
        without_rowid: live.without_rowid,
    };
    conn.execute(&target.create_table_sql(), &[])?;

    let new_columns: Vec<String> = copy.iter().map(|(_, new)| quote(new)).collect();
    let old_columns: Vec<String> = copy.iter().map(|(old, _)| quote(old)).collect();
    conn.execute(
        &format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote(&tmp_name),
            new_columns.join(", "),
            old_columns.join(", "),
            quote(name)
        ),
        &[],
    )?;

    conn.execute(&format!("DROP TABLE {}", quote(name)), &[])?;
    conn.execute(
        &format!(
            "ALTER TABLE {} RENAME TO {}",
            quote(&tmp_name),
            quote(name)
        ),
        &[],
    )?;

    for sql in artifacts {
        conn.execute(&sql, &[])?;
    }
    Ok(())
}

fn same_name_copy(columns: &[Column]) -> Vec<(String, String)> {
    columns
        .iter()
        .map(|c| (c.name.clone(), c.name.clone()))
        .collect()
}

/// Whether a table with the given name exists.
pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let rows = conn.query(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = :name",
        &[(":name", &name)],
    )?;
    Ok(!rows.is_empty())
}

fn dependent_sql(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let rows = conn.query(
        "SELECT sql FROM sqlite_master \
         WHERE tbl_name = :table AND type IN ('index', 'trigger') AND sql IS NOT NULL",
        &[(":table", &table)],
    )?;
    Ok(rows
        .iter()
        .filter_map(|row| row.text("sql").map(String::from))
        .collect())
}

fn foreign_keys_enabled(conn: &Connection) -> Result<bool> {
    Ok(matches!(
        conn.pragma("foreign_keys")?,
        Some(Value::Integer(1))
    ))
}

fn foreign_key_check(conn: &Connection) -> Result<Vec<FkViolation>> {
    let rows = conn.query("PRAGMA foreign_key_check", &[])?;
    Ok(rows
        .iter()
        .map(|row| FkViolation {
            table: row.text("table").unwrap_or_default().to_string(),
            rowid: row.integer("rowid"),
            parent: row.text("parent").unwrap_or_default().to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Literal;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.set_pragma("foreign_keys", "ON").unwrap();
        conn
    }

    fn column_order(conn: &Connection, table: &str) -> Vec<String> {
        introspect::introspect_table(conn, table)
            .unwrap()
            .column_names()
            .map(String::from)
            .collect()
    }

    #[test]
    fn create_and_drop_table() {
        let conn = conn();
        let table = Table::new("t", vec![Column::new("a", "INTEGER").primary_key()]).unwrap();

        apply(&conn, &[Operation::create_table(table)]).unwrap();
        assert!(table_exists(&conn, "t").unwrap());

        apply(&conn, &[Operation::drop_table("t")]).unwrap();
        assert!(!table_exists(&conn, "t").unwrap());
    }

    #[test]
    fn add_column_in_place_appends() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER PRIMARY KEY, b TEXT)", &[])
            .unwrap();
        conn.execute("INSERT INTO t (a, b) VALUES (1, 'x')", &[])
            .unwrap();

        apply(
            &conn,
            &[Operation::add_column("t", Column::new("c", "INTEGER"))],
        )
        .unwrap();

        assert_eq!(column_order(&conn, "t"), ["a", "b", "c"]);
        let rows = conn.query("SELECT a, b, c FROM t", &[]).unwrap();
        assert_eq!(rows[0].integer("a"), Some(1));
        assert_eq!(rows[0].text("b"), Some("x"));
        assert_eq!(rows[0].get("c"), Some(&Value::Null));
    }

    #[test]
    fn add_unique_column_rebuilds() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER PRIMARY KEY)", &[])
            .unwrap();
        conn.execute("INSERT INTO t (a) VALUES (7)", &[]).unwrap();

        apply(
            &conn,
            &[Operation::add_column(
                "t",
                Column::new("code", "TEXT").unique(),
            )],
        )
        .unwrap();

        let live = introspect::introspect_table(&conn, "t").unwrap();
        assert!(live.get_column("code").unwrap().unique);
        let rows = conn.query("SELECT a FROM t", &[]).unwrap();
        assert_eq!(rows[0].integer("a"), Some(7));
    }

    #[test]
    fn drop_column_preserves_remaining_data() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER PRIMARY KEY, b TEXT, c INTEGER)", &[])
            .unwrap();
        conn.execute("INSERT INTO t (a, b, c) VALUES (1, 'x', 10)", &[])
            .unwrap();

        apply(&conn, &[Operation::drop_column("t", "b")]).unwrap();

        assert_eq!(column_order(&conn, "t"), ["a", "c"]);
        let rows = conn.query("SELECT a, c FROM t", &[]).unwrap();
        assert_eq!(rows[0].integer("a"), Some(1));
        assert_eq!(rows[0].integer("c"), Some(10));
    }

    #[test]
    fn drop_missing_column_identifies_operation() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER)", &[]).unwrap();

        let err = apply(&conn, &[Operation::drop_column("t", "nope")]).unwrap_err();
        match err {
            IsqliteError::MigrationExecution { source, .. } => {
                assert!(matches!(*source, IsqliteError::ColumnNotFound(..)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn alter_column_rewrites_definition() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER PRIMARY KEY, n TEXT)", &[])
            .unwrap();
        conn.execute("INSERT INTO t (a, n) VALUES (1, 'x')", &[])
            .unwrap();

        apply(
            &conn,
            &[Operation::alter_column(
                "t",
                Column::new("n", "TEXT")
                    .required()
                    .default(Literal::Text("".to_string())),
            )],
        )
        .unwrap();

        let live = introspect::introspect_table(&conn, "t").unwrap();
        let n = live.get_column("n").unwrap();
        assert!(n.required);
        let rows = conn.query("SELECT n FROM t", &[]).unwrap();
        assert_eq!(rows[0].text("n"), Some("x"));
    }

    #[test]
    fn rename_column_keeps_values() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER PRIMARY KEY, name TEXT NOT NULL)", &[])
            .unwrap();
        conn.execute("INSERT INTO t (a, name) VALUES (1, 'x')", &[])
            .unwrap();

        apply(
            &conn,
            &[Operation::rename_column("t", "name", "legal_name")],
        )
        .unwrap();

        assert_eq!(column_order(&conn, "t"), ["a", "legal_name"]);
        let rows = conn.query("SELECT legal_name FROM t", &[]).unwrap();
        assert_eq!(rows[0].text("legal_name"), Some("x"));
    }

    #[test]
    fn rename_column_to_existing_name_fails_cleanly() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER, b INTEGER)", &[])
            .unwrap();

        let err = apply(&conn, &[Operation::rename_column("t", "a", "b")]).unwrap_err();
        match err {
            IsqliteError::MigrationExecution { source, .. } => {
                assert!(matches!(*source, IsqliteError::Precondition(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reorder_columns_preserves_values_by_name() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER PRIMARY KEY, b TEXT, c INTEGER)", &[])
            .unwrap();
        conn.execute("INSERT INTO t (a, b, c) VALUES (1, 'x', 10)", &[])
            .unwrap();
        conn.execute("INSERT INTO t (a, b, c) VALUES (2, 'y', 20)", &[])
            .unwrap();

        apply(
            &conn,
            &[Operation::reorder_columns(
                "t",
                vec!["a".to_string(), "c".to_string(), "b".to_string()],
            )],
        )
        .unwrap();

        assert_eq!(column_order(&conn, "t"), ["a", "c", "b"]);
        let rows = conn
            .query("SELECT * FROM t ORDER BY a", &[])
            .unwrap();
        assert_eq!(rows[0].columns, ["a", "c", "b"]);
        assert_eq!(rows[1].text("b"), Some("y"));
        assert_eq!(rows[1].integer("c"), Some(20));
    }

    #[test]
    fn reorder_with_wrong_set_is_a_precondition_error() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER, b TEXT)", &[])
            .unwrap();

        let err = apply(
            &conn,
            &[Operation::reorder_columns(
                "t",
                vec!["a".to_string(), "missing".to_string()],
            )],
        )
        .unwrap_err();
        match err {
            IsqliteError::MigrationExecution { source, .. } => {
                assert!(matches!(*source, IsqliteError::Precondition(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rebuild_preserves_rowid_identity() {
        let conn = conn();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[])
            .unwrap();
        conn.execute("INSERT INTO t (id, v) VALUES (42, 'x')", &[])
            .unwrap();

        apply(
            &conn,
            &[Operation::reorder_columns(
                "t",
                vec!["v".to_string(), "id".to_string()],
            )],
        )
        .unwrap();

        let rows = conn.query("SELECT rowid AS r FROM t", &[]).unwrap();
        assert_eq!(rows[0].integer("r"), Some(42));
    }

    #[test]
    fn rebuild_recreates_indexes_and_triggers() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER PRIMARY KEY, b TEXT, c INTEGER)", &[])
            .unwrap();
        conn.execute("CREATE INDEX idx_t_c ON t (c)", &[]).unwrap();
        conn.execute(
            "CREATE TRIGGER trg_t AFTER INSERT ON t \
             BEGIN UPDATE t SET b = 'seen' WHERE a = NEW.a; END",
            &[],
        )
        .unwrap();

        // Dropping "c" orphans its index; recreating the index fails and
        // the whole migration rolls back, leaving the table intact.
        apply(&conn, &[Operation::drop_column("t", "c")]).unwrap_err();
        assert_eq!(column_order(&conn, "t"), ["a", "b", "c"]);

        apply(
            &conn,
            &[Operation::reorder_columns(
                "t",
                vec!["a".to_string(), "c".to_string(), "b".to_string()],
            )],
        )
        .unwrap();

        let names: Vec<String> = conn
            .query(
                "SELECT name FROM sqlite_master WHERE tbl_name = 't' AND type IN ('index', 'trigger') AND sql IS NOT NULL",
                &[],
            )
            .unwrap()
            .iter()
            .filter_map(|r| r.text("name").map(String::from))
            .collect();
        assert!(names.contains(&"idx_t_c".to_string()));
        assert!(names.contains(&"trg_t".to_string()));

        // The recreated trigger still fires.
        conn.execute("INSERT INTO t (a, c, b) VALUES (1, 2, 'x')", &[])
            .unwrap();
        let rows = conn.query("SELECT b FROM t WHERE a = 1", &[]).unwrap();
        assert_eq!(rows[0].text("b"), Some("seen"));
    }

    #[test]
    fn tmp_name_collision_fails_cleanly() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER, b TEXT)", &[])
            .unwrap();
        conn.execute("CREATE TABLE t_isqlite_tmp (x INTEGER)", &[])
            .unwrap();

        let err = apply(&conn, &[Operation::drop_column("t", "b")]).unwrap_err();
        match err {
            IsqliteError::MigrationExecution { source, .. } => {
                assert!(matches!(*source, IsqliteError::Precondition(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(column_order(&conn, "t"), ["a", "b"]);
    }

    #[test]
    fn failed_operation_rolls_back_everything() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER)", &[]).unwrap();

        let ops = vec![
            Operation::add_column("t", Column::new("b", "TEXT")),
            Operation::drop_table("no_such_table"),
        ];
        apply(&conn, &ops).unwrap_err();

        // The first operation must not be visible.
        assert_eq!(column_order(&conn, "t"), ["a"]);
        assert!(!conn.in_transaction());
    }

    #[test]
    fn rename_table_checks_preconditions() {
        let conn = conn();
        conn.execute("CREATE TABLE a (x INTEGER)", &[]).unwrap();
        conn.execute("CREATE TABLE b (x INTEGER)", &[]).unwrap();

        let err = apply(&conn, &[Operation::rename_table("a", "b")]).unwrap_err();
        match err {
            IsqliteError::MigrationExecution { source, .. } => {
                assert!(matches!(*source, IsqliteError::Precondition(_)));
            }
            other => panic!("unexpected error: {other}"),
        }

        apply(&conn, &[Operation::rename_table("a", "c")]).unwrap();
        assert!(table_exists(&conn, "c").unwrap());
        assert!(!table_exists(&conn, "a").unwrap());
    }

    #[test]
    fn migration_restores_foreign_key_pragma() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER)", &[]).unwrap();

        apply(&conn, &[Operation::drop_column("t", "a")]).unwrap_err();
        assert_eq!(
            conn.pragma("foreign_keys").unwrap(),
            Some(Value::Integer(1))
        );

        apply(
            &conn,
            &[Operation::add_column("t", Column::new("b", "TEXT"))],
        )
        .unwrap();
        assert_eq!(
            conn.pragma("foreign_keys").unwrap(),
            Some(Value::Integer(1))
        );
    }
}
