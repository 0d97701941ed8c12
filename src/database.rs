//! The public database surface.
//!
//! [`Database`] owns one [`Connection`] and ties the pieces together:
//! introspection, diffing, migration, and a small row-level convenience
//! layer (create/get/list/count/update/delete by primary key). A `Database`
//! opened with `transaction = true` holds an ambient transaction that is
//! committed by [`Database::close`]; dropping an unclosed `Database` lets
//! SQLite roll the transaction back, so no exit path leaks a half-applied
//! change.

use rusqlite::types::Value;
use rusqlite::ToSql;

use crate::connection::{Connection, Row};
use crate::diff::{self, DiffOptions};
use crate::error::{IsqliteError, Result};
use crate::executor;
use crate::introspect;
use crate::operations::Operation;
use crate::schema::{quote, validate_identifier, Column, Schema, Table, TimestampKind};

/// Options for [`Database::open`].
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Open the database read-only.
    pub readonly: bool,
    /// Enable foreign-key enforcement on the connection.
    pub enforce_foreign_keys: bool,
    /// Store auto-table timestamps as integer seconds since the epoch
    /// instead of ISO-8601 text. Must match the `AutoTable` declarations
    /// used with this database.
    pub use_epoch_timestamps: bool,
    /// Open an ambient transaction immediately, committed on
    /// [`Database::close`].
    pub transaction: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            enforce_foreign_keys: true,
            use_epoch_timestamps: false,
            transaction: true,
        }
    }
}

impl OpenOptions {
    /// Creates the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the database read-only.
    #[must_use]
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Disables foreign-key enforcement.
    #[must_use]
    pub fn without_foreign_keys(mut self) -> Self {
        self.enforce_foreign_keys = false;
        self
    }

    /// Stores auto-table timestamps as epoch seconds.
    #[must_use]
    pub fn epoch_timestamps(mut self) -> Self {
        self.use_epoch_timestamps = true;
        self
    }

    /// Leaves transaction management entirely to the caller.
    #[must_use]
    pub fn autocommit(mut self) -> Self {
        self.transaction = false;
        self
    }
}

/// A connection to one SQLite database, with schema management attached.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
    timestamps: TimestampKind,
    schema: Schema,
}

impl Database {
    /// Opens a database file or URI.
    pub fn open(path: &str, options: OpenOptions) -> Result<Self> {
        let conn = Connection::open(path, options.readonly)?;
        Self::setup(conn, options)
    }

    /// Opens a fresh in-memory database.
    pub fn open_in_memory(options: OpenOptions) -> Result<Self> {
        Self::setup(Connection::open_in_memory()?, options)
    }

    fn setup(conn: Connection, options: OpenOptions) -> Result<Self> {
        // Must run before BEGIN; SQLite ignores this pragma inside a
        // transaction.
        conn.set_pragma(
            "foreign_keys",
            if options.enforce_foreign_keys {
                "ON"
            } else {
                "OFF"
            },
        )?;
        if options.transaction && !options.readonly {
            conn.begin()?;
        }
        let schema = introspect::introspect_schema(&conn)?;
        Ok(Self {
            conn,
            timestamps: if options.use_epoch_timestamps {
                TimestampKind::EpochSeconds
            } else {
                TimestampKind::Iso8601
            },
            schema,
        })
    }

    /// The live schema as of the last schema-altering call.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The underlying connection façade.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Re-reads the live schema from the database. All schema-altering
    /// methods call this automatically; it is only needed after altering
    /// the schema through raw [`Database::sql`].
    pub fn refresh_schema(&mut self) -> Result<()> {
        self.schema = introspect::introspect_schema(&self.conn)?;
        Ok(())
    }

    // ---- schema management ----------------------------------------------

    /// Computes the operations that would migrate this database to match
    /// `declared`. Read-only; never writes.
    pub fn diff(&self, declared: &Schema, options: &DiffOptions) -> Result<Vec<Operation>> {
        let live = introspect::introspect_schema(&self.conn)?;
        diff::diff_schemas(&live, declared, options)
    }

    /// Applies an operation list per the executor's contract: atomically,
    /// with foreign-key enforcement suspended and re-checked afterwards.
    pub fn apply_diff(&mut self, operations: &[Operation]) -> Result<()> {
        match executor::apply(&self.conn, operations) {
            Ok(()) => self.refresh_schema(),
            // An integrity violation is reported after the commit, so the
            // schema cache must still be brought up to date.
            Err(e @ IsqliteError::IntegrityViolation(_)) => {
                self.refresh_schema()?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Diffs against `declared` and applies the result.
    pub fn migrate(&mut self, declared: &Schema, options: &DiffOptions) -> Result<()> {
        let operations = self.diff(declared, options)?;
        self.apply_diff(&operations)
    }

    /// Creates a table.
    pub fn create_table(&mut self, table: Table) -> Result<()> {
        if self.schema.get(&table.name).is_some() {
            return Err(IsqliteError::Precondition(format!(
                "table {:?} already exists",
                table.name
            )));
        }
        self.apply_diff(&[Operation::create_table(table)])
    }

    /// Drops a table.
    pub fn drop_table(&mut self, table: &str) -> Result<()> {
        self.require_table(table)?;
        self.apply_diff(&[Operation::drop_table(table)])
    }

    /// Renames a table. Never inferred by `diff`; always explicit.
    pub fn rename_table(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        self.require_table(old_name)?;
        self.apply_diff(&[Operation::rename_table(old_name, new_name)])
    }

    /// Adds a column to a table.
    pub fn add_column(&mut self, table: &str, column: Column) -> Result<()> {
        let existing = self.require_table(table)?;
        if existing.get_column(&column.name).is_some() {
            return Err(IsqliteError::Precondition(format!(
                "column {:?} already exists in table {:?}",
                column.name, table
            )));
        }
        self.apply_diff(&[Operation::add_column(table, column)])
    }

    /// Drops a column, discarding its data.
    pub fn drop_column(&mut self, table: &str, column: &str) -> Result<()> {
        self.require_column(table, column)?;
        self.apply_diff(&[Operation::drop_column(table, column)])
    }

    /// Replaces a column's definition, keeping its data.
    pub fn alter_column(&mut self, table: &str, new_column: Column) -> Result<()> {
        self.require_column(table, &new_column.name)?;
        self.apply_diff(&[Operation::alter_column(table, new_column)])
    }

    /// Renames a column.
    pub fn rename_column(&mut self, table: &str, old_name: &str, new_name: &str) -> Result<()> {
        self.require_column(table, old_name)?;
        self.apply_diff(&[Operation::rename_column(table, old_name, new_name)])
    }

    /// Reorders the columns of a table. `order` must name every column
    /// exactly once.
    pub fn reorder_columns(&mut self, table: &str, order: Vec<String>) -> Result<()> {
        self.require_table(table)?;
        self.apply_diff(&[Operation::reorder_columns(table, order)])
    }

    // ---- rows ------------------------------------------------------------

    /// Inserts a row and returns its rowid. If the table has `created_at` /
    /// `last_updated_at` columns and the caller did not supply them, they
    /// are filled with the current time in the database's configured
    /// representation.
    pub fn create(&mut self, table: &str, data: &[(&str, Value)]) -> Result<i64> {
        self.require_table(table)?;
        let auto = self.auto_timestamp_columns(table, data);

        let mut columns = Vec::with_capacity(data.len() + auto.len());
        let mut values = Vec::with_capacity(data.len() + auto.len());
        let mut names = Vec::with_capacity(data.len());
        for (i, (column, _)) in data.iter().enumerate() {
            validate_identifier(column)?;
            columns.push(quote(column));
            values.push(format!(":v{}", i));
            names.push(format!(":v{}", i));
        }
        for column in &auto {
            columns.push(quote(column));
            values.push(self.timestamps.current_timestamp_sql().to_string());
        }

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote(table))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(table),
                columns.join(", "),
                values.join(", ")
            )
        };
        let params: Vec<(&str, &dyn ToSql)> = names
            .iter()
            .zip(data.iter())
            .map(|(name, (_, value))| (name.as_str(), value as &dyn ToSql))
            .collect();
        self.conn.execute(&sql, &params)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Inserts many rows with one prepared statement. All rows share the
    /// given column list; timestamp columns are auto-filled as in
    /// [`Database::create`].
    pub fn create_many(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: Vec<Vec<Value>>,
    ) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.require_table(table)?;
        let supplied: Vec<(&str, Value)> = columns.iter().map(|c| (*c, Value::Null)).collect();
        let auto = self.auto_timestamp_columns(table, &supplied);

        let mut quoted = Vec::with_capacity(columns.len() + auto.len());
        let mut values = Vec::with_capacity(columns.len() + auto.len());
        for (i, column) in columns.iter().enumerate() {
            validate_identifier(column)?;
            quoted.push(quote(column));
            values.push(format!("?{}", i + 1));
        }
        for column in &auto {
            quoted.push(quote(column));
            values.push(self.timestamps.current_timestamp_sql().to_string());
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(table),
            quoted.join(", "),
            values.join(", ")
        );
        self.conn.execute_many(&sql, &rows)
    }

    /// Fetches a row by primary key (rowid).
    pub fn get_by_pk(&self, table: &str, pk: i64) -> Result<Option<Row>> {
        self.require_table(table)?;
        let rows = self.conn.query(
            &format!("SELECT * FROM {} WHERE rowid = :pk LIMIT 1", quote(table)),
            &[(":pk", &pk)],
        )?;
        Ok(rows.into_iter().next())
    }

    /// Fetches the first row matching `data` exactly, inserting it first if
    /// none exists.
    pub fn get_or_create(&mut self, table: &str, data: &[(&str, Value)]) -> Result<Row> {
        if data.is_empty() {
            return Err(IsqliteError::Precondition(
                "get_or_create requires at least one column".to_string(),
            ));
        }
        let mut clauses = Vec::with_capacity(data.len());
        let mut names = Vec::with_capacity(data.len());
        for (i, (column, _)) in data.iter().enumerate() {
            validate_identifier(column)?;
            clauses.push(format!("{} = :v{}", quote(column), i));
            names.push(format!(":v{}", i));
        }
        let params: Vec<(&str, &dyn ToSql)> = names
            .iter()
            .zip(data.iter())
            .map(|(name, (_, value))| (name.as_str(), value as &dyn ToSql))
            .collect();
        let rows = self.conn.query(
            &format!(
                "SELECT * FROM {} WHERE {} LIMIT 1",
                quote(table),
                clauses.join(" AND ")
            ),
            &params,
        )?;
        if let Some(row) = rows.into_iter().next() {
            return Ok(row);
        }

        let pk = self.create(table, data)?;
        let created = self.get_by_pk(table, pk)?;
        created.ok_or_else(|| {
            IsqliteError::Precondition(format!(
                "row {} vanished from table {:?} after insert",
                pk, table
            ))
        })
    }

    /// Lists rows, optionally filtered by a `WHERE` clause with named
    /// parameters.
    pub fn list(
        &self,
        table: &str,
        where_clause: Option<&str>,
        params: &[(&str, &dyn ToSql)],
    ) -> Result<Vec<Row>> {
        self.require_table(table)?;
        let sql = match where_clause {
            Some(clause) => format!("SELECT * FROM {} WHERE {}", quote(table), clause),
            None => format!("SELECT * FROM {}", quote(table)),
        };
        self.conn.query(&sql, params)
    }

    /// Counts rows, optionally filtered.
    pub fn count(
        &self,
        table: &str,
        where_clause: Option<&str>,
        params: &[(&str, &dyn ToSql)],
    ) -> Result<i64> {
        self.require_table(table)?;
        let sql = match where_clause {
            Some(clause) => format!(
                "SELECT COUNT(*) AS n FROM {} WHERE {}",
                quote(table),
                clause
            ),
            None => format!("SELECT COUNT(*) AS n FROM {}", quote(table)),
        };
        let rows = self.conn.query(&sql, params)?;
        Ok(rows.first().and_then(|r| r.integer("n")).unwrap_or(0))
    }

    /// Updates a row by primary key. A `last_updated_at` column, if the
    /// table has one and the caller did not set it, is refreshed.
    pub fn update_by_pk(&mut self, table: &str, pk: i64, data: &[(&str, Value)]) -> Result<()> {
        let table_schema = self.require_table(table)?;
        let touch_timestamp = table_schema.get_column("last_updated_at").is_some()
            && data.iter().all(|(c, _)| *c != "last_updated_at");

        let mut assignments = Vec::with_capacity(data.len() + 1);
        let mut names = Vec::with_capacity(data.len());
        for (i, (column, _)) in data.iter().enumerate() {
            validate_identifier(column)?;
            assignments.push(format!("{} = :v{}", quote(column), i));
            names.push(format!(":v{}", i));
        }
        if touch_timestamp {
            assignments.push(format!(
                "{} = {}",
                quote("last_updated_at"),
                self.timestamps.current_timestamp_sql()
            ));
        }
        if assignments.is_empty() {
            return Err(IsqliteError::Precondition(
                "update_by_pk requires at least one column".to_string(),
            ));
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE rowid = :pk",
            quote(table),
            assignments.join(", ")
        );
        let mut params: Vec<(&str, &dyn ToSql)> = names
            .iter()
            .zip(data.iter())
            .map(|(name, (_, value))| (name.as_str(), value as &dyn ToSql))
            .collect();
        params.push((":pk", &pk));
        self.conn.execute(&sql, &params)?;
        Ok(())
    }

    /// Deletes a row by primary key.
    pub fn delete_by_pk(&mut self, table: &str, pk: i64) -> Result<()> {
        self.require_table(table)?;
        self.conn.execute(
            &format!("DELETE FROM {} WHERE rowid = :pk", quote(table)),
            &[(":pk", &pk)],
        )?;
        Ok(())
    }

    /// Runs a raw SQL query with named parameters and returns all rows.
    pub fn sql(&self, query: &str, params: &[(&str, &dyn ToSql)]) -> Result<Vec<Row>> {
        self.conn.query(query, params)
    }

    // ---- transactions and lifetime ---------------------------------------

    /// Begins a transaction.
    pub fn begin(&self) -> Result<()> {
        self.conn.begin()
    }

    /// Commits the current transaction.
    pub fn commit(&self) -> Result<()> {
        self.conn.commit()
    }

    /// Rolls back the current transaction.
    pub fn rollback(&self) -> Result<()> {
        self.conn.rollback()
    }

    /// Whether a transaction is currently open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.conn.in_transaction()
    }

    /// Commits any open transaction and closes the connection.
    ///
    /// A `Database` that is dropped without `close` has its open
    /// transaction rolled back by SQLite instead.
    pub fn close(self) -> Result<()> {
        if self.conn.in_transaction() {
            self.conn.commit()?;
        }
        self.conn.close()
    }

    fn require_table(&self, table: &str) -> Result<&Table> {
        self.schema
            .get(table)
            .ok_or_else(|| IsqliteError::TableNotFound(table.to_string()))
    }

    fn require_column(&self, table: &str, column: &str) -> Result<&Column> {
        self.require_table(table)?
            .get_column(column)
            .ok_or_else(|| IsqliteError::ColumnNotFound(table.to_string(), column.to_string()))
    }

    /// Timestamp columns of `table` that the caller did not supply.
    fn auto_timestamp_columns(&self, table: &str, data: &[(&str, Value)]) -> Vec<&'static str> {
        let Some(table_schema) = self.schema.get(table) else {
            return Vec::new();
        };
        ["created_at", "last_updated_at"]
            .into_iter()
            .filter(|column| {
                table_schema.get_column(column).is_some()
                    && data.iter().all(|(c, _)| c != column)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AutoTable;

    fn db() -> Database {
        Database::open_in_memory(OpenOptions::new().autocommit()).unwrap()
    }

    fn people_schema() -> Schema {
        Schema::new(vec![Table::new(
            "people",
            vec![
                Column::new("id", "INTEGER").primary_key(),
                Column::new("name", "TEXT").required(),
            ],
        )
        .unwrap()])
        .unwrap()
    }

    #[test]
    fn migrate_then_diff_is_empty() {
        let mut db = db();
        let schema = people_schema();
        db.migrate(&schema, &DiffOptions::default()).unwrap();

        let ops = db.diff(&schema, &DiffOptions::default()).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn diff_does_not_write() {
        let db = db();
        let schema = people_schema();

        let ops = db.diff(&schema, &DiffOptions::default()).unwrap();
        assert_eq!(ops.len(), 1);
        assert!(db.schema().is_empty());
        assert!(db
            .sql(
                "SELECT name FROM sqlite_master WHERE type = 'table'",
                &[]
            )
            .unwrap()
            .is_empty());
    }

    #[test]
    fn create_fills_timestamps_for_auto_tables() {
        let mut db = db();
        let schema = Schema::new(vec![AutoTable::new(
            "notes",
            vec![Column::new("body", "TEXT").required()],
        )
        .build()
        .unwrap()])
        .unwrap();
        db.migrate(&schema, &DiffOptions::default()).unwrap();

        let pk = db
            .create("notes", &[("body", Value::Text("hello".to_string()))])
            .unwrap();
        let row = db.get_by_pk("notes", pk).unwrap().unwrap();

        assert_eq!(row.text("body"), Some("hello"));
        assert!(matches!(row.get("created_at"), Some(Value::Text(_))));
        assert!(matches!(row.get("last_updated_at"), Some(Value::Text(_))));
    }

    #[test]
    fn epoch_timestamps_store_integers() {
        let mut db = Database::open_in_memory(
            OpenOptions::new().autocommit().epoch_timestamps(),
        )
        .unwrap();
        let schema = Schema::new(vec![AutoTable::new(
            "notes",
            vec![Column::new("body", "TEXT").required()],
        )
        .timestamps(TimestampKind::EpochSeconds)
        .build()
        .unwrap()])
        .unwrap();
        db.migrate(&schema, &DiffOptions::default()).unwrap();

        let pk = db
            .create("notes", &[("body", Value::Text("x".to_string()))])
            .unwrap();
        let row = db.get_by_pk("notes", pk).unwrap().unwrap();
        assert!(matches!(row.get("created_at"), Some(Value::Integer(_))));
    }

    #[test]
    fn update_by_pk_touches_last_updated_at() {
        let mut db = db();
        let schema = Schema::new(vec![AutoTable::new(
            "notes",
            vec![Column::new("body", "TEXT").required()],
        )
        .build()
        .unwrap()])
        .unwrap();
        db.migrate(&schema, &DiffOptions::default()).unwrap();

        let pk = db
            .create("notes", &[("body", Value::Text("a".to_string()))])
            .unwrap();
        db.update_by_pk("notes", pk, &[("body", Value::Text("b".to_string()))])
            .unwrap();

        let row = db.get_by_pk("notes", pk).unwrap().unwrap();
        assert_eq!(row.text("body"), Some("b"));
        assert!(matches!(row.get("last_updated_at"), Some(Value::Text(_))));
    }

    #[test]
    fn get_or_create_inserts_once() {
        let mut db = db();
        db.migrate(&people_schema(), &DiffOptions::default())
            .unwrap();

        let first = db
            .get_or_create("people", &[("name", Value::Text("ada".to_string()))])
            .unwrap();
        let second = db
            .get_or_create("people", &[("name", Value::Text("ada".to_string()))])
            .unwrap();

        assert_eq!(first.get("id"), second.get("id"));
        assert_eq!(db.count("people", None, &[]).unwrap(), 1);
    }

    #[test]
    fn list_and_count_filter_with_named_params() {
        let mut db = db();
        db.migrate(&people_schema(), &DiffOptions::default())
            .unwrap();
        db.create_many(
            "people",
            &["name"],
            vec![
                vec![Value::Text("ada".to_string())],
                vec![Value::Text("alan".to_string())],
                vec![Value::Text("grace".to_string())],
            ],
        )
        .unwrap();

        let rows = db
            .list("people", Some("name LIKE :p"), &[(":p", &"a%")])
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            db.count("people", Some("name = :n"), &[(":n", &"grace")])
                .unwrap(),
            1
        );
    }

    #[test]
    fn delete_by_pk_removes_the_row() {
        let mut db = db();
        db.migrate(&people_schema(), &DiffOptions::default())
            .unwrap();
        let pk = db
            .create("people", &[("name", Value::Text("ada".to_string()))])
            .unwrap();

        db.delete_by_pk("people", pk).unwrap();
        assert!(db.get_by_pk("people", pk).unwrap().is_none());
    }

    #[test]
    fn crud_on_missing_table_is_a_user_error() {
        let db = db();
        assert!(matches!(
            db.get_by_pk("nope", 1),
            Err(IsqliteError::TableNotFound(_))
        ));
        assert!(matches!(
            db.list("nope", None, &[]),
            Err(IsqliteError::TableNotFound(_))
        ));
    }

    #[test]
    fn single_op_helpers_check_preconditions() {
        let mut db = db();
        db.migrate(&people_schema(), &DiffOptions::default())
            .unwrap();

        assert!(matches!(
            db.add_column("people", Column::new("name", "TEXT")),
            Err(IsqliteError::Precondition(_))
        ));
        assert!(matches!(
            db.drop_column("people", "nope"),
            Err(IsqliteError::ColumnNotFound(..))
        ));
        assert!(matches!(
            db.rename_table("nope", "other"),
            Err(IsqliteError::TableNotFound(_))
        ));
    }

    #[test]
    fn rename_helpers_apply_single_operations() {
        let mut db = db();
        db.migrate(&people_schema(), &DiffOptions::default())
            .unwrap();
        let pk = db
            .create("people", &[("name", Value::Text("ada".to_string()))])
            .unwrap();

        db.rename_column("people", "name", "legal_name").unwrap();
        let row = db.get_by_pk("people", pk).unwrap().unwrap();
        assert_eq!(row.text("legal_name"), Some("ada"));

        db.rename_table("people", "persons").unwrap();
        assert!(db.schema().get("persons").is_some());
        assert!(db.schema().get("people").is_none());
    }

    #[test]
    fn ambient_transaction_survives_migration() {
        let mut db = Database::open_in_memory(OpenOptions::new()).unwrap();
        assert!(db.in_transaction());

        db.migrate(&people_schema(), &DiffOptions::default())
            .unwrap();
        assert!(db.in_transaction());

        db.create("people", &[("name", Value::Text("ada".to_string()))])
            .unwrap();
        db.close().unwrap();
    }
}
