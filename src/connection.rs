//! Thin synchronous connection façade.
//!
//! [`Connection`] wraps a single `rusqlite::Connection` behind the narrow
//! contract the executor and introspector need: execute, query, batched
//! execute, transaction control, and pragmas. It is single-threaded and
//! blocking; the executor assumes no concurrent writer exists on the same
//! connection.

use rusqlite::{OpenFlags, ToSql};
use tracing::debug;

use crate::error::Result;

pub use rusqlite::types::Value;

/// Named parameters for [`Connection::execute`] and [`Connection::query`].
/// Names carry their `:` prefix, e.g. `(":pk", &5)`.
pub type NamedParams<'a> = [(&'a str, &'a dyn ToSql)];

/// One result row: column names paired with values, in select order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Column names in select order.
    pub columns: Vec<String>,
    /// Values in the same order.
    pub values: Vec<Value>,
}

impl Row {
    /// Gets a value by column name.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    /// Gets a text value by column name.
    #[must_use]
    pub fn text(&self, column: &str) -> Option<&str> {
        match self.get(column) {
            Some(Value::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Gets an integer value by column name.
    #[must_use]
    pub fn integer(&self, column: &str) -> Option<i64> {
        match self.get(column) {
            Some(Value::Integer(i)) => Some(*i),
            _ => None,
        }
    }
}

/// A synchronous connection to one SQLite database.
#[derive(Debug)]
pub struct Connection {
    inner: rusqlite::Connection,
}

impl Connection {
    /// Opens a database file (or URI) for reading and writing, creating it
    /// if missing.
    pub fn open(path: &str, readonly: bool) -> Result<Self> {
        let flags = if readonly {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
        };
        let inner = rusqlite::Connection::open_with_flags(path, flags)?;
        Ok(Self { inner })
    }

    /// Opens an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            inner: rusqlite::Connection::open_in_memory()?,
        })
    }

    /// Executes a statement with named parameters, returning the number of
    /// affected rows.
    pub fn execute(&self, sql: &str, params: &NamedParams<'_>) -> Result<usize> {
        debug!(%sql, "execute");
        let mut stmt = self.inner.prepare(sql)?;
        Ok(stmt.execute(params)?)
    }

    /// Runs a query with named parameters and returns all rows.
    pub fn query(&self, sql: &str, params: &NamedParams<'_>) -> Result<Vec<Row>> {
        debug!(%sql, "query");
        let mut stmt = self.inner.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(row.get::<_, Value>(i)?);
            }
            out.push(Row {
                columns: columns.clone(),
                values,
            });
        }
        Ok(out)
    }

    /// Executes a statement once per row of positional parameters, reusing
    /// the prepared statement. Returns the total number of affected rows.
    pub fn execute_many(&self, sql: &str, rows: &[Vec<Value>]) -> Result<usize> {
        debug!(%sql, rows = rows.len(), "execute_many");
        let mut stmt = self.inner.prepare(sql)?;
        let mut affected = 0;
        for row in rows {
            affected += stmt.execute(rusqlite::params_from_iter(row.iter()))?;
        }
        Ok(affected)
    }

    /// Begins a transaction.
    pub fn begin(&self) -> Result<()> {
        debug!("BEGIN");
        self.inner.execute_batch("BEGIN")?;
        Ok(())
    }

    /// Commits the current transaction.
    pub fn commit(&self) -> Result<()> {
        debug!("COMMIT");
        self.inner.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Rolls back the current transaction.
    pub fn rollback(&self) -> Result<()> {
        debug!("ROLLBACK");
        self.inner.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Whether a transaction is currently open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        !self.inner.is_autocommit()
    }

    /// Reads a pragma value.
    pub fn pragma(&self, name: &str) -> Result<Option<Value>> {
        let rows = self.query(&format!("PRAGMA {}", name), &[])?;
        Ok(rows.into_iter().next().and_then(|r| r.values.into_iter().next()))
    }

    /// Sets a pragma. The value is interpolated verbatim, so callers pass
    /// only fixed values like `ON`/`OFF`.
    ///
    /// SQLite ignores some pragmas (foreign_keys among them) inside a
    /// transaction; callers are responsible for issuing these outside one.
    pub fn set_pragma(&self, name: &str, value: &str) -> Result<()> {
        let sql = format!("PRAGMA {} = {}", name, value);
        debug!(%sql, "pragma");
        self.inner.execute_batch(&sql)?;
        Ok(())
    }

    /// Rowid of the most recently inserted row.
    #[must_use]
    pub fn last_insert_rowid(&self) -> i64 {
        self.inner.last_insert_rowid()
    }

    /// The version number of the linked SQLite library, e.g. `3045001`.
    #[must_use]
    pub fn sqlite_version() -> i32 {
        rusqlite::version_number()
    }

    /// Closes the connection. An open transaction is rolled back by SQLite,
    /// so callers that want their work kept must commit first.
    pub fn close(self) -> Result<()> {
        self.inner.close().map_err(|(_, e)| e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn execute_and_query_round_trip() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER, b TEXT)", &[]).unwrap();
        conn.execute(
            "INSERT INTO t (a, b) VALUES (:a, :b)",
            &[(":a", &1_i64), (":b", &"one")],
        )
        .unwrap();

        let rows = conn.query("SELECT a, b FROM t", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].integer("a"), Some(1));
        assert_eq!(rows[0].text("b"), Some("one"));
        assert_eq!(rows[0].get("missing"), None);
    }

    #[test]
    fn execute_many_reuses_statement() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER)", &[]).unwrap();
        let affected = conn
            .execute_many(
                "INSERT INTO t (a) VALUES (?1)",
                &[
                    vec![Value::Integer(1)],
                    vec![Value::Integer(2)],
                    vec![Value::Integer(3)],
                ],
            )
            .unwrap();

        assert_eq!(affected, 3);
        let rows = conn.query("SELECT COUNT(*) AS n FROM t", &[]).unwrap();
        assert_eq!(rows[0].integer("n"), Some(3));
    }

    #[test]
    fn transactions_commit_and_roll_back() {
        let conn = conn();
        conn.execute("CREATE TABLE t (a INTEGER)", &[]).unwrap();

        conn.begin().unwrap();
        assert!(conn.in_transaction());
        conn.execute("INSERT INTO t (a) VALUES (1)", &[]).unwrap();
        conn.rollback().unwrap();
        assert!(!conn.in_transaction());

        conn.begin().unwrap();
        conn.execute("INSERT INTO t (a) VALUES (2)", &[]).unwrap();
        conn.commit().unwrap();

        let rows = conn.query("SELECT a FROM t", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].integer("a"), Some(2));
    }

    #[test]
    fn pragma_round_trip() {
        let conn = conn();
        conn.set_pragma("foreign_keys", "ON").unwrap();
        assert_eq!(
            conn.pragma("foreign_keys").unwrap(),
            Some(Value::Integer(1))
        );
        conn.set_pragma("foreign_keys", "OFF").unwrap();
        assert_eq!(
            conn.pragma("foreign_keys").unwrap(),
            Some(Value::Integer(0))
        );
    }
}
