//! Live-schema introspection.
//!
//! Recovers a [`Schema`] from a database by reading every `CREATE TABLE`
//! statement stored in `sqlite_master` and translating it into the column
//! and table model. SQL parsing is delegated to the `sqlparser` crate; this
//! module's only job is to map its AST into [`Column`] and [`Table`]
//! values.
//!
//! The introspector never rejects syntactically valid SQL: type names are
//! kept as opaque text, checks it cannot model become table-level
//! constraint strings, and unmodeled column options are skipped with a
//! debug log.

use sqlparser::ast::{
    ColumnDef, ColumnOption, Expr, ObjectName, ReferentialAction, Statement, UnaryOperator,
    Value as AstValue,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{IsqliteError, Result};
use crate::schema::{Column, ForeignKey, Literal, OnDeleteAction, Schema, Table};

const LIST_TABLES: &str = "SELECT name, sql FROM sqlite_master \
     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY rowid";

const GET_TABLE: &str = "SELECT sql FROM sqlite_master \
     WHERE type = 'table' AND name = :name";

/// Reads the full live schema from the database.
///
/// Table order follows `sqlite_master`; column order within each table is
/// SQLite's storage order.
pub fn introspect_schema(conn: &Connection) -> Result<Schema> {
    let rows = conn.query(LIST_TABLES, &[])?;
    let mut tables = Vec::with_capacity(rows.len());
    for row in &rows {
        let name = row.text("name").ok_or_else(|| IsqliteError::Introspection {
            table: String::new(),
            message: "sqlite_master row without a name".to_string(),
        })?;
        let sql = row.text("sql").ok_or_else(|| IsqliteError::Introspection {
            table: name.to_string(),
            message: "sqlite_master row without stored SQL".to_string(),
        })?;
        tables.push(table_from_sql(name, sql)?);
    }
    Schema::new(tables)
}

/// Reads a single table's live definition.
///
/// # Errors
///
/// Returns [`IsqliteError::TableNotFound`] if the table does not exist.
pub fn introspect_table(conn: &Connection, name: &str) -> Result<Table> {
    let rows = conn.query(GET_TABLE, &[(":name", &name)])?;
    let row = rows
        .first()
        .ok_or_else(|| IsqliteError::TableNotFound(name.to_string()))?;
    let sql = row.text("sql").ok_or_else(|| IsqliteError::Introspection {
        table: name.to_string(),
        message: "sqlite_master row without stored SQL".to_string(),
    })?;
    table_from_sql(name, sql)
}

/// Translates a stored `CREATE TABLE` statement into a [`Table`].
///
/// The table name is taken from the catalog rather than re-parsed, so the
/// result always matches `sqlite_master`.
pub fn table_from_sql(table_name: &str, sql: &str) -> Result<Table> {
    let statements =
        Parser::parse_sql(&SQLiteDialect {}, sql).map_err(|e| IsqliteError::Introspection {
            table: table_name.to_string(),
            message: e.to_string(),
        })?;
    let create = statements
        .into_iter()
        .find_map(|statement| match statement {
            Statement::CreateTable(create) => Some(create),
            _ => None,
        })
        .ok_or_else(|| IsqliteError::Introspection {
            table: table_name.to_string(),
            message: "stored SQL is not a CREATE TABLE statement".to_string(),
        })?;

    let mut constraints = Vec::new();
    let mut columns = Vec::with_capacity(create.columns.len());
    for def in &create.columns {
        columns.push(column_from_def(def, &mut constraints));
    }
    for constraint in &create.constraints {
        constraints.push(constraint.to_string());
    }

    Ok(Table {
        name: table_name.to_string(),
        columns,
        constraints,
        without_rowid: create.without_rowid,
    })
}

/// Parses a single column definition such as `"age" INTEGER NOT NULL`.
///
/// Used by the CLI's column-oriented commands.
pub fn parse_column(sql: &str) -> Result<Column> {
    let table = parse_table("t", &[sql.to_string()])?;
    let mut columns = table.columns;
    if columns.len() != 1 || !table.constraints.is_empty() {
        return Err(IsqliteError::SchemaBuild(format!(
            "expected a single column definition, got {:?}",
            sql
        )));
    }
    Ok(columns.remove(0))
}

/// Parses raw column/constraint definitions into a [`Table`], as the CLI's
/// `create-table` command receives them.
pub fn parse_table(name: &str, definitions: &[String]) -> Result<Table> {
    let sql = format!(
        "CREATE TABLE {} ({})",
        crate::schema::quote(name),
        definitions.join(", ")
    );
    table_from_sql(name, &sql).map_err(|e| match e {
        IsqliteError::Introspection { message, .. } => IsqliteError::SchemaBuild(format!(
            "could not parse table definition: {}",
            message
        )),
        other => other,
    })
}

fn column_from_def(def: &ColumnDef, table_constraints: &mut Vec<String>) -> Column {
    let mut column = Column::new(def.name.value.clone(), def.data_type.to_string());

    for opt in &def.options {
        match &opt.option {
            ColumnOption::NotNull => column.required = true,
            ColumnOption::Null => {}
            ColumnOption::Default(expr) => {
                column.default = Some(
                    literal_from_expr(expr)
                        .unwrap_or_else(|| Literal::Expression(expr.to_string())),
                );
            }
            ColumnOption::Unique { is_primary, .. } => {
                if *is_primary {
                    column.primary_key = true;
                    // Canonical rendering always spells NOT NULL on primary
                    // keys, so reflect that here to keep diffs quiet.
                    column.required = true;
                } else {
                    column.unique = true;
                }
            }
            ColumnOption::ForeignKey {
                foreign_table,
                on_delete,
                ..
            } => {
                let action = match on_delete {
                    Some(action) => on_delete_action(*action),
                    None => OnDeleteAction::NoAction,
                };
                column.foreign_key = Some(ForeignKey {
                    table: object_name_string(foreign_table),
                    on_delete: action,
                });
            }
            ColumnOption::Check(expr) => match choices_from_check(&column.name, expr) {
                Some(choices) => column.choices = choices,
                None => table_constraints.push(format!("CHECK ({})", expr)),
            },
            other => {
                debug!(column = %column.name, option = %other, "ignoring unmodeled column option");
            }
        }
    }

    column
}

/// Extracts `choices` from a `CHECK (col IN (...))` expression attached to
/// `column`. Any other shape returns `None` and the check is kept as a
/// table-level constraint.
fn choices_from_check(column: &str, expr: &Expr) -> Option<Vec<Literal>> {
    let mut expr = expr;
    while let Expr::Nested(inner) = expr {
        expr = inner;
    }
    let Expr::InList {
        expr: lhs,
        list,
        negated: false,
    } = expr
    else {
        return None;
    };
    match lhs.as_ref() {
        Expr::Identifier(ident) if ident.value == column => {}
        _ => return None,
    }
    list.iter().map(literal_from_expr).collect()
}

fn literal_from_expr(expr: &Expr) -> Option<Literal> {
    match expr {
        Expr::Value(AstValue::Null) => Some(Literal::Null),
        Expr::Value(AstValue::SingleQuotedString(s)) => Some(Literal::Text(s.clone())),
        Expr::Value(AstValue::Number(n, _)) => {
            if let Ok(i) = n.parse::<i64>() {
                Some(Literal::Integer(i))
            } else {
                n.parse::<f64>().ok().map(Literal::Real)
            }
        }
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match literal_from_expr(expr)? {
            Literal::Integer(i) => Some(Literal::Integer(-i)),
            Literal::Real(f) => Some(Literal::Real(-f)),
            _ => None,
        },
        _ => None,
    }
}

fn on_delete_action(action: ReferentialAction) -> OnDeleteAction {
    match action {
        ReferentialAction::NoAction => OnDeleteAction::NoAction,
        ReferentialAction::Restrict => OnDeleteAction::Restrict,
        ReferentialAction::SetNull => OnDeleteAction::SetNull,
        ReferentialAction::SetDefault => OnDeleteAction::SetDefault,
        ReferentialAction::Cascade => OnDeleteAction::Cascade,
    }
}

fn object_name_string(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .unwrap_or_else(|| name.to_string())
}
