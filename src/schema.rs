//! Schema representation types.
//!
//! These types describe the structure of database tables and are used both
//! by user code (to declare what the schema should be) and by the
//! introspector (to describe what the database currently contains). Columns
//! and tables are immutable value types once built; construction validates
//! identifiers and constraint compatibility so that errors surface before
//! any I/O.

use serde::{Deserialize, Serialize};

use crate::error::{IsqliteError, Result};

/// Quotes an identifier for use in SQL, doubling any embedded quotes.
///
/// Identifiers built through [`Column`] and [`Table`] are validated and can
/// never contain a quote, but identifiers read back from a live database are
/// arbitrary.
#[must_use]
pub fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Checks that `name` is an ASCII identifier: `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(IsqliteError::InvalidIdentifier(name.to_string()))
    }
}

/// A SQL literal, used for column defaults and `CHECK (... IN ...)` choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    /// NULL.
    Null,
    /// Integer literal.
    Integer(i64),
    /// Floating-point literal.
    Real(f64),
    /// String literal.
    Text(String),
    /// A raw SQL expression (e.g. `CURRENT_TIMESTAMP`), rendered verbatim.
    Expression(String),
}

impl Literal {
    /// Renders the literal as SQL. Strings are single-quoted with internal
    /// quotes doubled.
    #[must_use]
    pub fn to_sql(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Integer(i) => i.to_string(),
            // {:?} keeps a decimal point on round values so the literal
            // parses back as a float, not an integer.
            Self::Real(f) => format!("{:?}", f),
            Self::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Self::Expression(expr) => expr.clone(),
        }
    }

    /// Returns true for constant literals that SQLite accepts as defaults in
    /// `ALTER TABLE ADD COLUMN`.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        !matches!(self, Self::Expression(_))
    }
}

/// Referential action for `ON DELETE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OnDeleteAction {
    /// No action (the default).
    #[default]
    NoAction,
    /// Restrict.
    Restrict,
    /// Set the referencing column to NULL.
    SetNull,
    /// Set the referencing column to its default value.
    SetDefault,
    /// Cascade the delete to referencing rows.
    Cascade,
}

impl OnDeleteAction {
    /// Returns the SQL representation of this action.
    #[must_use]
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
            Self::Cascade => "CASCADE",
        }
    }
}

/// A single-column foreign key reference.
///
/// The referenced table is stored by name, not by reference; the graph of
/// cross-table relationships is resolved at execution time by SQLite itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Name of the referenced table.
    pub table: String,
    /// Action when the referenced row is deleted.
    #[serde(default)]
    pub on_delete: OnDeleteAction,
}

/// Declaration of a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// SQL type, kept as opaque text (e.g. `TEXT`, `INTEGER`, `VARCHAR(40)`).
    pub sql_type: String,
    /// Whether the column is `NOT NULL`.
    #[serde(default)]
    pub required: bool,
    /// Finite set of permitted values, enforced with `CHECK (col IN (...))`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Literal>,
    /// Default value.
    #[serde(default)]
    pub default: Option<Literal>,
    /// Whether the column has a `UNIQUE` constraint.
    #[serde(default)]
    pub unique: bool,
    /// Whether the column is the table's primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// Foreign key reference, if any.
    #[serde(default)]
    pub foreign_key: Option<ForeignKey>,
}

impl Column {
    /// Creates a new column declaration.
    #[must_use]
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into().trim().to_string(),
            required: false,
            choices: Vec::new(),
            default: None,
            unique: false,
            primary_key: false,
            foreign_key: None,
        }
    }

    /// Marks the column `NOT NULL`.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Restricts the column to a finite set of values.
    #[must_use]
    pub fn choices(mut self, choices: Vec<Literal>) -> Self {
        self.choices = choices;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn default(mut self, value: Literal) -> Self {
        self.default = Some(value);
        self
    }

    /// Adds a `UNIQUE` constraint.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Marks the column as the table's primary key. Primary keys are always
    /// `NOT NULL`.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.required = true;
        self
    }

    /// Makes the column reference another table.
    #[must_use]
    pub fn references(mut self, table: impl Into<String>, on_delete: OnDeleteAction) -> Self {
        self.foreign_key = Some(ForeignKey {
            table: table.into(),
            on_delete,
        });
        self
    }

    /// Returns a copy of this column under a different name.
    #[must_use]
    pub fn renamed(&self, new_name: impl Into<String>) -> Self {
        let mut column = self.clone();
        column.name = new_name.into();
        column
    }

    /// Compares two columns ignoring their names. This is the equivalence
    /// used by rename detection.
    #[must_use]
    pub fn same_definition(&self, other: &Column) -> bool {
        self.sql_type == other.sql_type
            && self.required == other.required
            && self.choices == other.choices
            && self.default == other.default
            && self.unique == other.unique
            && self.primary_key == other.primary_key
            && self.foreign_key == other.foreign_key
    }

    /// Renders the canonical SQL fragment for this column. Clause order is
    /// fixed, so equal columns always render byte-identically.
    #[must_use]
    pub fn to_sql(&self) -> String {
        let mut parts = vec![quote(&self.name), self.sql_type.clone()];
        if self.required {
            parts.push("NOT NULL".to_string());
        }
        if let Some(default) = &self.default {
            parts.push(format!("DEFAULT {}", default.to_sql()));
        }
        if self.unique {
            parts.push("UNIQUE".to_string());
        }
        if self.primary_key {
            parts.push("PRIMARY KEY".to_string());
        }
        if let Some(fk) = &self.foreign_key {
            parts.push(format!(
                "REFERENCES {} ON DELETE {}",
                quote(&fk.table),
                fk.on_delete.to_sql()
            ));
        }
        if !self.choices.is_empty() {
            let values: Vec<String> = self.choices.iter().map(Literal::to_sql).collect();
            parts.push(format!("CHECK({} IN ({}))", quote(&self.name), values.join(", ")));
        }
        parts.join(" ")
    }

    /// Whether the column can be added with a plain `ALTER TABLE ADD COLUMN`
    /// instead of a table rebuild.
    #[must_use]
    pub fn addable_in_place(&self) -> bool {
        if self.primary_key || self.unique {
            return false;
        }
        match &self.default {
            Some(default) if !default.is_constant() => false,
            Some(Literal::Null) | None => !self.required,
            Some(_) => true,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_identifier(&self.name)?;
        if self.sql_type.is_empty() {
            return Err(IsqliteError::SchemaBuild(format!(
                "column {:?} has an empty type",
                self.name
            )));
        }
        if self.primary_key && self.foreign_key.is_some() {
            return Err(IsqliteError::SchemaBuild(format!(
                "column {:?} cannot be both a primary key and a foreign key",
                self.name
            )));
        }
        if let Some(fk) = &self.foreign_key {
            validate_identifier(&fk.table)?;
        }
        self.validate_choices()
    }

    fn validate_choices(&self) -> Result<()> {
        let affinity = self.sql_type.to_ascii_uppercase();
        for choice in &self.choices {
            let compatible = match choice {
                Literal::Integer(_) => !affinity.contains("CHAR") && !affinity.contains("TEXT"),
                Literal::Text(_) => !affinity.contains("INT"),
                Literal::Real(_) => {
                    !affinity.contains("INT")
                        && !affinity.contains("CHAR")
                        && !affinity.contains("TEXT")
                }
                Literal::Null | Literal::Expression(_) => false,
            };
            if !compatible {
                return Err(IsqliteError::SchemaBuild(format!(
                    "choice {} is not compatible with type {:?} of column {:?}",
                    choice.to_sql(),
                    self.sql_type,
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Declaration of a table: an ordered list of columns plus opaque
/// table-level constraints.
///
/// Column positions matter; they are the table's column order on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Table name.
    pub name: String,
    /// Ordered column declarations.
    pub columns: Vec<Column>,
    /// Table-level constraints, appended verbatim after the columns
    /// (e.g. `CHECK(start < end)`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    /// Whether the table is declared `WITHOUT ROWID`.
    #[serde(default)]
    pub without_rowid: bool,
}

impl Table {
    /// Creates a new table declaration.
    ///
    /// # Errors
    ///
    /// Fails if the table name or any column is invalid, if two columns
    /// share a name, or if more than one column is marked primary key.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Result<Self> {
        let table = Self {
            name: name.into(),
            columns,
            constraints: Vec::new(),
            without_rowid: false,
        };
        table.validate()?;
        Ok(table)
    }

    /// Appends a table-level constraint.
    #[must_use]
    pub fn constraint(mut self, sql: impl Into<String>) -> Self {
        self.constraints.push(sql.into());
        self
    }

    /// Declares the table `WITHOUT ROWID`.
    #[must_use]
    pub fn without_rowid(mut self) -> Self {
        self.without_rowid = true;
        self
    }

    /// Gets a column by name.
    #[must_use]
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Returns the position of a column by name.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Returns the column names in declared order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Renders the `CREATE TABLE` statement for this table.
    #[must_use]
    pub fn create_table_sql(&self) -> String {
        self.create_table_sql_as(&self.name)
    }

    /// Renders the `CREATE TABLE` statement under a different table name.
    /// Used by the rebuild protocol to create the temporary table.
    #[must_use]
    pub fn create_table_sql_as(&self, name: &str) -> String {
        let mut sql = String::from("CREATE TABLE ");
        sql.push_str(&quote(name));
        sql.push_str(" (\n  ");
        let mut items: Vec<String> = self.columns.iter().map(Column::to_sql).collect();
        items.extend(self.constraints.iter().cloned());
        sql.push_str(&items.join(",\n  "));
        sql.push_str("\n)");
        if self.without_rowid {
            sql.push_str(" WITHOUT ROWID");
        }
        sql
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_identifier(&self.name)?;
        let mut primary_keys = 0;
        for (i, column) in self.columns.iter().enumerate() {
            column.validate()?;
            if column.primary_key {
                primary_keys += 1;
            }
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(IsqliteError::SchemaBuild(format!(
                    "column {:?} was declared multiple times in table {:?}",
                    column.name, self.name
                )));
            }
        }
        if primary_keys > 1 {
            return Err(IsqliteError::SchemaBuild(format!(
                "table {:?} declares more than one primary key column",
                self.name
            )));
        }
        Ok(())
    }
}

/// How `AutoTable` timestamp columns are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimestampKind {
    /// ISO-8601 text (`TIMESTAMP` columns).
    #[default]
    Iso8601,
    /// Integer seconds since the Unix epoch (`INTEGER` columns).
    EpochSeconds,
}

impl TimestampKind {
    /// The SQL type used for timestamp columns of this kind.
    #[must_use]
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Iso8601 => "TIMESTAMP",
            Self::EpochSeconds => "INTEGER",
        }
    }

    /// SQL expression producing the current time in this representation.
    #[must_use]
    pub fn current_timestamp_sql(&self) -> &'static str {
        match self {
            Self::Iso8601 => "STRFTIME('%Y-%m-%d %H:%M:%f', 'now')",
            Self::EpochSeconds => "CAST(STRFTIME('%s', 'now') AS INTEGER)",
        }
    }
}

/// Builder for tables that follow the auto-timestamped convention: an
/// `id INTEGER NOT NULL PRIMARY KEY` column is prepended and required
/// `created_at` / `last_updated_at` columns are appended.
///
/// The result is a plain [`Table`]; downstream components never treat it
/// specially. The timestamp representation must match the database the
/// table will live in (see `OpenOptions::use_epoch_timestamps`).
#[derive(Debug, Clone)]
pub struct AutoTable {
    name: String,
    columns: Vec<Column>,
    constraints: Vec<String>,
    timestamps: TimestampKind,
}

impl AutoTable {
    /// Column names reserved by the convention.
    pub const RESERVED: [&'static str; 3] = ["id", "created_at", "last_updated_at"];

    /// Creates a new auto-table builder with ISO-8601 timestamps.
    #[must_use]
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            constraints: Vec::new(),
            timestamps: TimestampKind::Iso8601,
        }
    }

    /// Sets the timestamp representation.
    #[must_use]
    pub fn timestamps(mut self, kind: TimestampKind) -> Self {
        self.timestamps = kind;
        self
    }

    /// Appends a table-level constraint.
    #[must_use]
    pub fn constraint(mut self, sql: impl Into<String>) -> Self {
        self.constraints.push(sql.into());
        self
    }

    /// Expands the builder into a plain [`Table`].
    ///
    /// # Errors
    ///
    /// Fails if any user column uses one of the reserved names, or if the
    /// expanded table is invalid.
    pub fn build(self) -> Result<Table> {
        for column in &self.columns {
            if Self::RESERVED.contains(&column.name.as_str()) {
                return Err(IsqliteError::SchemaBuild(format!(
                    "column name {:?} is reserved by the auto-table convention",
                    column.name
                )));
            }
        }

        let timestamp_type = self.timestamps.sql_type();
        let mut columns = vec![Column::new("id", "INTEGER").primary_key()];
        columns.extend(self.columns);
        columns.push(Column::new("created_at", timestamp_type).required());
        columns.push(Column::new("last_updated_at", timestamp_type).required());

        let mut table = Table::new(self.name, columns)?;
        table.constraints = self.constraints;
        Ok(table)
    }
}

/// An ordered collection of table declarations.
///
/// Table order is significant for creation (referenced tables should come
/// before referencing tables) but not for diffing.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Schema {
    tables: Vec<Table>,
}

impl Schema {
    /// Creates a schema from a list of tables.
    ///
    /// # Errors
    ///
    /// Fails if two tables share a name or any table is invalid.
    pub fn new(tables: Vec<Table>) -> Result<Self> {
        for (i, table) in tables.iter().enumerate() {
            table.validate()?;
            if tables[..i].iter().any(|t| t.name == table.name) {
                return Err(IsqliteError::SchemaBuild(format!(
                    "table {:?} was declared multiple times",
                    table.name
                )));
            }
        }
        Ok(Self { tables })
    }

    /// Creates an empty schema.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Gets a table by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Returns the table names in declared order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    /// Returns the tables in declared order.
    #[must_use]
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// Returns true if the schema declares no tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl<'a> IntoIterator for &'a Schema {
    type Item = &'a Table;
    type IntoIter = std::slice::Iter<'a, Table>;

    fn into_iter(self) -> Self::IntoIter {
        self.tables.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_renders_clauses_in_canonical_order() {
        let column = Column::new("status", "TEXT")
            .required()
            .default(Literal::Text("new".to_string()))
            .choices(vec![
                Literal::Text("new".to_string()),
                Literal::Text("done".to_string()),
            ]);

        assert_eq!(
            column.to_sql(),
            "\"status\" TEXT NOT NULL DEFAULT 'new' CHECK(\"status\" IN ('new', 'done'))"
        );
    }

    #[test]
    fn column_renders_foreign_key() {
        let column = Column::new("author", "INTEGER")
            .required()
            .references("people", OnDeleteAction::Cascade);

        assert_eq!(
            column.to_sql(),
            "\"author\" INTEGER NOT NULL REFERENCES \"people\" ON DELETE CASCADE"
        );
    }

    #[test]
    fn text_literal_doubles_quotes() {
        assert_eq!(
            Literal::Text("it's".to_string()).to_sql(),
            "'it''s'"
        );
    }

    #[test]
    fn real_literal_keeps_decimal_point() {
        assert_eq!(Literal::Real(1.0).to_sql(), "1.0");
        assert_eq!(Literal::Real(2.5).to_sql(), "2.5");
    }

    #[test]
    fn primary_key_implies_not_null() {
        let column = Column::new("id", "INTEGER").primary_key();
        assert!(column.required);
        assert_eq!(column.to_sql(), "\"id\" INTEGER NOT NULL PRIMARY KEY");
    }

    #[test]
    fn same_definition_ignores_name_only() {
        let a = Column::new("old", "TEXT").required();
        let b = Column::new("new", "TEXT").required();
        let c = Column::new("new", "TEXT");

        assert!(a.same_definition(&b));
        assert!(!a.same_definition(&c));
    }

    #[test]
    fn invalid_identifier_is_rejected() {
        let column = Column::new("bad name", "TEXT");
        assert!(matches!(
            Table::new("t", vec![column]),
            Err(IsqliteError::InvalidIdentifier(_))
        ));

        assert!(matches!(
            Table::new("drop;--", vec![Column::new("a", "TEXT")]),
            Err(IsqliteError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn primary_key_foreign_key_conflict_is_rejected() {
        let mut column = Column::new("id", "INTEGER").primary_key();
        column.foreign_key = Some(ForeignKey {
            table: "other".to_string(),
            on_delete: OnDeleteAction::NoAction,
        });

        assert!(matches!(
            Table::new("t", vec![column]),
            Err(IsqliteError::SchemaBuild(_))
        ));
    }

    #[test]
    fn incompatible_choices_are_rejected() {
        let column = Column::new("n", "INTEGER").choices(vec![Literal::Text("a".to_string())]);
        assert!(matches!(
            Table::new("t", vec![column]),
            Err(IsqliteError::SchemaBuild(_))
        ));

        let column = Column::new("s", "VARCHAR(10)").choices(vec![Literal::Integer(1)]);
        assert!(Table::new("t", vec![column]).is_err());
    }

    #[test]
    fn duplicate_column_is_rejected() {
        let result = Table::new(
            "t",
            vec![Column::new("a", "TEXT"), Column::new("a", "INTEGER")],
        );
        assert!(matches!(result, Err(IsqliteError::SchemaBuild(_))));
    }

    #[test]
    fn two_primary_keys_are_rejected() {
        let result = Table::new(
            "t",
            vec![
                Column::new("a", "INTEGER").primary_key(),
                Column::new("b", "INTEGER").primary_key(),
            ],
        );
        assert!(matches!(result, Err(IsqliteError::SchemaBuild(_))));
    }

    #[test]
    fn create_table_sql_includes_constraints_and_without_rowid() {
        let table = Table::new(
            "spans",
            vec![
                Column::new("key", "TEXT").primary_key(),
                Column::new("start", "INTEGER").required(),
                Column::new("end", "INTEGER").required(),
            ],
        )
        .unwrap()
        .constraint("CHECK(start < end)")
        .without_rowid();

        let sql = table.create_table_sql();
        assert!(sql.starts_with("CREATE TABLE \"spans\" (\n"));
        assert!(sql.contains("\"start\" INTEGER NOT NULL,"));
        assert!(sql.contains("CHECK(start < end)"));
        assert!(sql.ends_with(") WITHOUT ROWID"));
    }

    #[test]
    fn auto_table_expands_to_plain_table() {
        let table = AutoTable::new("events", vec![Column::new("title", "TEXT").required()])
            .build()
            .unwrap();

        let names: Vec<&str> = table.column_names().collect();
        assert_eq!(names, ["id", "title", "created_at", "last_updated_at"]);
        assert!(table.columns[0].primary_key);
        assert_eq!(table.columns[2].sql_type, "TIMESTAMP");
        assert!(table.columns[3].required);
    }

    #[test]
    fn auto_table_epoch_timestamps_use_integer_columns() {
        let table = AutoTable::new("events", vec![])
            .timestamps(TimestampKind::EpochSeconds)
            .build()
            .unwrap();

        assert_eq!(table.get_column("created_at").unwrap().sql_type, "INTEGER");
        assert_eq!(
            table.get_column("last_updated_at").unwrap().sql_type,
            "INTEGER"
        );
    }

    #[test]
    fn auto_table_rejects_reserved_names() {
        let result = AutoTable::new("events", vec![Column::new("id", "INTEGER")]).build();
        assert!(matches!(result, Err(IsqliteError::SchemaBuild(_))));
    }

    #[test]
    fn schema_rejects_duplicate_tables() {
        let a = Table::new("t", vec![Column::new("x", "TEXT")]).unwrap();
        let b = Table::new("t", vec![Column::new("y", "TEXT")]).unwrap();
        assert!(matches!(
            Schema::new(vec![a, b]),
            Err(IsqliteError::SchemaBuild(_))
        ));
    }

    #[test]
    fn schema_preserves_declared_order() {
        let schema = Schema::new(vec![
            Table::new("b", vec![Column::new("x", "TEXT")]).unwrap(),
            Table::new("a", vec![Column::new("y", "TEXT")]).unwrap(),
        ])
        .unwrap();

        let names: Vec<&str> = schema.names().collect();
        assert_eq!(names, ["b", "a"]);
        assert!(schema.get("a").is_some());
        assert!(schema.get("missing").is_none());
    }
}
