//! The `isqlite` command-line tool.
//!
//! Exit codes: `0` success, `1` user error, `2` migration aborted, `3`
//! integrity failure on the post-migration foreign-key check.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use isqlite::introspect;
use isqlite::prelude::*;

/// Declarative schema management for SQLite.
#[derive(Parser)]
#[command(name = "isqlite")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output (logs every SQL statement).
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a column to a table.
    AddColumn {
        /// Path to the database file.
        db: String,
        /// Table to alter.
        table: String,
        /// Column definition, e.g. '"age" INTEGER NOT NULL DEFAULT 0'.
        column: String,
    },

    /// Replace a column's definition, keeping its data.
    AlterColumn {
        /// Path to the database file.
        db: String,
        /// Table to alter.
        table: String,
        /// New definition of the column, including its name.
        column: String,
    },

    /// Create a table.
    CreateTable {
        /// Path to the database file.
        db: String,
        /// Name of the table to create.
        table: String,
        /// Column and constraint definitions.
        #[arg(required = true)]
        columns: Vec<String>,
    },

    /// Drop a column, discarding its data.
    DropColumn {
        /// Path to the database file.
        db: String,
        /// Table to alter.
        table: String,
        /// Column to drop.
        column: String,
    },

    /// Drop a table.
    DropTable {
        /// Path to the database file.
        db: String,
        /// Table to drop.
        table: String,
    },

    /// List the tables in the database.
    ListTables {
        /// Path to the database file.
        db: String,
    },

    /// Migrate the database to match a declared schema.
    ///
    /// The schema file is a JSON array of table declarations. By default
    /// the planned operations are only printed; pass --write to apply them.
    Migrate {
        /// Path to the database file.
        db: String,
        /// Path to the JSON schema file.
        schema_path: PathBuf,
        /// Disable column rename detection (renames become drop+add).
        #[arg(long)]
        no_rename: bool,
        /// Apply the migration instead of just printing it.
        #[arg(long)]
        write: bool,
        /// Print the operation list as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Rename a column.
    RenameColumn {
        /// Path to the database file.
        db: String,
        /// Table to alter.
        table: String,
        /// Current column name.
        old_name: String,
        /// New column name.
        new_name: String,
    },

    /// Rename a table.
    RenameTable {
        /// Path to the database file.
        db: String,
        /// Current table name.
        table: String,
        /// New table name.
        new_name: String,
    },

    /// Change the order of columns in a table.
    ReorderColumns {
        /// Path to the database file.
        db: String,
        /// Table to reorder.
        table: String,
        /// The complete new column order.
        #[arg(required = true)]
        columns: Vec<String>,
    },
}

#[derive(Debug)]
enum CliError {
    /// Bad arguments, unparsable definitions, missing tables or columns.
    User(String),
    /// The migration was rolled back.
    Migration(String),
    /// The post-migration foreign-key check failed.
    Integrity(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::User(_) => 1,
            Self::Migration(_) => 2,
            Self::Integrity(_) => 3,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::User(m) | Self::Migration(m) | Self::Integrity(m) => m,
        }
    }
}

impl From<IsqliteError> for CliError {
    fn from(e: IsqliteError) -> Self {
        match &e {
            IsqliteError::IntegrityViolation(_) => Self::Integrity(e.to_string()),
            IsqliteError::MigrationExecution { .. } => Self::Migration(e.to_string()),
            _ => Self::User(e.to_string()),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        Self::User(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::User(e.to_string())
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose {
            Level::DEBUG
        } else {
            Level::WARN
        })
        .with_target(false)
        .without_time()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e.message());
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(command: Commands) -> std::result::Result<(), CliError> {
    match command {
        Commands::AddColumn { db, table, column } => {
            let column = introspect::parse_column(&column)?;
            let name = column.name.clone();
            let mut db = open_for_writing(&db)?;
            db.add_column(&table, column)?;
            db.close()?;
            println!("Column {:?} added to table {:?}.", name, table);
        }

        Commands::AlterColumn { db, table, column } => {
            let column = introspect::parse_column(&column)?;
            let name = column.name.clone();
            let mut db = open_for_writing(&db)?;
            db.alter_column(&table, column)?;
            db.close()?;
            println!("Column {:?} altered in table {:?}.", name, table);
        }

        Commands::CreateTable { db, table, columns } => {
            let table_def = parse_table_definition(&table, &columns)?;
            let mut db = open_for_writing(&db)?;
            db.create_table(table_def)?;
            db.close()?;
            println!("Table {:?} created.", table);
        }

        Commands::DropColumn { db, table, column } => {
            let mut db = open_for_writing(&db)?;
            db.drop_column(&table, &column)?;
            db.close()?;
            println!("Column {:?} dropped from table {:?}.", column, table);
        }

        Commands::DropTable { db, table } => {
            let mut db = open_for_writing(&db)?;
            db.drop_table(&table)?;
            db.close()?;
            println!("Table {:?} dropped.", table);
        }

        Commands::ListTables { db } => {
            let db = Database::open(&db, OpenOptions::new().readonly())?;
            for name in db.schema().names() {
                println!("{}", name);
            }
        }

        Commands::Migrate {
            db,
            schema_path,
            no_rename,
            write,
            json,
        } => migrate(&db, &schema_path, no_rename, write, json)?,

        Commands::RenameColumn {
            db,
            table,
            old_name,
            new_name,
        } => {
            let mut db = open_for_writing(&db)?;
            db.rename_column(&table, &old_name, &new_name)?;
            db.close()?;
            println!(
                "Column {:?} renamed to {:?} in table {:?}.",
                old_name, new_name, table
            );
        }

        Commands::RenameTable { db, table, new_name } => {
            let mut db = open_for_writing(&db)?;
            db.rename_table(&table, &new_name)?;
            db.close()?;
            println!("Table {:?} renamed to {:?}.", table, new_name);
        }

        Commands::ReorderColumns { db, table, columns } => {
            let mut db = open_for_writing(&db)?;
            db.reorder_columns(&table, columns)?;
            db.close()?;
            println!("Columns of table {:?} reordered.", table);
        }
    }
    Ok(())
}

fn open_for_writing(path: &str) -> std::result::Result<Database, CliError> {
    Ok(Database::open(path, OpenOptions::new().autocommit())?)
}

/// Parses CLI column/constraint definitions and validates them the way the
/// schema builders would.
fn parse_table_definition(name: &str, definitions: &[String]) -> std::result::Result<Table, CliError> {
    let parsed = introspect::parse_table(name, definitions)?;
    let mut table = Table::new(parsed.name, parsed.columns)?;
    table.constraints = parsed.constraints;
    table.without_rowid = parsed.without_rowid;
    Ok(table)
}

fn migrate(
    db_path: &str,
    schema_path: &std::path::Path,
    no_rename: bool,
    write: bool,
    json: bool,
) -> std::result::Result<(), CliError> {
    let file = File::open(schema_path)
        .map_err(|e| CliError::User(format!("could not open {}: {}", schema_path.display(), e)))?;
    let tables: Vec<Table> = serde_json::from_reader(file)?;
    let schema = Schema::new(tables)?;

    let diff_options = DiffOptions {
        detect_renaming: !no_rename,
        strict: false,
    };
    let open_options = if write {
        OpenOptions::new().autocommit()
    } else {
        OpenOptions::new().readonly()
    };
    let mut db = Database::open(db_path, open_options)?;

    let operations = db.diff(&schema, &diff_options)?;
    if operations.is_empty() {
        println!("Nothing to migrate - database matches schema.");
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&operations)?);
    } else {
        print_plan(&operations);
    }

    println!();
    if write {
        db.apply_diff(&operations)?;
        db.close()?;
        println!("Performed {} operation(s).", operations.len());
    } else {
        println!(
            "Would have performed {} operation(s). \
             To perform this migration, re-run with the --write flag.",
            operations.len()
        );
    }
    Ok(())
}

/// Prints the operation list grouped by table.
fn print_plan(operations: &[Operation]) {
    let mut current: Option<&str> = None;
    for op in operations {
        match op {
            Operation::CreateTable { .. } | Operation::DropTable { .. } => {
                current = None;
                println!("{}", op);
            }
            _ => {
                let table = op.table_name();
                if current != Some(table) {
                    println!("Table {}", table);
                    current = Some(table);
                }
                println!("- {}", op);
            }
        }
    }
}
