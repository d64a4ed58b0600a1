//! Purpose: Table and index declarations, and their mapping onto SQLite relations.
//! Exports: `IndexSpec`, `TableSchema`, `EnsurePlan`, name validation, DDL helpers.
//! Role: Schema-as-data; all DDL issued by the store is built here.
//! Invariants: Unique fields are fixed at table creation and never added later.
//! Invariants: Every table has `_id` (identity, insertion order) and `_ob` (payload).
use std::fmt;

use rusqlite::Connection;
use serde::Serialize;

use crate::core::error::{Error, ErrorKind, sqlite_error};

pub(crate) const ID_COLUMN: &str = "_id";
pub(crate) const PAYLOAD_COLUMN: &str = "_ob";
const UNIQUE_MARKER: char = '!';

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct IndexSpec {
    field: String,
    unique: bool,
}

impl IndexSpec {
    pub fn optional(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            unique: false,
        }
    }

    pub fn unique(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            unique: true,
        }
    }

    /// Parses `"field"` or `"!field"` (mandatory and unique).
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let (field, unique) = match spec.strip_prefix(UNIQUE_MARKER) {
            Some(rest) => (rest, true),
            None => (spec, false),
        };
        validate_field_name(field)?;
        Ok(Self {
            field: field.to_string(),
            unique,
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unique {
            write!(f, "{UNIQUE_MARKER}")?;
        }
        write!(f, "{}", self.field)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TableSchema {
    name: String,
    indices: Vec<IndexSpec>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, indices: Vec<IndexSpec>) -> Self {
        Self {
            name: name.into(),
            indices,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn indices(&self) -> &[IndexSpec] {
        &self.indices
    }

    pub fn index(&self, field: &str) -> Option<&IndexSpec> {
        self.indices
            .iter()
            .find(|spec| spec.field.eq_ignore_ascii_case(field))
    }

    pub fn unique_fields(&self) -> impl Iterator<Item = &IndexSpec> {
        self.indices.iter().filter(|spec| spec.unique)
    }

    pub fn has_unique(&self) -> bool {
        self.indices.iter().any(|spec| spec.unique)
    }
}

/// What `ensure_table` has to change on an existing table.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EnsurePlan {
    pub added: Vec<IndexSpec>,
}

impl EnsurePlan {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
    }
}

/// Checks requested specs against an existing table.
pub fn plan_extension(existing: &TableSchema, requested: &[IndexSpec]) -> Result<EnsurePlan, Error> {
    let mut plan = EnsurePlan::default();
    for spec in requested {
        match existing.index(spec.field()) {
            Some(current) if current.unique == spec.unique => {}
            Some(current) if current.unique => {
                return Err(Error::new(ErrorKind::SchemaConflict)
                    .with_message(format!("index '{}' should be unique", spec.field()))
                    .with_hint(format!("Declare it as '{current}'."))
                    .with_table(existing.name()));
            }
            _ if spec.unique => {
                return Err(Error::new(ErrorKind::SchemaConflict)
                    .with_message(format!(
                        "cannot add unique index '{spec}' after the table has been created"
                    ))
                    .with_hint("Copy the items into a new table and rename it.")
                    .with_table(existing.name()));
            }
            _ => {
                if !plan.added.iter().any(|added| added.field.eq_ignore_ascii_case(&spec.field)) {
                    plan.added.push(spec.clone());
                }
            }
        }
    }
    Ok(plan)
}

pub fn parse_specs<S: AsRef<str>>(specs: &[S]) -> Result<Vec<IndexSpec>, Error> {
    let mut parsed: Vec<IndexSpec> = Vec::with_capacity(specs.len());
    for spec in specs {
        let spec = IndexSpec::parse(spec.as_ref())?;
        if let Some(previous) = parsed
            .iter()
            .find(|previous| previous.field.eq_ignore_ascii_case(&spec.field))
        {
            if previous.unique != spec.unique {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("index '{}' declared twice with different flags", spec.field)));
            }
            continue;
        }
        parsed.push(spec);
    }
    Ok(parsed)
}

pub fn validate_table_name(name: &str) -> Result<(), Error> {
    if !is_identifier(name) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("table name must be an identifier, not '{name}'")));
    }
    if name.to_ascii_lowercase().starts_with("sqlite_") {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("table name '{name}' is reserved by the engine")));
    }
    Ok(())
}

pub fn validate_field_name(name: &str) -> Result<(), Error> {
    if !is_identifier(name) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("index name must be an identifier, not '{name}'")));
    }
    if name.eq_ignore_ascii_case(ID_COLUMN) || name.eq_ignore_ascii_case(PAYLOAD_COLUMN) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("index name '{name}' is reserved")));
    }
    Ok(())
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

fn index_name(table: &str, field: &str) -> String {
    quote(&format!("idx_{table}_{field}"))
}

pub fn table_names(conn: &Connection) -> Result<Vec<String>, Error> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' ORDER BY name",
        )
        .map_err(sqlite_error)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(sqlite_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_error)?;
    Ok(names)
}

/// Reads the schema back from the engine; `None` if the table does not exist.
pub fn read_schema(conn: &Connection, name: &str) -> Result<Option<TableSchema>, Error> {
    let mut stmt = conn
        .prepare("SELECT name, \"notnull\" FROM pragma_table_info(?1)")
        .map_err(sqlite_error)?;
    let columns = stmt
        .query_map([name], |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)))
        .map_err(sqlite_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_error)?;
    if columns.is_empty() {
        return Ok(None);
    }
    let indices = columns
        .into_iter()
        .filter(|(column, _)| column != ID_COLUMN && column != PAYLOAD_COLUMN)
        .map(|(field, unique)| IndexSpec { field, unique })
        .collect();
    Ok(Some(TableSchema::new(name, indices)))
}

pub fn create_table(conn: &Connection, schema: &TableSchema) -> Result<(), Error> {
    let mut columns = vec![
        format!("{} INTEGER PRIMARY KEY", quote(ID_COLUMN)),
        format!("{} TEXT NOT NULL", quote(PAYLOAD_COLUMN)),
    ];
    for spec in schema.indices() {
        if spec.unique {
            columns.push(format!("{} NOT NULL UNIQUE", quote(&spec.field)));
        } else {
            columns.push(quote(&spec.field));
        }
    }
    let sql = format!("CREATE TABLE {} ({})", quote(schema.name()), columns.join(", "));
    conn.execute(&sql, [])
        .map_err(|err| sqlite_error(err).with_table(schema.name()))?;
    for spec in schema.indices().iter().filter(|spec| !spec.unique) {
        create_index(conn, schema.name(), spec.field())?;
    }
    tracing::debug!(table = schema.name(), indices = ?schema.indices(), "created table");
    Ok(())
}

pub fn add_index(conn: &Connection, table: &str, spec: &IndexSpec) -> Result<(), Error> {
    let sql = format!("ALTER TABLE {} ADD COLUMN {}", quote(table), quote(spec.field()));
    conn.execute(&sql, [])
        .map_err(|err| sqlite_error(err).with_table(table))?;
    create_index(conn, table, spec.field())?;
    tracing::debug!(table, field = spec.field(), "added index");
    Ok(())
}

fn create_index(conn: &Connection, table: &str, field: &str) -> Result<(), Error> {
    let sql = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        index_name(table, field),
        quote(table),
        quote(field)
    );
    conn.execute(&sql, [])
        .map_err(|err| sqlite_error(err).with_table(table))?;
    Ok(())
}

pub fn drop_table(conn: &Connection, table: &str) -> Result<(), Error> {
    conn.execute(&format!("DROP TABLE {}", quote(table)), [])
        .map_err(|err| sqlite_error(err).with_table(table))?;
    tracing::debug!(table, "dropped table");
    Ok(())
}

/// Renames the relation and its secondary indexes so the old name is free for reuse.
pub fn rename_table(conn: &Connection, schema: &TableSchema, new_name: &str) -> Result<(), Error> {
    let old_name = schema.name();
    conn.execute(
        &format!("ALTER TABLE {} RENAME TO {}", quote(old_name), quote(new_name)),
        [],
    )
    .map_err(|err| sqlite_error(err).with_table(old_name))?;
    for spec in schema.indices().iter().filter(|spec| !spec.unique) {
        conn.execute(
            &format!("DROP INDEX IF EXISTS {}", index_name(old_name, spec.field())),
            [],
        )
        .map_err(|err| sqlite_error(err).with_table(new_name))?;
        create_index(conn, new_name, spec.field())?;
    }
    tracing::debug!(from = old_name, to = new_name, "renamed table");
    Ok(())
}
