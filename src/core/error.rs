// Error kinds shared by the store, the async adapter and the CLI.
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

use rusqlite::ErrorCode;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    NotFound,
    AlreadyExists,
    SchemaViolation,
    SchemaConflict,
    UniqueConstraint,
    UnindexedField,
    TransactionState,
    TransactionTimeout,
    InvalidValue,
    Closed,
    Corrupt,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    table: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            table: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(table) = &self.table {
            write!(f, " (table: {table})")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

/// Classify an engine error. Callers add context (table, message) on top.
pub fn sqlite_error(err: rusqlite::Error) -> Error {
    let kind = sqlite_error_kind(&err);
    let message = match &err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.clone(),
        other => other.to_string(),
    };
    Error::new(kind).with_message(message).with_source(err)
}

fn sqlite_error_kind(err: &rusqlite::Error) -> ErrorKind {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorKind::TransactionTimeout,
            ErrorCode::ConstraintViolation => ErrorKind::UniqueConstraint,
            ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => ErrorKind::Corrupt,
            // SQLITE_ERROR: malformed SQL, unknown function, wrong argument count.
            ErrorCode::Unknown => ErrorKind::Usage,
            _ => ErrorKind::Io,
        },
        rusqlite::Error::InvalidParameterCount(_, _)
        | rusqlite::Error::MultipleStatement
        | rusqlite::Error::InvalidParameterName(_) => ErrorKind::Usage,
        rusqlite::Error::FromSqlConversionFailure(_, _, _)
        | rusqlite::Error::InvalidColumnType(_, _, _) => ErrorKind::Corrupt,
        _ => ErrorKind::Io,
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::AlreadyExists => 4,
        ErrorKind::Corrupt => 7,
        ErrorKind::Io => 8,
        ErrorKind::SchemaViolation => 10,
        ErrorKind::SchemaConflict => 11,
        ErrorKind::UniqueConstraint => 12,
        ErrorKind::UnindexedField => 13,
        ErrorKind::TransactionState => 14,
        ErrorKind::TransactionTimeout => 15,
        ErrorKind::InvalidValue => 16,
        ErrorKind::Closed => 17,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, sqlite_error, to_exit_code};

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::NotFound, 3),
            (ErrorKind::AlreadyExists, 4),
            (ErrorKind::Corrupt, 7),
            (ErrorKind::Io, 8),
            (ErrorKind::SchemaViolation, 10),
            (ErrorKind::SchemaConflict, 11),
            (ErrorKind::UniqueConstraint, 12),
            (ErrorKind::UnindexedField, 13),
            (ErrorKind::TransactionState, 14),
            (ErrorKind::TransactionTimeout, 15),
            (ErrorKind::InvalidValue, 16),
            (ErrorKind::Closed, 17),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::NotFound)
            .with_message("table not present")
            .with_table("persons");
        assert_eq!(err.to_string(), "NotFound: table not present (table: persons)");
    }

    #[test]
    fn engine_errors_map_to_kinds() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        let err = conn.execute("SELEC 1", []).expect_err("syntax");
        assert_eq!(sqlite_error(err).kind(), ErrorKind::Usage);

        conn.execute("CREATE TABLE t (k UNIQUE)", []).expect("create");
        conn.execute("INSERT INTO t (k) VALUES (1)", []).expect("insert");
        let err = conn
            .execute("INSERT INTO t (k) VALUES (1)", [])
            .expect_err("duplicate");
        assert_eq!(sqlite_error(err).kind(), ErrorKind::UniqueConstraint);
    }
}
