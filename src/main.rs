//! Purpose: `itemdb` CLI entry point.
//! Role: Binary crate root; parses args, opens the database, emits JSON on stdout.
//! Invariants: Commands emit one JSON document on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Mutating commands run inside exactly one transaction.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use itemdb::api::{DbOptions, Error, ErrorKind, ItemDb, to_exit_code};

mod command_dispatch;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run(std::env::args_os()) {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run<I>(args: I) -> Result<RunOutcome, Error>
where
    I: IntoIterator<Item = OsString>,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome { exit_code });
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint(clap_error_hint(&err)));
            }
        },
    };

    let mut options = DbOptions::new();
    if let Some(ms) = cli.busy_timeout_ms {
        options = options.with_busy_timeout(Duration::from_millis(ms));
    }
    let db = ItemDb::open_with(&cli.db, options)?;

    command_dispatch::dispatch_command(cli.command, db)
        .map_err(add_busy_hint)
        .map_err(add_corrupt_hint)
        .map_err(add_internal_hint)
}

#[derive(Parser)]
#[command(
    name = "itemdb",
    version,
    about = "Transactional JSON item tables on SQLite",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"Items are JSON objects stored in tables. Only indexed fields can be queried.

Mental model:
  - `ensure` declares a table and its indexed fields (`!field` = unique, required)
  - `put` inserts items, replacing those that share a unique value
  - `select` / `count` / `delete` filter with SQL expressions over indexed fields
"#,
    after_help = r#"EXAMPLES
  $ itemdb app.db ensure persons '!name' age
  $ itemdb app.db put persons '{"name":"Jane","age":25}' '{"name":"John","age":17}'
  $ itemdb app.db select persons --where 'age > ?' --arg 20
  $ itemdb app.db count persons

LEARN MORE
  $ itemdb <DB> <command> --help
  RUST_LOG=debug shows transaction and schema events on stderr."#,
    arg_required_else_help = true,
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        value_name = "MS",
        help = "How long to wait for another writer's lock (default: 60000)"
    )]
    busy_timeout_ms: Option<u64>,
    #[arg(
        help = "Database file, or :memory: for a throwaway database",
        value_hint = ValueHint::FilePath
    )]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "List tables with the database path and modification time")]
    Tables,
    #[command(about = "Show the indexed fields of a table")]
    Indices {
        #[arg(help = "Table name")]
        table: String,
    },
    #[command(
        about = "Create a table or add indexed fields to it",
        after_help = r#"EXAMPLES
  $ itemdb app.db ensure persons '!name' age
  $ itemdb app.db ensure persons email     # adds an index, re-indexing existing items

NOTES
  - `!field` is unique and required; unique fields can only be set when the table is created."#
    )]
    Ensure {
        #[arg(help = "Table name")]
        table: String,
        #[arg(help = "Index specs: `field` or `!field`")]
        specs: Vec<String>,
    },
    #[command(about = "Count items, optionally matching a filter")]
    Count {
        #[arg(help = "Table name")]
        table: String,
        #[command(flatten)]
        filter: FilterArgs,
    },
    #[command(
        about = "Print items in insertion order",
        after_help = r#"EXAMPLES
  $ itemdb app.db select persons
  $ itemdb app.db select persons --where 'name = ?' --arg '"Jane"' --one"#
    )]
    Select {
        #[arg(help = "Table name")]
        table: String,
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, help = "Print only the first match (or null)")]
        one: bool,
    },
    #[command(
        about = "Insert or update items in one transaction",
        after_help = r#"NOTES
  - With no ITEM arguments, reads one JSON object per line from stdin."#
    )]
    Put {
        #[arg(help = "Table name")]
        table: String,
        #[arg(help = "Items as JSON objects")]
        items: Vec<String>,
    },
    #[command(about = "Delete items matching a filter")]
    Delete {
        #[arg(help = "Table name")]
        table: String,
        #[arg(long = "where", value_name = "EXPR", required = true)]
        filter: String,
        #[arg(long = "arg", value_name = "JSON", help = "Placeholder value, as JSON")]
        args: Vec<String>,
    },
    #[command(about = "Delete a table and all of its items")]
    Drop {
        #[arg(help = "Table name")]
        table: String,
    },
    #[command(about = "Rename a table")]
    Rename {
        #[arg(help = "Current table name")]
        table: String,
        #[arg(help = "New table name")]
        new_table: String,
    },
}

#[derive(clap::Args)]
struct FilterArgs {
    #[arg(
        long = "where",
        value_name = "EXPR",
        help = "SQL expression over indexed fields, with ? placeholders"
    )]
    filter: Option<String>,
    #[arg(long = "arg", value_name = "JSON", help = "Placeholder value, as JSON")]
    args: Vec<String>,
}

fn add_busy_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::TransactionTimeout || err.hint().is_some() {
        return err;
    }
    err.with_hint("Another process holds the write lock. Retry, or raise --busy-timeout-ms.")
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corrupt || err.hint().is_some() {
        return err;
    }
    err.with_hint("Database appears corrupt. Restore it from a backup or inspect it with sqlite3.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_LOG=debug and share command/context if it persists.",
    )
}

fn parse_inline_json(data: &str) -> Result<Value, Error> {
    serde_json::from_str(data).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid json `{data}`"))
            .with_hint("Provide a single JSON value (e.g. '{\"x\":1}' or '\"text\"').")
            .with_source(err)
    })
}

fn format_system_time(time: SystemTime) -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    let duration = time.duration_since(UNIX_EPOCH).ok()?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}

fn emit_json(value: Value) {
    let encoded = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    };
    let json = encoded.unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::NotFound => "not found",
        ErrorKind::AlreadyExists => "already exists",
        ErrorKind::SchemaViolation => "item does not fit the table schema",
        ErrorKind::SchemaConflict => "conflicting table schema",
        ErrorKind::UniqueConstraint => "unique constraint failed",
        ErrorKind::UnindexedField => "field is not indexed",
        ErrorKind::TransactionState => "invalid transaction state",
        ErrorKind::TransactionTimeout => "timed out waiting for the write lock",
        ErrorKind::InvalidValue => "invalid value",
        ErrorKind::Closed => "database is closed",
        ErrorKind::Corrupt => "corrupt data",
        ErrorKind::Io => "i/o error",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(table) = err.table() {
        inner.insert("table".to_string(), json!(table));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(table) = err.table() {
        lines.push(format!("table: {table}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);
    let Some(usage) = usage else {
        return "Try `itemdb --help`.".to_string();
    };

    // Usage: itemdb <DB> select [OPTIONS] <TABLE>
    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let command = tokens
        .iter()
        .skip_while(|token| **token != "itemdb")
        .skip(1)
        .find(|token| !token.starts_with('-') && !token.starts_with('<') && !token.starts_with('['));
    match command {
        Some(command) => format!("Try `itemdb <DB> {command} --help`."),
        None => "Try `itemdb --help`.".to_string(),
    }
}
