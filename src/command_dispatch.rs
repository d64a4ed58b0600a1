//! Purpose: Hold top-level CLI command dispatch for `itemdb`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Each command consumes the handle and closes it before returning.

use std::io::BufRead;

use itemdb::api::{Item, item_from_value};

use super::*;

pub(super) fn dispatch_command(command: Command, mut db: ItemDb) -> Result<RunOutcome, Error> {
    match command {
        Command::Tables => {
            let tables = db.table_names()?;
            emit_json(json!({
                "path": db.path().map(|path| path.display().to_string()),
                "mtime": db.mtime().and_then(format_system_time),
                "tables": tables,
            }));
        }
        Command::Indices { table } => {
            let schema = db.get_indices(&table)?;
            emit_json(schema_json(&schema)?);
        }
        Command::Ensure { table, specs } => {
            let schema = db.ensure_table(&table, &specs[..])?;
            emit_json(schema_json(&schema)?);
        }
        Command::Count { table, filter } => {
            let args = parse_args(&filter.args)?;
            let count = match filter.filter.as_deref() {
                Some(expr) => db.count(&table, expr, &args)?,
                None => {
                    reject_args_without_filter(&args)?;
                    db.count_all(&table)?
                }
            };
            emit_json(json!({ "count": count }));
        }
        Command::Select { table, filter, one } => {
            let args = parse_args(&filter.args)?;
            let value = match (filter.filter.as_deref(), one) {
                (Some(expr), true) => json!(db.select_one(&table, expr, &args)?),
                (Some(expr), false) => json!(db.select(&table, expr, &args)?),
                (None, one) => {
                    reject_args_without_filter(&args)?;
                    let items = db.select_all(&table)?;
                    if one {
                        json!(items.into_iter().next())
                    } else {
                        json!(items)
                    }
                }
            };
            emit_json(value);
        }
        Command::Put { table, items } => {
            let items = if items.is_empty() {
                read_stdin_items()?
            } else {
                items
                    .iter()
                    .map(|raw| parse_inline_json(raw).and_then(item_from_value))
                    .collect::<Result<Vec<Item>, Error>>()?
            };
            let count = items.len();
            db.transaction(|db| db.put(&table, &items))?;
            emit_json(json!({ "table": table, "put": count }));
        }
        Command::Delete {
            table,
            filter,
            args,
        } => {
            let args = parse_args(&args)?;
            let deleted = db.transaction(|db| db.delete(&table, &filter, &args))?;
            emit_json(json!({ "table": table, "deleted": deleted }));
        }
        Command::Drop { table } => {
            db.transaction(|db| db.delete_table(&table))?;
            emit_json(json!({ "dropped": table }));
        }
        Command::Rename { table, new_table } => {
            db.transaction(|db| db.rename_table(&table, &new_table))?;
            emit_json(json!({ "renamed": { "from": table, "to": new_table } }));
        }
    }
    db.close()?;
    Ok(RunOutcome::ok())
}

fn schema_json(schema: &itemdb::api::TableSchema) -> Result<Value, Error> {
    serde_json::to_value(schema).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode table schema")
            .with_source(err)
    })
}

fn parse_args(raw: &[String]) -> Result<Vec<Value>, Error> {
    raw.iter().map(|arg| parse_inline_json(arg)).collect()
}

fn reject_args_without_filter(args: &[Value]) -> Result<(), Error> {
    if args.is_empty() {
        return Ok(());
    }
    Err(Error::new(ErrorKind::Usage)
        .with_message("--arg needs a --where expression with placeholders")
        .with_hint("Example: --where 'age > ?' --arg 20"))
}

fn read_stdin_items() -> Result<Vec<Item>, Error> {
    let stdin = io::stdin();
    let mut items = Vec::new();
    for (idx, line) in stdin.lock().lines().enumerate() {
        let line = line.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read stdin")
                .with_source(err)
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let value = parse_inline_json(&line)
            .map_err(|err| err.with_hint(format!("Line {} of stdin is not a JSON object.", idx + 1)))?;
        items.push(item_from_value(value)?);
    }
    if items.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("no items to put")
            .with_hint("Pass items as arguments or one JSON object per line on stdin."));
    }
    Ok(items)
}
