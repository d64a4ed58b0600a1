//! Purpose: Put, select, count and delete items over a resolved table schema.
//! Exports: `put`, `select`, `select_one`, `count`, `delete`, `backfill`.
//! Role: Builds parameterised SQL; callers own transaction policy.
//! Invariants: Results come back in row insertion order (`_id`).
//! Invariants: `put` applies all of its items or none of them.
use std::collections::HashMap;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};
use serde_json::Value;

use crate::core::codec::{self, EncodedItem, Item};
use crate::core::error::{Error, ErrorKind, sqlite_error};
use crate::core::filter::check_filter;
use crate::core::schema::{ID_COLUMN, PAYLOAD_COLUMN, TableSchema, quote};

const PUT_SAVEPOINT: &str = "itemdb_put";

/// Upserts items. An item sharing a unique value with one stored row replaces
/// that row in place; two items of one call may only share a unique value when
/// a stored row already held it.
pub fn put(conn: &Connection, schema: &TableSchema, items: &[Item]) -> Result<(), Error> {
    let encoded = items
        .iter()
        .map(|item| codec::encode(schema, item))
        .collect::<Result<Vec<_>, _>>()?;
    if encoded.is_empty() {
        return Ok(());
    }

    conn.execute_batch(&format!("SAVEPOINT {PUT_SAVEPOINT}"))
        .map_err(sqlite_error)?;
    let result = put_encoded(conn, schema, &encoded);
    finish_savepoint(conn, result)
}

/// Releases the put savepoint, undoing its writes first when `result` failed.
/// A cleanup failure never replaces the put's own error.
fn finish_savepoint(conn: &Connection, result: Result<(), Error>) -> Result<(), Error> {
    let finish = match &result {
        Ok(()) => format!("RELEASE {PUT_SAVEPOINT}"),
        Err(_) => format!("ROLLBACK TO {PUT_SAVEPOINT}; RELEASE {PUT_SAVEPOINT}"),
    };
    if let Err(err) = conn.execute_batch(&finish) {
        let err = sqlite_error(err);
        if result.is_ok() {
            return Err(err);
        }
        tracing::warn!(error = %err, "releasing put savepoint after a failed put failed");
    }
    result
}

fn put_encoded(conn: &Connection, schema: &TableSchema, encoded: &[EncodedItem]) -> Result<(), Error> {
    let insert_sql = insert_sql(schema);
    if !schema.has_unique() {
        for item in encoded {
            insert_row(conn, schema, &insert_sql, item)?;
        }
        return Ok(());
    }

    let unique_positions: Vec<usize> = schema
        .indices()
        .iter()
        .enumerate()
        .filter(|(_, spec)| spec.is_unique())
        .map(|(idx, _)| idx)
        .collect();
    let lookup_sql = format!(
        "SELECT {} FROM {} WHERE {}",
        quote(ID_COLUMN),
        quote(schema.name()),
        unique_positions
            .iter()
            .map(|idx| format!("{} = ?", quote(schema.indices()[*idx].field())))
            .collect::<Vec<_>>()
            .join(" OR ")
    );
    let update_sql = update_sql(schema);

    // Unique values written by this call, and whether a row held them beforehand.
    let mut written: HashMap<String, bool> = HashMap::new();
    for item in encoded {
        let keys: Vec<String> = unique_positions
            .iter()
            .map(|idx| unique_key(*idx, &item.indexed[*idx]))
            .collect();
        let rows = matching_rows(conn, &lookup_sql, &unique_positions, item)?;

        for key in &keys {
            if written.get(key) == Some(&false) {
                return Err(Error::new(ErrorKind::UniqueConstraint)
                    .with_message("two items in one put() share a unique value")
                    .with_hint("Merge the items before putting them, or put them in separate calls.")
                    .with_table(schema.name()));
            }
        }

        match rows.as_slice() {
            [] => {
                insert_row(conn, schema, &insert_sql, item)?;
                for key in keys {
                    written.entry(key).or_insert(false);
                }
            }
            [row_id] => {
                let params = std::iter::once(SqlValue::Text(item.payload.clone()))
                    .chain(item.indexed.iter().cloned())
                    .chain(std::iter::once(SqlValue::Integer(*row_id)));
                conn.execute(&update_sql, params_from_iter(params))
                    .map_err(|err| sqlite_error(err).with_table(schema.name()))?;
                for key in keys {
                    written.entry(key).or_insert(true);
                }
            }
            _ => {
                return Err(Error::new(ErrorKind::UniqueConstraint)
                    .with_message(format!(
                        "item matches {} existing items on different unique fields",
                        rows.len()
                    ))
                    .with_table(schema.name()));
            }
        }
    }
    Ok(())
}

fn matching_rows(
    conn: &Connection,
    lookup_sql: &str,
    unique_positions: &[usize],
    item: &EncodedItem,
) -> Result<Vec<i64>, Error> {
    let mut stmt = conn.prepare_cached(lookup_sql).map_err(sqlite_error)?;
    let params = unique_positions.iter().map(|idx| &item.indexed[*idx]);
    let rows = stmt
        .query_map(params_from_iter(params), |row| row.get::<_, i64>(0))
        .map_err(sqlite_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_error)?;
    Ok(rows)
}

fn insert_row(conn: &Connection, schema: &TableSchema, sql: &str, item: &EncodedItem) -> Result<(), Error> {
    let params = std::iter::once(SqlValue::Text(item.payload.clone())).chain(item.indexed.iter().cloned());
    conn.prepare_cached(sql)
        .and_then(|mut stmt| stmt.execute(params_from_iter(params)))
        .map_err(|err| sqlite_error(err).with_table(schema.name()))?;
    Ok(())
}

fn insert_sql(schema: &TableSchema) -> String {
    let mut columns = vec![quote(PAYLOAD_COLUMN)];
    columns.extend(schema.indices().iter().map(|spec| quote(spec.field())));
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        quote(schema.name()),
        columns.join(", ")
    )
}

fn update_sql(schema: &TableSchema) -> String {
    let mut assignments = vec![format!("{} = ?", quote(PAYLOAD_COLUMN))];
    assignments.extend(
        schema
            .indices()
            .iter()
            .map(|spec| format!("{} = ?", quote(spec.field()))),
    );
    format!(
        "UPDATE {} SET {} WHERE {} = ?",
        quote(schema.name()),
        assignments.join(", "),
        quote(ID_COLUMN)
    )
}

/// SQLite compares 1 and 1.0 as equal, so integral reals share the integer key.
fn unique_key(position: usize, value: &SqlValue) -> String {
    match value {
        SqlValue::Integer(i) => format!("{position}:n:{i}"),
        SqlValue::Real(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
            format!("{position}:n:{}", *f as i64)
        }
        SqlValue::Real(f) => format!("{position}:f:{f}"),
        SqlValue::Text(s) => format!("{position}:t:{s}"),
        SqlValue::Blob(b) => format!("{position}:b:{b:?}"),
        SqlValue::Null => format!("{position}:null"),
    }
}

fn where_clause(schema: &TableSchema, filter: Option<&str>) -> Result<String, Error> {
    match filter {
        Some(filter) => {
            check_filter(schema, filter)?;
            // Newline so a trailing `--` comment cannot swallow the parenthesis.
            Ok(format!(" WHERE ({filter}\n)"))
        }
        None => Ok(String::new()),
    }
}

fn bind_args(args: &[Value]) -> Result<Vec<SqlValue>, Error> {
    args.iter().map(codec::param_value).collect()
}

/// Engine errors that slipped past the scanner still surface as field errors.
fn query_error(schema: &TableSchema, err: rusqlite::Error) -> Error {
    let err = sqlite_error(err).with_table(schema.name());
    let no_such_column = err
        .message()
        .is_some_and(|message| message.to_ascii_lowercase().contains("no such column"));
    if no_such_column {
        let message = err.message().unwrap_or("no such column").to_string();
        return Error::new(ErrorKind::UnindexedField)
            .with_message(message)
            .with_table(schema.name());
    }
    err
}

pub fn select(
    conn: &Connection,
    schema: &TableSchema,
    filter: Option<&str>,
    args: &[Value],
    limit: Option<usize>,
) -> Result<Vec<Item>, Error> {
    let mut sql = format!(
        "SELECT {} FROM {}{} ORDER BY {}",
        quote(PAYLOAD_COLUMN),
        quote(schema.name()),
        where_clause(schema, filter)?,
        quote(ID_COLUMN)
    );
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    let params = bind_args(args)?;
    let mut stmt = conn.prepare(&sql).map_err(|err| query_error(schema, err))?;
    let payloads = stmt
        .query_map(params_from_iter(params), |row| row.get::<_, String>(0))
        .map_err(|err| query_error(schema, err))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| query_error(schema, err))?;
    payloads
        .iter()
        .map(|payload| codec::decode(payload).map_err(|err| err.with_table(schema.name())))
        .collect()
}

pub fn select_one(
    conn: &Connection,
    schema: &TableSchema,
    filter: &str,
    args: &[Value],
) -> Result<Option<Item>, Error> {
    Ok(select(conn, schema, Some(filter), args, Some(1))?.into_iter().next())
}

pub fn count(
    conn: &Connection,
    schema: &TableSchema,
    filter: Option<&str>,
    args: &[Value],
) -> Result<u64, Error> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}{}",
        quote(schema.name()),
        where_clause(schema, filter)?
    );
    let params = bind_args(args)?;
    let count: i64 = conn
        .query_row(&sql, params_from_iter(params), |row| row.get(0))
        .map_err(|err| query_error(schema, err))?;
    Ok(count as u64)
}

pub fn delete(
    conn: &Connection,
    schema: &TableSchema,
    filter: &str,
    args: &[Value],
) -> Result<u64, Error> {
    let sql = format!(
        "DELETE FROM {}{}",
        quote(schema.name()),
        where_clause(schema, Some(filter))?
    );
    let params = bind_args(args)?;
    let removed = conn
        .execute(&sql, params_from_iter(params))
        .map_err(|err| query_error(schema, err))?;
    Ok(removed as u64)
}

/// Recomputes indexed columns for rows that carry any of `fields`, after new indices appear.
pub fn backfill(conn: &Connection, schema: &TableSchema, fields: &[&str]) -> Result<usize, Error> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {}, {} FROM {} ORDER BY {}",
            quote(ID_COLUMN),
            quote(PAYLOAD_COLUMN),
            quote(schema.name()),
            quote(ID_COLUMN)
        ))
        .map_err(sqlite_error)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
        .map_err(sqlite_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_error)?;

    let update_sql = update_sql(schema);
    let mut updated = 0;
    for (row_id, payload) in rows {
        let item = codec::decode(&payload).map_err(|err| err.with_table(schema.name()))?;
        if !fields.iter().any(|field| item.contains_key(*field)) {
            continue;
        }
        let encoded = codec::encode(schema, &item)?;
        let params = std::iter::once(SqlValue::Text(encoded.payload))
            .chain(encoded.indexed)
            .chain(std::iter::once(SqlValue::Integer(row_id)));
        conn.execute(&update_sql, params_from_iter(params))
            .map_err(|err| sqlite_error(err).with_table(schema.name()))?;
        updated += 1;
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::{count, delete, finish_savepoint, put, select, select_one};
    use crate::core::codec::{Item, item_from_value};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::schema::{IndexSpec, TableSchema, create_table};
    use rusqlite::Connection;
    use serde_json::{Value, json};

    fn item(value: Value) -> Item {
        item_from_value(value).expect("object")
    }

    fn setup(indices: Vec<IndexSpec>) -> (Connection, TableSchema) {
        let conn = Connection::open_in_memory().expect("open");
        let schema = TableSchema::new("persons", indices);
        create_table(&conn, &schema).expect("create");
        (conn, schema)
    }

    fn names(items: &[Item]) -> Vec<&str> {
        items
            .iter()
            .map(|item| item["name"].as_str().expect("name"))
            .collect()
    }

    #[test]
    fn persons_scenario() {
        let (conn, schema) = setup(vec![IndexSpec::unique("name"), IndexSpec::optional("age")]);
        put(
            &conn,
            &schema,
            &[
                item(json!({"name": "Jane", "age": 22})),
                item(json!({"name": "John", "age": 18})),
                item(json!({"name": "Anne", "age": 42})),
            ],
        )
        .expect("put");
        assert_eq!(count(&conn, &schema, None, &[]).expect("count"), 3);
        let older = select(&conn, &schema, Some("age > ?"), &[json!(20)], None).expect("select");
        assert_eq!(names(&older), ["Jane", "Anne"]);
    }

    #[test]
    fn upsert_keeps_insertion_position() {
        let (conn, schema) = setup(vec![IndexSpec::unique("name"), IndexSpec::optional("age")]);
        put(&conn, &schema, &[item(json!({"name": "X", "age": 1})), item(json!({"name": "Y"}))])
            .expect("put");
        put(&conn, &schema, &[item(json!({"name": "X", "age": 2}))]).expect("put");

        let all = select(&conn, &schema, None, &[], None).expect("select");
        assert_eq!(names(&all), ["X", "Y"]);
        assert_eq!(all[0]["age"], json!(2));
        let by_age = select_one(&conn, &schema, "age = ?", &[json!(2)]).expect("select");
        assert_eq!(by_age.expect("found")["name"], json!("X"));
    }

    #[test]
    fn no_unique_index_appends() {
        let (conn, schema) = setup(vec![IndexSpec::optional("name")]);
        let same = item(json!({"name": "X"}));
        put(&conn, &schema, &[same.clone(), same]).expect("put");
        assert_eq!(count(&conn, &schema, Some("name = 'X'"), &[]).expect("count"), 2);
    }

    #[test]
    fn intra_call_collision_without_existing_row_is_rejected() {
        let (conn, schema) = setup(vec![IndexSpec::unique("name")]);
        put(&conn, &schema, &[item(json!({"name": "A"}))]).expect("put");
        let err = put(
            &conn,
            &schema,
            &[
                item(json!({"name": "B", "v": 1})),
                item(json!({"name": "C"})),
                item(json!({"name": "B", "v": 2})),
            ],
        )
        .expect_err("collision");
        assert_eq!(err.kind(), ErrorKind::UniqueConstraint);
        // nothing from the failed call is visible
        assert_eq!(count(&conn, &schema, None, &[]).expect("count"), 1);
    }

    #[test]
    fn intra_call_collision_merges_into_existing_row() {
        let (conn, schema) = setup(vec![IndexSpec::unique("name")]);
        put(&conn, &schema, &[item(json!({"name": "A", "v": 0}))]).expect("put");
        put(
            &conn,
            &schema,
            &[item(json!({"name": "A", "v": 1})), item(json!({"name": "A", "v": 2}))],
        )
        .expect("merge");
        let all = select(&conn, &schema, None, &[], None).expect("select");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["v"], json!(2));
    }

    #[test]
    fn ambiguous_match_on_two_unique_fields_is_rejected() {
        let (conn, schema) = setup(vec![IndexSpec::unique("name"), IndexSpec::unique("email")]);
        put(
            &conn,
            &schema,
            &[
                item(json!({"name": "A", "email": "a@x"})),
                item(json!({"name": "B", "email": "b@x"})),
            ],
        )
        .expect("put");
        let err = put(&conn, &schema, &[item(json!({"name": "A", "email": "b@x"}))])
            .expect_err("ambiguous");
        assert_eq!(err.kind(), ErrorKind::UniqueConstraint);
        assert_eq!(count(&conn, &schema, None, &[]).expect("count"), 2);
    }

    #[test]
    fn schema_violation_rejects_whole_call() {
        let (conn, schema) = setup(vec![IndexSpec::unique("name")]);
        let err = put(&conn, &schema, &[item(json!({"name": "A"})), item(json!({"age": 3}))])
            .expect_err("violation");
        assert_eq!(err.kind(), ErrorKind::SchemaViolation);
        assert_eq!(count(&conn, &schema, None, &[]).expect("count"), 0);
    }

    #[test]
    fn delete_reports_removed_count() {
        let (conn, schema) = setup(vec![IndexSpec::unique("name"), IndexSpec::optional("age")]);
        put(
            &conn,
            &schema,
            &[
                item(json!({"name": "A", "age": 1})),
                item(json!({"name": "B", "age": 5})),
                item(json!({"name": "C", "age": 9})),
            ],
        )
        .expect("put");
        assert_eq!(delete(&conn, &schema, "age > ?", &[json!(3)]).expect("delete"), 2);
        assert_eq!(names(&select(&conn, &schema, None, &[], None).expect("select")), ["A"]);
    }

    #[test]
    fn filters_on_unindexed_fields_fail_fast() {
        let (conn, schema) = setup(vec![IndexSpec::unique("name")]);
        for result in [
            select(&conn, &schema, Some("age > ?"), &[json!(1)], None).map(|_| ()),
            count(&conn, &schema, Some("age > 1"), &[]).map(|_| ()),
            delete(&conn, &schema, "age > 1", &[]).map(|_| ()),
        ] {
            assert_eq!(result.expect_err("unindexed").kind(), ErrorKind::UnindexedField);
        }
    }

    #[test]
    fn malformed_filters_are_usage_errors() {
        let (conn, schema) = setup(vec![IndexSpec::unique("name")]);
        let err = select(&conn, &schema, Some("name = = 1"), &[], None).expect_err("syntax");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = select(&conn, &schema, Some("name = ?"), &[], None).expect_err("arity");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn savepoint_cleanup_failure_keeps_the_put_error() {
        let (conn, _) = setup(vec![IndexSpec::unique("name")]);
        // No savepoint is open, so the cleanup statement itself fails.
        let original = Error::new(ErrorKind::UniqueConstraint).with_message("collision");
        let err = finish_savepoint(&conn, Err(original)).expect_err("kept");
        assert_eq!(err.kind(), ErrorKind::UniqueConstraint);
        assert_eq!(err.message(), Some("collision"));

        let err = finish_savepoint(&conn, Ok(())).expect_err("release fails");
        assert_ne!(err.kind(), ErrorKind::UniqueConstraint);
    }

    #[test]
    fn filters_may_carry_comments() {
        let (conn, schema) = setup(vec![IndexSpec::unique("name"), IndexSpec::optional("age")]);
        put(
            &conn,
            &schema,
            &[item(json!({"name": "A", "age": 1})), item(json!({"name": "B", "age": 5}))],
        )
        .expect("put");
        let found = select(&conn, &schema, Some("age > ? -- by value"), &[json!(3)], None)
            .expect("select");
        assert_eq!(names(&found), ["B"]);
        let counted = count(&conn, &schema, Some("/* all */ age >= 1"), &[]).expect("count");
        assert_eq!(counted, 2);
    }
}
