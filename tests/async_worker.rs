// Integration tests for the async handle and the blocking-pool helper.
use itemdb::api::{AsyncItemDb, Error, ErrorKind, Item, ItemDb, asyncify, item_from_value};
use serde_json::{Value, json};

fn item(value: Value) -> Item {
    item_from_value(value).expect("object")
}

#[tokio::test]
async fn persons_scenario_through_the_worker() {
    let db = AsyncItemDb::open(":memory:").await.expect("open");
    assert!(db.path().is_none());
    db.ensure_table("persons", &["!name", "age"]).await.expect("ensure");
    db.transaction(|db| async move {
        db.put(
            "persons",
            vec![
                item(json!({"name": "Jane", "age": 22})),
                item(json!({"name": "John", "age": 18})),
                item(json!({"name": "Anne", "age": 42})),
            ],
        )
        .await
    })
    .await
    .expect("put");

    assert_eq!(db.count_all("persons").await.expect("count"), 3);
    let adults = db.select("persons", "age > ?", &[json!(20)]).await.expect("select");
    let names: Vec<&str> = adults.iter().map(|p| p["name"].as_str().expect("name")).collect();
    assert_eq!(names, vec!["Jane", "Anne"]);
    db.close().await.expect("close");
}

#[tokio::test]
async fn calls_run_in_issue_order() {
    let db = AsyncItemDb::open(":memory:").await.expect("open");
    db.ensure_table("seq", &["n"]).await.expect("ensure");
    let writer = db.clone();

    // Each future enqueues on its first poll; join! polls them left to right.
    let (begin, first, second, third, commit, count) = tokio::join!(
        writer.begin(),
        writer.put_one("seq", item(json!({"n": 1}))),
        db.put_one("seq", item(json!({"n": 2}))),
        writer.put_one("seq", item(json!({"n": 3}))),
        db.commit(),
        db.count_all("seq"),
    );
    begin.expect("begin");
    first.expect("first");
    second.expect("second");
    third.expect("third");
    commit.expect("commit");
    assert_eq!(count.expect("count"), 3);

    let order: Vec<i64> = db
        .run(|db| -> Result<Vec<i64>, Error> {
            let items = db.select_all("seq")?;
            Ok(items.iter().filter_map(|item| item["n"].as_i64()).collect())
        })
        .await
        .expect("run")
        .expect("select");
    assert_eq!(order, vec![1, 2, 3]);
}

#[tokio::test]
async fn failing_transaction_rolls_back() {
    let db = AsyncItemDb::open(":memory:").await.expect("open");
    db.ensure_table("persons", &["!name"]).await.expect("ensure");

    let result: Result<(), Error> = db
        .transaction(|db| async move {
            db.put_one("persons", item(json!({"name": "Jane"}))).await?;
            db.put_one("persons", item(json!({"age": 3}))).await
        })
        .await;
    assert_eq!(result.expect_err("violation").kind(), ErrorKind::SchemaViolation);
    assert_eq!(db.count_all("persons").await.expect("count"), 0);
    assert!(!db.in_transaction().await.expect("state"));
}

#[tokio::test]
async fn writes_need_a_transaction() {
    let db = AsyncItemDb::open(":memory:").await.expect("open");
    db.ensure_table("persons", &["!name"]).await.expect("ensure");
    let err = db
        .put_one("persons", item(json!({"name": "Jane"})))
        .await
        .expect_err("no tx");
    assert_eq!(err.kind(), ErrorKind::TransactionState);
}

#[tokio::test]
async fn closed_handles_fail_with_closed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("items.db");
    let db = AsyncItemDb::open(&path).await.expect("open");
    assert_eq!(db.path(), Some(path.as_path()));
    db.ensure_table("persons", &["!name"]).await.expect("ensure");
    db.begin().await.expect("begin");
    db.close().await.expect("close");

    assert_eq!(db.count_all("persons").await.expect_err("closed").kind(), ErrorKind::Closed);
    assert_eq!(db.close().await.expect_err("closed").kind(), ErrorKind::Closed);

    let reopened = AsyncItemDb::open(&path).await.expect("reopen");
    assert!(reopened.mtime().is_some());
    assert_eq!(reopened.table_names().await.expect("names"), vec!["persons"]);
}

#[tokio::test]
async fn asyncify_runs_one_off_work() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("items.db");
    let count = asyncify(move || -> Result<u64, Error> {
        let mut db = ItemDb::open(&path)?;
        db.ensure_table("persons", &["!name"])?;
        db.transaction(|db| db.put_one("persons", item(json!({"name": "Jane"}))))?;
        db.count_all("persons")
    })
    .await
    .expect("asyncify");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn asyncify_passes_errors_through() {
    let err = asyncify(|| -> Result<(), Error> {
        let db = ItemDb::open_in_memory()?;
        db.count_all("missing")?;
        Ok(())
    })
    .await
    .expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
