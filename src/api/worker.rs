//! Purpose: Async twin of `ItemDb` driven by one dedicated worker thread per handle.
//! Exports: `AsyncItemDb`.
//! Role: Lets async callers share a handle without blocking their executor threads.
//! Invariants: One queue, one worker: calls run in the order they were issued.
//! Invariants: The worker owns the connection; it closes when `close()` runs or the last clone drops.
#![allow(clippy::result_large_err)]

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::SystemTime;

use serde_json::Value;
use tokio::sync::oneshot;

use super::db::{ApiResult, DbOptions, ItemDb};
use crate::core::codec::Item;
use crate::core::error::{Error, ErrorKind};
use crate::core::schema::TableSchema;

static WORKER_COUNT: AtomicUsize = AtomicUsize::new(0);

type Job = Box<dyn FnOnce(&mut ItemDb) + Send>;

enum Command {
    Run(Job),
    Close(oneshot::Sender<ApiResult<()>>),
}

struct Shared {
    sender: mpsc::Sender<Command>,
    closing: AtomicBool,
    path: Option<PathBuf>,
    mtime: Option<SystemTime>,
}

/// Same operations as [`ItemDb`], as futures.
///
/// Clones share one worker. Use [`AsyncItemDb::transaction`] for scoped
/// transactions and [`AsyncItemDb::run`] to execute a block of synchronous
/// code against the handle in one step.
#[derive(Clone)]
pub struct AsyncItemDb {
    shared: Arc<Shared>,
}

impl AsyncItemDb {
    pub async fn open(path: impl AsRef<Path>) -> ApiResult<Self> {
        Self::open_with(path, DbOptions::default()).await
    }

    pub async fn open_with(path: impl AsRef<Path>, options: DbOptions) -> ApiResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (sender, receiver) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = oneshot::channel::<ApiResult<(Option<PathBuf>, Option<SystemTime>)>>();
        let id = WORKER_COUNT.fetch_add(1, Ordering::Relaxed) + 1;

        thread::Builder::new()
            .name(format!("itemdb-worker-{id}"))
            .spawn(move || {
                let db = match ItemDb::open_with(&path, options) {
                    Ok(db) => db,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok((db.path().map(Path::to_path_buf), db.mtime())));
                worker_loop(db, receiver);
            })
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to spawn database worker")
                    .with_source(err)
            })?;

        let (path, mtime) = ready_rx.await.map_err(|_| worker_gone())??;
        tracing::debug!(worker = id, "database worker started");
        Ok(Self {
            shared: Arc::new(Shared {
                sender,
                closing: AtomicBool::new(false),
                path,
                mtime,
            }),
        })
    }

    /// Runs `f` against the handle on the worker, after everything queued before it.
    ///
    /// A panic in `f` rolls back an open transaction and resumes in the caller;
    /// the worker keeps serving other calls.
    pub async fn run<R, F>(&self, f: F) -> ApiResult<R>
    where
        F: FnOnce(&mut ItemDb) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, receive) = oneshot::channel();
        let job: Job = Box::new(move |db: &mut ItemDb| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(db)));
            if outcome.is_err() && db.in_transaction() {
                tracing::warn!("rolling back transaction after a panic on the database worker");
                if let Err(err) = db.rollback() {
                    tracing::warn!(error = %err, "rollback after panic failed");
                }
            }
            let _ = reply.send(outcome);
        });
        self.shared
            .sender
            .send(Command::Run(job))
            .map_err(|_| closed())?;
        match receive.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(self.no_reply()),
        }
    }

    // A job dropped unanswered was either discarded by `close()` or lost with the worker.
    fn no_reply(&self) -> Error {
        if self.shared.closing.load(Ordering::Acquire) {
            closed()
        } else {
            worker_gone()
        }
    }

    async fn call<T, F>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&mut ItemDb) -> ApiResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run(f).await?
    }

    /// Closes the database and stops the worker; later calls fail with `Closed`.
    pub async fn close(&self) -> ApiResult<()> {
        let (reply, receive) = oneshot::channel();
        self.shared.closing.store(true, Ordering::Release);
        self.shared
            .sender
            .send(Command::Close(reply))
            .map_err(|_| closed())?;
        receive.await.map_err(|_| self.no_reply())?
    }

    pub fn path(&self) -> Option<&Path> {
        self.shared.path.as_deref()
    }

    pub fn mtime(&self) -> Option<SystemTime> {
        self.shared.mtime
    }

    pub async fn in_transaction(&self) -> ApiResult<bool> {
        self.run(|db| db.in_transaction()).await
    }

    pub async fn begin(&self) -> ApiResult<()> {
        self.call(|db| db.begin()).await
    }

    pub async fn commit(&self) -> ApiResult<()> {
        self.call(|db| db.commit()).await
    }

    pub async fn rollback(&self) -> ApiResult<()> {
        self.call(|db| db.rollback()).await
    }

    /// Runs `f` in a transaction: `Ok` commits, `Err` rolls back and is returned unchanged.
    ///
    /// If the returned future is dropped midway, a rollback is queued.
    pub async fn transaction<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(AsyncItemDb) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        self.begin().await?;
        let mut guard = RollbackOnDrop {
            db: self.clone(),
            armed: true,
        };
        let outcome = f(self.clone()).await;
        guard.armed = false;
        match outcome {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback after failed transaction failed");
                }
                Err(err)
            }
        }
    }

    pub async fn table_names(&self) -> ApiResult<Vec<String>> {
        self.call(|db| db.table_names()).await
    }

    pub async fn get_indices(&self, table: &str) -> ApiResult<TableSchema> {
        let table = table.to_string();
        self.call(move |db| db.get_indices(&table)).await
    }

    pub async fn ensure_table<S: AsRef<str>>(&self, table: &str, specs: &[S]) -> ApiResult<TableSchema> {
        let table = table.to_string();
        let specs: Vec<String> = specs.iter().map(|spec| spec.as_ref().to_string()).collect();
        self.call(move |db| db.ensure_table(&table, &specs[..])).await
    }

    pub async fn delete_table(&self, table: &str) -> ApiResult<()> {
        let table = table.to_string();
        self.call(move |db| db.delete_table(&table)).await
    }

    pub async fn rename_table(&self, table: &str, new_table: &str) -> ApiResult<()> {
        let table = table.to_string();
        let new_table = new_table.to_string();
        self.call(move |db| db.rename_table(&table, &new_table)).await
    }

    pub async fn count_all(&self, table: &str) -> ApiResult<u64> {
        let table = table.to_string();
        self.call(move |db| db.count_all(&table)).await
    }

    pub async fn count(&self, table: &str, filter: &str, args: &[Value]) -> ApiResult<u64> {
        let (table, filter, args) = owned(table, filter, args);
        self.call(move |db| db.count(&table, &filter, &args)).await
    }

    pub async fn select_all(&self, table: &str) -> ApiResult<Vec<Item>> {
        let table = table.to_string();
        self.call(move |db| db.select_all(&table)).await
    }

    pub async fn select(&self, table: &str, filter: &str, args: &[Value]) -> ApiResult<Vec<Item>> {
        let (table, filter, args) = owned(table, filter, args);
        self.call(move |db| db.select(&table, &filter, &args)).await
    }

    pub async fn select_one(&self, table: &str, filter: &str, args: &[Value]) -> ApiResult<Option<Item>> {
        let (table, filter, args) = owned(table, filter, args);
        self.call(move |db| db.select_one(&table, &filter, &args)).await
    }

    pub async fn put(&self, table: &str, items: Vec<Item>) -> ApiResult<()> {
        let table = table.to_string();
        self.call(move |db| db.put(&table, &items)).await
    }

    pub async fn put_one(&self, table: &str, item: Item) -> ApiResult<()> {
        let table = table.to_string();
        self.call(move |db| db.put_one(&table, item)).await
    }

    pub async fn delete(&self, table: &str, filter: &str, args: &[Value]) -> ApiResult<u64> {
        let (table, filter, args) = owned(table, filter, args);
        self.call(move |db| db.delete(&table, &filter, &args)).await
    }
}

struct RollbackOnDrop {
    db: AsyncItemDb,
    armed: bool,
}

impl Drop for RollbackOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let job: Job = Box::new(|db: &mut ItemDb| {
            if db.in_transaction() {
                if let Err(err) = db.rollback() {
                    tracing::warn!(error = %err, "rollback of abandoned transaction failed");
                }
            }
        });
        let _ = self.db.shared.sender.send(Command::Run(job));
    }
}

fn worker_loop(mut db: ItemDb, receiver: mpsc::Receiver<Command>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Run(job) => job(&mut db),
            Command::Close(reply) => {
                let result = db.close();
                // Queued jobs drop unanswered; their callers see `Closed`.
                drop(receiver);
                let _ = reply.send(result);
                tracing::debug!("database worker closed");
                return;
            }
        }
    }
    tracing::debug!("all handles dropped; database worker exiting");
}

fn owned(table: &str, filter: &str, args: &[Value]) -> (String, String, Vec<Value>) {
    (table.to_string(), filter.to_string(), args.to_vec())
}

fn closed() -> Error {
    Error::new(ErrorKind::Closed).with_message("database handle is closed")
}

fn worker_gone() -> Error {
    Error::new(ErrorKind::Internal).with_message("database worker stopped before replying")
}

#[cfg(test)]
mod tests {
    use super::AsyncItemDb;
    use crate::api::ItemDb;
    use crate::core::codec::item_from_value;
    use crate::core::error::ErrorKind;

    #[tokio::test]
    async fn calls_after_close_fail() {
        let db = AsyncItemDb::open(":memory:").await.expect("open");
        let other = db.clone();
        db.close().await.expect("close");
        let err = other.table_names().await.expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn calls_queued_behind_close_report_closed() {
        let db = AsyncItemDb::open(":memory:").await.expect("open");
        db.ensure_table("t", &["k"]).await.expect("ensure");
        let (closing, counted, again) = tokio::join!(db.close(), db.count_all("t"), db.close());
        closing.expect("close");
        assert_eq!(counted.expect_err("closed").kind(), ErrorKind::Closed);
        assert_eq!(again.expect_err("closed").kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn panics_resume_in_the_caller_and_spare_the_worker() {
        let db = AsyncItemDb::open(":memory:").await.expect("open");
        db.ensure_table("t", &["k"]).await.expect("ensure");
        db.begin().await.expect("begin");

        let panicking = db.clone();
        let joined = tokio::spawn(async move {
            panicking
                .run(|db: &mut ItemDb| -> u64 {
                    let item = item_from_value(serde_json::json!({"k": 1})).expect("object");
                    db.put_one("t", item).expect("put");
                    panic!("boom")
                })
                .await
        })
        .await;
        assert!(joined.expect_err("panicked").is_panic());

        assert!(!db.in_transaction().await.expect("state"));
        assert_eq!(db.count_all("t").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn worker_thread_is_named() {
        let db = AsyncItemDb::open(":memory:").await.expect("open");
        let name = db
            .run(|_| std::thread::current().name().map(str::to_string))
            .await
            .expect("run")
            .expect("named");
        assert!(name.starts_with("itemdb-worker-"), "{name}");
    }

    #[tokio::test]
    async fn open_failure_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("missing").join("db.sqlite");
        let err = AsyncItemDb::open(&path).await.err().expect("open error");
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
