//! Purpose: Run a blocking closure on tokio's blocking pool and await its result.
//! Exports: `asyncify`.
//! Role: Escape hatch for synchronous `ItemDb` work that does not belong on a shared worker.
#![allow(clippy::result_large_err)]

use crate::core::error::{Error, ErrorKind};

/// Awaits `f` run on a blocking thread. Panics in `f` resume in the caller.
pub async fn asyncify<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<Error> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => Err(Error::new(ErrorKind::Internal)
            .with_message("blocking task was cancelled")
            .with_source(err)
            .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::asyncify;
    use crate::api::ItemDb;
    use crate::core::error::Error;

    #[tokio::test]
    async fn runs_store_work_off_the_runtime() {
        let names = asyncify(|| -> Result<Vec<String>, Error> {
            let mut db = ItemDb::open_in_memory()?;
            db.ensure_table("b", &["k"])?;
            db.ensure_table("a", &["k"])?;
            db.table_names()
        })
        .await
        .expect("asyncify");
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
