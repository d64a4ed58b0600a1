//! Purpose: Define the public Rust API of the item store.
//! Exports: Sync and async handles, item helpers, schema and error types.
//! Role: Public surface; storage internals stay under `core`.
//! Invariants: Both handles expose the same operations with the same error kinds.

mod asyncify;
mod db;
mod worker;

pub use crate::core::codec::{Item, float_value, item_from_value};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::schema::{IndexSpec, TableSchema};
pub use crate::core::txn::TxState;
pub use asyncify::asyncify;
pub use db::{ApiResult, DbOptions, ItemDb, MEMORY_PATH, Transaction};
pub use worker::AsyncItemDb;
