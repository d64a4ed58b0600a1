// Core modules implementing the item codec, schema model, transactions and queries.
pub mod codec;
pub mod error;
pub mod filter;
pub mod query;
pub mod schema;
pub mod txn;
