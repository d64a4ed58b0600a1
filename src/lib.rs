//! Purpose: Transactional storage of JSON items in SQLite tables with explicit indices.
//! Exports: `api` (database handles, async adapter, errors) and `core` (codec, schema, queries).
//! Role: Library backing the `itemdb` CLI; `api` is the supported surface.
//! Invariants: Every write happens inside an explicit transaction on one connection.
//! Invariants: Core modules take the connection as an explicit input and hold no hidden state.
pub mod api;
pub mod core;
