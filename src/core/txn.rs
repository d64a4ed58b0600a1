//! Purpose: Connection-level transaction state machine.
//! Exports: `TxState`, `TxContext`.
//! Role: Gate for every write; owns BEGIN/COMMIT/ROLLBACK on the connection.
//! Invariants: At most one transaction per connection; nested begin is rejected.
//! Invariants: Every exit path (commit failure included) returns the state to `Idle`.
use rusqlite::Connection;

use crate::core::error::{Error, ErrorKind, sqlite_error};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxState {
    Idle,
    Active,
    Committing,
    RollingBack,
}

#[derive(Debug)]
pub struct TxContext {
    state: TxState,
}

impl TxContext {
    pub fn new() -> Self {
        Self {
            state: TxState::Idle,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxState::Active
    }

    /// Takes the write lock up front; waits according to the connection's busy timeout.
    pub fn begin(&mut self, conn: &Connection) -> Result<(), Error> {
        if self.state != TxState::Idle {
            return Err(Error::new(ErrorKind::TransactionState)
                .with_message("already in a transaction")
                .with_hint("Transactions cannot be nested; finish the current one first."));
        }
        conn.execute_batch("BEGIN IMMEDIATE").map_err(|err| {
            let err = sqlite_error(err);
            if err.kind() == ErrorKind::TransactionTimeout {
                err.with_message("timed out waiting for the database write lock")
                    .with_hint("Another connection holds a long transaction; retry or raise the busy timeout.")
            } else {
                err
            }
        })?;
        self.state = TxState::Active;
        tracing::debug!("transaction started");
        Ok(())
    }

    pub fn commit(&mut self, conn: &Connection) -> Result<(), Error> {
        self.require_active("commit")?;
        self.state = TxState::Committing;
        match conn.execute_batch("COMMIT") {
            Ok(()) => {
                self.state = TxState::Idle;
                tracing::debug!("transaction committed");
                Ok(())
            }
            Err(err) => {
                let err = sqlite_error(err).with_message("commit failed; transaction rolled back");
                self.state = TxState::RollingBack;
                if !conn.is_autocommit() {
                    if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                        tracing::warn!(error = %rollback_err, "rollback after failed commit failed");
                    }
                }
                self.state = TxState::Idle;
                Err(err)
            }
        }
    }

    pub fn rollback(&mut self, conn: &Connection) -> Result<(), Error> {
        self.require_active("rollback")?;
        self.state = TxState::RollingBack;
        let result = if conn.is_autocommit() {
            Ok(())
        } else {
            conn.execute_batch("ROLLBACK").map_err(sqlite_error)
        };
        self.state = TxState::Idle;
        tracing::debug!("transaction rolled back");
        result
    }

    pub fn require_active(&self, operation: &str) -> Result<(), Error> {
        if self.state == TxState::Active {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::TransactionState)
                .with_message(format!("can only use {operation}() within a transaction")))
        }
    }
}

impl Default for TxContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{TxContext, TxState};
    use crate::core::error::ErrorKind;
    use rusqlite::Connection;

    #[test]
    fn begin_commit_cycle() {
        let conn = Connection::open_in_memory().expect("open");
        let mut tx = TxContext::new();
        tx.begin(&conn).expect("begin");
        assert_eq!(tx.state(), TxState::Active);
        assert!(!conn.is_autocommit());
        tx.commit(&conn).expect("commit");
        assert_eq!(tx.state(), TxState::Idle);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn nested_begin_is_rejected() {
        let conn = Connection::open_in_memory().expect("open");
        let mut tx = TxContext::new();
        tx.begin(&conn).expect("begin");
        let err = tx.begin(&conn).expect_err("nested");
        assert_eq!(err.kind(), ErrorKind::TransactionState);
        assert_eq!(tx.state(), TxState::Active);
    }

    #[test]
    fn commit_and_rollback_require_active() {
        let conn = Connection::open_in_memory().expect("open");
        let mut tx = TxContext::new();
        assert_eq!(tx.commit(&conn).expect_err("idle").kind(), ErrorKind::TransactionState);
        assert_eq!(tx.rollback(&conn).expect_err("idle").kind(), ErrorKind::TransactionState);
    }

    #[test]
    fn rollback_discards_writes() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute("CREATE TABLE t (x)", []).expect("create");
        let mut tx = TxContext::new();
        tx.begin(&conn).expect("begin");
        conn.execute("INSERT INTO t VALUES (1)", []).expect("insert");
        tx.rollback(&conn).expect("rollback");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 0);
        assert_eq!(tx.state(), TxState::Idle);
    }
}
