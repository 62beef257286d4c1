//! Resilient Database Transaction
//!
//! Bundles a series of work items into one transaction and retries the
//! whole block on transient database failures. Because the block can be
//! re-invoked, the actions must be idempotent. Each attempt runs under a
//! fresh transaction id, which is handed to the actions so event log saves
//! can stamp their rows with it.

use futures::future::BoxFuture;
use sqlx::{Database, Pool, Transaction};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ResilientTransactionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("transaction action failed: {0}")]
    Action(#[source] ActionError),
}

pub struct ResilientTransaction<DB: Database> {
    pool: Pool<DB>,
    max_attempts: u32,
}

impl<DB: Database> ResilientTransaction<DB> {
    pub fn new(pool: Pool<DB>) -> Self {
        Self {
            pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Run `actions` in order under one transaction: commit on success,
    /// roll back and surface the error otherwise. Transient database errors
    /// restart the whole block. Returns the transaction id of the attempt
    /// that committed.
    pub async fn execute<F>(&self, actions: F) -> Result<Uuid, ResilientTransactionError>
    where
        F: for<'t> Fn(
            &'t mut Transaction<'static, DB>,
            Uuid,
        ) -> BoxFuture<'t, Result<(), ActionError>>,
    {
        let mut attempt = 1u32;
        loop {
            let transaction_id = Uuid::new_v4();
            match self.run_once(&actions, transaction_id).await {
                Ok(()) => return Ok(transaction_id),
                Err(error) if attempt < self.max_attempts && is_transient(&error) => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "transient database failure, re-running transaction block"
                    );
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn run_once<F>(
        &self,
        actions: &F,
        transaction_id: Uuid,
    ) -> Result<(), ResilientTransactionError>
    where
        F: for<'t> Fn(
            &'t mut Transaction<'static, DB>,
            Uuid,
        ) -> BoxFuture<'t, Result<(), ActionError>>,
    {
        let mut tx = self.pool.begin().await?;
        match actions(&mut tx, transaction_id).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(error = %rollback_error, "transaction rollback failed");
                }
                Err(classify(error))
            }
        }
    }
}

fn classify(error: ActionError) -> ResilientTransactionError {
    match error.downcast::<sqlx::Error>() {
        Ok(database) => ResilientTransactionError::Database(*database),
        Err(other) => ResilientTransactionError::Action(other),
    }
}

fn is_transient(error: &ResilientTransactionError) -> bool {
    matches!(
        error,
        ResilientTransactionError::Database(sqlx::Error::Io(_))
            | ResilientTransactionError::Database(sqlx::Error::PoolTimedOut)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        let error = ResilientTransactionError::Database(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(is_transient(&error));
        assert!(is_transient(&ResilientTransactionError::Database(
            sqlx::Error::PoolTimedOut
        )));
    }

    #[test]
    fn action_errors_are_not_transient() {
        let error = ResilientTransactionError::Action("invariant violated".into());
        assert!(!is_transient(&error));
    }

    #[test]
    fn database_errors_inside_actions_are_unwrapped() {
        let boxed: ActionError = Box::new(sqlx::Error::RowNotFound);
        assert!(matches!(
            classify(boxed),
            ResilientTransactionError::Database(sqlx::Error::RowNotFound)
        ));
    }
}
