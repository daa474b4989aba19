use std::future::Future;
use std::time::Duration;

use sqlx::{Pool, Sqlite, SqliteConnection, Transaction};
use tracing::debug;

use crate::error::AppError;

/// One store transaction owned by a single manager call.
///
/// `finish` commits on `Ok` and rolls back on `Err`. A scope that is dropped
/// without being finished (early return, panic, deadline expiry) is rolled
/// back by sqlx when the inner transaction is dropped.
pub struct TxScope {
    tx: Transaction<'static, Sqlite>,
    operation: &'static str,
}

impl TxScope {
    pub async fn begin(pool: &Pool<Sqlite>, operation: &'static str) -> Result<Self, AppError> {
        debug!(operation, "Beginning transaction");
        let tx = pool.begin().await?;
        Ok(Self { tx, operation })
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn finish<T>(self, result: Result<T, AppError>) -> Result<T, AppError> {
        let operation = self.operation;
        match result {
            Ok(value) => match self.tx.commit().await {
                Ok(()) => {
                    debug!(operation, "Transaction committed");
                    Ok(value)
                }
                Err(e) => {
                    let err = AppError::commit_failed(&e);
                    err.log_and_record(operation);
                    Err(err)
                }
            },
            Err(original) => match self.tx.rollback().await {
                Ok(()) => {
                    debug!(operation, error = %original, "Transaction rolled back");
                    Err(original)
                }
                Err(e) => {
                    let err = AppError::rollback_failed(&original, &e);
                    err.log_and_record(operation);
                    Err(err)
                }
            },
        }
    }
}

/// Managers whose transactions can be bounded by a caller-chosen deadline.
pub trait Bounded: Clone {
    /// Copy of `self` whose calls use `deadline` instead of the configured
    /// transaction timeout.
    fn with_timeout(&self, deadline: Duration) -> Self;
}

/// Bounds a transactional operation by `deadline`. On expiry the future is
/// dropped together with any open transaction it holds.
pub async fn with_deadline<T, F>(
    deadline: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => {
            let err = AppError::Timeout(format!(
                "{} did not finish within {}ms",
                operation,
                deadline.as_millis()
            ));
            err.log_and_record(operation);
            Err(err)
        }
    }
}
