use opentelemetry_semantic_conventions::{attribute::OTEL_STATUS_CODE, trace::ERROR_TYPE};
use rocket::http::Status;
use thiserror::Error;
use tracing::{Span, error, warn};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// The store failed to commit or to roll back; partial state is possible.
    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn rollback_failed(original: &AppError, rollback: &sqlx::Error) -> Self {
        AppError::Fatal(format!(
            "unable to rollback transaction on error: {}; {}",
            original, rollback
        ))
    }

    pub fn commit_failed(err: &sqlx::Error) -> Self {
        AppError::Fatal(format!("unable to commit transaction: {}", err))
    }

    /// Maps a statement failure to a business error when the driver reports
    /// a constraint violation, otherwise keeps it as a database error.
    pub fn from_constraint(err: sqlx::Error, unique: &str, foreign_key: &str) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return AppError::Conflict(unique.to_string());
            }
            if db_err.is_foreign_key_violation() {
                return AppError::NotFound(foreign_key.to_string());
            }
        }
        AppError::Database(err)
    }

    pub fn log_and_record(&self, ctx: &str) {
        let current_span = Span::current();
        let is_valid_span = !current_span.is_none();

        let message = self.to_string();
        let error_kind = match self {
            AppError::Database(err) => {
                error!(error = %message, context = %ctx, db_error = %err, "Database error");
                "database_error"
            }
            AppError::Authorization(msg) => {
                warn!(message = %msg, context = %ctx, "Authorization error");
                "authorization_error"
            }
            AppError::NotFound(msg) => {
                warn!(message = %msg, context = %ctx, "Not found error");
                "not_found_error"
            }
            AppError::Conflict(msg) => {
                warn!(message = %msg, context = %ctx, "Conflict error");
                "conflict_error"
            }
            AppError::Validation(msg) => {
                warn!(message = %msg, context = %ctx, "Validation error");
                "validation_error"
            }
            AppError::Timeout(msg) => {
                error!(message = %msg, context = %ctx, "Transaction deadline exceeded");
                "timeout_error"
            }
            AppError::Fatal(msg) => {
                error!(message = %msg, context = %ctx, severity = "fatal", "Transaction failure");
                "fatal_transaction_error"
            }
            AppError::ExternalService(msg) => {
                error!(message = %msg, context = %ctx, "External service error");
                "external_service_error"
            }
            AppError::Internal(msg) => {
                error!(message = %msg, context = %ctx, "Internal server error");
                "internal_error"
            }
        };

        if is_valid_span {
            current_span.record("error", tracing::field::display(true));
            current_span.record(ERROR_TYPE, tracing::field::display(error_kind));
            current_span.record("error.message", tracing::field::display(&message));

            match self {
                AppError::Database(_)
                | AppError::Fatal(_)
                | AppError::Timeout(_)
                | AppError::Internal(_)
                | AppError::ExternalService(_) => {
                    current_span.record(OTEL_STATUS_CODE, tracing::field::display("ERROR"));
                }
                _ => {}
            }
        }
    }

    pub fn status_code(&self) -> Status {
        match self {
            AppError::Database(_) => Status::InternalServerError,
            AppError::Authorization(_) => Status::Forbidden,
            AppError::NotFound(_) => Status::NotFound,
            AppError::Conflict(_) => Status::Conflict,
            AppError::Validation(_) => Status::BadRequest,
            AppError::Timeout(_) => Status::ServiceUnavailable,
            AppError::Fatal(_) => Status::InternalServerError,
            AppError::ExternalService(_) => Status::ServiceUnavailable,
            AppError::Internal(_) => Status::InternalServerError,
        }
    }

    pub fn to_status_with_log(&self, context: &str) -> Status {
        self.log_and_record(context);
        self.status_code()
    }
}

impl<'r> rocket::response::Responder<'r, 'static> for AppError {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        self.to_status_with_log(&format!("Request to {} {}", req.method(), req.uri()))
            .respond_to(req)
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {}", error))
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        AppError::ExternalService(format!("File store error: {}", error))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

impl From<AppError> for Status {
    fn from(err: AppError) -> Self {
        err.to_status_with_log("Error conversion into Status")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_failure_keeps_both_causes() {
        let original = AppError::Conflict("still enrolled".to_string());
        let err = AppError::rollback_failed(&original, &sqlx::Error::PoolClosed);

        match &err {
            AppError::Fatal(msg) => {
                assert!(msg.starts_with("unable to rollback transaction on error"));
                assert!(msg.contains("still enrolled"));
            }
            other => panic!("Expected fatal error, got {:?}", other),
        }
        assert_eq!(err.status_code(), Status::InternalServerError);
    }

    #[test]
    fn test_non_constraint_errors_stay_database_errors() {
        let err = AppError::from_constraint(sqlx::Error::RowNotFound, "dup", "missing");
        assert!(matches!(err, AppError::Database(_)));
    }
}
