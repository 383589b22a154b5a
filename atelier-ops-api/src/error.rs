use std::time::Duration;

use serde::Serialize;
use tracing::error;

use atelier_auth::AuthError;
use atelier_finance::FinanceError;
use atelier_jobs::JobError;
use atelier_outbox::OutboxError;
use atelier_pipelines::PipelineError;
use atelier_store::StoreError;
use atelier_tenancy::TenancyError;

pub type OpsResult<T> = Result<T, OpsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Unauthenticated,
    RateLimited,
    /// Internal defect: a tenant-scoped path ran without context.
    TenantContextMissing,
    FinancialInvariantViolation,
    /// Deadlocks, transient I/O; retried once before surfacing.
    Transient,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Validation | ErrorKind::TenantContextMissing => 400,
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict | ErrorKind::FinancialInvariantViolation => 409,
            ErrorKind::RateLimited => 429,
            ErrorKind::Internal => 500,
            ErrorKind::Transient => 503,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpsError {
    pub kind: ErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl std::fmt::Display for OpsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for OpsError {}

impl OpsError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self {
            kind: ErrorKind::RateLimited,
            message: "too many requests".into(),
            retry_after: Some(retry_after),
        }
    }

    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    /// Message as surfaced to callers. Internal details never leak in
    /// production.
    #[must_use]
    pub fn public_message(&self, production: bool) -> String {
        if production && self.kind == ErrorKind::Internal {
            "internal error".into()
        } else {
            self.message.clone()
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl From<StoreError> for OpsError {
    fn from(err: StoreError) -> Self {
        let kind = match &err {
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Conflict { .. } => ErrorKind::Conflict,
            StoreError::CrossTenant { .. } => ErrorKind::Forbidden,
            StoreError::ContextMissing(_) => {
                error!("tenant context missing on a scoped path");
                ErrorKind::TenantContextMissing
            }
        };
        Self::new(kind, err.to_string())
    }
}

impl From<TenancyError> for OpsError {
    fn from(err: TenancyError) -> Self {
        let kind = match &err {
            TenancyError::NotFound(_) => ErrorKind::NotFound,
            TenancyError::Conflict(_) => ErrorKind::Conflict,
            TenancyError::Validation(_) => ErrorKind::Validation,
            TenancyError::Internal(_) => ErrorKind::Internal,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<FinanceError> for OpsError {
    fn from(err: FinanceError) -> Self {
        match err {
            FinanceError::Validation(_) | FinanceError::InvalidTransition { .. } => {
                Self::new(ErrorKind::Validation, err.to_string())
            }
            FinanceError::NotFound(_) => Self::new(ErrorKind::NotFound, err.to_string()),
            FinanceError::Conflict(_) => Self::new(ErrorKind::Conflict, err.to_string()),
            FinanceError::InsufficientPayableBalance { .. } => {
                Self::new(ErrorKind::FinancialInvariantViolation, err.to_string())
            }
            FinanceError::Storage(storage) => storage.into(),
            FinanceError::Outbox(outbox) => outbox.into(),
        }
    }
}

impl From<AuthError> for OpsError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthenticated(_) => Self::new(ErrorKind::Unauthenticated, err.to_string()),
            AuthError::Forbidden(_) => Self::new(ErrorKind::Forbidden, err.to_string()),
            AuthError::Validation(_) => Self::new(ErrorKind::Validation, err.to_string()),
            AuthError::RateLimited { retry_after } => Self::rate_limited(retry_after),
            AuthError::Crypto(_) => Self::new(ErrorKind::Internal, err.to_string()),
        }
    }
}

impl From<OutboxError> for OpsError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::Storage(storage) => storage.into(),
            other => Self::new(ErrorKind::Internal, other.to_string()),
        }
    }
}

impl From<PipelineError> for OpsError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Storage(storage) => storage.into(),
            PipelineError::UnknownTemplate { .. } | PipelineError::MissingVariable(_) => {
                Self::new(ErrorKind::Validation, err.to_string())
            }
            PipelineError::Transport(_) => Self::new(ErrorKind::Transient, err.to_string()),
        }
    }
}

impl From<JobError> for OpsError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::ShuttingDown => Self::new(ErrorKind::Transient, err.to_string()),
            other => Self::new(ErrorKind::Internal, other.to_string()),
        }
    }
}

/// Retries a transient failure once at the service layer before it
/// surfaces as 503.
pub async fn with_transient_retry<T, Fut>(mut attempt: impl FnMut() -> Fut) -> OpsResult<T>
where
    Fut: Future<Output = OpsResult<T>>,
{
    match attempt().await {
        Err(err) if err.is_transient() => attempt().await,
        outcome => outcome,
    }
}

/// Error envelope as the HTTP boundary serializes it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub status_code: u16,
    pub message: String,
    pub correlation_id: Option<String>,
    pub timestamp: String,
    pub path: String,
    pub method: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_codes_follow_the_contract() {
        assert_eq!(ErrorKind::Validation.status_code(), 400);
        assert_eq!(ErrorKind::Unauthenticated.status_code(), 401);
        assert_eq!(ErrorKind::Forbidden.status_code(), 403);
        assert_eq!(ErrorKind::NotFound.status_code(), 404);
        assert_eq!(ErrorKind::Conflict.status_code(), 409);
        assert_eq!(ErrorKind::FinancialInvariantViolation.status_code(), 409);
        assert_eq!(ErrorKind::RateLimited.status_code(), 429);
        assert_eq!(ErrorKind::TenantContextMissing.status_code(), 400);
        assert_eq!(ErrorKind::Transient.status_code(), 503);
        assert_eq!(ErrorKind::Internal.status_code(), 500);
    }

    #[test]
    fn internal_messages_redact_in_production() {
        let err = OpsError::new(ErrorKind::Internal, "pool exhausted on shard 3");
        assert_eq!(err.public_message(true), "internal error");
        assert_eq!(err.public_message(false), "pool exhausted on shard 3");

        let visible = OpsError::new(ErrorKind::Validation, "amount must be positive");
        assert_eq!(visible.public_message(true), "amount must be positive");
    }

    #[tokio::test]
    async fn transient_errors_get_one_retry() {
        let mut calls = 0;
        let result: OpsResult<u32> = with_transient_retry(|| {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt == 1 {
                    Err(OpsError::new(ErrorKind::Transient, "deadlock detected"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.expect("retry succeeds"), 7);
        assert_eq!(calls, 2);

        let mut calls = 0;
        let result: OpsResult<u32> = with_transient_retry(|| {
            calls += 1;
            async { Err(OpsError::new(ErrorKind::Transient, "still down")) }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 2);
    }
}
