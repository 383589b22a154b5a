#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

mod in_memory;

pub use crate::in_memory::InMemoryTenancyService;

pub type TenantId = Uuid;
pub type UserId = Uuid;

pub type TenancyResult<T> = Result<T, TenancyError>;

#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("resource already exists: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Raised by [`TenantContext::require`] when no tenant is installed on the
/// current task. Surfaced as a 400 at the boundary and logged as a defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("tenant context missing")]
pub struct ContextMissing;

/// The ambient identity of the work currently executing: which tenant it
/// belongs to, who initiated it, and the correlation id threaded through
/// every log line it produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveContext {
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub correlation_id: Option<String>,
}

impl ActiveContext {
    #[must_use]
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            user_id: None,
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

tokio::task_local! {
    static CONTEXT: ActiveContext;
}

/// Task-local tenant context. Installed with [`TenantContext::scope`] for
/// the duration of a request or a per-tenant job pass; survives every
/// suspension point inside the scoped future. Work handed to a different
/// task (spawn, queue) must be re-scoped by its runtime; the job runtime
/// captures the producing context and reinstalls it per attempt.
pub struct TenantContext;

impl TenantContext {
    /// The ambient context, or `None` on paths that tolerate absence
    /// (health, metrics, platform bootstrap).
    #[must_use]
    pub fn current() -> Option<ActiveContext> {
        CONTEXT.try_with(Clone::clone).ok()
    }

    /// The ambient context, or [`ContextMissing`]. Every scoped-table
    /// operation on a tenant-owned entity goes through this.
    pub fn require() -> Result<ActiveContext, ContextMissing> {
        CONTEXT.try_with(Clone::clone).map_err(|_| ContextMissing)
    }

    /// Runs `future` with `context` installed. Nested scopes shadow the
    /// outer context and restore it on exit.
    pub async fn scope<F>(context: ActiveContext, future: F) -> F::Output
    where
        F: Future,
    {
        CONTEXT.scope(context, future).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantStatus {
    Active,
    Suspended,
    Archived,
}

impl TenantStatus {
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, TenantStatus::Active)
    }
}

impl Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TenantStatus::Active => write!(f, "active"),
            TenantStatus::Suspended => write!(f, "suspended"),
            TenantStatus::Archived => write!(f, "archived"),
        }
    }
}

/// A tenant is the top-level isolation boundary. The catalog itself is
/// global state managed outside the tenant-scoped layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub slug: String,
    pub name: String,
    pub status: TenantStatus,
    pub base_currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTenantRequest {
    pub slug: String,
    pub name: String,
    pub base_currency: String,
}

impl CreateTenantRequest {
    pub fn normalize(mut self) -> TenancyResult<Self> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(TenancyError::Validation(
                "tenant name cannot be empty".into(),
            ));
        }

        self.slug = normalize_slug(&self.slug)?;

        let code = self.base_currency.trim().to_ascii_uppercase();
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(TenancyError::Validation(
                "base currency must be a 3-letter ISO code".into(),
            ));
        }
        self.base_currency = code;

        Ok(self)
    }
}

fn normalize_slug(slug: &str) -> TenancyResult<String> {
    let slug = slug.trim().to_ascii_lowercase();
    if slug.is_empty() {
        return Err(TenancyError::Validation("slug cannot be empty".into()));
    }
    let valid = slug
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if !valid || slug.starts_with('-') || slug.ends_with('-') {
        return Err(TenancyError::Validation(format!(
            "slug {slug} must be lowercase letters, digits and inner dashes"
        )));
    }
    Ok(slug)
}

#[async_trait]
pub trait TenancyService: Send + Sync {
    async fn create_tenant(&self, request: CreateTenantRequest) -> TenancyResult<Tenant>;

    async fn get_tenant(&self, tenant_id: TenantId) -> TenancyResult<Tenant>;

    async fn get_by_slug(&self, slug: &str) -> TenancyResult<Tenant>;

    async fn list_tenants(&self) -> TenancyResult<Vec<Tenant>>;

    async fn set_status(&self, tenant_id: TenantId, status: TenantStatus) -> TenancyResult<Tenant>;

    /// Tenants eligible for scheduled work. Suspended and archived tenants
    /// are skipped by every background pass.
    async fn active_tenant_ids(&self) -> TenancyResult<Vec<TenantId>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tenant_status_display() {
        assert_eq!(TenantStatus::Active.to_string(), "active");
        assert_eq!(TenantStatus::Suspended.to_string(), "suspended");
        assert_eq!(TenantStatus::Archived.to_string(), "archived");
    }

    #[test]
    fn create_request_normalizes() {
        let result = CreateTenantRequest {
            slug: "  North-Shore-22  ".into(),
            name: "  North Shore Studio  ".into(),
            base_currency: " usd ".into(),
        }
        .normalize()
        .expect("request should normalize");

        assert_eq!(result.slug, "north-shore-22");
        assert_eq!(result.name, "North Shore Studio");
        assert_eq!(result.base_currency, "USD");
    }

    #[test]
    fn create_request_rejects_invalid_slug() {
        for slug in ["", "has space", "-leading", "trailing-", "Ünicode"] {
            let err = CreateTenantRequest {
                slug: slug.into(),
                name: "Name".into(),
                base_currency: "USD".into(),
            }
            .normalize()
            .unwrap_err();
            assert!(matches!(err, TenancyError::Validation(_)), "slug {slug}");
        }
    }

    #[test]
    fn create_request_rejects_invalid_currency() {
        let err = CreateTenantRequest {
            slug: "demo".into(),
            name: "Name".into(),
            base_currency: "US".into(),
        }
        .normalize()
        .unwrap_err();

        assert!(matches!(err, TenancyError::Validation(_)));
    }

    #[tokio::test]
    async fn context_is_absent_outside_scope() {
        assert_eq!(TenantContext::current(), None);
        assert_eq!(TenantContext::require(), Err(ContextMissing));
    }

    #[tokio::test]
    async fn context_survives_suspension_points() {
        let tenant = Uuid::new_v4();
        let observed = TenantContext::scope(ActiveContext::new(tenant), async {
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            TenantContext::require().expect("context must survive awaits")
        })
        .await;

        assert_eq!(observed.tenant_id, tenant);
        assert_eq!(TenantContext::current(), None);
    }

    #[tokio::test]
    async fn nested_scope_restores_outer_context() {
        let outer = Uuid::new_v4();
        let inner = Uuid::new_v4();

        TenantContext::scope(ActiveContext::new(outer), async {
            let seen = TenantContext::scope(ActiveContext::new(inner), async {
                TenantContext::require().expect("inner context").tenant_id
            })
            .await;
            assert_eq!(seen, inner);
            assert_eq!(
                TenantContext::require().expect("outer context").tenant_id,
                outer
            );
        })
        .await;
    }
}
