#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Store substrate for tenant-owned state: scoped tables keyed by
//! `(tenant_id, id)`, bounded decimal transformers for monetary columns,
//! and the two lock layers the financial core builds on (row-level locks
//! and coarse advisory locks).

use chrono::DateTime;
use chrono::Utc;
use regex_lite::Regex;
use thiserror::Error;
use uuid::Uuid;

use atelier_tenancy::ContextMissing;
use atelier_tenancy::TenantId;

mod decimal;
mod locks;
mod table;

pub use crate::decimal::Money;
pub use crate::decimal::Percent;
pub use crate::decimal::Rate;
pub use crate::locks::AdvisoryGuard;
pub use crate::locks::AdvisoryLocks;
pub use crate::locks::RowGuard;
pub use crate::locks::RowKey;
pub use crate::locks::RowLocks;
pub use crate::table::Disjunction;
pub use crate::table::Query;
pub use crate::table::ScopedTable;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("unique violation on {index}: {key}")]
    Conflict { index: String, key: String },
    #[error("row tenant {actual} does not match ambient tenant {expected}")]
    CrossTenant { expected: TenantId, actual: TenantId },
    #[error(transparent)]
    ContextMissing(#[from] ContextMissing),
}

impl StoreError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// A row owned by a tenant. The logical primary key is always
/// `(tenant_id, id)`; an `id`-only lookup is never the scoping basis.
pub trait TenantRow: Clone + Send + Sync + 'static {
    fn tenant_id(&self) -> TenantId;

    fn id(&self) -> Uuid;

    /// Soft-delete marker. Rows carrying a marker are excluded from
    /// default reads; override for entities that support soft deletion.
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Entities that keep referential history instead of disappearing.
pub trait SoftDeletable: TenantRow {
    fn set_deleted_at(&mut self, deleted_at: Option<DateTime<Utc>>);
}

/// Parses a tenant id from its canonical textual form. Legacy string
/// identifiers from pre-uuid seed data are accepted only when they match
/// the canonical shape; anything else is a validation error, never a
/// silent pass-through.
pub fn parse_tenant_id(raw: &str) -> StoreResult<TenantId> {
    let canonical =
        Regex::new("^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
            .map_err(|err| StoreError::Validation(format!("uuid pattern: {err}")))?;
    let candidate = raw.trim().to_ascii_lowercase();
    if !canonical.is_match(&candidate) {
        return Err(StoreError::Validation(format!(
            "{raw} is not a canonical tenant id"
        )));
    }
    Uuid::parse_str(&candidate)
        .map_err(|err| StoreError::Validation(format!("{raw} is not a tenant id: {err}")))
}
