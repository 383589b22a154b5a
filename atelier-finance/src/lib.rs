#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Financial core: immutable transactions, employee wallets, payouts and
//! the batched payroll run. Hot rows are mutated under row-level locks
//! acquired in deterministic order; every externally visible change
//! stages an outbox event in the same commit.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use atelier_outbox::OutboxError;
use atelier_store::Money;
use atelier_store::Percent;
use atelier_store::Rate;
use atelier_store::StoreError;
use atelier_store::TenantRow;
use atelier_tenancy::TenantId;
use atelier_tenancy::UserId;

mod rates;
mod service;

pub use crate::rates::ExchangeRates;
pub use crate::rates::FixedRates;
pub use crate::service::CreatePayout;
pub use crate::service::CreateTransaction;
pub use crate::service::FinanceService;
pub use crate::service::PayoutRunStats;
pub use crate::service::PayrollRunSummary;
pub use crate::service::TransactionFilter;
pub use crate::service::PAYROLL_BATCH_SIZE;

pub type FinanceResult<T> = Result<T, FinanceError>;

#[derive(Debug, Error)]
pub enum FinanceError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("payable balance {available} cannot cover {requested}")]
    InsufficientPayableBalance { requested: Money, available: Money },
    #[error("invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("outbox failure: {0}")]
    Outbox(#[from] OutboxError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Income,
    Expense,
    Commission,
    Payroll,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionType::Income => write!(f, "INCOME"),
            TransactionType::Expense => write!(f, "EXPENSE"),
            TransactionType::Commission => write!(f, "COMMISSION"),
            TransactionType::Payroll => write!(f, "PAYROLL"),
        }
    }
}

/// Immutable once created. Adjustments are compensating rows, never
/// updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub transaction_type: TransactionType,
    pub amount: Money,
    pub currency: String,
    /// Rate to the tenant base currency on the transaction date.
    pub exchange_rate: Rate,
    pub category: String,
    pub booking_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub payout_id: Option<Uuid>,
    pub description: String,
    pub transaction_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl TenantRow for Transaction {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeWallet {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub pending_balance: Money,
    pub payable_balance: Money,
    pub updated_at: DateTime<Utc>,
}

impl TenantRow for EmployeeWallet {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub amount: Money,
    pub status: PayoutStatus,
    /// The unique constraint on this key is the duplicate defense; a
    /// retried payout with the same key is a no-op by uniqueness.
    pub idempotency_key: String,
    pub gateway_reference: Option<String>,
    pub notes: String,
    pub payout_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl TenantRow for Payout {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Draft,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    #[must_use]
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Draft, BookingStatus::Confirmed)
                | (BookingStatus::Confirmed, BookingStatus::Completed)
                | (BookingStatus::Draft, BookingStatus::Cancelled)
                | (BookingStatus::Confirmed, BookingStatus::Cancelled)
        )
    }
}

/// Summarized booking: enough state machine to drive settlement and the
/// commission links; the rest of the booking domain lives outside the
/// financial core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub status: BookingStatus,
    pub total: Money,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TenantRow for Booking {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignee {
    pub user_id: UserId,
    pub share: Percent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkTask {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub booking_id: Option<Uuid>,
    pub status: TaskStatus,
    pub commission_total: Money,
    pub assignees: Vec<TaskAssignee>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TenantRow for WorkTask {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Staff profile carrying the payroll base salary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaffProfile {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub base_salary: Money,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl TenantRow for StaffProfile {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Template applied once per month by the recurring-transaction pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringRule {
    pub id: Uuid,
    pub tenant_id: TenantId,
    /// Day of month the rule falls due; capped at 28 so every month has it.
    pub day_of_month: u32,
    pub transaction_type: TransactionType,
    pub amount: Money,
    pub currency: String,
    pub category: String,
    pub description: String,
    pub last_applied: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl TenantRow for RecurringRule {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Retry on the next settlement pass.
    #[error("transient gateway failure: {0}")]
    Transient(String),
    /// Terminal: the payout fails and its amount refunds to the wallet.
    #[error("terminal gateway failure: {0}")]
    Terminal(String),
}

/// External payment gateway. The protocol itself is out of scope; the
/// settlement job only needs submit-and-reference semantics.
#[async_trait]
pub trait PayoutGateway: Send + Sync {
    async fn submit(&self, payout: &Payout) -> Result<String, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn transaction_type_display_matches_storage_form() {
        assert_eq!(TransactionType::Income.to_string(), "INCOME");
        assert_eq!(TransactionType::Payroll.to_string(), "PAYROLL");
    }

    #[test]
    fn booking_transitions_follow_the_machine() {
        assert!(BookingStatus::Draft.can_transition_to(BookingStatus::Confirmed));
        assert!(BookingStatus::Confirmed.can_transition_to(BookingStatus::Completed));
        assert!(!BookingStatus::Completed.can_transition_to(BookingStatus::Confirmed));
        assert!(!BookingStatus::Cancelled.can_transition_to(BookingStatus::Confirmed));
        assert!(!BookingStatus::Draft.can_transition_to(BookingStatus::Completed));
    }
}
