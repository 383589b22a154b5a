use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Datelike;
use chrono::NaiveDate;
use chrono::Utc;
use regex_lite::Regex;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use atelier_audit_chain::AuditChainService;
use atelier_audit_chain::AuditDraft;
use atelier_outbox::OutboxStore;
use atelier_store::AdvisoryLocks;
use atelier_store::Money;
use atelier_store::Rate;
use atelier_store::RowLocks;
use atelier_store::ScopedTable;
use atelier_store::StoreError;
use atelier_telemetry::OpsTelemetry;
use atelier_tenancy::TenancyError;
use atelier_tenancy::TenancyService;
use atelier_tenancy::TenantContext;
use atelier_tenancy::TenantId;
use atelier_tenancy::UserId;

use crate::Booking;
use crate::BookingStatus;
use crate::EmployeeWallet;
use crate::ExchangeRates;
use crate::FinanceError;
use crate::FinanceResult;
use crate::GatewayError;
use crate::Payout;
use crate::PayoutGateway;
use crate::PayoutStatus;
use crate::RecurringRule;
use crate::StaffProfile;
use crate::TaskAssignee;
use crate::TaskStatus;
use crate::Transaction;
use crate::TransactionType;
use crate::WorkTask;

/// Profiles processed per payroll commit; a failed batch rolls back
/// alone while later batches continue.
pub const PAYROLL_BATCH_SIZE: usize = 100;

const TASK_LOCK: &str = "tasks";
const BOOKING_LOCK: &str = "bookings";
/// Wallet locks are keyed by user id, so multi-wallet operations order
/// their acquisitions lexicographically by user.
const WALLET_LOCK: &str = "employee_wallets";

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTransaction {
    pub transaction_type: TransactionType,
    pub amount: Money,
    pub currency: String,
    pub category: String,
    pub booking_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub payout_id: Option<Uuid>,
    pub description: String,
    pub transaction_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatePayout {
    pub user_id: UserId,
    pub amount: Money,
    pub idempotency_key: String,
    pub notes: String,
    pub payout_date: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub types: Vec<TransactionType>,
    pub booking_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayrollRunSummary {
    /// False when another replica held the payroll lock.
    pub ran: bool,
    pub created: usize,
    pub skipped: usize,
    pub failed_batches: usize,
    pub total: Money,
}

impl Default for PayrollRunSummary {
    fn default() -> Self {
        Self {
            ran: true,
            created: 0,
            skipped: 0,
            failed_batches: 0,
            total: Money::zero(),
        }
    }
}

impl PayrollRunSummary {
    fn lock_held() -> Self {
        Self {
            ran: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayoutRunStats {
    pub completed: usize,
    pub failed: usize,
    pub deferred: usize,
}

#[derive(Default)]
struct BatchOutcome {
    created: usize,
    skipped: usize,
    total: Option<Money>,
}

pub struct FinanceService {
    transactions: ScopedTable<Transaction>,
    wallets: ScopedTable<EmployeeWallet>,
    payouts: ScopedTable<Payout>,
    bookings: ScopedTable<Booking>,
    tasks: ScopedTable<WorkTask>,
    profiles: ScopedTable<StaffProfile>,
    recurring: ScopedTable<RecurringRule>,
    locks: Arc<RowLocks>,
    advisory: Arc<AdvisoryLocks>,
    outbox: Arc<OutboxStore>,
    audit: Arc<AuditChainService>,
    rates: Arc<dyn ExchangeRates>,
    tenancy: Arc<dyn TenancyService>,
    telemetry: OpsTelemetry,
}

fn tenancy_error(err: TenancyError) -> FinanceError {
    match err {
        TenancyError::NotFound(what) => FinanceError::NotFound(what),
        other => FinanceError::Validation(other.to_string()),
    }
}

fn refund_like(category: &str) -> bool {
    Regex::new("(?i)refund|reversal")
        .map(|pattern| pattern.is_match(category))
        .unwrap_or(false)
}

fn normalize_currency(raw: &str) -> FinanceResult<String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(FinanceError::Validation(format!(
            "currency {raw} must be a 3-letter ISO code"
        )));
    }
    Ok(code)
}

impl FinanceService {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        tenancy: Arc<dyn TenancyService>,
        rates: Arc<dyn ExchangeRates>,
        outbox: Arc<OutboxStore>,
        audit: Arc<AuditChainService>,
        locks: Arc<RowLocks>,
        advisory: Arc<AdvisoryLocks>,
        telemetry: OpsTelemetry,
    ) -> Arc<Self> {
        Arc::new(Self {
            transactions: ScopedTable::new("transactions"),
            wallets: ScopedTable::new("employee_wallets").with_unique(
                "employee_wallets.tenant_user",
                |wallet: &EmployeeWallet| Some(format!("{}:{}", wallet.tenant_id, wallet.user_id)),
            ),
            payouts: ScopedTable::new("payouts").with_unique(
                "payouts.idempotency_key",
                |payout: &Payout| Some(payout.idempotency_key.clone()),
            ),
            bookings: ScopedTable::new("bookings"),
            tasks: ScopedTable::new("tasks"),
            profiles: ScopedTable::new("staff_profiles").with_unique(
                "staff_profiles.tenant_user",
                |profile: &StaffProfile| Some(format!("{}:{}", profile.tenant_id, profile.user_id)),
            ),
            recurring: ScopedTable::new("recurring_rules"),
            locks,
            advisory,
            outbox,
            audit,
            rates,
            tenancy,
            telemetry,
        })
    }

    fn ambient_tenant() -> FinanceResult<TenantId> {
        let context = TenantContext::require().map_err(StoreError::from)?;
        Ok(context.tenant_id)
    }

    async fn base_currency(&self) -> FinanceResult<String> {
        let tenant_id = Self::ambient_tenant()?;
        let tenant = self
            .tenancy
            .get_tenant(tenant_id)
            .await
            .map_err(tenancy_error)?;
        Ok(tenant.base_currency)
    }

    /// Compensates a failed multi-row commit: restores wallet snapshots
    /// and removes rows and staged events written before the failure.
    async fn rollback(
        &self,
        wallets: Vec<EmployeeWallet>,
        transaction_ids: Vec<Uuid>,
        payout_ids: Vec<Uuid>,
        event_ids: Vec<Uuid>,
    ) {
        for wallet in wallets {
            if let Err(err) = self.wallets.save(wallet).await {
                warn!(error = %err, "wallet rollback failed");
            }
        }
        for id in transaction_ids {
            let _ = self.transactions.remove(id).await;
        }
        for id in payout_ids {
            let _ = self.payouts.remove(id).await;
        }
        for id in event_ids {
            let _ = self.outbox.discard(id).await;
        }
    }

    // ---- wallets & profiles -------------------------------------------------

    pub async fn ensure_wallet(&self, user_id: UserId) -> FinanceResult<EmployeeWallet> {
        let existing = self
            .wallets
            .find(|wallet| wallet.user_id == user_id)
            .await?;
        if let Some(wallet) = existing.into_iter().next() {
            return Ok(wallet);
        }
        let tenant_id = Self::ambient_tenant()?;
        let wallet = EmployeeWallet {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            pending_balance: Money::zero(),
            payable_balance: Money::zero(),
            updated_at: Utc::now(),
        };
        match self.wallets.insert(wallet).await {
            Ok(wallet) => Ok(wallet),
            // Lost a race against a concurrent creator: re-read.
            Err(err) if err.is_conflict() => self.wallet_of(user_id).await,
            Err(err) => Err(err.into()),
        }
    }

    pub async fn wallet_of(&self, user_id: UserId) -> FinanceResult<EmployeeWallet> {
        self.wallets
            .find(|wallet| wallet.user_id == user_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| FinanceError::NotFound(format!("wallet for user {user_id}")))
    }

    pub async fn upsert_profile(
        &self,
        user_id: UserId,
        base_salary: Money,
    ) -> FinanceResult<StaffProfile> {
        let existing = self
            .profiles
            .find(|profile| profile.user_id == user_id)
            .await?;
        if let Some(profile) = existing.into_iter().next() {
            return Ok(self
                .profiles
                .update(profile.id, |row| {
                    row.base_salary = base_salary;
                    Ok(())
                })
                .await?);
        }
        let tenant_id = Self::ambient_tenant()?;
        Ok(self
            .profiles
            .insert(StaffProfile {
                id: Uuid::new_v4(),
                tenant_id,
                user_id,
                base_salary,
                is_active: true,
                created_at: Utc::now(),
            })
            .await?)
    }

    // ---- bookings & tasks ---------------------------------------------------

    pub async fn create_booking(&self, total: Money) -> FinanceResult<Booking> {
        let tenant_id = Self::ambient_tenant()?;
        Ok(self
            .bookings
            .insert(Booking {
                id: Uuid::new_v4(),
                tenant_id,
                status: BookingStatus::Draft,
                total,
                settled_at: None,
                created_at: Utc::now(),
            })
            .await?)
    }

    async fn transition_booking(
        &self,
        booking_id: Uuid,
        next: BookingStatus,
    ) -> FinanceResult<Booking> {
        Ok(self
            .bookings
            .update(booking_id, |booking| {
                if !booking.status.can_transition_to(next) {
                    return Err(StoreError::Validation(format!(
                        "booking cannot move from {:?} to {next:?}",
                        booking.status
                    )));
                }
                booking.status = next;
                Ok(())
            })
            .await?)
    }

    pub async fn confirm_booking(&self, booking_id: Uuid) -> FinanceResult<Booking> {
        self.transition_booking(booking_id, BookingStatus::Confirmed)
            .await
    }

    pub async fn complete_booking(&self, booking_id: Uuid) -> FinanceResult<Booking> {
        self.transition_booking(booking_id, BookingStatus::Completed)
            .await
    }

    pub async fn cancel_booking(&self, booking_id: Uuid) -> FinanceResult<Booking> {
        self.transition_booking(booking_id, BookingStatus::Cancelled)
            .await
    }

    pub async fn list_bookings(&self) -> FinanceResult<Vec<Booking>> {
        let mut bookings = self.bookings.find(|_| true).await?;
        bookings.sort_by_key(|booking| booking.created_at);
        Ok(bookings)
    }

    pub async fn create_task(
        &self,
        booking_id: Option<Uuid>,
        commission_total: Money,
        assignees: Vec<TaskAssignee>,
    ) -> FinanceResult<WorkTask> {
        if commission_total.is_negative() {
            return Err(FinanceError::Validation(
                "commission total cannot be negative".into(),
            ));
        }
        let mut share_sum = rust_decimal::Decimal::ZERO;
        for assignee in &assignees {
            if assignee.share.value() <= rust_decimal::Decimal::ZERO {
                return Err(FinanceError::Validation(
                    "commission share must be positive".into(),
                ));
            }
            share_sum += assignee.share.value();
        }
        if share_sum > rust_decimal::Decimal::ONE_HUNDRED {
            return Err(FinanceError::Validation(
                "commission shares exceed 100 percent".into(),
            ));
        }

        let tenant_id = Self::ambient_tenant()?;
        Ok(self
            .tasks
            .insert(WorkTask {
                id: Uuid::new_v4(),
                tenant_id,
                booking_id,
                status: TaskStatus::Pending,
                commission_total,
                assignees,
                completed_at: None,
                created_at: Utc::now(),
            })
            .await?)
    }

    pub async fn start_task(&self, task_id: Uuid) -> FinanceResult<WorkTask> {
        Ok(self
            .tasks
            .update(task_id, |task| {
                if task.status != TaskStatus::Pending {
                    return Err(StoreError::Validation(format!(
                        "task cannot start from {:?}",
                        task.status
                    )));
                }
                task.status = TaskStatus::InProgress;
                Ok(())
            })
            .await?)
    }

    // ---- transactions -------------------------------------------------------

    fn validate_amount_sign(input: &CreateTransaction) -> FinanceResult<()> {
        if !input.amount.is_negative() {
            return Ok(());
        }
        let refund_of_revenue = input.transaction_type == TransactionType::Income
            && (input.booking_id.is_some() || refund_like(&input.category));
        if refund_of_revenue {
            Ok(())
        } else {
            Err(FinanceError::Validation(
                "negative amounts are only valid for income refunds and reversals".into(),
            ))
        }
    }

    async fn resolve_rate(&self, currency: &str, date: NaiveDate) -> FinanceResult<Rate> {
        let base = self.base_currency().await?;
        if currency == base {
            return Ok(Rate::one());
        }
        self.rates
            .rate_on(currency, &base, date)
            .await
            .ok_or_else(|| {
                FinanceError::Validation(format!("no exchange rate known for {currency}/{base}"))
            })
    }

    async fn insert_transaction_row(
        &self,
        input: CreateTransaction,
        exchange_rate: Rate,
    ) -> FinanceResult<Transaction> {
        let tenant_id = Self::ambient_tenant()?;
        Ok(self
            .transactions
            .insert(Transaction {
                id: Uuid::new_v4(),
                tenant_id,
                transaction_type: input.transaction_type,
                amount: input.amount,
                currency: input.currency,
                exchange_rate,
                category: input.category,
                booking_id: input.booking_id,
                task_id: input.task_id,
                payout_id: input.payout_id,
                description: input.description,
                transaction_date: input.transaction_date,
                created_at: Utc::now(),
            })
            .await?)
    }

    fn transaction_event_payload(transaction: &Transaction) -> serde_json::Value {
        serde_json::json!({
            "transaction_id": transaction.id,
            "type": transaction.transaction_type.to_string(),
            "amount": transaction.amount.to_db_string(),
            "currency": transaction.currency,
            "booking_id": transaction.booking_id,
            "task_id": transaction.task_id,
            "payout_id": transaction.payout_id,
        })
    }

    /// Creates an immutable transaction row and stages its
    /// `transaction.created` event in the same commit.
    pub async fn create_transaction(
        &self,
        mut input: CreateTransaction,
    ) -> FinanceResult<Transaction> {
        if input.category.trim().is_empty() {
            return Err(FinanceError::Validation("category is required".into()));
        }
        input.currency = normalize_currency(&input.currency)?;
        Self::validate_amount_sign(&input)?;

        let rate = self
            .resolve_rate(&input.currency, input.transaction_date)
            .await?;
        let transaction = self.insert_transaction_row(input, rate).await?;

        if let Err(err) = self
            .outbox
            .append(
                "transaction",
                transaction.id.to_string(),
                "transaction.created",
                Self::transaction_event_payload(&transaction),
            )
            .await
        {
            self.rollback(Vec::new(), vec![transaction.id], Vec::new(), Vec::new())
                .await;
            return Err(err.into());
        }

        self.audit
            .log(
                AuditDraft::action("TRANSACTION_CREATED")
                    .entity("transaction", transaction.id.to_string())
                    .values(
                        serde_json::Value::Null,
                        serde_json::json!({
                            "type": transaction.transaction_type.to_string(),
                            "amount": transaction.amount.to_db_string(),
                            "currency": transaction.currency,
                            "category": transaction.category,
                        }),
                    ),
            )
            .await;

        Ok(transaction)
    }

    pub async fn list_transactions(
        &self,
        filter: TransactionFilter,
    ) -> FinanceResult<Vec<Transaction>> {
        let mut query = self.transactions.query();
        if let Some(from) = filter.from {
            query = query.and_where(move |t: &Transaction| t.transaction_date >= from);
        }
        if let Some(to) = filter.to {
            query = query.and_where(move |t: &Transaction| t.transaction_date <= to);
        }
        if let Some(booking_id) = filter.booking_id {
            query = query.and_where(move |t: &Transaction| t.booking_id == Some(booking_id));
        }
        if !filter.types.is_empty() {
            let types = filter.types;
            query = query.grouped(move |mut group| {
                for transaction_type in types {
                    group = group
                        .or_where(move |t: &Transaction| t.transaction_type == transaction_type);
                }
                group
            });
        }

        let mut rows = query.fetch().await?;
        rows.sort_by_key(|t| (t.transaction_date, t.created_at));
        Ok(rows)
    }

    pub async fn transactions_for_payout(&self, payout_id: Uuid) -> FinanceResult<Vec<Transaction>> {
        Ok(self
            .transactions
            .find(|t| t.payout_id == Some(payout_id))
            .await?)
    }

    // ---- commission accrual -------------------------------------------------

    /// Completes a task and accrues each assignee's commission share into
    /// the pending balance, all in one commit. The task row lock is the
    /// double-completion guard; wallet locks are taken in user order.
    pub async fn complete_task(&self, task_id: Uuid) -> FinanceResult<Vec<Transaction>> {
        let tenant_id = Self::ambient_tenant()?;
        let _task_guard = self.locks.lock((TASK_LOCK, tenant_id, task_id)).await;

        let task = self
            .tasks
            .find_one(task_id)
            .await?
            .ok_or_else(|| FinanceError::NotFound(format!("task {task_id}")))?;
        match task.status {
            TaskStatus::Completed => {
                return Err(FinanceError::Conflict(format!(
                    "task {task_id} is already completed"
                )));
            }
            TaskStatus::Pending => {
                return Err(FinanceError::InvalidTransition {
                    entity: "task",
                    from: "PENDING".into(),
                    to: "COMPLETED".into(),
                });
            }
            TaskStatus::InProgress => {}
        }

        for assignee in &task.assignees {
            self.ensure_wallet(assignee.user_id).await?;
        }
        let wallet_keys = task
            .assignees
            .iter()
            .map(|assignee| (WALLET_LOCK, tenant_id, assignee.user_id))
            .collect();
        let _wallet_guards = self.locks.lock_many(wallet_keys).await;

        let base_currency = self.base_currency().await?;
        let today = Utc::now().date_naive();

        let mut wallet_snapshots = Vec::new();
        let mut transaction_ids = Vec::new();
        let mut event_ids = Vec::new();
        let outcome = self
            .accrue_commissions(
                &task,
                &base_currency,
                today,
                &mut wallet_snapshots,
                &mut transaction_ids,
                &mut event_ids,
            )
            .await;

        match outcome {
            Ok(transactions) => {
                self.tasks
                    .update(task_id, |row| {
                        row.status = TaskStatus::Completed;
                        row.completed_at = Some(Utc::now());
                        Ok(())
                    })
                    .await?;
                self.audit
                    .log(
                        AuditDraft::action("TASK_COMPLETED")
                            .entity("task", task_id.to_string())
                            .values(
                                serde_json::json!({ "status": "IN_PROGRESS" }),
                                serde_json::json!({
                                    "status": "COMPLETED",
                                    "commissions": transactions.len(),
                                }),
                            ),
                    )
                    .await;
                Ok(transactions)
            }
            Err(err) => {
                self.rollback(wallet_snapshots, transaction_ids, Vec::new(), event_ids)
                    .await;
                Err(err)
            }
        }
    }

    async fn accrue_commissions(
        &self,
        task: &WorkTask,
        base_currency: &str,
        today: NaiveDate,
        wallet_snapshots: &mut Vec<EmployeeWallet>,
        transaction_ids: &mut Vec<Uuid>,
        event_ids: &mut Vec<Uuid>,
    ) -> FinanceResult<Vec<Transaction>> {
        let mut transactions = Vec::new();
        for assignee in &task.assignees {
            let share_amount = task.commission_total.apply_percent(assignee.share)?;
            if share_amount.is_zero() {
                continue;
            }

            let wallet = self.wallet_of(assignee.user_id).await?;
            wallet_snapshots.push(wallet.clone());
            self.wallets
                .update(wallet.id, |row| {
                    row.pending_balance = row.pending_balance.checked_add(share_amount)?;
                    row.updated_at = Utc::now();
                    Ok(())
                })
                .await?;

            let transaction = self
                .insert_transaction_row(
                    CreateTransaction {
                        transaction_type: TransactionType::Commission,
                        amount: share_amount,
                        currency: base_currency.to_string(),
                        category: "commission".into(),
                        booking_id: task.booking_id,
                        task_id: Some(task.id),
                        payout_id: None,
                        description: format!("Commission share for task {}", task.id),
                        transaction_date: today,
                    },
                    Rate::one(),
                )
                .await?;
            transaction_ids.push(transaction.id);

            let event = self
                .outbox
                .append(
                    "transaction",
                    transaction.id.to_string(),
                    "transaction.created",
                    Self::transaction_event_payload(&transaction),
                )
                .await?;
            event_ids.push(event.id);
            transactions.push(transaction);
        }
        Ok(transactions)
    }

    // ---- settlement: pending -> payable ------------------------------------

    /// On booking settlement the commissions accrued by its completed
    /// tasks move from pending to payable for every touched wallet, in
    /// one commit. Wallets lock in lexicographic user order so
    /// overlapping settlements cannot deadlock.
    pub async fn settle_booking(&self, booking_id: Uuid) -> FinanceResult<Booking> {
        let tenant_id = Self::ambient_tenant()?;
        let _booking_guard = self.locks.lock((BOOKING_LOCK, tenant_id, booking_id)).await;

        let booking = self
            .bookings
            .find_one(booking_id)
            .await?
            .ok_or_else(|| FinanceError::NotFound(format!("booking {booking_id}")))?;
        if booking.settled_at.is_some() {
            return Err(FinanceError::Conflict(format!(
                "booking {booking_id} is already settled"
            )));
        }
        if booking.status != BookingStatus::Completed {
            return Err(FinanceError::InvalidTransition {
                entity: "booking",
                from: format!("{:?}", booking.status),
                to: "SETTLED".into(),
            });
        }

        let tasks = self
            .tasks
            .find(|task| task.booking_id == Some(booking_id) && task.status == TaskStatus::Completed)
            .await?;
        let mut accrued: BTreeMap<UserId, Money> = BTreeMap::new();
        for task in &tasks {
            for assignee in &task.assignees {
                let share_amount = task.commission_total.apply_percent(assignee.share)?;
                if share_amount.is_zero() {
                    continue;
                }
                let entry = accrued.entry(assignee.user_id).or_insert_with(Money::zero);
                *entry = entry.checked_add(share_amount)?;
            }
        }

        for user_id in accrued.keys() {
            self.ensure_wallet(*user_id).await?;
        }
        let wallet_keys = accrued
            .keys()
            .map(|user_id| (WALLET_LOCK, tenant_id, *user_id))
            .collect();
        let _wallet_guards = self.locks.lock_many(wallet_keys).await;

        let mut wallet_snapshots = Vec::new();
        let mut event_ids = Vec::new();
        let outcome = async {
            for (user_id, amount) in &accrued {
                let wallet = self.wallet_of(*user_id).await?;
                wallet_snapshots.push(wallet.clone());
                let transfer = (*amount).min(wallet.pending_balance);
                self.wallets
                    .update(wallet.id, |row| {
                        row.pending_balance = row.pending_balance.checked_sub(transfer)?;
                        row.payable_balance = row.payable_balance.checked_add(transfer)?;
                        row.updated_at = Utc::now();
                        Ok(())
                    })
                    .await?;
            }
            let event = self
                .outbox
                .append(
                    "booking",
                    booking_id.to_string(),
                    "booking.settled",
                    serde_json::json!({
                        "booking_id": booking_id,
                        "wallets": accrued.len(),
                    }),
                )
                .await?;
            event_ids.push(event.id);
            FinanceResult::Ok(())
        }
        .await;

        if let Err(err) = outcome {
            self.rollback(wallet_snapshots, Vec::new(), Vec::new(), event_ids)
                .await;
            return Err(err);
        }

        let settled = self
            .bookings
            .update(booking_id, |row| {
                row.settled_at = Some(Utc::now());
                Ok(())
            })
            .await?;

        self.audit
            .log(
                AuditDraft::action("BOOKING_SETTLED")
                    .entity("booking", booking_id.to_string())
                    .values(
                        serde_json::json!({ "settled": false }),
                        serde_json::json!({ "settled": true, "wallets": accrued.len() }),
                    ),
            )
            .await;

        Ok(settled)
    }

    // ---- payouts ------------------------------------------------------------

    /// Drains payable balance into a pending payout. The wallet row lock
    /// covers the balance check; the idempotency key's unique constraint
    /// is the duplicate defense.
    pub async fn create_payout(&self, input: CreatePayout) -> FinanceResult<Payout> {
        if input.amount.is_zero() || input.amount.is_negative() {
            return Err(FinanceError::Validation(
                "payout amount must be positive".into(),
            ));
        }
        if input.idempotency_key.trim().is_empty() {
            return Err(FinanceError::Validation(
                "idempotency key is required".into(),
            ));
        }

        let tenant_id = Self::ambient_tenant()?;
        let _wallet_guard = self
            .locks
            .lock((WALLET_LOCK, tenant_id, input.user_id))
            .await;

        let wallet = self.wallet_of(input.user_id).await?;
        if input.amount > wallet.payable_balance {
            return Err(FinanceError::InsufficientPayableBalance {
                requested: input.amount,
                available: wallet.payable_balance,
            });
        }

        let payout = match self
            .payouts
            .insert(Payout {
                id: Uuid::new_v4(),
                tenant_id,
                user_id: input.user_id,
                amount: input.amount,
                status: PayoutStatus::Pending,
                idempotency_key: input.idempotency_key.clone(),
                gateway_reference: None,
                notes: input.notes,
                payout_date: input.payout_date,
                created_at: Utc::now(),
            })
            .await
        {
            Ok(payout) => payout,
            Err(err) if err.is_conflict() => {
                return Err(FinanceError::Conflict(format!(
                    "idempotency key {} already used",
                    input.idempotency_key
                )));
            }
            Err(err) => return Err(err.into()),
        };

        let outcome = self
            .finish_payout_commit(&payout, &wallet, input.amount)
            .await;
        match outcome {
            Ok(()) => {
                self.audit
                    .log(
                        AuditDraft::action("PAYOUT_CREATED")
                            .entity("payout", payout.id.to_string())
                            .values(
                                serde_json::Value::Null,
                                serde_json::json!({
                                    "amount": payout.amount.to_db_string(),
                                    "user_id": payout.user_id,
                                }),
                            ),
                    )
                    .await;
                Ok(payout)
            }
            Err(err) => Err(err),
        }
    }

    /// Wallet decrement, payroll transaction and outbox event for a
    /// freshly inserted payout; rolls everything back on failure.
    async fn finish_payout_commit(
        &self,
        payout: &Payout,
        wallet: &EmployeeWallet,
        drained: Money,
    ) -> FinanceResult<()> {
        let mut transaction_ids = Vec::new();
        let mut event_ids = Vec::new();
        let base_currency = self.base_currency().await?;

        let outcome = async {
            self.wallets
                .update(wallet.id, |row| {
                    row.payable_balance = row.payable_balance.checked_sub(drained)?;
                    row.updated_at = Utc::now();
                    Ok(())
                })
                .await?;

            let transaction = self
                .insert_transaction_row(
                    CreateTransaction {
                        transaction_type: TransactionType::Payroll,
                        amount: payout.amount,
                        currency: base_currency.clone(),
                        category: "payroll".into(),
                        booking_id: None,
                        task_id: None,
                        payout_id: Some(payout.id),
                        description: format!("Payout {}", payout.id),
                        transaction_date: payout.payout_date,
                    },
                    Rate::one(),
                )
                .await?;
            transaction_ids.push(transaction.id);

            let event = self
                .outbox
                .append(
                    "payout",
                    payout.id.to_string(),
                    "payout.created",
                    serde_json::json!({
                        "payout_id": payout.id,
                        "user_id": payout.user_id,
                        "amount": payout.amount.to_db_string(),
                    }),
                )
                .await?;
            event_ids.push(event.id);
            FinanceResult::Ok(())
        }
        .await;

        if let Err(err) = outcome {
            self.rollback(
                vec![wallet.clone()],
                transaction_ids,
                vec![payout.id],
                event_ids,
            )
            .await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn payout(&self, payout_id: Uuid) -> FinanceResult<Payout> {
        self.payouts
            .find_one(payout_id)
            .await?
            .ok_or_else(|| FinanceError::NotFound(format!("payout {payout_id}")))
    }

    /// Settlement job: submits pending payouts to the gateway. Success
    /// records the reference; a terminal failure refunds the wallet's
    /// payable balance as a compensating credit.
    pub async fn process_pending_payouts(
        &self,
        gateway: &dyn PayoutGateway,
    ) -> FinanceResult<PayoutRunStats> {
        let tenant_id = Self::ambient_tenant()?;
        let pending = self
            .payouts
            .find(|payout| payout.status == PayoutStatus::Pending)
            .await?;

        let mut stats = PayoutRunStats::default();
        for payout in pending {
            match gateway.submit(&payout).await {
                Ok(reference) => {
                    self.payouts
                        .update(payout.id, |row| {
                            row.status = PayoutStatus::Completed;
                            row.gateway_reference = Some(reference);
                            Ok(())
                        })
                        .await?;
                    self.telemetry.record_payout_gateway(true);
                    stats.completed += 1;
                }
                Err(GatewayError::Transient(reason)) => {
                    warn!(payout_id = %payout.id, %reason, "gateway deferred payout");
                    stats.deferred += 1;
                }
                Err(GatewayError::Terminal(reason)) => {
                    let _wallet_guard = self
                        .locks
                        .lock((WALLET_LOCK, tenant_id, payout.user_id))
                        .await;
                    self.payouts
                        .update(payout.id, |row| {
                            row.status = PayoutStatus::Failed;
                            row.notes = format!("{} | gateway: {reason}", row.notes);
                            Ok(())
                        })
                        .await?;
                    let wallet = self.wallet_of(payout.user_id).await?;
                    self.wallets
                        .update(wallet.id, |row| {
                            row.payable_balance = row.payable_balance.checked_add(payout.amount)?;
                            row.updated_at = Utc::now();
                            Ok(())
                        })
                        .await?;
                    self.telemetry.record_payout_gateway(false);
                    self.audit
                        .log(
                            AuditDraft::action("PAYOUT_FAILED")
                                .entity("payout", payout.id.to_string())
                                .values(
                                    serde_json::json!({ "status": "PENDING" }),
                                    serde_json::json!({
                                        "status": "FAILED",
                                        "refunded": payout.amount.to_db_string(),
                                    }),
                                ),
                        )
                        .await;
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }

    // ---- scheduled payroll --------------------------------------------------

    /// End-of-month payroll for the ambient tenant. Guarded by the
    /// `payroll:<tenant>` advisory lock; a concurrent invocation returns
    /// immediately with `ran = false`. Profiles are processed in batches;
    /// a failed batch rolls back alone and later batches continue.
    pub async fn run_payroll(&self, year_month: &str) -> FinanceResult<PayrollRunSummary> {
        validate_year_month(year_month)?;
        let tenant_id = Self::ambient_tenant()?;

        let Some(_guard) = self.advisory.try_acquire(format!("payroll:{tenant_id}")) else {
            return Ok(PayrollRunSummary::lock_held());
        };

        let mut profiles = self.profiles.find(|profile| profile.is_active).await?;
        profiles.sort_by_key(|profile| profile.user_id);

        let mut summary = PayrollRunSummary::default();
        for batch in profiles.chunks(PAYROLL_BATCH_SIZE) {
            let wallet_keys = batch
                .iter()
                .map(|profile| (WALLET_LOCK, tenant_id, profile.user_id))
                .collect();
            let _wallet_guards = self.locks.lock_many(wallet_keys).await;

            let mut wallet_snapshots = Vec::new();
            let mut payout_ids = Vec::new();
            let mut transaction_ids = Vec::new();
            let mut event_ids = Vec::new();
            let outcome = self
                .payroll_batch(
                    batch,
                    tenant_id,
                    year_month,
                    &mut wallet_snapshots,
                    &mut payout_ids,
                    &mut transaction_ids,
                    &mut event_ids,
                )
                .await;

            match outcome {
                Ok(batch_outcome) => {
                    summary.created += batch_outcome.created;
                    summary.skipped += batch_outcome.skipped;
                    if let Some(batch_total) = batch_outcome.total {
                        summary.total = summary.total.checked_add(batch_total)?;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "payroll batch failed, rolling back batch");
                    self.rollback(wallet_snapshots, transaction_ids, payout_ids, event_ids)
                        .await;
                    summary.failed_batches += 1;
                }
            }
        }

        self.audit
            .log(
                AuditDraft::action("PAYROLL_RUN")
                    .entity("payroll", year_month.to_string())
                    .values(
                        serde_json::Value::Null,
                        serde_json::json!({
                            "period": year_month,
                            "created": summary.created,
                            "skipped": summary.skipped,
                            "failed_batches": summary.failed_batches,
                            "total": summary.total.to_db_string(),
                        }),
                    ),
            )
            .await;

        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn payroll_batch(
        &self,
        batch: &[StaffProfile],
        tenant_id: TenantId,
        year_month: &str,
        wallet_snapshots: &mut Vec<EmployeeWallet>,
        payout_ids: &mut Vec<Uuid>,
        transaction_ids: &mut Vec<Uuid>,
        event_ids: &mut Vec<Uuid>,
    ) -> FinanceResult<BatchOutcome> {
        let base_currency = self.base_currency().await?;
        let today = Utc::now().date_naive();
        let mut outcome = BatchOutcome::default();

        for profile in batch {
            let wallet = self.ensure_wallet(profile.user_id).await?;
            let amount = profile.base_salary.checked_add(wallet.payable_balance)?;
            if amount.is_zero() {
                continue;
            }

            let idempotency_key =
                format!("payroll:{tenant_id}:{}:{year_month}", profile.user_id);
            let payout = match self
                .payouts
                .insert(Payout {
                    id: Uuid::new_v4(),
                    tenant_id,
                    user_id: profile.user_id,
                    amount,
                    status: PayoutStatus::Pending,
                    idempotency_key,
                    gateway_reference: None,
                    notes: format!("Scheduled payroll {year_month}"),
                    payout_date: today,
                    created_at: Utc::now(),
                })
                .await
            {
                Ok(payout) => payout,
                // Same (tenant, user, month) already paid: retry no-op.
                Err(err) if err.is_conflict() => {
                    outcome.skipped += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            payout_ids.push(payout.id);

            wallet_snapshots.push(wallet.clone());
            self.wallets
                .update(wallet.id, |row| {
                    row.payable_balance = Money::zero();
                    row.updated_at = Utc::now();
                    Ok(())
                })
                .await?;

            let transaction = self
                .insert_transaction_row(
                    CreateTransaction {
                        transaction_type: TransactionType::Payroll,
                        amount,
                        currency: base_currency.clone(),
                        category: "payroll".into(),
                        booking_id: None,
                        task_id: None,
                        payout_id: Some(payout.id),
                        description: format!("Scheduled payroll {year_month}"),
                        transaction_date: today,
                    },
                    Rate::one(),
                )
                .await?;
            transaction_ids.push(transaction.id);

            let event = self
                .outbox
                .append(
                    "payout",
                    payout.id.to_string(),
                    "payout.created",
                    serde_json::json!({
                        "payout_id": payout.id,
                        "user_id": payout.user_id,
                        "amount": amount.to_db_string(),
                        "period": year_month,
                    }),
                )
                .await?;
            event_ids.push(event.id);

            outcome.created += 1;
            outcome.total = Some(match outcome.total {
                Some(total) => total.checked_add(amount)?,
                None => amount,
            });
        }
        Ok(outcome)
    }
}

impl FinanceService {
    // ---- recurring transactions --------------------------------------------

    pub async fn create_recurring_rule(
        &self,
        day_of_month: u32,
        template: CreateTransaction,
    ) -> FinanceResult<RecurringRule> {
        if !(1..=28).contains(&day_of_month) {
            return Err(FinanceError::Validation(
                "recurring day of month must be between 1 and 28".into(),
            ));
        }
        if template.category.trim().is_empty() {
            return Err(FinanceError::Validation("category is required".into()));
        }
        let currency = normalize_currency(&template.currency)?;
        Self::validate_amount_sign(&template)?;

        let tenant_id = Self::ambient_tenant()?;
        Ok(self
            .recurring
            .insert(RecurringRule {
                id: Uuid::new_v4(),
                tenant_id,
                day_of_month,
                transaction_type: template.transaction_type,
                amount: template.amount,
                currency,
                category: template.category,
                description: template.description,
                last_applied: None,
                created_at: Utc::now(),
            })
            .await?)
    }

    /// Applies every rule that has fallen due this month, at most once
    /// per month per rule. Guarded by the `recurring:<tenant>` advisory
    /// lock like the other per-tenant scheduled passes.
    pub async fn process_recurring(&self, today: NaiveDate) -> FinanceResult<usize> {
        let tenant_id = Self::ambient_tenant()?;
        let Some(_guard) = self.advisory.try_acquire(format!("recurring:{tenant_id}")) else {
            return Ok(0);
        };

        let rules = self.recurring.find(|_| true).await?;
        let mut applied = 0;
        for rule in rules {
            if !rule_due(&rule, today) {
                continue;
            }
            self.create_transaction(CreateTransaction {
                transaction_type: rule.transaction_type,
                amount: rule.amount,
                currency: rule.currency.clone(),
                category: rule.category.clone(),
                booking_id: None,
                task_id: None,
                payout_id: None,
                description: rule.description.clone(),
                transaction_date: today,
            })
            .await?;
            self.recurring
                .update(rule.id, |row| {
                    row.last_applied = Some(today);
                    Ok(())
                })
                .await?;
            applied += 1;
        }
        Ok(applied)
    }
}

fn rule_due(rule: &RecurringRule, today: NaiveDate) -> bool {
    if today.day() < rule.day_of_month {
        return false;
    }
    match rule.last_applied {
        Some(last) => (last.year(), last.month()) < (today.year(), today.month()),
        None => true,
    }
}

fn validate_year_month(year_month: &str) -> FinanceResult<()> {
    let valid = NaiveDate::parse_from_str(&format!("{year_month}-01"), "%Y-%m-%d").is_ok();
    if !valid {
        return Err(FinanceError::Validation(format!(
            "{year_month} is not a YYYY-MM period"
        )));
    }
    Ok(())
}
