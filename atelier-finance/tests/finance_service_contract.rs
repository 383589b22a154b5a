//! Contract tests for the financial core: commission accrual, the
//! pending-to-payable transfer, payout creation under the idempotency
//! key, gateway settlement, and the batched payroll run.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use uuid::Uuid;

use atelier_audit_chain::AuditChainService;
use atelier_finance::CreatePayout;
use atelier_finance::CreateTransaction;
use atelier_finance::FinanceError;
use atelier_finance::FinanceService;
use atelier_finance::FixedRates;
use atelier_finance::GatewayError;
use atelier_finance::Payout;
use atelier_finance::PayoutGateway;
use atelier_finance::PayoutStatus;
use atelier_finance::TaskAssignee;
use atelier_finance::TransactionFilter;
use atelier_finance::TransactionType;
use atelier_jobs::JobRuntime;
use atelier_outbox::OutboxStore;
use atelier_store::AdvisoryLocks;
use atelier_store::Money;
use atelier_store::Percent;
use atelier_store::Rate;
use atelier_store::RowLocks;
use atelier_telemetry::OpsTelemetry;
use atelier_tenancy::ActiveContext;
use atelier_tenancy::CreateTenantRequest;
use atelier_tenancy::InMemoryTenancyService;
use atelier_tenancy::TenancyService;
use atelier_tenancy::Tenant;
use atelier_tenancy::TenantContext;

struct Env {
    finance: Arc<FinanceService>,
    outbox: Arc<OutboxStore>,
    jobs: Arc<JobRuntime>,
    audit: Arc<AuditChainService>,
    rates: Arc<FixedRates>,
    advisory: Arc<AdvisoryLocks>,
    tenant: Tenant,
}

async fn env() -> Env {
    let tenancy = Arc::new(InMemoryTenancyService::new());
    let tenant = tenancy
        .create_tenant(CreateTenantRequest {
            slug: "north-shore".into(),
            name: "North Shore Studio".into(),
            base_currency: "USD".into(),
        })
        .await
        .expect("tenant");

    let advisory = AdvisoryLocks::new();
    let jobs = JobRuntime::new(Arc::clone(&advisory), OpsTelemetry::new());
    let audit = AuditChainService::new(Arc::clone(&jobs), OpsTelemetry::new());
    let outbox = Arc::new(OutboxStore::new());
    let rates = Arc::new(FixedRates::new());

    let finance = FinanceService::new(
        tenancy,
        Arc::clone(&rates) as Arc<dyn atelier_finance::ExchangeRates>,
        Arc::clone(&outbox),
        Arc::clone(&audit),
        RowLocks::new(),
        Arc::clone(&advisory),
        OpsTelemetry::new(),
    );

    Env {
        finance,
        outbox,
        jobs,
        audit,
        rates,
        advisory,
        tenant,
    }
}

async fn scoped<F: Future>(env: &Env, future: F) -> F::Output {
    TenantContext::scope(ActiveContext::new(env.tenant.id), future).await
}

fn usd(raw: &str) -> Money {
    Money::parse(raw).expect("money literal")
}

fn pct(raw: &str) -> Percent {
    Percent::parse(raw).expect("percent literal")
}

fn day(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("date literal")
}

fn income(amount: &str, date: &str) -> CreateTransaction {
    CreateTransaction {
        transaction_type: TransactionType::Income,
        amount: usd(amount),
        currency: "USD".into(),
        category: "session".into(),
        booking_id: None,
        task_id: None,
        payout_id: None,
        description: "Studio session".into(),
        transaction_date: day(date),
    }
}

#[tokio::test]
async fn created_transaction_round_trips() {
    let env = env().await;
    let created = scoped(&env, env.finance.create_transaction(income("120.00", "2024-06-03")))
        .await
        .expect("create");

    let fetched = scoped(
        &env,
        env.finance.list_transactions(TransactionFilter::default()),
    )
    .await
    .expect("list");
    assert_eq!(fetched, vec![created.clone()]);
    assert_eq!(created.exchange_rate, Rate::one());

    let events = scoped(&env, env.outbox.events_for_tenant())
        .await
        .expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "transaction.created");
}

#[tokio::test]
async fn foreign_currency_stores_the_resolved_rate() {
    let env = env().await;
    env.rates
        .insert_rate("EUR", "USD", day("2024-06-01"), Rate::parse("1.10").expect("rate"))
        .await;

    let mut input = income("100.00", "2024-06-15");
    input.currency = "EUR".into();
    let created = scoped(&env, env.finance.create_transaction(input))
        .await
        .expect("create");
    assert_eq!(created.exchange_rate, Rate::parse("1.10").expect("rate"));

    let mut unknown = income("10.00", "2024-06-15");
    unknown.currency = "GBP".into();
    let err = scoped(&env, env.finance.create_transaction(unknown))
        .await
        .unwrap_err();
    assert!(matches!(err, FinanceError::Validation(_)));
}

#[tokio::test]
async fn negative_amount_rules() {
    let env = env().await;

    let mut expense = income("-50.00", "2024-06-03");
    expense.transaction_type = TransactionType::Expense;
    let err = scoped(&env, env.finance.create_transaction(expense))
        .await
        .unwrap_err();
    assert!(matches!(err, FinanceError::Validation(_)));

    let booking = scoped(&env, env.finance.create_booking(usd("500.00")))
        .await
        .expect("booking");
    let mut refund = income("-50.00", "2024-06-03");
    refund.booking_id = Some(booking.id);
    scoped(&env, env.finance.create_transaction(refund))
        .await
        .expect("refund of revenue is accepted");

    let mut reversal = income("-20.00", "2024-06-04");
    reversal.category = "Session Refund".into();
    scoped(&env, env.finance.create_transaction(reversal))
        .await
        .expect("refund category is accepted");
}

async fn completed_booking_with_task(env: &Env, shares: &[(Uuid, &str)]) -> (Uuid, Uuid) {
    let booking = scoped(env, env.finance.create_booking(usd("1000.00")))
        .await
        .expect("booking");
    scoped(env, env.finance.confirm_booking(booking.id))
        .await
        .expect("confirm");

    let assignees = shares
        .iter()
        .map(|(user_id, share)| TaskAssignee {
            user_id: *user_id,
            share: pct(share),
        })
        .collect();
    let task = scoped(
        env,
        env.finance.create_task(Some(booking.id), usd("100.00"), assignees),
    )
    .await
    .expect("task");
    scoped(env, env.finance.start_task(task.id))
        .await
        .expect("start");
    (booking.id, task.id)
}

#[tokio::test]
async fn task_completion_accrues_commission_per_assignee() {
    let env = env().await;
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    let (_, task_id) = completed_booking_with_task(&env, &[(first, "50"), (second, "50")]).await;

    let commissions = scoped(&env, env.finance.complete_task(task_id))
        .await
        .expect("complete");
    assert_eq!(commissions.len(), 2);
    assert!(commissions
        .iter()
        .all(|txn| txn.transaction_type == TransactionType::Commission));

    let first_wallet = scoped(&env, env.finance.wallet_of(first))
        .await
        .expect("wallet");
    let second_wallet = scoped(&env, env.finance.wallet_of(second))
        .await
        .expect("wallet");
    assert_eq!(first_wallet.pending_balance, usd("50.00"));
    assert_eq!(second_wallet.pending_balance, usd("50.00"));
    assert_eq!(first_wallet.payable_balance, usd("0.00"));

    // One outbox event per assignee.
    let events = scoped(&env, env.outbox.events_for_tenant())
        .await
        .expect("events");
    let created: Vec<_> = events
        .iter()
        .filter(|event| event.event_type == "transaction.created")
        .collect();
    assert_eq!(created.len(), 2);
}

#[tokio::test]
async fn double_completion_is_refused() {
    let env = env().await;
    let user = Uuid::new_v4();
    let (_, task_id) = completed_booking_with_task(&env, &[(user, "100")]).await;

    scoped(&env, env.finance.complete_task(task_id))
        .await
        .expect("first completion");
    let err = scoped(&env, env.finance.complete_task(task_id))
        .await
        .unwrap_err();
    assert!(matches!(err, FinanceError::Conflict(_)));

    let wallet = scoped(&env, env.finance.wallet_of(user))
        .await
        .expect("wallet");
    assert_eq!(wallet.pending_balance, usd("100.00"));
}

#[tokio::test]
async fn settlement_moves_pending_to_payable() {
    let env = env().await;
    let user = Uuid::new_v4();
    let (booking_id, task_id) = completed_booking_with_task(&env, &[(user, "100")]).await;
    scoped(&env, env.finance.complete_task(task_id))
        .await
        .expect("complete");
    scoped(&env, env.finance.complete_booking(booking_id))
        .await
        .expect("booking completed");

    let settled = scoped(&env, env.finance.settle_booking(booking_id))
        .await
        .expect("settle");
    assert!(settled.settled_at.is_some());

    let wallet = scoped(&env, env.finance.wallet_of(user))
        .await
        .expect("wallet");
    assert_eq!(wallet.pending_balance, usd("0.00"));
    assert_eq!(wallet.payable_balance, usd("100.00"));

    let err = scoped(&env, env.finance.settle_booking(booking_id))
        .await
        .unwrap_err();
    assert!(matches!(err, FinanceError::Conflict(_)));
}

async fn payable_wallet(env: &Env, user: Uuid) -> Money {
    let (booking_id, task_id) = completed_booking_with_task(env, &[(user, "100")]).await;
    scoped(env, env.finance.complete_task(task_id))
        .await
        .expect("complete");
    scoped(env, env.finance.complete_booking(booking_id))
        .await
        .expect("booking completed");
    scoped(env, env.finance.settle_booking(booking_id))
        .await
        .expect("settle");
    scoped(env, env.finance.wallet_of(user))
        .await
        .expect("wallet")
        .payable_balance
}

#[tokio::test]
async fn payout_drains_payable_and_links_one_payroll_transaction() {
    let env = env().await;
    let user = Uuid::new_v4();
    let payable = payable_wallet(&env, user).await;
    assert_eq!(payable, usd("100.00"));

    let payout = scoped(
        &env,
        env.finance.create_payout(CreatePayout {
            user_id: user,
            amount: usd("60.00"),
            idempotency_key: format!("payout:{user}:60.00:2024-06"),
            notes: "June draw".into(),
            payout_date: day("2024-06-30"),
        }),
    )
    .await
    .expect("payout");
    assert_eq!(payout.status, PayoutStatus::Pending);

    let wallet = scoped(&env, env.finance.wallet_of(user))
        .await
        .expect("wallet");
    assert_eq!(wallet.payable_balance, usd("40.00"));

    let linked = scoped(&env, env.finance.transactions_for_payout(payout.id))
        .await
        .expect("linked");
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].transaction_type, TransactionType::Payroll);
    assert_eq!(linked[0].amount, payout.amount);
}

#[tokio::test]
async fn payout_exceeding_payable_is_refused_to_the_cent() {
    let env = env().await;
    let user = Uuid::new_v4();
    let (booking_id, task_id) = completed_booking_with_task(&env, &[(user, "10")]).await;
    scoped(&env, env.finance.complete_task(task_id))
        .await
        .expect("complete");
    scoped(&env, env.finance.complete_booking(booking_id))
        .await
        .expect("complete booking");
    scoped(&env, env.finance.settle_booking(booking_id))
        .await
        .expect("settle");

    // payable is now exactly 10.00
    let err = scoped(
        &env,
        env.finance.create_payout(CreatePayout {
            user_id: user,
            amount: usd("10.01"),
            idempotency_key: "too-much".into(),
            notes: String::new(),
            payout_date: day("2024-06-30"),
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        FinanceError::InsufficientPayableBalance { .. }
    ));

    let wallet = scoped(&env, env.finance.wallet_of(user))
        .await
        .expect("wallet");
    assert_eq!(wallet.payable_balance, usd("10.00"));
}

#[tokio::test]
async fn payout_idempotency_key_collision_is_a_conflict() {
    let env = env().await;
    let user = Uuid::new_v4();
    payable_wallet(&env, user).await;

    let request = CreatePayout {
        user_id: user,
        amount: usd("10.00"),
        idempotency_key: "weekly:draw:1".into(),
        notes: String::new(),
        payout_date: day("2024-06-30"),
    };
    scoped(&env, env.finance.create_payout(request.clone()))
        .await
        .expect("first payout");
    let err = scoped(&env, env.finance.create_payout(request))
        .await
        .unwrap_err();
    assert!(matches!(err, FinanceError::Conflict(_)));

    let wallet = scoped(&env, env.finance.wallet_of(user))
        .await
        .expect("wallet");
    assert_eq!(wallet.payable_balance, usd("90.00"));
}

struct StaticGateway {
    outcome: fn(&Payout) -> Result<String, GatewayError>,
}

#[async_trait]
impl PayoutGateway for StaticGateway {
    async fn submit(&self, payout: &Payout) -> Result<String, GatewayError> {
        (self.outcome)(payout)
    }
}

#[tokio::test]
async fn gateway_success_completes_the_payout() {
    let env = env().await;
    let user = Uuid::new_v4();
    payable_wallet(&env, user).await;
    scoped(
        &env,
        env.finance.create_payout(CreatePayout {
            user_id: user,
            amount: usd("100.00"),
            idempotency_key: "draw".into(),
            notes: String::new(),
            payout_date: day("2024-06-30"),
        }),
    )
    .await
    .expect("payout");

    let gateway = StaticGateway {
        outcome: |_| Ok("gw-12345".into()),
    };
    let stats = scoped(&env, env.finance.process_pending_payouts(&gateway))
        .await
        .expect("process");
    assert_eq!(stats.completed, 1);

    let payouts = scoped(
        &env,
        env.finance.list_transactions(TransactionFilter {
            types: vec![TransactionType::Payroll],
            ..TransactionFilter::default()
        }),
    )
    .await
    .expect("payroll txns");
    assert_eq!(payouts.len(), 1);
}

#[tokio::test]
async fn terminal_gateway_failure_refunds_payable() {
    let env = env().await;
    let user = Uuid::new_v4();
    payable_wallet(&env, user).await;
    let payout = scoped(
        &env,
        env.finance.create_payout(CreatePayout {
            user_id: user,
            amount: usd("100.00"),
            idempotency_key: "draw".into(),
            notes: "draw".into(),
            payout_date: day("2024-06-30"),
        }),
    )
    .await
    .expect("payout");

    let wallet = scoped(&env, env.finance.wallet_of(user))
        .await
        .expect("wallet");
    assert_eq!(wallet.payable_balance, usd("0.00"));

    let gateway = StaticGateway {
        outcome: |_| Err(GatewayError::Terminal("account closed".into())),
    };
    let stats = scoped(&env, env.finance.process_pending_payouts(&gateway))
        .await
        .expect("process");
    assert_eq!(stats.failed, 1);

    let failed = scoped(&env, env.finance.payout(payout.id))
        .await
        .expect("payout");
    assert_eq!(failed.status, PayoutStatus::Failed);

    let wallet = scoped(&env, env.finance.wallet_of(user))
        .await
        .expect("wallet");
    assert_eq!(wallet.payable_balance, usd("100.00"));
}

#[tokio::test]
async fn payroll_is_idempotent_per_user_and_month() {
    let env = env().await;
    let user = Uuid::new_v4();

    // Wallet payable 150 via a settled booking-less path: accrue and settle.
    let booking = scoped(&env, env.finance.create_booking(usd("1500.00")))
        .await
        .expect("booking");
    scoped(&env, env.finance.confirm_booking(booking.id))
        .await
        .expect("confirm");
    let task = scoped(
        &env,
        env.finance.create_task(
            Some(booking.id),
            usd("150.00"),
            vec![TaskAssignee {
                user_id: user,
                share: pct("100"),
            }],
        ),
    )
    .await
    .expect("task");
    scoped(&env, env.finance.start_task(task.id))
        .await
        .expect("start");
    scoped(&env, env.finance.complete_task(task.id))
        .await
        .expect("complete");
    scoped(&env, env.finance.complete_booking(booking.id))
        .await
        .expect("complete booking");
    scoped(&env, env.finance.settle_booking(booking.id))
        .await
        .expect("settle");

    scoped(&env, env.finance.upsert_profile(user, usd("2000.00")))
        .await
        .expect("profile");

    let summary = scoped(&env, env.finance.run_payroll("2024-06"))
        .await
        .expect("payroll");
    assert!(summary.ran);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.total, usd("2150.00"));

    let wallet = scoped(&env, env.finance.wallet_of(user))
        .await
        .expect("wallet");
    assert_eq!(wallet.payable_balance, usd("0.00"));

    // Retry for the same period: no new payout, a skip by key collision.
    let retry = scoped(&env, env.finance.run_payroll("2024-06"))
        .await
        .expect("payroll retry");
    assert_eq!(retry.created, 0);
    assert_eq!(retry.skipped, 1);

    // The PAYROLL_RUN audit entry records the aggregate outcome.
    env.jobs.run_until_idle().await;
    let verification = env.audit.verify_chain(env.tenant.id, 1000).await;
    assert!(verification.valid, "{verification:?}");

    let chain = scoped(&env, env.audit.store().chain()).await.expect("chain");
    let payroll_runs: Vec<_> = chain
        .iter()
        .filter(|entry| entry.action == "PAYROLL_RUN")
        .collect();
    assert_eq!(payroll_runs.len(), 2);
    assert_eq!(payroll_runs[1].new_values["created"], 0);
    assert_eq!(payroll_runs[1].new_values["skipped"], 1);
}

#[tokio::test]
async fn payroll_skips_when_another_replica_holds_the_lock() {
    let env = env().await;
    let user = Uuid::new_v4();
    scoped(&env, env.finance.upsert_profile(user, usd("1000.00")))
        .await
        .expect("profile");

    // Another replica holds this tenant's payroll lock.
    let guard = env
        .advisory
        .try_acquire(format!("payroll:{}", env.tenant.id))
        .expect("hold lock");
    let held = scoped(&env, env.finance.run_payroll("2024-07"))
        .await
        .expect("run while held");
    assert!(!held.ran);
    assert_eq!(held.created, 0);

    drop(guard);
    let free = scoped(&env, env.finance.run_payroll("2024-07"))
        .await
        .expect("run after release");
    assert!(free.ran);
    assert_eq!(free.created, 1);
}

#[tokio::test]
async fn recurring_rules_apply_once_per_month() {
    let env = env().await;
    scoped(
        &env,
        env.finance.create_recurring_rule(
            5,
            CreateTransaction {
                transaction_type: TransactionType::Expense,
                amount: usd("90.00"),
                currency: "USD".into(),
                category: "rent".into(),
                booking_id: None,
                task_id: None,
                payout_id: None,
                description: "Studio rent".into(),
                transaction_date: day("2024-06-05"),
            },
        ),
    )
    .await
    .expect("rule");

    // Before the due day nothing applies.
    let applied = scoped(&env, env.finance.process_recurring(day("2024-06-03")))
        .await
        .expect("process");
    assert_eq!(applied, 0);

    let applied = scoped(&env, env.finance.process_recurring(day("2024-06-07")))
        .await
        .expect("process");
    assert_eq!(applied, 1);

    // Same month again: no duplicate.
    let applied = scoped(&env, env.finance.process_recurring(day("2024-06-21")))
        .await
        .expect("process");
    assert_eq!(applied, 0);

    // Next month applies again.
    let applied = scoped(&env, env.finance.process_recurring(day("2024-07-09")))
        .await
        .expect("process");
    assert_eq!(applied, 1);
}

#[tokio::test]
async fn tenants_never_see_each_other() {
    let env = env().await;
    scoped(&env, env.finance.create_transaction(income("10.00", "2024-06-01")))
        .await
        .expect("create");

    let other = Uuid::new_v4();
    let seen = TenantContext::scope(ActiveContext::new(other), async {
        env.finance
            .list_transactions(TransactionFilter::default())
            .await
            .expect("list")
    })
    .await;
    assert!(seen.is_empty());
}
