use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Datelike;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use atelier_audit_chain::AuditChainService;
use atelier_audit_chain::AuditDraft;
use atelier_auth::Admission;
use atelier_auth::Identity;
use atelier_auth::RateLimitConfig;
use atelier_auth::RefreshTokenStore;
use atelier_auth::SlidingWindowLimiter;
use atelier_auth::TokenService;
use atelier_auth::enroll_mfa;
use atelier_auth::hash_password;
use atelier_auth::verify_password;
use atelier_auth::verify_totp;
use atelier_finance::FinanceService;
use atelier_finance::FixedRates;
use atelier_finance::PayoutGateway;
use atelier_jobs::JobError;
use atelier_jobs::JobResult;
use atelier_jobs::JobRuntime;
use atelier_jobs::Schedule;
use atelier_jobs::ScheduledHandler;
use atelier_outbox::OutboxRelay;
use atelier_outbox::OutboxStore;
use atelier_outbox::RelayConfig;
use atelier_pipelines::EMAIL_QUEUE;
use atelier_pipelines::EmailWorker;
use atelier_pipelines::Mailer;
use atelier_pipelines::TemplateCatalog;
use atelier_pipelines::WEBHOOK_QUEUE;
use atelier_pipelines::WebhookDispatcher;
use atelier_pipelines::WebhookHub;
use atelier_pipelines::WebhookTransport;
use atelier_pipelines::WebhookWorker;
use atelier_store::AdvisoryLocks;
use atelier_store::RowLocks;
use atelier_telemetry::OpsTelemetry;
use atelier_telemetry::correlation_id_from;
use atelier_tenancy::ActiveContext;
use atelier_tenancy::CreateTenantRequest;
use atelier_tenancy::InMemoryTenancyService;
use atelier_tenancy::TenancyService;
use atelier_tenancy::TenantContext;
use atelier_tenancy::TenantId;
use atelier_tenancy::UserId;

use crate::config::OpsConfig;
use crate::error::ErrorKind;
use crate::error::OpsError;
use crate::error::OpsResult;
use crate::users::Role;
use crate::users::User;
use crate::users::UserStore;

/// External collaborators the core composes against.
pub struct OpsDeps {
    pub mailer: Arc<dyn Mailer>,
    pub webhook_transport: Arc<dyn WebhookTransport>,
    pub gateway: Arc<dyn PayoutGateway>,
    pub templates: TemplateCatalog,
    pub rate_limits: RateLimitConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInput {
    pub tenant_slug: String,
    pub tenant_name: String,
    pub base_currency: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Tokens(AuthTokens),
    /// Password accepted but MFA is owed: exchange the step-up token
    /// plus a TOTP or recovery code for full tokens.
    MfaRequired { step_up_token: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserView {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub email: String,
    pub role: String,
    pub mfa_enabled: bool,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            tenant_id: user.tenant_id,
            email: user.email,
            role: user.role.to_string(),
            mfa_enabled: user.mfa_enabled,
        }
    }
}

/// Recovery codes are shown exactly once, at enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfaSetup {
    pub recovery_codes: Vec<String>,
    pub sealed_secret: String,
}

/// Per-request metadata the admission path works from.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub correlation_id: Option<String>,
    pub client_ip: Option<IpAddr>,
    pub method: String,
    pub path: String,
}

/// Composition root for the operational core: one instance wires the
/// tenancy catalog, the stores, the queues, the pipelines and the
/// scheduled passes together.
pub struct OpsBackend {
    pub config: OpsConfig,
    pub tenancy: Arc<dyn TenancyService>,
    pub users: Arc<UserStore>,
    pub finance: Arc<FinanceService>,
    pub audit: Arc<AuditChainService>,
    pub outbox: Arc<OutboxStore>,
    pub relay: Arc<OutboxRelay>,
    pub webhooks: Arc<WebhookHub>,
    pub jobs: Arc<JobRuntime>,
    pub rates: Arc<FixedRates>,
    pub telemetry: OpsTelemetry,
    tokens: TokenService,
    refresh: RefreshTokenStore,
    limiter: SlidingWindowLimiter,
    gateway: Arc<dyn PayoutGateway>,
}

struct RelayPump {
    relay: Arc<OutboxRelay>,
}

#[async_trait]
impl ScheduledHandler for RelayPump {
    async fn run(&self) -> JobResult<()> {
        self.relay.run_guarded(Utc::now()).await;
        Ok(())
    }
}

fn is_last_day_of_month(date: NaiveDate) -> bool {
    date.succ_opt().is_none_or(|next| next.month() != date.month())
}

async fn active_tenants(tenancy: &Arc<dyn TenancyService>) -> JobResult<Vec<TenantId>> {
    tenancy
        .active_tenant_ids()
        .await
        .map_err(|err| JobError::Failed(err.to_string()))
}

struct PayrollSweep {
    tenancy: Arc<dyn TenancyService>,
    finance: Arc<FinanceService>,
}

#[async_trait]
impl ScheduledHandler for PayrollSweep {
    async fn run(&self) -> JobResult<()> {
        let today = Utc::now().date_naive();
        if !is_last_day_of_month(today) {
            return Ok(());
        }
        let period = format!("{:04}-{:02}", today.year(), today.month());
        for tenant_id in active_tenants(&self.tenancy).await? {
            let finance = Arc::clone(&self.finance);
            let period = period.clone();
            let outcome = TenantContext::scope(ActiveContext::new(tenant_id), async move {
                finance.run_payroll(&period).await
            })
            .await;
            if let Err(err) = outcome {
                warn!(%tenant_id, error = %err, "payroll sweep failed for tenant");
            }
        }
        Ok(())
    }
}

struct RecurringSweep {
    tenancy: Arc<dyn TenancyService>,
    finance: Arc<FinanceService>,
}

#[async_trait]
impl ScheduledHandler for RecurringSweep {
    async fn run(&self) -> JobResult<()> {
        let today = Utc::now().date_naive();
        for tenant_id in active_tenants(&self.tenancy).await? {
            let finance = Arc::clone(&self.finance);
            let outcome = TenantContext::scope(ActiveContext::new(tenant_id), async move {
                finance.process_recurring(today).await
            })
            .await;
            if let Err(err) = outcome {
                warn!(%tenant_id, error = %err, "recurring sweep failed for tenant");
            }
        }
        Ok(())
    }
}

struct SettlementSweep {
    tenancy: Arc<dyn TenancyService>,
    finance: Arc<FinanceService>,
    gateway: Arc<dyn PayoutGateway>,
}

#[async_trait]
impl ScheduledHandler for SettlementSweep {
    async fn run(&self) -> JobResult<()> {
        for tenant_id in active_tenants(&self.tenancy).await? {
            let finance = Arc::clone(&self.finance);
            let gateway = Arc::clone(&self.gateway);
            let outcome = TenantContext::scope(ActiveContext::new(tenant_id), async move {
                finance.process_pending_payouts(gateway.as_ref()).await
            })
            .await;
            if let Err(err) = outcome {
                warn!(%tenant_id, error = %err, "payout settlement failed for tenant");
            }
        }
        Ok(())
    }
}

impl OpsBackend {
    pub fn build(config: OpsConfig, deps: OpsDeps) -> OpsResult<Arc<Self>> {
        config
            .validate()
            .map_err(|err| OpsError::new(ErrorKind::Validation, err.to_string()))?;

        let advisory = AdvisoryLocks::new();
        let locks = RowLocks::new();
        let telemetry = OpsTelemetry::new();
        let jobs = JobRuntime::new(Arc::clone(&advisory), telemetry.clone());
        let audit = AuditChainService::new(Arc::clone(&jobs), telemetry.clone());
        let outbox = Arc::new(OutboxStore::new());
        let tenancy: Arc<dyn TenancyService> = Arc::new(InMemoryTenancyService::new());
        let rates = Arc::new(FixedRates::new());
        let webhooks = Arc::new(WebhookHub::new());

        let finance = FinanceService::new(
            Arc::clone(&tenancy),
            Arc::clone(&rates) as Arc<dyn atelier_finance::ExchangeRates>,
            Arc::clone(&outbox),
            Arc::clone(&audit),
            locks,
            Arc::clone(&advisory),
            telemetry.clone(),
        );

        jobs.register(
            EMAIL_QUEUE,
            EmailWorker::new(
                Arc::new(deps.templates),
                deps.mailer,
                Arc::clone(&audit),
            ),
        );
        jobs.register(
            WEBHOOK_QUEUE,
            WebhookWorker::new(
                Arc::clone(&webhooks),
                deps.webhook_transport,
                telemetry.clone(),
            ),
        );

        let dispatcher = WebhookDispatcher::new(Arc::clone(&webhooks), Arc::clone(&jobs));
        let relay = Arc::new(
            OutboxRelay::new(
                Arc::clone(&outbox),
                Arc::clone(&advisory),
                telemetry.clone(),
                RelayConfig::default(),
            )
            .with_dispatcher("transaction.created", dispatcher.clone())
            .with_dispatcher("payout.created", dispatcher.clone())
            .with_dispatcher("booking.settled", dispatcher),
        );

        let backend = Arc::new(Self {
            tokens: TokenService::new(config.jwt_secret.clone()),
            refresh: RefreshTokenStore::new(Duration::from_secs(30 * 24 * 3600)),
            limiter: SlidingWindowLimiter::new(deps.rate_limits, telemetry.clone()),
            gateway: deps.gateway,
            config,
            tenancy,
            users: Arc::new(UserStore::new()),
            finance,
            audit,
            outbox,
            relay,
            webhooks,
            jobs,
            rates,
            telemetry,
        });
        backend.register_schedules();
        Ok(backend)
    }

    fn register_schedules(&self) {
        self.jobs.register_scheduled(
            Schedule {
                name: "outbox-relay".into(),
                every: Duration::from_secs(5),
                lock_key: "schedule:outbox-relay".into(),
            },
            Arc::new(RelayPump {
                relay: Arc::clone(&self.relay),
            }),
        );
        self.jobs.register_scheduled(
            Schedule {
                name: "payroll".into(),
                every: Duration::from_secs(24 * 3600),
                lock_key: "schedule:payroll".into(),
            },
            Arc::new(PayrollSweep {
                tenancy: Arc::clone(&self.tenancy),
                finance: Arc::clone(&self.finance),
            }),
        );
        self.jobs.register_scheduled(
            Schedule {
                name: "recurring-transactions".into(),
                every: Duration::from_secs(24 * 3600),
                lock_key: "schedule:recurring-transactions".into(),
            },
            Arc::new(RecurringSweep {
                tenancy: Arc::clone(&self.tenancy),
                finance: Arc::clone(&self.finance),
            }),
        );
        self.jobs.register_scheduled(
            Schedule {
                name: "payout-settlement".into(),
                every: Duration::from_secs(60),
                lock_key: "schedule:payout-settlement".into(),
            },
            Arc::new(SettlementSweep {
                tenancy: Arc::clone(&self.tenancy),
                finance: Arc::clone(&self.finance),
                gateway: Arc::clone(&self.gateway),
            }),
        );
    }

    // ---- admission ----------------------------------------------------------

    async fn admit(&self, meta: &RequestMeta, user: Option<UserId>) -> OpsResult<()> {
        let (identity, _issued_cookie) = Identity::resolve(meta.client_ip, user, None);
        match self.limiter.check(&identity, Utc::now()) {
            Admission::Allow => Ok(()),
            Admission::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Admission::Blocked { retry_after } => Err(OpsError::rate_limited(retry_after)),
        }
    }

    /// Request wrapper: admit, authenticate, install the tenant context
    /// (with the correlation id) and run the operation inside it.
    pub async fn handle<T, Fut>(
        &self,
        meta: RequestMeta,
        access_token: Option<&str>,
        operation: impl FnOnce() -> Fut,
    ) -> OpsResult<T>
    where
        Fut: Future<Output = OpsResult<T>>,
    {
        let claims = access_token
            .map(|token| self.tokens.verify_access(token))
            .transpose()?;
        self.admit(&meta, claims.as_ref().map(|claims| claims.sub))
            .await?;
        self.telemetry.record_request();

        let correlation_id = correlation_id_from(meta.correlation_id.as_deref());
        match claims {
            Some(claims) => {
                let context = ActiveContext::new(claims.tenant_id)
                    .with_user(claims.sub)
                    .with_correlation(correlation_id);
                TenantContext::scope(context, operation()).await
            }
            None => operation().await,
        }
    }

    // ---- auth flows ---------------------------------------------------------

    async fn issue_tokens(&self, user: &User, mfa_passed: bool) -> OpsResult<AuthTokens> {
        let access_token =
            self.tokens
                .issue_access(user.id, user.tenant_id, &user.role.to_string(), mfa_passed)?;
        let refresh_token = self.refresh.issue(user.id, user.tenant_id).await?;
        Ok(AuthTokens {
            access_token,
            refresh_token,
        })
    }

    /// Bootstraps a tenant with its admin user and returns a token pair.
    // endpoint: POST /auth/register
    // public-endpoint: auth bootstrap, nothing to authenticate against yet
    pub async fn register(&self, input: RegisterInput) -> OpsResult<AuthTokens> {
        if input.password.len() < 12 {
            return Err(OpsError::new(
                ErrorKind::Validation,
                "password must be at least 12 characters",
            ));
        }
        let tenant = self
            .tenancy
            .create_tenant(CreateTenantRequest {
                slug: input.tenant_slug,
                name: input.tenant_name,
                base_currency: input.base_currency,
            })
            .await?;

        let password_hash = hash_password(&input.password)?;
        TenantContext::scope(ActiveContext::new(tenant.id), async {
            let user = self
                .users
                .create(input.email, password_hash, Role::Admin)
                .await?;
            self.audit
                .log(
                    AuditDraft::action("USER_REGISTERED")
                        .entity("user", user.id.to_string())
                        .values(
                            serde_json::Value::Null,
                            serde_json::json!({ "email": user.email, "role": "admin" }),
                        ),
                )
                .await;
            self.issue_tokens(&user, true).await
        })
        .await
    }

    // endpoint: POST /auth/login
    // public-endpoint: credential exchange is the authentication
    pub async fn login(
        &self,
        tenant_slug: &str,
        email: &str,
        password: &str,
        meta: &RequestMeta,
    ) -> OpsResult<LoginOutcome> {
        self.admit(meta, None).await?;

        let invalid = || OpsError::new(ErrorKind::Unauthenticated, "invalid credentials");
        let tenant = self
            .tenancy
            .get_by_slug(tenant_slug)
            .await
            .map_err(|_| invalid())?;

        TenantContext::scope(ActiveContext::new(tenant.id), async {
            let user = self.users.by_email(email).await?.ok_or_else(invalid)?;
            if !user.is_active {
                return Err(invalid());
            }
            if user.is_locked(Utc::now()) {
                return Err(OpsError::new(
                    ErrorKind::Unauthenticated,
                    "account temporarily locked",
                ));
            }

            let verdict = verify_password(password, &user.password_hash)?;
            if !verdict.valid {
                self.users.record_login_failure(user.id).await?;
                return Err(invalid());
            }
            if let Some(upgraded) = verdict.upgraded_hash {
                self.users.set_password_hash(user.id, upgraded).await?;
            }
            self.users.record_login_success(user.id).await?;
            self.audit
                .log(
                    AuditDraft::action("USER_LOGIN")
                        .entity("user", user.id.to_string())
                        .values(
                            serde_json::Value::Null,
                            serde_json::json!({ "mfa_required": user.mfa_enabled }),
                        ),
                )
                .await;

            if user.mfa_enabled {
                let step_up_token =
                    self.tokens
                        .issue_step_up(user.id, user.tenant_id, &user.role.to_string())?;
                Ok(LoginOutcome::MfaRequired { step_up_token })
            } else {
                Ok(LoginOutcome::Tokens(self.issue_tokens(&user, true).await?))
            }
        })
        .await
    }

    /// Exchanges a step-up token plus a TOTP or one-time recovery code
    /// for full tokens.
    // endpoint: POST /auth/mfa/verify
    pub async fn verify_mfa(&self, step_up_token: &str, code: &str) -> OpsResult<AuthTokens> {
        let claims = self.tokens.verify_step_up(step_up_token)?;
        let context = ActiveContext::new(claims.tenant_id).with_user(claims.sub);
        TenantContext::scope(context, async {
            let user = self.users.get(claims.sub).await?;
            let sealed = user
                .mfa_secret
                .clone()
                .ok_or_else(|| OpsError::new(ErrorKind::Unauthenticated, "mfa not enrolled"))?;

            let now_unix = Utc::now().timestamp().max(0) as u64;
            let accepted = verify_totp(&sealed, code, now_unix)?
                || self.users.consume_recovery_code(user.id, code).await?;
            if !accepted {
                self.users.record_login_failure(user.id).await?;
                return Err(OpsError::new(
                    ErrorKind::Unauthenticated,
                    "invalid mfa code",
                ));
            }

            self.users.record_login_success(user.id).await?;
            self.audit
                .log(
                    AuditDraft::action("MFA_VERIFIED")
                        .entity("user", user.id.to_string())
                        .values(serde_json::Value::Null, serde_json::Value::Null),
                )
                .await;
            self.issue_tokens(&user, true).await
        })
        .await
    }

    /// Rotates a refresh token: the presented token is revoked, a new
    /// pair is issued.
    // endpoint: POST /auth/refresh
    // public-endpoint: authenticates by the refresh token itself
    pub async fn refresh(&self, tenant_slug: &str, refresh_token: &str) -> OpsResult<AuthTokens> {
        let tenant = self
            .tenancy
            .get_by_slug(tenant_slug)
            .await
            .map_err(|_| OpsError::new(ErrorKind::Unauthenticated, "unknown refresh token"))?;
        let (new_refresh, user_id) = self.refresh.rotate(refresh_token, tenant.id).await?;

        TenantContext::scope(ActiveContext::new(tenant.id), async {
            let user = self.users.get(user_id).await?;
            let access_token = self.tokens.issue_access(
                user.id,
                user.tenant_id,
                &user.role.to_string(),
                true,
            )?;
            Ok(AuthTokens {
                access_token,
                refresh_token: new_refresh,
            })
        })
        .await
    }

    // endpoint: GET /auth/me
    pub async fn me(&self, access_token: &str) -> OpsResult<UserView> {
        let claims = self.tokens.verify_access(access_token)?;
        TenantContext::scope(ActiveContext::new(claims.tenant_id), async {
            Ok(UserView::from(self.users.get(claims.sub).await?))
        })
        .await
    }

    /// Enrolls the authenticated user in MFA. The recovery codes are
    /// returned exactly once.
    // endpoint: POST /auth/mfa/enroll
    pub async fn enable_mfa(&self, access_token: &str) -> OpsResult<MfaSetup> {
        let claims = self.tokens.verify_access(access_token)?;
        TenantContext::scope(ActiveContext::new(claims.tenant_id), async {
            let enrollment = enroll_mfa()?;
            self.users
                .enable_mfa(
                    claims.sub,
                    enrollment.sealed_secret.clone(),
                    enrollment.recovery_code_hashes,
                )
                .await?;
            self.audit
                .log(
                    AuditDraft::action("MFA_ENROLLED")
                        .entity("user", claims.sub.to_string())
                        .values(serde_json::Value::Null, serde_json::Value::Null),
                )
                .await;
            Ok(MfaSetup {
                recovery_codes: enrollment.recovery_codes,
                sealed_secret: enrollment.sealed_secret,
            })
        })
        .await
    }
}
