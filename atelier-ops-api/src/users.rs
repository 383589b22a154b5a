use std::fmt::Display;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use atelier_store::ScopedTable;
use atelier_store::SoftDeletable;
use atelier_store::StoreError;
use atelier_store::TenantRow;
use atelier_tenancy::TenantContext;
use atelier_tenancy::TenantId;
use atelier_tenancy::UserId;

use crate::error::ErrorKind;
use crate::error::OpsError;
use crate::error::OpsResult;

const MAX_FAILED_LOGINS: u32 = 5;
const LOCKOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Staff,
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Manager => write!(f, "manager"),
            Role::Staff => write!(f, "staff"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = OpsError;

    fn from_str(raw: &str) -> OpsResult<Self> {
        match raw {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "staff" => Ok(Role::Staff),
            other => Err(OpsError::new(
                ErrorKind::Validation,
                format!("unknown role {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub mfa_enabled: bool,
    /// TOTP secret in its sealed at-rest form.
    pub mfa_secret: Option<String>,
    /// bcrypt hashes; a matching code is removed on use.
    pub mfa_recovery_codes: Vec<String>,
    pub failed_login_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TenantRow for User {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

impl SoftDeletable for User {
    fn set_deleted_at(&mut self, deleted_at: Option<DateTime<Utc>>) {
        self.deleted_at = deleted_at;
    }
}

impl User {
    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

pub struct UserStore {
    users: ScopedTable<User>,
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: ScopedTable::new("users").with_unique("users.tenant_email", |user: &User| {
                Some(format!("{}:{}", user.tenant_id, user.email))
            }),
        }
    }

    pub async fn create(
        &self,
        email: impl Into<String>,
        password_hash: String,
        role: Role,
    ) -> OpsResult<User> {
        let email = email.into().trim().to_ascii_lowercase();
        if !email.contains('@') {
            return Err(OpsError::new(
                ErrorKind::Validation,
                "email must include '@'",
            ));
        }
        let context = TenantContext::require().map_err(StoreError::from)?;
        let user = User {
            id: Uuid::new_v4(),
            tenant_id: context.tenant_id,
            email,
            password_hash,
            role,
            is_active: true,
            mfa_enabled: false,
            mfa_secret: None,
            mfa_recovery_codes: Vec::new(),
            failed_login_attempts: 0,
            locked_until: None,
            created_at: Utc::now(),
            deleted_at: None,
        };
        Ok(self.users.insert(user).await?)
    }

    pub async fn by_email(&self, email: &str) -> OpsResult<Option<User>> {
        let email = email.trim().to_ascii_lowercase();
        Ok(self
            .users
            .find(|user| user.email == email)
            .await?
            .into_iter()
            .next())
    }

    pub async fn get(&self, user_id: UserId) -> OpsResult<User> {
        Ok(self.users.get(user_id).await?)
    }

    pub async fn set_password_hash(&self, user_id: UserId, hash: String) -> OpsResult<User> {
        Ok(self
            .users
            .update(user_id, |user| {
                user.password_hash = hash;
                Ok(())
            })
            .await?)
    }

    /// Failed login: increments the counter and locks the account past
    /// the threshold.
    pub async fn record_login_failure(&self, user_id: UserId) -> OpsResult<User> {
        Ok(self
            .users
            .update(user_id, |user| {
                user.failed_login_attempts += 1;
                if user.failed_login_attempts >= MAX_FAILED_LOGINS {
                    user.locked_until = Some(
                        Utc::now()
                            + chrono::Duration::from_std(LOCKOUT)
                                .unwrap_or_else(|_| chrono::Duration::seconds(900)),
                    );
                }
                Ok(())
            })
            .await?)
    }

    pub async fn record_login_success(&self, user_id: UserId) -> OpsResult<User> {
        Ok(self
            .users
            .update(user_id, |user| {
                user.failed_login_attempts = 0;
                user.locked_until = None;
                Ok(())
            })
            .await?)
    }

    pub async fn enable_mfa(
        &self,
        user_id: UserId,
        sealed_secret: String,
        recovery_code_hashes: Vec<String>,
    ) -> OpsResult<User> {
        Ok(self
            .users
            .update(user_id, move |user| {
                user.mfa_enabled = true;
                user.mfa_secret = Some(sealed_secret);
                user.mfa_recovery_codes = recovery_code_hashes;
                Ok(())
            })
            .await?)
    }

    /// Consumes one recovery code; the stored hash set shrinks on use.
    pub async fn consume_recovery_code(&self, user_id: UserId, code: &str) -> OpsResult<bool> {
        let code = code.to_string();
        let mut consumed = false;
        self.users
            .update(user_id, |user| {
                consumed = atelier_auth::consume_recovery_code(&mut user.mfa_recovery_codes, &code);
                Ok(())
            })
            .await?;
        Ok(consumed)
    }

    pub async fn soft_delete(&self, user_id: UserId) -> OpsResult<User> {
        Ok(self.users.soft_delete(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use super::*;
    use atelier_tenancy::ActiveContext;
    use pretty_assertions::assert_eq;

    async fn scoped<F: Future>(tenant: TenantId, future: F) -> F::Output {
        TenantContext::scope(ActiveContext::new(tenant), future).await
    }

    #[tokio::test]
    async fn email_is_unique_per_tenant() {
        let store = UserStore::new();
        let tenant = Uuid::new_v4();

        scoped(tenant, store.create("crew@example.com", "h".into(), Role::Staff))
            .await
            .expect("create");
        let err = scoped(
            tenant,
            store.create("Crew@Example.com", "h".into(), Role::Staff),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        // The same address is fine under another tenant.
        let other = Uuid::new_v4();
        scoped(other, store.create("crew@example.com", "h".into(), Role::Staff))
            .await
            .expect("create under other tenant");
    }

    #[tokio::test]
    async fn lockout_after_repeated_failures() {
        let store = UserStore::new();
        let tenant = Uuid::new_v4();
        let user = scoped(tenant, store.create("a@b.co", "h".into(), Role::Admin))
            .await
            .expect("create");

        for _ in 0..4 {
            let updated = scoped(tenant, store.record_login_failure(user.id))
                .await
                .expect("failure");
            assert!(!updated.is_locked(Utc::now()));
        }
        let locked = scoped(tenant, store.record_login_failure(user.id))
            .await
            .expect("failure");
        assert!(locked.is_locked(Utc::now()));

        let reset = scoped(tenant, store.record_login_success(user.id))
            .await
            .expect("success");
        assert!(!reset.is_locked(Utc::now()));
        assert_eq!(reset.failed_login_attempts, 0);
    }

    #[tokio::test]
    async fn soft_deleted_users_keep_history_but_leave_reads() {
        let store = UserStore::new();
        let tenant = Uuid::new_v4();
        let user = scoped(tenant, store.create("a@b.co", "h".into(), Role::Staff))
            .await
            .expect("create");

        scoped(tenant, store.soft_delete(user.id))
            .await
            .expect("soft delete");
        assert!(scoped(tenant, store.by_email("a@b.co"))
            .await
            .expect("lookup")
            .is_none());
    }
}
