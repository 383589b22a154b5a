use std::collections::HashMap;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use jsonwebtoken::Algorithm;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::EncodingKey;
use jsonwebtoken::Header;
use jsonwebtoken::Validation;
use rand::RngCore;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tokio::sync::RwLock;

use atelier_tenancy::TenantId;
use atelier_tenancy::UserId;

use crate::AuthError;
use crate::AuthResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPurpose {
    Access,
    /// Short-lived credential issued after the password check when MFA
    /// is still owed; exchanged for a full access token.
    StepUp,
}

/// Tenant identity derives exclusively from these claims, never from a
/// request body or query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: UserId,
    pub tenant_id: TenantId,
    pub role: String,
    pub mfa_passed: bool,
    pub purpose: TokenPurpose,
    pub iat: i64,
    pub exp: i64,
}

pub struct TokenService {
    secret: Vec<u8>,
    access_ttl: Duration,
    step_up_ttl: Duration,
}

impl TokenService {
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            access_ttl: Duration::from_secs(15 * 60),
            step_up_ttl: Duration::from_secs(5 * 60),
        }
    }

    #[must_use]
    pub fn with_ttls(mut self, access_ttl: Duration, step_up_ttl: Duration) -> Self {
        self.access_ttl = access_ttl;
        self.step_up_ttl = step_up_ttl;
        self
    }

    fn issue(
        &self,
        sub: UserId,
        tenant_id: TenantId,
        role: &str,
        mfa_passed: bool,
        purpose: TokenPurpose,
        ttl: Duration,
    ) -> AuthResult<String> {
        let now = Utc::now();
        let claims = AccessClaims {
            sub,
            tenant_id,
            role: role.to_string(),
            mfa_passed,
            purpose,
            iat: now.timestamp(),
            exp: (now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()))
                .timestamp(),
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|err| AuthError::Crypto(format!("token encode: {err}")))
    }

    pub fn issue_access(
        &self,
        sub: UserId,
        tenant_id: TenantId,
        role: &str,
        mfa_passed: bool,
    ) -> AuthResult<String> {
        self.issue(
            sub,
            tenant_id,
            role,
            mfa_passed,
            TokenPurpose::Access,
            self.access_ttl,
        )
    }

    pub fn issue_step_up(&self, sub: UserId, tenant_id: TenantId, role: &str) -> AuthResult<String> {
        self.issue(
            sub,
            tenant_id,
            role,
            false,
            TokenPurpose::StepUp,
            self.step_up_ttl,
        )
    }

    /// HS256 only: any other algorithm in the header is rejected before
    /// signature verification.
    fn decode(&self, token: &str) -> AuthResult<AccessClaims> {
        let validation = Validation::new(Algorithm::HS256);
        jsonwebtoken::decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|err| AuthError::Unauthenticated(format!("invalid token: {err}")))
    }

    pub fn verify_access(&self, token: &str) -> AuthResult<AccessClaims> {
        let claims = self.decode(token)?;
        if claims.purpose != TokenPurpose::Access {
            return Err(AuthError::Unauthenticated(
                "step-up token cannot access resources".into(),
            ));
        }
        Ok(claims)
    }

    pub fn verify_step_up(&self, token: &str) -> AuthResult<AccessClaims> {
        let claims = self.decode(token)?;
        if claims.purpose != TokenPurpose::StepUp {
            return Err(AuthError::Unauthenticated(
                "expected a step-up token".into(),
            ));
        }
        Ok(claims)
    }
}

/// Server-side record of a refresh token: only the hash is stored, the
/// opaque value is returned to the caller exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshToken {
    pub token_hash: String,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

fn hash_opaque(opaque: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(opaque.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn new_opaque() -> String {
    let mut bytes = [0_u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct RefreshTokenStore {
    tokens: RwLock<HashMap<String, RefreshToken>>,
    ttl: Duration,
}

impl RefreshTokenStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Issues a fresh opaque refresh token for the user.
    pub async fn issue(&self, user_id: UserId, tenant_id: TenantId) -> AuthResult<String> {
        let opaque = new_opaque();
        let record = RefreshToken {
            token_hash: hash_opaque(&opaque),
            user_id,
            tenant_id,
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero()),
            revoked_at: None,
        };
        let mut tokens = self.tokens.write().await;
        tokens.insert(record.token_hash.clone(), record);
        Ok(opaque)
    }

    /// Rotation: the presented token is revoked and a replacement issued
    /// for the same identity. Lookup is by hash under the tenant.
    pub async fn rotate(
        &self,
        presented: &str,
        tenant_id: TenantId,
    ) -> AuthResult<(String, UserId)> {
        let hash = hash_opaque(presented);
        let user_id = {
            let mut tokens = self.tokens.write().await;
            let record = tokens
                .get_mut(&hash)
                .ok_or_else(|| AuthError::Unauthenticated("unknown refresh token".into()))?;
            if record.tenant_id != tenant_id {
                return Err(AuthError::Unauthenticated("unknown refresh token".into()));
            }
            if record.revoked_at.is_some() {
                return Err(AuthError::Unauthenticated("refresh token revoked".into()));
            }
            if record.expires_at <= Utc::now() {
                return Err(AuthError::Unauthenticated("refresh token expired".into()));
            }
            record.revoked_at = Some(Utc::now());
            record.user_id
        };

        let replacement = self.issue(user_id, tenant_id).await?;
        Ok((replacement, user_id))
    }

    pub async fn revoke(&self, presented: &str) {
        let hash = hash_opaque(presented);
        let mut tokens = self.tokens.write().await;
        if let Some(record) = tokens.get_mut(&hash) {
            record.revoked_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn service() -> TokenService {
        TokenService::new("a-test-signing-secret-of-32-chars!!")
    }

    #[test]
    fn access_token_round_trips() {
        let service = service();
        let user = Uuid::new_v4();
        let tenant = Uuid::new_v4();

        let token = service
            .issue_access(user, tenant, "admin", true)
            .expect("issue");
        let claims = service.verify_access(&token).expect("verify");
        assert_eq!(claims.sub, user);
        assert_eq!(claims.tenant_id, tenant);
        assert_eq!(claims.role, "admin");
        assert!(claims.mfa_passed);
    }

    #[test]
    fn step_up_token_is_not_an_access_token() {
        let service = service();
        let token = service
            .issue_step_up(Uuid::new_v4(), Uuid::new_v4(), "admin")
            .expect("issue");

        assert!(matches!(
            service.verify_access(&token),
            Err(AuthError::Unauthenticated(_))
        ));
        let claims = service.verify_step_up(&token).expect("verify");
        assert!(!claims.mfa_passed);
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let token = service()
            .issue_access(Uuid::new_v4(), Uuid::new_v4(), "admin", false)
            .expect("issue");
        let other = TokenService::new("a-different-signing-secret-32chars");
        assert!(matches!(
            other.verify_access(&token),
            Err(AuthError::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn refresh_rotation_revokes_the_old_token() {
        let store = RefreshTokenStore::new(Duration::from_secs(3600));
        let user = Uuid::new_v4();
        let tenant = Uuid::new_v4();

        let first = store.issue(user, tenant).await.expect("issue");
        let (second, rotated_user) = store.rotate(&first, tenant).await.expect("rotate");
        assert_eq!(rotated_user, user);
        assert_ne!(first, second);

        // The consumed token is dead.
        assert!(matches!(
            store.rotate(&first, tenant).await,
            Err(AuthError::Unauthenticated(_))
        ));
        // The replacement still rotates.
        store.rotate(&second, tenant).await.expect("rotate again");
    }

    #[tokio::test]
    async fn refresh_is_scoped_to_its_tenant() {
        let store = RefreshTokenStore::new(Duration::from_secs(3600));
        let opaque = store
            .issue(Uuid::new_v4(), Uuid::new_v4())
            .await
            .expect("issue");
        assert!(matches!(
            store.rotate(&opaque, Uuid::new_v4()).await,
            Err(AuthError::Unauthenticated(_))
        ));
    }
}
