#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Authentication primitives and the rate-limit guard: Argon2id password
//! storage with legacy bcrypt upgrade, HS256 access and step-up tokens,
//! rotating refresh tokens, TOTP/recovery-code MFA, sliding-window rate
//! limiting and the request fingerprint checks.

use std::time::Duration;

use thiserror::Error;

mod guard;
mod mfa;
mod passwords;
mod rate_limit;
mod tokens;

pub use crate::guard::AuthKind;
pub use crate::guard::RequestFingerprint;
pub use crate::guard::admit_fingerprint;
pub use crate::mfa::MfaEnrollment;
pub use crate::mfa::consume_recovery_code;
pub use crate::mfa::enroll_mfa;
pub use crate::mfa::enroll_mfa_with_cost;
pub use crate::mfa::generate_totp;
pub use crate::mfa::verify_totp;
pub use crate::passwords::PasswordVerdict;
pub use crate::passwords::hash_password;
pub use crate::passwords::verify_password;
pub use crate::rate_limit::Admission;
pub use crate::rate_limit::Identity;
pub use crate::rate_limit::IdentityKind;
pub use crate::rate_limit::RateLimitConfig;
pub use crate::rate_limit::SlidingWindowLimiter;
pub use crate::rate_limit::new_session_id;
pub use crate::tokens::AccessClaims;
pub use crate::tokens::RefreshToken;
pub use crate::tokens::RefreshTokenStore;
pub use crate::tokens::TokenPurpose;
pub use crate::tokens::TokenService;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("crypto failure: {0}")]
    Crypto(String),
}
