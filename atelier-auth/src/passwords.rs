use argon2::Algorithm;
use argon2::Argon2;
use argon2::Params;
use argon2::Version;
use argon2::password_hash::PasswordHash;
use argon2::password_hash::PasswordHasher;
use argon2::password_hash::PasswordVerifier;
use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;

use crate::AuthError;
use crate::AuthResult;

pub const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
pub const ARGON2_ITERATIONS: u32 = 3;
pub const ARGON2_PARALLELISM: u32 = 4;

fn hasher() -> AuthResult<Argon2<'static>> {
    let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_ITERATIONS, ARGON2_PARALLELISM, None)
        .map_err(|err| AuthError::Crypto(format!("argon2 params: {err}")))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

pub fn hash_password(password: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    hasher()?
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthError::Crypto(format!("argon2 hash: {err}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordVerdict {
    pub valid: bool,
    /// Set when a legacy bcrypt hash verified: the caller re-stores this
    /// Argon2id hash so the account upgrades on its next login.
    pub upgraded_hash: Option<String>,
}

pub fn verify_password(password: &str, stored: &str) -> AuthResult<PasswordVerdict> {
    if stored.starts_with("$2") {
        let valid = bcrypt::verify(password, stored)
            .map_err(|err| AuthError::Crypto(format!("bcrypt verify: {err}")))?;
        let upgraded_hash = if valid {
            Some(hash_password(password)?)
        } else {
            None
        };
        return Ok(PasswordVerdict {
            valid,
            upgraded_hash,
        });
    }

    let parsed = PasswordHash::new(stored)
        .map_err(|err| AuthError::Crypto(format!("stored hash unparsable: {err}")))?;
    let valid = hasher()?
        .verify_password(password.as_bytes(), &parsed)
        .is_ok();
    Ok(PasswordVerdict {
        valid,
        upgraded_hash: None,
    })
}
