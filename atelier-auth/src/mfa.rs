use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use totp_rs::Algorithm;
use totp_rs::TOTP;

use crate::AuthError;
use crate::AuthResult;

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP: u64 = 30;
const SECRET_BYTES: usize = 20;
const RECOVERY_CODES: usize = 8;

/// Result of enrolling a user in MFA. The plaintext recovery codes are
/// shown exactly once; only their bcrypt hashes are stored.
#[derive(Debug, Clone)]
pub struct MfaEnrollment {
    /// Sealed TOTP secret as stored at rest. Envelope encryption is the
    /// configured secret manager's job; this is the storage form the
    /// rest of the core passes around.
    pub sealed_secret: String,
    pub recovery_codes: Vec<String>,
    pub recovery_code_hashes: Vec<String>,
}

fn seal(secret: &[u8]) -> String {
    BASE64.encode(secret)
}

fn unseal(sealed: &str) -> AuthResult<Vec<u8>> {
    BASE64
        .decode(sealed)
        .map_err(|err| AuthError::Crypto(format!("sealed secret undecodable: {err}")))
}

fn totp_for(sealed_secret: &str) -> AuthResult<TOTP> {
    let secret = unseal(sealed_secret)?;
    TOTP::new(Algorithm::SHA1, TOTP_DIGITS, TOTP_SKEW, TOTP_STEP, secret)
        .map_err(|err| AuthError::Crypto(format!("totp setup: {err}")))
}

pub fn enroll_mfa() -> AuthResult<MfaEnrollment> {
    enroll_mfa_with_cost(bcrypt::DEFAULT_COST)
}

/// Test hook: recovery-code hashing cost is tunable because the default
/// cost is deliberately slow.
pub fn enroll_mfa_with_cost(cost: u32) -> AuthResult<MfaEnrollment> {
    let mut secret = [0_u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut secret);

    let mut recovery_codes = Vec::with_capacity(RECOVERY_CODES);
    let mut recovery_code_hashes = Vec::with_capacity(RECOVERY_CODES);
    for _ in 0..RECOVERY_CODES {
        let mut code_bytes = [0_u8; 5];
        rand::rng().fill_bytes(&mut code_bytes);
        let code: String = code_bytes.iter().map(|b| format!("{b:02x}")).collect();
        let hash = bcrypt::hash(&code, cost)
            .map_err(|err| AuthError::Crypto(format!("recovery hash: {err}")))?;
        recovery_codes.push(code);
        recovery_code_hashes.push(hash);
    }

    Ok(MfaEnrollment {
        sealed_secret: seal(&secret),
        recovery_codes,
        recovery_code_hashes,
    })
}

pub fn verify_totp(sealed_secret: &str, code: &str, at_unix: u64) -> AuthResult<bool> {
    Ok(totp_for(sealed_secret)?.check(code, at_unix))
}

/// Current code for a sealed secret; used by tests and the enrollment
/// confirmation flow.
pub fn generate_totp(sealed_secret: &str, at_unix: u64) -> AuthResult<String> {
    Ok(totp_for(sealed_secret)?.generate(at_unix))
}

/// One-time recovery code check: a matching hash is removed from the
/// set so the code can never be replayed.
pub fn consume_recovery_code(hashes: &mut Vec<String>, code: &str) -> bool {
    let position = hashes
        .iter()
        .position(|hash| bcrypt::verify(code, hash).unwrap_or(false));
    match position {
        Some(index) => {
            hashes.remove(index);
            true
        }
        None => false,
    }
}
