use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt::Display;
use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use rand::RngCore;

use atelier_telemetry::OpsTelemetry;
use atelier_tenancy::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    Ip,
    User,
    Session,
}

impl Display for IdentityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityKind::Ip => write!(f, "ip"),
            IdentityKind::User => write!(f, "user"),
            IdentityKind::Session => write!(f, "session"),
        }
    }
}

/// The identity a request is limited under. Buckets are keyed by
/// `<kind>:<value>` so different identities never interfere.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub kind: IdentityKind,
    pub value: String,
}

impl Identity {
    #[must_use]
    pub fn bucket_key(&self) -> String {
        format!("rl:{}:{}", self.kind, self.value)
    }

    /// Identity priority: client IP from the trusted proxy chain, then
    /// the authenticated user, then the anonymous session cookie. When
    /// nothing identifies the caller a fresh session id is issued; the
    /// middleware sets it as an HttpOnly cookie.
    #[must_use]
    pub fn resolve(
        client_ip: Option<IpAddr>,
        user: Option<UserId>,
        session: Option<&str>,
    ) -> (Identity, Option<String>) {
        if let Some(ip) = client_ip {
            return (
                Identity {
                    kind: IdentityKind::Ip,
                    value: ip.to_string(),
                },
                None,
            );
        }
        if let Some(user) = user {
            return (
                Identity {
                    kind: IdentityKind::User,
                    value: user.to_string(),
                },
                None,
            );
        }
        match session {
            Some(existing) if !existing.is_empty() => (
                Identity {
                    kind: IdentityKind::Session,
                    value: existing.to_string(),
                },
                None,
            ),
            _ => {
                let fresh = new_session_id();
                (
                    Identity {
                        kind: IdentityKind::Session,
                        value: fresh.clone(),
                    },
                    Some(fresh),
                )
            }
        }
    }
}

/// Opaque random id for the anonymous session cookie.
#[must_use]
pub fn new_session_id() -> String {
    let mut bytes = [0_u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    /// Hits at or above this count inside the window get a delay.
    pub soft_limit: u32,
    /// Hits at or above this count trip the block bucket.
    pub hard_limit: u32,
    pub soft_delay: Duration,
    pub block_for: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            soft_limit: 10,
            hard_limit: 20,
            soft_delay: Duration::from_millis(500),
            block_for: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// Soft threshold: the caller injects this delay before handling.
    Delay(Duration),
    Blocked { retry_after: Duration },
}

#[derive(Default)]
struct Bucket {
    hits: VecDeque<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
}

/// Sliding window over a short-term hit bucket plus a long-term block
/// bucket per identity.
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
    telemetry: OpsTelemetry,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig, telemetry: OpsTelemetry) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            telemetry,
        }
    }

    pub fn check(&self, identity: &Identity, now: DateTime<Utc>) -> Admission {
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets.entry(identity.bucket_key()).or_default();

        if let Some(blocked_until) = bucket.blocked_until {
            if blocked_until > now {
                let retry_after = (blocked_until - now)
                    .to_std()
                    .unwrap_or(self.config.block_for);
                return Admission::Blocked { retry_after };
            }
            bucket.blocked_until = None;
        }

        let horizon = now - window;
        while bucket.hits.front().is_some_and(|hit| *hit < horizon) {
            bucket.hits.pop_front();
        }
        bucket.hits.push_back(now);
        let count = bucket.hits.len() as u32;

        if count >= self.config.hard_limit {
            bucket.blocked_until = Some(
                now + chrono::Duration::from_std(self.config.block_for)
                    .unwrap_or_else(|_| chrono::Duration::seconds(900)),
            );
            self.telemetry.record_rate_limit_block();
            Admission::Blocked {
                retry_after: self.config.block_for,
            }
        } else if count >= self.config.soft_limit {
            self.telemetry.record_rate_limit_delay();
            Admission::Delay(self.config.soft_delay)
        } else {
            Admission::Allow
        }
    }
}
