#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Named durable job queues with retry, exponential backoff and a
//! single-shot exhaustion hook, plus interval schedules that run their
//! body under a distributed advisory lock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use atelier_tenancy::ActiveContext;

mod runtime;

pub use crate::runtime::JobRuntime;
pub use crate::runtime::Schedule;
pub use crate::runtime::ScheduledHandler;
pub use crate::runtime::ScheduledOutcome;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),
    #[error("attempt exceeded its {0:?} budget")]
    TimedOut(Duration),
    #[error("no handler registered for queue {0}")]
    NoHandler(String),
    #[error("unknown schedule {0}")]
    UnknownSchedule(String),
    #[error("runtime is shutting down")]
    ShuttingDown,
}

/// Defaults follow the runtime policy: three attempts, exponential
/// backoff from one second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub remove_on_complete: bool,
}

impl JobSpec {
    #[must_use]
    pub fn new(queue: impl Into<String>, name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            queue: queue.into(),
            name: name.into(),
            payload,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            remove_on_complete: true,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    #[must_use]
    pub fn keep_on_complete(mut self) -> Self {
        self.remove_on_complete = false;
        self
    }
}

/// A queued unit of work. The producing tenant context is captured at
/// enqueue time and reinstalled around every attempt, so handlers log and
/// read state under the identity that created the job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub spec: JobSpec,
    pub attempts: u32,
    pub context: Option<ActiveContext>,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobResult<()>;

    /// Fired exactly once when the final attempt has failed. Queue owners
    /// preserve the work here (audit DLQ rows, terminal outbox state,
    /// failed webhook deliveries).
    async fn exhausted(&self, _job: &Job, _error: &JobError) {}
}

/// Backoff ceiling shared by the queues and the outbox relay.
pub const BACKOFF_CAP: Duration = Duration::from_secs(600);

/// `min(base * 2^attempts, cap)` with multiplicative jitter in
/// `[0.5, 1.5)` so synchronized retries spread out.
#[must_use]
pub fn backoff_delay(base: Duration, cap: Duration, attempts: u32) -> Duration {
    backoff_delay_with(base, cap, attempts, rand::rng().random_range(0.5..1.5))
}

#[must_use]
pub fn backoff_delay_with(base: Duration, cap: Duration, attempts: u32, jitter: f64) -> Duration {
    let factor = 2_u32.saturating_pow(attempts.min(20));
    let exponential = base.saturating_mul(factor);
    exponential.min(cap).mul_f64(jitter.clamp(0.5, 1.5))
}
