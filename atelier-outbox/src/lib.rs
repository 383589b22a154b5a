#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Transactional outbox. Producers stage domain events in the same
//! commit as the state they describe; a single relay replica publishes
//! them to registered dispatchers at least once, with exponential
//! backoff and a terminal failure state that preserves the row.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use atelier_jobs::backoff_delay;
use atelier_store::AdvisoryLocks;
use atelier_store::ScopedTable;
use atelier_store::StoreError;
use atelier_store::TenantRow;
use atelier_telemetry::OpsTelemetry;
use atelier_tenancy::ActiveContext;
use atelier_tenancy::TenantContext;
use atelier_tenancy::TenantId;

/// Advisory lock key electing the single relay replica.
pub const RELAY_LOCK: &str = "outbox:relay";

pub type OutboxResult<T> = Result<T, OutboxError>;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
    #[error("no dispatcher registered for {0}")]
    NoDispatcher(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Terminal: attempts exhausted. The row is kept, never deleted.
    pub failed: bool,
}

impl TenantRow for OutboxEvent {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

impl OutboxEvent {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.published_at.is_none()
            && !self.failed
            && self.next_attempt_at.is_none_or(|due| due <= now)
    }
}

/// Staging table. `append` runs inside the producer's commit scope; the
/// claim methods are the relay's skip-locked scan.
pub struct OutboxStore {
    events: ScopedTable<OutboxEvent>,
    claimed: StdMutex<HashSet<Uuid>>,
}

impl Default for OutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboxStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: ScopedTable::new("outbox_events"),
            claimed: StdMutex::new(HashSet::new()),
        }
    }

    /// Stages an event for the ambient tenant.
    pub async fn append(
        &self,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> OutboxResult<OutboxEvent> {
        let context = TenantContext::require().map_err(StoreError::from)?;
        let event = OutboxEvent {
            id: Uuid::new_v4(),
            tenant_id: context.tenant_id,
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
            published_at: None,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
            failed: false,
        };
        Ok(self.events.insert(event).await?)
    }

    /// Claims up to `limit` due rows across tenants, skipping rows held
    /// by a concurrent claimant. Claims release when the row is marked.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Vec<OutboxEvent> {
        let mut due = self.events.unscoped_scan(|event| event.is_due(now)).await;
        due.sort_by_key(|event| event.created_at);

        let mut claimed = self
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        due.retain(|event| !claimed.contains(&event.id));
        due.truncate(limit);
        for event in &due {
            claimed.insert(event.id);
        }
        due
    }

    fn release(&self, id: Uuid) {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Marks a claimed row delivered. Runs under the event's tenant scope.
    pub async fn mark_published(&self, id: Uuid, now: DateTime<Utc>) -> OutboxResult<OutboxEvent> {
        let updated = self
            .events
            .update(id, |event| {
                event.published_at = Some(now);
                event.last_error = None;
                Ok(())
            })
            .await;
        self.release(id);
        Ok(updated?)
    }

    /// Records a failed publish attempt and schedules the retry.
    pub async fn mark_attempt_failed(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> OutboxResult<OutboxEvent> {
        let updated = self
            .events
            .update(id, |event| {
                event.attempts += 1;
                event.next_attempt_at = Some(retry_at);
                event.last_error = Some(error.to_string());
                Ok(())
            })
            .await;
        self.release(id);
        Ok(updated?)
    }

    /// Terminal failure: the row stays for operators, the relay stops
    /// touching it.
    pub async fn mark_exhausted(&self, id: Uuid, error: &str) -> OutboxResult<OutboxEvent> {
        let updated = self
            .events
            .update(id, |event| {
                event.attempts += 1;
                event.failed = true;
                event.next_attempt_at = None;
                event.last_error = Some(error.to_string());
                Ok(())
            })
            .await;
        self.release(id);
        Ok(updated?)
    }

    /// Rollback compensation: removes an event staged by a commit that
    /// subsequently failed. Published rows are never discarded.
    pub async fn discard(&self, id: Uuid) -> OutboxResult<()> {
        self.events.remove(id).await?;
        self.release(id);
        Ok(())
    }

    /// Events staged by the ambient tenant, oldest first.
    pub async fn events_for_tenant(&self) -> OutboxResult<Vec<OutboxEvent>> {
        let mut events = self.events.find(|_| true).await?;
        events.sort_by_key(|event| event.created_at);
        Ok(events)
    }
}

/// A consumer of published events. Delivery is at-least-once; every
/// dispatcher must be idempotent.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn dispatch(&self, event: &OutboxEvent) -> OutboxResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 8,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub published: usize,
    pub retried: usize,
    pub exhausted: usize,
}

/// Background publisher. One replica at a time runs the pump, elected by
/// the [`RELAY_LOCK`] advisory lock; each claimed event is dispatched
/// under its own tenant's context.
pub struct OutboxRelay {
    store: Arc<OutboxStore>,
    dispatchers: BTreeMap<String, Arc<dyn EventDispatcher>>,
    advisory: Arc<AdvisoryLocks>,
    telemetry: OpsTelemetry,
    config: RelayConfig,
}

impl OutboxRelay {
    #[must_use]
    pub fn new(
        store: Arc<OutboxStore>,
        advisory: Arc<AdvisoryLocks>,
        telemetry: OpsTelemetry,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            dispatchers: BTreeMap::new(),
            advisory,
            telemetry,
            config,
        }
    }

    #[must_use]
    pub fn with_dispatcher(
        mut self,
        event_type: impl Into<String>,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> Self {
        self.dispatchers.insert(event_type.into(), dispatcher);
        self
    }

    /// One relay pass without leader election; callers own the lock.
    pub async fn run_once(&self, now: DateTime<Utc>) -> RelayStats {
        let mut stats = RelayStats::default();
        let batch = self.store.claim_due(now, self.config.batch_size).await;
        for event in batch {
            let context = ActiveContext::new(event.tenant_id);
            let outcome = TenantContext::scope(context, self.publish(&event, now)).await;
            match outcome {
                Ok(()) => stats.published += 1,
                Err(true) => stats.exhausted += 1,
                Err(false) => stats.retried += 1,
            }
        }
        stats
    }

    /// One relay pass under the advisory lock; `None` when another
    /// replica is pumping.
    pub async fn run_guarded(&self, now: DateTime<Utc>) -> Option<RelayStats> {
        let _guard = self.advisory.try_acquire(RELAY_LOCK)?;
        Some(self.run_once(now).await)
    }

    /// Err(true) means the event hit its terminal state.
    async fn publish(&self, event: &OutboxEvent, now: DateTime<Utc>) -> Result<(), bool> {
        let result = match self.dispatchers.get(&event.event_type) {
            Some(dispatcher) => dispatcher.dispatch(event).await,
            None => Err(OutboxError::NoDispatcher(event.event_type.clone())),
        };

        match result {
            Ok(()) => {
                debug!(event_type = %event.event_type, event_id = %event.id, "outbox event published");
                self.store
                    .mark_published(event.id, now)
                    .await
                    .map(|_| ())
                    .map_err(|err| {
                        warn!(error = %err, "failed to mark outbox event published");
                        false
                    })
            }
            Err(err) => {
                self.telemetry.record_outbox_publish_failure();
                let attempts = event.attempts + 1;
                if attempts >= self.config.max_attempts {
                    self.telemetry.record_outbox_exhausted();
                    warn!(
                        event_type = %event.event_type,
                        event_id = %event.id,
                        attempts,
                        error = %err,
                        "outbox event exhausted"
                    );
                    let _ = self.store.mark_exhausted(event.id, &err.to_string()).await;
                    Err(true)
                } else {
                    let delay = backoff_delay(
                        self.config.backoff_base,
                        self.config.backoff_cap,
                        attempts,
                    );
                    let retry_at = now
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    let _ = self
                        .store
                        .mark_attempt_failed(event.id, &err.to_string(), retry_at)
                        .await;
                    Err(false)
                }
            }
        }
    }
}
