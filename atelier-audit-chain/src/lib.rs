#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Per-tenant append-only audit chain. Each entry's hash covers the
//! previous entry's hash, so the log for a tenant is independently
//! verifiable; writes ride an async queue and never fail the request
//! that produced them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use atelier_jobs::Job;
use atelier_jobs::JobError;
use atelier_jobs::JobHandler;
use atelier_jobs::JobResult;
use atelier_jobs::JobRuntime;
use atelier_jobs::JobSpec;
use atelier_store::ScopedTable;
use atelier_store::StoreError;
use atelier_store::TenantRow;
use atelier_telemetry::OpsTelemetry;
use atelier_tenancy::ActiveContext;
use atelier_tenancy::TenantContext;
use atelier_tenancy::TenantId;
use atelier_tenancy::UserId;

mod mask;

pub use crate::mask::mask_sensitive;

/// Queue the async writer consumes.
pub const AUDIT_QUEUE: &str = "audit";

/// Sequence number reserved for dead-letter entries; the chain proper
/// starts at 1 and negative values never participate in verification.
pub const DLQ_SEQUENCE: i64 = -1;

const SEQUENCE_RETRIES: usize = 5;
const DLQ_PAYLOAD_LIMIT: usize = 2_048;

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("sequence {sequence_number} already written for tenant {tenant_id}")]
    SequenceConflict {
        tenant_id: TenantId,
        sequence_number: i64,
    },
    #[error("corrupted chain: {0}")]
    Corrupted(String),
}

impl From<StoreError> for AuditError {
    fn from(err: StoreError) -> Self {
        AuditError::Storage(err.to_string())
    }
}

/// Producer-side description of an auditable action. Values are masked
/// before the draft leaves the producer, so the queue never carries
/// unmasked data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditDraft {
    pub action: String,
    pub entity_name: String,
    pub entity_id: String,
    #[serde(default)]
    pub old_values: serde_json::Value,
    #[serde(default)]
    pub new_values: serde_json::Value,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status_code: Option<u16>,
    pub duration_ms: Option<u64>,
}

impl AuditDraft {
    #[must_use]
    pub fn action(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn entity(mut self, entity_name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_name = entity_name.into();
        self.entity_id = entity_id.into();
        self
    }

    #[must_use]
    pub fn values(mut self, old_values: serde_json::Value, new_values: serde_json::Value) -> Self {
        self.old_values = old_values;
        self.new_values = new_values;
        self
    }
}

/// Masked draft as it travels on the queue, stamped with its identity
/// and creation time at the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedAudit {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub draft: AuditDraft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub sequence_number: i64,
    pub previous_hash: Option<String>,
    pub hash: String,
    pub action: String,
    pub entity_name: String,
    pub entity_id: String,
    pub old_values: serde_json::Value,
    pub new_values: serde_json::Value,
    pub user_id: Option<UserId>,
    pub correlation_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status_code: Option<u16>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl TenantRow for AuditEntry {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub total_checked: usize,
    pub broken_at: Option<i64>,
    pub error: Option<String>,
}

/// Canonical form hashed into the chain: the entry serialized as JSON
/// with recursively sorted keys and the `hash` field removed.
/// `serde_json` maps are ordered, so serialization is already canonical
/// once the field is stripped.
pub fn canonical_payload(entry: &AuditEntry) -> AuditResult<String> {
    let mut value = serde_json::to_value(entry)
        .map_err(|err| AuditError::Storage(format!("canonicalize: {err}")))?;
    if let serde_json::Value::Object(map) = &mut value {
        map.remove("hash");
    }
    Ok(value.to_string())
}

fn chain_hash(previous_hash: Option<&str>, canonical: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(previous) = previous_hash {
        hasher.update(previous.as_bytes());
    }
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Chain storage plus the append protocol. Appends read the tenant's
/// tip under the ambient context and retry on a sequence collision, so
/// concurrent writers converge on a gap-free monotonic chain.
pub struct AuditChainStore {
    entries: ScopedTable<AuditEntry>,
}

impl Default for AuditChainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditChainStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: ScopedTable::new("audit_log").with_unique(
                "audit_log.tenant_sequence",
                |entry: &AuditEntry| {
                    (entry.sequence_number >= 1)
                        .then(|| format!("{}:{}", entry.tenant_id, entry.sequence_number))
                },
            ),
        }
    }

    async fn chain_tip(&self) -> AuditResult<Option<(i64, String)>> {
        let chain = self
            .entries
            .find(|entry| entry.sequence_number >= 1)
            .await?;
        Ok(chain
            .into_iter()
            .max_by_key(|entry| entry.sequence_number)
            .map(|entry| (entry.sequence_number, entry.hash)))
    }

    /// Appends the next chain entry for the ambient tenant.
    pub async fn append_next(&self, record: QueuedAudit) -> AuditResult<AuditEntry> {
        let context = TenantContext::require()
            .map_err(|err| AuditError::Validation(err.to_string()))?;

        let mut last_conflict = None;
        for _ in 0..SEQUENCE_RETRIES {
            let tip = self.chain_tip().await?;
            let (sequence_number, previous_hash) = match tip {
                Some((sequence, hash)) => (sequence + 1, Some(hash)),
                None => (1, None),
            };

            let mut entry = Self::build_entry(&context, &record, sequence_number, previous_hash);
            let canonical = canonical_payload(&entry)?;
            entry.hash = chain_hash(entry.previous_hash.as_deref(), &canonical);

            match self.entries.insert(entry).await {
                Ok(entry) => return Ok(entry),
                Err(err) if err.is_conflict() => {
                    last_conflict = Some(AuditError::SequenceConflict {
                        tenant_id: context.tenant_id,
                        sequence_number,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_conflict.unwrap_or_else(|| {
            AuditError::Storage("sequence contention exhausted retries".into())
        }))
    }

    fn build_entry(
        context: &ActiveContext,
        record: &QueuedAudit,
        sequence_number: i64,
        previous_hash: Option<String>,
    ) -> AuditEntry {
        AuditEntry {
            id: record.id,
            tenant_id: context.tenant_id,
            sequence_number,
            previous_hash,
            hash: String::new(),
            action: record.draft.action.clone(),
            entity_name: record.draft.entity_name.clone(),
            entity_id: record.draft.entity_id.clone(),
            old_values: record.draft.old_values.clone(),
            new_values: record.draft.new_values.clone(),
            user_id: context.user_id,
            correlation_id: context.correlation_id.clone(),
            ip: record.draft.ip.clone(),
            user_agent: record.draft.user_agent.clone(),
            method: record.draft.method.clone(),
            path: record.draft.path.clone(),
            status_code: record.draft.status_code,
            duration_ms: record.draft.duration_ms,
            created_at: record.created_at,
        }
    }

    /// Preserves an exhausted audit job outside the chain. Dead-letter
    /// rows share the tenant but use the reserved sequence and are
    /// skipped by verification.
    pub async fn dead_letter(&self, record: &QueuedAudit, error: &str) -> AuditResult<AuditEntry> {
        let context = TenantContext::require()
            .map_err(|err| AuditError::Validation(err.to_string()))?;

        let mut payload = serde_json::to_string(&record.draft)
            .unwrap_or_else(|err| format!("unserializable draft: {err}"));
        payload.truncate(DLQ_PAYLOAD_LIMIT);

        let entry = AuditEntry {
            id: Uuid::new_v4(),
            tenant_id: context.tenant_id,
            sequence_number: DLQ_SEQUENCE,
            previous_hash: None,
            hash: String::new(),
            action: format!("DLQ_FAILED:{}", record.draft.action),
            entity_name: record.draft.entity_name.clone(),
            entity_id: record.draft.entity_id.clone(),
            old_values: serde_json::Value::Null,
            new_values: serde_json::json!({ "error": error, "payload": payload }),
            user_id: context.user_id,
            correlation_id: context.correlation_id.clone(),
            ip: None,
            user_agent: None,
            method: None,
            path: None,
            status_code: None,
            duration_ms: None,
            created_at: Utc::now(),
        };
        Ok(self.entries.insert(entry).await?)
    }

    /// Chain entries for the ambient tenant in sequence order, DLQ rows
    /// excluded.
    pub async fn chain(&self) -> AuditResult<Vec<AuditEntry>> {
        let mut entries = self
            .entries
            .find(|entry| entry.sequence_number >= 1)
            .await?;
        entries.sort_by_key(|entry| entry.sequence_number);
        Ok(entries)
    }

    pub async fn dead_letters(&self) -> AuditResult<Vec<AuditEntry>> {
        Ok(self
            .entries
            .find(|entry| entry.sequence_number == DLQ_SEQUENCE)
            .await?)
    }

    fn verify_entries(entries: &[AuditEntry]) -> ChainVerification {
        let mut previous: Option<(i64, String)> = None;
        for entry in entries {
            let expected_sequence = previous.as_ref().map_or(1, |(sequence, _)| sequence + 1);
            if entry.sequence_number != expected_sequence {
                return ChainVerification {
                    valid: false,
                    total_checked: entries.len(),
                    broken_at: Some(entry.sequence_number),
                    error: Some(format!(
                        "sequence gap: expected {expected_sequence}, found {}",
                        entry.sequence_number
                    )),
                };
            }
            let expected_previous = previous.as_ref().map(|(_, hash)| hash.as_str());
            if entry.previous_hash.as_deref() != expected_previous {
                return ChainVerification {
                    valid: false,
                    total_checked: entries.len(),
                    broken_at: Some(entry.sequence_number),
                    error: Some("previous hash mismatch".into()),
                };
            }
            let recomputed = match canonical_payload(entry) {
                Ok(canonical) => chain_hash(entry.previous_hash.as_deref(), &canonical),
                Err(err) => {
                    return ChainVerification {
                        valid: false,
                        total_checked: entries.len(),
                        broken_at: Some(entry.sequence_number),
                        error: Some(err.to_string()),
                    };
                }
            };
            if recomputed != entry.hash {
                return ChainVerification {
                    valid: false,
                    total_checked: entries.len(),
                    broken_at: Some(entry.sequence_number),
                    error: Some("stored hash does not match recomputation".into()),
                };
            }
            previous = Some((entry.sequence_number, entry.hash.clone()));
        }
        ChainVerification {
            valid: true,
            total_checked: entries.len(),
            broken_at: None,
            error: None,
        }
    }
}

/// Facade producers call. `log` is best-effort by contract: masking and
/// enqueueing happen inline, everything else is the worker's problem.
pub struct AuditChainService {
    store: Arc<AuditChainStore>,
    jobs: Arc<JobRuntime>,
    telemetry: OpsTelemetry,
}

impl AuditChainService {
    #[must_use]
    pub fn new(jobs: Arc<JobRuntime>, telemetry: OpsTelemetry) -> Arc<Self> {
        let store = Arc::new(AuditChainStore::new());
        jobs.register(
            AUDIT_QUEUE,
            Arc::new(AuditWorker {
                store: Arc::clone(&store),
                telemetry: telemetry.clone(),
            }),
        );
        Arc::new(Self {
            store,
            jobs,
            telemetry,
        })
    }

    #[must_use]
    pub fn store(&self) -> Arc<AuditChainStore> {
        Arc::clone(&self.store)
    }

    /// Records an auditable action. Never blocks on the chain and never
    /// returns an error to the producer: queue submission failures fall
    /// back to one synchronous append attempt and a counter.
    pub async fn log(&self, mut draft: AuditDraft) {
        mask_sensitive(&mut draft.old_values);
        mask_sensitive(&mut draft.new_values);

        if TenantContext::current().is_none() {
            warn!(action = %draft.action, "audit entry dropped: no tenant context");
            self.telemetry.record_audit_enqueue_failure();
            return;
        }

        let record = QueuedAudit {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            draft,
        };
        let payload = match serde_json::to_value(&record) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "audit entry dropped: unserializable");
                self.telemetry.record_audit_enqueue_failure();
                return;
            }
        };

        let spec = JobSpec::new(AUDIT_QUEUE, record.draft.action.clone(), payload);
        if let Err(err) = self.jobs.enqueue(spec).await {
            self.telemetry.record_audit_enqueue_failure();
            warn!(error = %err, "audit enqueue failed, attempting synchronous append");
            self.telemetry.record_audit_sync_fallback();
            if let Err(err) = self.store.append_next(record).await {
                warn!(error = %err, "synchronous audit fallback failed");
            }
        }
    }

    /// Walks the tenant's chain in sequence order.
    pub async fn verify_chain(&self, tenant_id: TenantId, max_rows: usize) -> ChainVerification {
        let store = Arc::clone(&self.store);
        TenantContext::scope(ActiveContext::new(tenant_id), async move {
            match store.chain().await {
                Ok(mut entries) => {
                    entries.truncate(max_rows);
                    AuditChainStore::verify_entries(&entries)
                }
                Err(err) => ChainVerification {
                    valid: false,
                    total_checked: 0,
                    broken_at: None,
                    error: Some(err.to_string()),
                },
            }
        })
        .await
    }
}

/// Queue consumer: reads the tenant tip, links and hashes the entry,
/// retries on sequence collisions, and preserves exhausted work as a
/// dead-letter row.
struct AuditWorker {
    store: Arc<AuditChainStore>,
    telemetry: OpsTelemetry,
}

impl AuditWorker {
    fn decode(job: &Job) -> JobResult<QueuedAudit> {
        serde_json::from_value(job.spec.payload.clone())
            .map_err(|err| JobError::Failed(format!("undecodable audit payload: {err}")))
    }
}

#[async_trait]
impl JobHandler for AuditWorker {
    async fn handle(&self, job: &Job) -> JobResult<()> {
        let record = Self::decode(job)?;
        self.store
            .append_next(record)
            .await
            .map(|_| ())
            .map_err(|err| JobError::Failed(err.to_string()))
    }

    async fn exhausted(&self, job: &Job, error: &JobError) {
        self.telemetry.record_audit_dead_letter();
        let record = Self::decode(job).unwrap_or_else(|_| QueuedAudit {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            draft: AuditDraft::action("unknown"),
        });
        if let Err(err) = self.store.dead_letter(&record, &error.to_string()).await {
            warn!(error = %err, "failed to preserve dead-lettered audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use super::*;
    use atelier_store::AdvisoryLocks;
    use pretty_assertions::assert_eq;

    fn service() -> (Arc<AuditChainService>, Arc<JobRuntime>) {
        let jobs = JobRuntime::new(AdvisoryLocks::new(), OpsTelemetry::new());
        let service = AuditChainService::new(Arc::clone(&jobs), OpsTelemetry::new());
        (service, jobs)
    }

    fn draft(action: &str) -> AuditDraft {
        AuditDraft::action(action)
            .entity("booking", "b-1")
            .values(
                serde_json::Value::Null,
                serde_json::json!({ "status": "CONFIRMED" }),
            )
    }

    async fn scoped<F: Future>(tenant: TenantId, future: F) -> F::Output {
        TenantContext::scope(ActiveContext::new(tenant), future).await
    }

    #[tokio::test]
    async fn drained_queue_produces_a_valid_chain() {
        let (service, jobs) = service();
        let tenant = Uuid::new_v4();

        for n in 0..5 {
            scoped(tenant, service.log(draft(&format!("ACTION_{n}")))).await;
        }
        jobs.run_until_idle().await;

        let verification = service.verify_chain(tenant, 100).await;
        assert!(verification.valid, "{verification:?}");
        assert_eq!(verification.total_checked, 5);

        let chain = scoped(tenant, service.store().chain()).await.expect("chain");
        assert_eq!(chain[0].sequence_number, 1);
        assert_eq!(chain[0].previous_hash, None);
        assert_eq!(chain[4].previous_hash, Some(chain[3].hash.clone()));
    }

    #[tokio::test]
    async fn restart_resumes_sequence_from_the_tip() {
        let (service, jobs) = service();
        let tenant = Uuid::new_v4();

        scoped(tenant, service.log(draft("FIRST"))).await;
        jobs.run_until_idle().await;

        // A fresh worker over the same store picks up where the chain left off.
        scoped(
            tenant,
            service.store().append_next(QueuedAudit {
                id: Uuid::new_v4(),
                created_at: Utc::now(),
                draft: draft("SECOND"),
            }),
        )
        .await
        .expect("append after restart");

        let chain = scoped(tenant, service.store().chain()).await.expect("chain");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].sequence_number, 2);
        assert_eq!(chain[1].previous_hash, Some(chain[0].hash.clone()));
    }

    #[tokio::test]
    async fn chains_are_isolated_per_tenant() {
        let (service, jobs) = service();
        let tenants: Vec<TenantId> = (0..3).map(|_| Uuid::new_v4()).collect();

        for round in 0..4 {
            for tenant in &tenants {
                scoped(*tenant, service.log(draft(&format!("ROUND_{round}")))).await;
            }
        }
        jobs.run_until_idle().await;

        for tenant in &tenants {
            let verification = service.verify_chain(*tenant, 100).await;
            assert!(verification.valid, "{verification:?}");
            assert_eq!(verification.total_checked, 4);
        }
    }

    #[tokio::test]
    async fn tampering_breaks_verification() {
        let (service, jobs) = service();
        let tenant = Uuid::new_v4();

        scoped(tenant, service.log(draft("A"))).await;
        scoped(tenant, service.log(draft("B"))).await;
        jobs.run_until_idle().await;

        let mut chain = scoped(tenant, service.store().chain()).await.expect("chain");
        let mut tampered = chain.remove(1);
        tampered.new_values = serde_json::json!({ "status": "FORGED" });
        let store = service.store();
        scoped(tenant, store.entries.save(tampered))
            .await
            .expect("tamper");

        let verification = service.verify_chain(tenant, 100).await;
        assert!(!verification.valid);
        assert_eq!(verification.broken_at, Some(2));
    }

    #[tokio::test]
    async fn undecodable_payload_lands_in_the_dlq() {
        let (service, jobs) = service();
        let tenant = Uuid::new_v4();

        scoped(tenant, async {
            jobs.enqueue(JobSpec::new(
                AUDIT_QUEUE,
                "garbage",
                serde_json::json!("not an audit record"),
            ))
            .await
            .expect("enqueue");
        })
        .await;

        for _ in 0..3 {
            jobs.run_until_idle().await;
            jobs.force_retries().await;
        }
        jobs.run_until_idle().await;

        let dead = scoped(tenant, service.store().dead_letters())
            .await
            .expect("dead letters");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].sequence_number, DLQ_SEQUENCE);
        assert!(dead[0].action.starts_with("DLQ_FAILED:"));

        // DLQ rows never participate in verification.
        let verification = service.verify_chain(tenant, 100).await;
        assert!(verification.valid);
        assert_eq!(verification.total_checked, 0);
    }

    #[tokio::test]
    async fn log_without_context_is_dropped_not_propagated() {
        let telemetry = OpsTelemetry::new();
        let jobs = JobRuntime::new(AdvisoryLocks::new(), OpsTelemetry::new());
        let service = AuditChainService::new(jobs, telemetry.clone());

        service.log(draft("NO_CONTEXT")).await;
        assert_eq!(telemetry.snapshot().audit_enqueue_failures, 1);
    }
}
