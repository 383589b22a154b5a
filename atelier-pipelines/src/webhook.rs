use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use hmac::Hmac;
use hmac::Mac;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use atelier_jobs::Job;
use atelier_jobs::JobError;
use atelier_jobs::JobHandler;
use atelier_jobs::JobResult;
use atelier_jobs::JobRuntime;
use atelier_jobs::JobSpec;
use atelier_jobs::backoff_delay;
use atelier_outbox::EventDispatcher;
use atelier_outbox::OutboxError;
use atelier_outbox::OutboxEvent;
use atelier_outbox::OutboxResult;
use atelier_store::ScopedTable;
use atelier_store::StoreError;
use atelier_store::TenantRow;
use atelier_telemetry::OpsTelemetry;
use atelier_tenancy::TenantContext;
use atelier_tenancy::TenantId;

use crate::PipelineError;
use crate::PipelineResult;

pub const WEBHOOK_QUEUE: &str = "webhook";

const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// `HMAC-SHA256(secret, "<timestamp>.<body>")`, hex encoded. Receivers
/// recompute it from the `X-Timestamp` header and the raw body.
#[must_use]
pub fn sign_payload(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length; unreachable in practice.
        Err(_) => return String::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    format!("{:x}", mac.finalize().into_bytes())
}

/// Receive-side check: an inbound webhook's signature must validate
/// before any business effect runs. Comparison is through the MAC's
/// constant-time verify.
#[must_use]
pub fn verify_signature(secret: &str, timestamp: i64, body: &str, signature: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());

    let mut expected = Vec::with_capacity(signature.len() / 2);
    let bytes = signature.as_bytes();
    if bytes.len() % 2 != 0 {
        return false;
    }
    for pair in bytes.chunks(2) {
        let hex = match std::str::from_utf8(pair) {
            Ok(hex) => hex,
            Err(_) => return false,
        };
        match u8::from_str_radix(hex, 16) {
            Ok(byte) => expected.push(byte),
            Err(_) => return false,
        }
    }
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub url: String,
    pub secret: String,
    pub event_types: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl TenantRow for WebhookEndpoint {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub webhook_id: Uuid,
    pub event_type: String,
    pub request_body: String,
    pub request_headers: BTreeMap<String, String>,
    pub status: DeliveryStatus,
    pub response_status: Option<u16>,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TenantRow for WebhookDelivery {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Endpoint registry plus the delivery ledger.
pub struct WebhookHub {
    endpoints: ScopedTable<WebhookEndpoint>,
    deliveries: ScopedTable<WebhookDelivery>,
}

impl Default for WebhookHub {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            endpoints: ScopedTable::new("webhook_endpoints"),
            deliveries: ScopedTable::new("webhook_deliveries"),
        }
    }

    pub async fn register_endpoint(
        &self,
        url: impl Into<String>,
        secret: impl Into<String>,
        event_types: Vec<String>,
    ) -> PipelineResult<WebhookEndpoint> {
        let context = TenantContext::require().map_err(StoreError::from)?;
        let endpoint = WebhookEndpoint {
            id: Uuid::new_v4(),
            tenant_id: context.tenant_id,
            url: url.into(),
            secret: secret.into(),
            event_types,
            is_active: true,
            created_at: Utc::now(),
        };
        Ok(self.endpoints.insert(endpoint).await?)
    }

    pub async fn subscribed_endpoints(
        &self,
        event_type: &str,
    ) -> PipelineResult<Vec<WebhookEndpoint>> {
        Ok(self
            .endpoints
            .find(|endpoint| {
                endpoint.is_active
                    && endpoint
                        .event_types
                        .iter()
                        .any(|subscribed| subscribed == event_type)
            })
            .await?)
    }

    pub async fn delivery(&self, id: Uuid) -> PipelineResult<Option<WebhookDelivery>> {
        Ok(self.deliveries.find_one(id).await?)
    }

    pub async fn deliveries_for_tenant(&self) -> PipelineResult<Vec<WebhookDelivery>> {
        let mut rows = self.deliveries.find(|_| true).await?;
        rows.sort_by_key(|delivery| delivery.created_at);
        Ok(rows)
    }
}

/// Outbox dispatcher: fans a published event out to every endpoint
/// subscribed to its type, one delivery row and one queue job each.
pub struct WebhookDispatcher {
    hub: Arc<WebhookHub>,
    jobs: Arc<JobRuntime>,
}

impl WebhookDispatcher {
    #[must_use]
    pub fn new(hub: Arc<WebhookHub>, jobs: Arc<JobRuntime>) -> Arc<Self> {
        Arc::new(Self { hub, jobs })
    }
}

#[async_trait]
impl EventDispatcher for WebhookDispatcher {
    async fn dispatch(&self, event: &OutboxEvent) -> OutboxResult<()> {
        let endpoints = self
            .hub
            .subscribed_endpoints(&event.event_type)
            .await
            .map_err(|err| OutboxError::Dispatch(err.to_string()))?;

        for endpoint in endpoints {
            let body = serde_json::json!({
                "id": event.id,
                "event_type": event.event_type,
                "aggregate_type": event.aggregate_type,
                "aggregate_id": event.aggregate_id,
                "created_at": event.created_at,
                "payload": event.payload,
            })
            .to_string();

            let delivery = WebhookDelivery {
                id: Uuid::new_v4(),
                tenant_id: event.tenant_id,
                webhook_id: endpoint.id,
                event_type: event.event_type.clone(),
                request_body: body,
                request_headers: BTreeMap::new(),
                status: DeliveryStatus::Pending,
                response_status: None,
                attempt_number: 0,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                next_retry_at: None,
                delivered_at: None,
                duration_ms: None,
                last_error: None,
                created_at: Utc::now(),
            };
            let delivery = self
                .hub
                .deliveries
                .insert(delivery)
                .await
                .map_err(|err| OutboxError::Dispatch(err.to_string()))?;

            self.jobs
                .enqueue(
                    JobSpec::new(
                        WEBHOOK_QUEUE,
                        event.event_type.clone(),
                        serde_json::json!({ "delivery_id": delivery.id }),
                    )
                    .with_max_attempts(DEFAULT_MAX_ATTEMPTS),
                )
                .await
                .map_err(|err| OutboxError::Dispatch(err.to_string()))?;
        }
        Ok(())
    }
}

/// HTTP transport for deliveries. Returns the response status, or an
/// error string for a network-level failure.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &str,
    ) -> Result<u16, String>;
}

/// Production transport over a pooled HTTP client.
#[derive(Default)]
pub struct HttpWebhookTransport {
    client: reqwest::Client,
}

impl HttpWebhookTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn post(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &str,
    ) -> Result<u16, String> {
        let mut request = self.client.post(url).body(body.to_string());
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(|err| err.to_string())?;
        Ok(response.status().as_u16())
    }
}

#[derive(Deserialize)]
struct DeliveryJobPayload {
    delivery_id: Uuid,
}

/// Queue consumer: signs and posts one delivery per attempt and keeps
/// the delivery row's retry ladder in step with the job runtime's.
pub struct WebhookWorker {
    hub: Arc<WebhookHub>,
    transport: Arc<dyn WebhookTransport>,
    telemetry: OpsTelemetry,
}

impl WebhookWorker {
    #[must_use]
    pub fn new(
        hub: Arc<WebhookHub>,
        transport: Arc<dyn WebhookTransport>,
        telemetry: OpsTelemetry,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            transport,
            telemetry,
        })
    }

    async fn load(&self, job: &Job) -> JobResult<(WebhookDelivery, WebhookEndpoint)> {
        let payload: DeliveryJobPayload = serde_json::from_value(job.spec.payload.clone())
            .map_err(|err| JobError::Failed(format!("undecodable webhook payload: {err}")))?;
        let delivery = self
            .hub
            .deliveries
            .find_one(payload.delivery_id)
            .await
            .map_err(PipelineError::from)?
            .ok_or_else(|| JobError::Failed(format!("delivery {} missing", payload.delivery_id)))?;
        let endpoint = self
            .hub
            .endpoints
            .find_one(delivery.webhook_id)
            .await
            .map_err(PipelineError::from)?
            .ok_or_else(|| JobError::Failed(format!("endpoint {} missing", delivery.webhook_id)))?;
        Ok((delivery, endpoint))
    }
}

#[async_trait]
impl JobHandler for WebhookWorker {
    async fn handle(&self, job: &Job) -> JobResult<()> {
        let (delivery, endpoint) = self.load(job).await?;
        if delivery.status == DeliveryStatus::Success {
            return Ok(());
        }

        let now = Utc::now();
        let signature = sign_payload(&endpoint.secret, now.timestamp(), &delivery.request_body);
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("X-Timestamp".to_string(), now.timestamp().to_string());
        headers.insert("X-Signature".to_string(), signature);

        let started = std::time::Instant::now();
        let outcome = self
            .transport
            .post(&endpoint.url, &headers, &delivery.request_body)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(status) if (200..300).contains(&status) => {
                self.hub
                    .deliveries
                    .update(delivery.id, |row| {
                        row.status = DeliveryStatus::Success;
                        row.attempt_number += 1;
                        row.request_headers = headers;
                        row.response_status = Some(status);
                        row.delivered_at = Some(now);
                        row.duration_ms = Some(duration_ms);
                        row.next_retry_at = None;
                        Ok(())
                    })
                    .await
                    .map_err(PipelineError::from)?;
                debug!(delivery_id = %delivery.id, status, "webhook delivered");
                Ok(())
            }
            outcome => {
                let response_status = outcome.as_ref().ok().copied();
                let error = match &outcome {
                    Ok(status) => format!("endpoint answered {status}"),
                    Err(network) => format!("network failure: {network}"),
                };
                let attempt = delivery.attempt_number + 1;
                let exhausted = attempt >= delivery.max_attempts;
                let retry_at = (!exhausted).then(|| {
                    now + chrono::Duration::from_std(backoff_delay(
                        job.spec.backoff_base,
                        atelier_jobs::BACKOFF_CAP,
                        attempt,
                    ))
                    .unwrap_or_else(|_| chrono::Duration::seconds(1))
                });
                self.hub
                    .deliveries
                    .update(delivery.id, |row| {
                        row.attempt_number = attempt;
                        row.request_headers = headers;
                        row.status = if exhausted {
                            DeliveryStatus::Failed
                        } else {
                            DeliveryStatus::Retrying
                        };
                        row.response_status = response_status;
                        row.next_retry_at = retry_at;
                        row.last_error = Some(error.clone());
                        row.duration_ms = Some(duration_ms);
                        Ok(())
                    })
                    .await
                    .map_err(PipelineError::from)?;
                Err(JobError::Failed(error))
            }
        }
    }

    async fn exhausted(&self, job: &Job, _error: &JobError) {
        self.telemetry.record_webhook_delivery_failed();
        if let Ok((delivery, _)) = self.load(job).await
            && delivery.status != DeliveryStatus::Failed
        {
            let result = self
                .hub
                .deliveries
                .update(delivery.id, |row| {
                    row.status = DeliveryStatus::Failed;
                    row.next_retry_at = None;
                    Ok(())
                })
                .await;
            if let Err(err) = result {
                warn!(error = %err, "failed to mark webhook delivery failed");
            }
        }
    }
}
