use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use atelier_audit_chain::AuditChainService;
use atelier_audit_chain::AuditDraft;
use atelier_jobs::Job;
use atelier_jobs::JobError;
use atelier_jobs::JobHandler;
use atelier_jobs::JobResult;
use atelier_jobs::JobRuntime;
use atelier_jobs::JobSpec;

use crate::PipelineError;
use crate::PipelineResult;

pub const EMAIL_QUEUE: &str = "email";

const DEFAULT_LOCALE: &str = "en";

/// What producers enqueue. Rendering happens in the worker so template
/// changes never race queued sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRequest {
    pub to: String,
    pub template: String,
    pub locale: Option<String>,
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Per-locale template set with an English fallback. Substitution is
/// strict: only `{{name}}` placeholders backed by a provided variable
/// render, and an unbacked placeholder fails the render rather than
/// leaking through.
#[derive(Default)]
pub struct TemplateCatalog {
    templates: HashMap<(String, String), EmailTemplate>,
}

impl TemplateCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_template(
        mut self,
        name: impl Into<String>,
        locale: impl Into<String>,
        template: EmailTemplate,
    ) -> Self {
        self.templates.insert((name.into(), locale.into()), template);
        self
    }

    fn lookup(&self, name: &str, locale: &str) -> PipelineResult<&EmailTemplate> {
        self.templates
            .get(&(name.to_string(), locale.to_string()))
            .or_else(|| {
                self.templates
                    .get(&(name.to_string(), DEFAULT_LOCALE.to_string()))
            })
            .ok_or_else(|| PipelineError::UnknownTemplate {
                template: name.to_string(),
                locale: locale.to_string(),
            })
    }

    pub fn render(&self, request: &EmailRequest) -> PipelineResult<EmailMessage> {
        let locale = request.locale.as_deref().unwrap_or(DEFAULT_LOCALE);
        let template = self.lookup(&request.template, locale)?;
        Ok(EmailMessage {
            to: request.to.clone(),
            subject: substitute(&template.subject, &request.vars)?,
            body: substitute(&template.body, &request.vars)?,
        })
    }
}

fn substitute(template: &str, vars: &BTreeMap<String, String>) -> PipelineResult<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            rendered.push_str(&rest[start..]);
            return Ok(rendered);
        };
        let name = after[..end].trim();
        let value = vars
            .get(name)
            .ok_or_else(|| PipelineError::MissingVariable(name.to_string()))?;
        rendered.push_str(value);
        rest = &after[end + 2..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

/// SMTP (or equivalent) transport. The wire protocol is outside the
/// core; the worker needs fire-and-confirm semantics only.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> PipelineResult<()>;
}

/// Test double that records every accepted message.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingMailer {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> PipelineResult<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}

/// Places an email job on the queue; the ambient tenant context rides
/// along with the job.
pub async fn enqueue_email(jobs: &JobRuntime, request: &EmailRequest) -> JobResult<()> {
    let payload = serde_json::to_value(request)
        .map_err(|err| JobError::Failed(format!("unserializable email request: {err}")))?;
    jobs.enqueue(JobSpec::new(EMAIL_QUEUE, request.template.clone(), payload))
        .await?;
    Ok(())
}

/// Queue consumer: renders and dispatches one message per job, with a
/// delivery audit entry on success.
pub struct EmailWorker {
    catalog: Arc<TemplateCatalog>,
    mailer: Arc<dyn Mailer>,
    audit: Arc<AuditChainService>,
}

impl EmailWorker {
    #[must_use]
    pub fn new(
        catalog: Arc<TemplateCatalog>,
        mailer: Arc<dyn Mailer>,
        audit: Arc<AuditChainService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            mailer,
            audit,
        })
    }
}

#[async_trait]
impl JobHandler for EmailWorker {
    async fn handle(&self, job: &Job) -> JobResult<()> {
        let request: EmailRequest = serde_json::from_value(job.spec.payload.clone())
            .map_err(|err| JobError::Failed(format!("undecodable email payload: {err}")))?;
        let message = self.catalog.render(&request)?;
        self.mailer.send(&message).await?;
        debug!(template = %request.template, "email dispatched");

        self.audit
            .log(
                AuditDraft::action("EMAIL_SENT")
                    .entity("email", request.template.clone())
                    .values(
                        serde_json::Value::Null,
                        serde_json::json!({
                            "template": request.template,
                            "to": request.to,
                        }),
                    ),
            )
            .await;
        Ok(())
    }
}
