#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Asynchronous side-effect pipelines: templated email dispatch and
//! signed webhook delivery, both driven by the job runtime with the
//! standard retry ladder.

use thiserror::Error;

use atelier_jobs::JobError;
use atelier_store::StoreError;

mod email;
mod webhook;

pub use crate::email::EMAIL_QUEUE;
pub use crate::email::EmailMessage;
pub use crate::email::EmailRequest;
pub use crate::email::EmailTemplate;
pub use crate::email::EmailWorker;
pub use crate::email::Mailer;
pub use crate::email::RecordingMailer;
pub use crate::email::TemplateCatalog;
pub use crate::email::enqueue_email;
pub use crate::webhook::DeliveryStatus;
pub use crate::webhook::HttpWebhookTransport;
pub use crate::webhook::WEBHOOK_QUEUE;
pub use crate::webhook::WebhookDelivery;
pub use crate::webhook::WebhookDispatcher;
pub use crate::webhook::WebhookEndpoint;
pub use crate::webhook::WebhookHub;
pub use crate::webhook::WebhookTransport;
pub use crate::webhook::WebhookWorker;
pub use crate::webhook::sign_payload;
pub use crate::webhook::verify_signature;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown template {template} (locale {locale})")]
    UnknownTemplate { template: String, locale: String },
    #[error("template variable {0} was not provided")]
    MissingVariable(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<PipelineError> for JobError {
    fn from(err: PipelineError) -> Self {
        JobError::Failed(err.to_string())
    }
}
