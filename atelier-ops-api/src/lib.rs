#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Composition layer of the operational core: boot configuration, the
//! error contract the HTTP boundary maps from, the user store, and the
//! backend that wires tenancy, finance, audit, outbox, queues and the
//! pipelines together.

mod backend;
mod config;
mod error;
mod users;

pub use crate::backend::AuthTokens;
pub use crate::backend::LoginOutcome;
pub use crate::backend::MfaSetup;
pub use crate::backend::OpsBackend;
pub use crate::backend::OpsDeps;
pub use crate::backend::RegisterInput;
pub use crate::backend::RequestMeta;
pub use crate::backend::UserView;
pub use crate::config::ConfigError;
pub use crate::config::MailConfig;
pub use crate::config::OpsConfig;
pub use crate::config::SecretManagerConfig;
pub use crate::error::ErrorBody;
pub use crate::error::ErrorKind;
pub use crate::error::OpsError;
pub use crate::error::OpsResult;
pub use crate::error::with_transient_retry;
pub use crate::users::Role;
pub use crate::users::User;
pub use crate::users::UserStore;

/// Installs the process-wide subscriber: env-filtered, structured. Log
/// lines carry the correlation id the context engine propagates.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
