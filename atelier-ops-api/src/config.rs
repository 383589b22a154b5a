use std::collections::HashSet;
use std::env;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("partial {0} configuration: set all of its variables or none")]
    Partial(&'static str),
}

const PLACEHOLDER_SECRETS: &[&str] = &[
    "changeme",
    "change-me",
    "secret",
    "password",
    "example",
    "your-secret",
    "jwt-secret",
    "dev-secret",
];

const MIN_SECRET_LEN: usize = 32;
const MIN_SECRET_DISTINCT_CHARS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub from_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretManagerConfig {
    pub provider: String,
    pub key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsConfig {
    pub database_url: String,
    pub jwt_secret: String,
    pub redis_url: Option<String>,
    pub mail: Option<MailConfig>,
    pub secret_manager: Option<SecretManagerConfig>,
    pub production: bool,
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl OpsConfig {
    /// Reads and validates the boot configuration. `.env` files are
    /// honored in development.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let database_url = optional("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let jwt_secret = optional("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        let production = optional("APP_ENV").as_deref() == Some("production");

        let mail = match (
            optional("MAIL_HOST"),
            optional("MAIL_PORT"),
            optional("MAIL_FROM"),
        ) {
            (None, None, None) => None,
            (Some(host), Some(port), Some(from_address)) => {
                let port = port.parse().map_err(|_| ConfigError::Invalid {
                    name: "MAIL_PORT",
                    reason: format!("{port} is not a port number"),
                })?;
                Some(MailConfig {
                    host,
                    port,
                    from_address,
                })
            }
            _ => return Err(ConfigError::Partial("mail")),
        };

        let secret_manager = match (optional("SECRET_PROVIDER"), optional("SECRET_KEY_ID")) {
            (None, None) => None,
            (Some(provider), Some(key_id)) => Some(SecretManagerConfig { provider, key_id }),
            _ => return Err(ConfigError::Partial("secret-manager")),
        };

        let config = Self {
            database_url,
            jwt_secret,
            redis_url: optional("REDIS_URL"),
            mail,
            secret_manager,
            production,
        };
        config.validate()?;
        Ok(config)
    }

    /// Boot-time validation: placeholder secrets are rejected anywhere,
    /// and production additionally demands length and entropy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let secret = self.jwt_secret.trim();
        if secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid {
                name: "JWT_SECRET",
                reason: format!("must be at least {MIN_SECRET_LEN} characters"),
            });
        }
        let lowered = secret.to_ascii_lowercase();
        if PLACEHOLDER_SECRETS
            .iter()
            .any(|placeholder| lowered.contains(placeholder))
        {
            return Err(ConfigError::Invalid {
                name: "JWT_SECRET",
                reason: "placeholder value rejected".into(),
            });
        }
        if self.production {
            let distinct: HashSet<char> = secret.chars().collect();
            if distinct.len() < MIN_SECRET_DISTINCT_CHARS {
                return Err(ConfigError::Invalid {
                    name: "JWT_SECRET",
                    reason: "insufficient entropy for production".into(),
                });
            }
        }
        Ok(())
    }
}
