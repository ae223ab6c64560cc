use serde::Deserialize;
use thiserror::Error;

use crate::options::ServerOptions;
use crate::stores::Application;

/// Shared secrets shorter than this are refused for the HMAC algorithms.
pub const MIN_SECRET_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default)]
    pub server: ServerOptions,
    /// Client applications served by the static application store.
    #[serde(default)]
    pub clients: Vec<Application>,
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;

        if let Some(issuer) = &server.issuer
            && !matches!(issuer.scheme(), "http" | "https")
        {
            return Err(ConfigError::Validation(format!(
                "server.issuer must be an http(s) URL, got '{issuer}'"
            )));
        }
        if server.request_caching.any_enabled() && server.request_caching.ttl_seconds == 0 {
            return Err(ConfigError::Validation(
                "server.request_caching.ttl_seconds must be > 0".into(),
            ));
        }

        let signing = &server.signing;
        if signing.is_symmetric() {
            if signing
                .secret
                .as_ref()
                .is_some_and(|secret| secret.len() < MIN_SECRET_BYTES)
            {
                return Err(ConfigError::Validation(format!(
                    "server.signing.secret must be at least {MIN_SECRET_BYTES} bytes"
                )));
            }
        } else if signing.private_key_pem.is_none() || signing.public_key_pem.is_none() {
            return Err(ConfigError::Validation(format!(
                "server.signing.{{private,public}}_key_pem are required for {:?}",
                signing.algorithm
            )));
        }

        if let Some(client) = self.clients.iter().find(|c| c.client_id.is_empty()) {
            return Err(ConfigError::Validation(format!(
                "a client has an empty client_id (redirect_uris: {:?})",
                client.redirect_uris
            )));
        }
        Ok(())
    }
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any environment variable matching a key path separated by double underscores
/// (e.g. `SERVER__ISSUER`) overrides the file value.
///
/// Returns a `ConfigError` instead of panicking so the caller can decide how to fail.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from("config.yaml")
}

/// Same as [`load_config`] with an explicit file. The file is optional; a missing file leaves
/// every setting at its default.
pub fn load_config_from(path: &str) -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

/// Convenience helper for binaries wanting panic-on-error behaviour.
pub fn load_config_or_panic() -> AppConfig {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}
