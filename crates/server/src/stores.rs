//! Application (client) store collaborator.
//!
//! Persistence is owned by the deployment. When no store is registered the server runs in
//! degraded mode and skips client existence, secret and redirect registration checks.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Application store failure: {0}")]
    Backend(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    #[default]
    Public,
    Confidential,
}

/// A registered client application.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Application {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub client_type: ClientType,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub post_logout_redirect_uris: Vec<String>,
}

impl Application {
    pub fn is_confidential(&self) -> bool {
        self.client_type == ClientType::Confidential
    }

    pub fn has_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == uri)
    }

    pub fn has_post_logout_redirect_uri(&self, uri: &str) -> bool {
        self.post_logout_redirect_uris.iter().any(|u| u == uri)
    }

    pub fn validate_client_secret(&self, secret: &str) -> bool {
        matches!(&self.client_secret, Some(stored) if stored == secret)
    }
}

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Application>, StoreError>;
}

/// Immutable store built from the `clients` configuration section.
#[derive(Clone, Debug, Default)]
pub struct StaticApplicationStore {
    applications: HashMap<String, Application>,
}

impl StaticApplicationStore {
    pub fn new(applications: impl IntoIterator<Item = Application>) -> Self {
        Self {
            applications: applications
                .into_iter()
                .map(|a| (a.client_id.clone(), a))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.applications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }
}

#[async_trait]
impl ApplicationStore for StaticApplicationStore {
    async fn find_by_client_id(&self, client_id: &str) -> Result<Option<Application>, StoreError> {
        Ok(self.applications.get(client_id).cloned())
    }
}
