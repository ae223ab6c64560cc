use std::fmt;

use axum::http::header::InvalidHeaderValue;
use thiserror::Error;

use crate::cache::CacheError;
use crate::stores::StoreError;
use crate::transaction::Endpoint;

/// Fatal faults caused by a misconfigured or broken deployment.
///
/// These abort the current call and propagate to the host untranslated. They are never
/// rendered as protocol error documents.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("No host transport is attached to the current transaction")]
    MissingTransport,
    #[error("Request caching or the device endpoint is enabled but no distributed cache was registered")]
    MissingCache,
    #[error("The issuer cannot be inferred from the current request: {0}")]
    InvalidHost(String),
    #[error("No issuer is configured and none was resolved for the current transaction")]
    MissingIssuer,
    #[error("The {0} request was not handled by any handler")]
    RequestNotHandled(Endpoint),
    #[error("The {0} request was not passed through to the host application")]
    NotPassedThrough(Endpoint),
    #[error("The issuer cannot be changed once the validation stage has completed")]
    IssuerLocked,
    #[error("Invalid signing credentials: {0}")]
    SigningCredentials(String),
    #[error("Invalid sign-in principal: {0}")]
    InvalidPrincipal(String),
    #[error("Apply handlers must not reject requests (rejected with {0})")]
    ApplyRejected(String),
    #[error("Invalid response header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Token encoding failure: {0}")]
    TokenEncoding(#[from] jsonwebtoken::errors::Error),
    #[error("Invalid server configuration: {0}")]
    Configuration(String),
}

/// A protocol error caused by the caller, surfaced as `error`/`error_description`.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub struct ProtocolError {
    pub error: String,
    pub description: Option<String>,
    pub uri: Option<String>,
}

impl ProtocolError {
    pub fn new(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            description: Some(description.into()),
            uri: None,
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.error, description),
            None => f.write_str(&self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_display_includes_description() {
        let error = ProtocolError::new("invalid_request", "The 'client_id' parameter is missing.");
        assert_eq!(
            error.to_string(),
            "invalid_request: The 'client_id' parameter is missing."
        );
    }

    #[test]
    fn fatal_errors_name_the_endpoint() {
        let error = ServerError::RequestNotHandled(Endpoint::Authorization);
        assert_eq!(
            error.to_string(),
            "The authorization request was not handled by any handler"
        );
    }
}
