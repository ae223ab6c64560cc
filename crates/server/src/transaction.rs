//! Per-call context shared by every handler of one pipeline run.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::error::{ProtocolError, ServerError};
use crate::host::HostContext;
use crate::options::ServerOptions;
use crate::protocol::{Principal, Request, Response};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Authorization,
    Token,
    Introspection,
    Revocation,
    Userinfo,
    Logout,
    Device,
    Configuration,
}

impl Endpoint {
    pub const ALL: [Endpoint; 8] = [
        Endpoint::Authorization,
        Endpoint::Token,
        Endpoint::Introspection,
        Endpoint::Revocation,
        Endpoint::Userinfo,
        Endpoint::Logout,
        Endpoint::Device,
        Endpoint::Configuration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Authorization => "authorization",
            Endpoint::Token => "token",
            Endpoint::Introspection => "introspection",
            Endpoint::Revocation => "revocation",
            Endpoint::Userinfo => "userinfo",
            Endpoint::Logout => "logout",
            Endpoint::Device => "device",
            Endpoint::Configuration => "configuration",
        }
    }

    /// PascalCase name used in event tags (`ExtractLogoutRequest`).
    pub fn event_name(&self) -> &'static str {
        match self {
            Endpoint::Authorization => "Authorization",
            Endpoint::Token => "Token",
            Endpoint::Introspection => "Introspection",
            Endpoint::Revocation => "Revocation",
            Endpoint::Userinfo => "Userinfo",
            Endpoint::Logout => "Logout",
            Endpoint::Device => "Device",
            Endpoint::Configuration => "Configuration",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage the transaction is currently in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Created,
    Extract,
    Validate,
    Handle,
    Apply,
    Completed,
}

/// What the host must do once the pipeline returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The pipeline has not finished.
    Pending,
    /// The host response is complete and can be written as is.
    Completed,
    /// The host application is expected to produce (or finish) the response.
    Passthrough,
}

pub struct Transaction {
    id: Uuid,
    endpoint: Endpoint,
    options: Arc<ServerOptions>,
    stage: Stage,
    disposition: Disposition,
    issuer: Option<Url>,
    host: Option<HostContext>,
    pub request: Option<Request>,
    pub response: Option<Response>,
    /// Where Apply redirects the user agent, once validated.
    pub redirect_uri: Option<Url>,
    /// Principal extracted from a validated token (code, refresh token, hint...).
    pub principal: Option<Principal>,
    sign_in: Option<Principal>,
    /// Free-form values handlers use to talk to each other within one call.
    pub properties: HashMap<String, Value>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("stage", &self.stage)
            .field("disposition", &self.disposition)
            .field("issuer", &self.issuer.as_ref().map(Url::as_str))
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub fn new(endpoint: Endpoint, options: Arc<ServerOptions>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint,
            options,
            stage: Stage::Created,
            disposition: Disposition::Pending,
            issuer: None,
            host: None,
            request: None,
            response: None,
            redirect_uri: None,
            principal: None,
            sign_in: None,
            properties: HashMap::new(),
        }
    }

    pub fn with_host(mut self, host: HostContext) -> Self {
        self.host = Some(host);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub(crate) fn enter(&mut self, stage: Stage) {
        self.stage = stage;
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub(crate) fn set_disposition(&mut self, disposition: Disposition) {
        self.disposition = disposition;
    }

    pub fn issuer(&self) -> Option<&Url> {
        self.issuer.as_ref()
    }

    /// Sets the resolved issuer. Refused once the validation stage has completed.
    pub fn set_issuer(&mut self, issuer: Url) -> Result<(), ServerError> {
        if self.stage > Stage::Validate {
            return Err(ServerError::IssuerLocked);
        }
        self.issuer = Some(issuer);
        Ok(())
    }

    /// The configured issuer, or the one resolved for this call.
    pub fn effective_issuer(&self) -> Option<&Url> {
        self.options.issuer.as_ref().or(self.issuer.as_ref())
    }

    pub fn host(&self) -> Option<&HostContext> {
        self.host.as_ref()
    }

    /// The host context, or a fatal error when the call didn't come through a transport.
    pub fn require_host(&mut self) -> Result<&mut HostContext, ServerError> {
        self.host.as_mut().ok_or(ServerError::MissingTransport)
    }

    pub fn into_host(self) -> Option<HostContext> {
        self.host
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// The response, created empty if no handler produced one yet.
    pub fn response_mut(&mut self) -> &mut Response {
        self.response.get_or_insert_with(Response::default)
    }

    /// Replaces the response with an error document.
    pub fn attach_error(&mut self, error: &ProtocolError) {
        self.response = Some(Response::from(error));
    }

    /// Asks the pipeline to issue tokens for `principal` once the Handle stage completes.
    pub fn sign_in(&mut self, principal: Principal) {
        self.sign_in = Some(principal);
    }

    pub fn sign_in_principal(&self) -> Option<&Principal> {
        self.sign_in.as_ref()
    }

    pub(crate) fn sign_in_principal_mut(&mut self) -> Option<&mut Principal> {
        self.sign_in.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuer_is_locked_after_validation() {
        let mut transaction = Transaction::new(Endpoint::Logout, Arc::new(ServerOptions::default()));
        transaction.enter(Stage::Validate);
        transaction
            .set_issuer(Url::parse("https://example.org/").unwrap())
            .unwrap();

        transaction.enter(Stage::Handle);
        let result = transaction.set_issuer(Url::parse("https://evil.example/").unwrap());
        assert!(matches!(result, Err(ServerError::IssuerLocked)));
        assert_eq!(transaction.issuer().unwrap().as_str(), "https://example.org/");
    }

    #[test]
    fn missing_host_is_fatal() {
        let mut transaction = Transaction::new(Endpoint::Token, Arc::new(ServerOptions::default()));
        assert!(matches!(
            transaction.require_host(),
            Err(ServerError::MissingTransport)
        ));
    }
}
