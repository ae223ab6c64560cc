//! OpenID Connect discovery document (`/.well-known/openid-configuration`).

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::error::ServerError;
use crate::handlers::{EventContext, EventKind, Handler, HandlerDescriptor, order};
use crate::options::ServerOptions;
use crate::protocol::code_challenge_methods;
use crate::transaction::Endpoint;

pub const ATTACH_CONFIGURATION: i32 = order::LAST;

#[derive(Debug, Serialize)]
pub struct OpenIdConfiguration {
    pub issuer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub introspection_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_authorization_endpoint: Option<String>,
    pub response_types_supported: Vec<String>,
    pub response_modes_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
}

impl OpenIdConfiguration {
    pub fn new(issuer: &Url, options: &ServerOptions) -> Self {
        let base = issuer.as_str().trim_end_matches('/');
        let endpoint = |endpoint: Endpoint| {
            options
                .endpoints
                .path(endpoint)
                .map(|path| format!("{base}{path}"))
        };
        let mut response_modes = options.response_modes.clone();
        if !response_modes.iter().any(|m| m == "form_post") {
            response_modes.push("form_post".into());
        }

        Self {
            issuer: issuer.to_string(),
            authorization_endpoint: endpoint(Endpoint::Authorization),
            token_endpoint: endpoint(Endpoint::Token),
            userinfo_endpoint: endpoint(Endpoint::Userinfo),
            revocation_endpoint: endpoint(Endpoint::Revocation),
            introspection_endpoint: endpoint(Endpoint::Introspection),
            end_session_endpoint: endpoint(Endpoint::Logout),
            device_authorization_endpoint: endpoint(Endpoint::Device),
            response_types_supported: options.response_types.clone(),
            response_modes_supported: response_modes,
            grant_types_supported: options.grant_types.clone(),
            subject_types_supported: vec!["public".to_string()],
            scopes_supported: options.scopes.clone(),
            id_token_signing_alg_values_supported: vec![format!("{:?}", options.signing.algorithm)],
            token_endpoint_auth_methods_supported: vec![
                "client_secret_basic".to_string(),
                "client_secret_post".to_string(),
                "none".to_string(),
            ],
            code_challenge_methods_supported: vec![
                code_challenge_methods::S256.to_string(),
                code_challenge_methods::PLAIN.to_string(),
            ],
        }
    }
}

pub struct AttachConfiguration;

#[async_trait]
impl Handler for AttachConfiguration {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        if context.transaction.response().is_some() {
            return Ok(());
        }
        let issuer = context
            .transaction
            .effective_issuer()
            .ok_or(ServerError::MissingIssuer)?;
        let document = serde_json::to_value(OpenIdConfiguration::new(issuer, context.options()))?;

        let response = context.transaction.response_mut();
        if let Value::Object(fields) = document {
            for (name, value) in fields {
                response.set(name, value);
            }
        }
        Ok(())
    }
}

pub(crate) fn descriptors() -> Vec<HandlerDescriptor> {
    vec![
        HandlerDescriptor::singleton(EventKind::Handle(Endpoint::Configuration), AttachConfiguration)
            .with_order(ATTACH_CONFIGURATION),
    ]
}
