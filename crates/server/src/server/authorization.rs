//! Authorization endpoint.
//!
//! Client and redirect checks run first; once the redirect target is trusted it is attached to
//! the transaction so every later error goes back to the client application. The Handle stage
//! has no default handler: the application authenticates the user and signs a principal in.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::error::ServerError;
use crate::handlers::{EventContext, EventKind, Handler, HandlerDescriptor, filters, order};
use crate::protocol::{
    Request, code_challenge_methods, errors, response_modes, response_types, scopes, split_values,
};
use crate::server::Services;
use crate::server::shared::{ValidateClientIdParameter, VALIDATE_CLIENT_ID};
use crate::transaction::Endpoint;

pub const VALIDATE_REDIRECT_URI_PARAMETER: i32 = VALIDATE_CLIENT_ID + order::STEP;
pub const VALIDATE_CLIENT_REDIRECT_URI: i32 = VALIDATE_REDIRECT_URI_PARAMETER + order::STEP;
pub const ATTACH_REDIRECT_URI: i32 = VALIDATE_CLIENT_REDIRECT_URI + order::STEP;
pub const VALIDATE_RESPONSE_TYPE: i32 = ATTACH_REDIRECT_URI + order::STEP;
pub const VALIDATE_RESPONSE_MODE: i32 = VALIDATE_RESPONSE_TYPE + order::STEP;
pub const VALIDATE_SCOPE: i32 = VALIDATE_RESPONSE_MODE + order::STEP;
pub const VALIDATE_NONCE: i32 = VALIDATE_SCOPE + order::STEP;
pub const VALIDATE_CODE_CHALLENGE: i32 = VALIDATE_NONCE + order::STEP;

/// Parses a redirection target: absolute, without fragment.
pub fn parse_redirect_uri(value: &str) -> Option<Url> {
    Url::parse(value)
        .ok()
        .filter(|url| !url.cannot_be_a_base() && url.fragment().is_none())
}

pub struct ValidateRedirectUriParameter;

#[async_trait]
impl Handler for ValidateRedirectUriParameter {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let error = match context.request().and_then(Request::redirect_uri) {
            None => Some("The mandatory 'redirect_uri' parameter is missing."),
            Some(value) if parse_redirect_uri(value).is_none() => {
                Some("The 'redirect_uri' parameter must be a valid absolute URL without fragment.")
            }
            Some(_) => None,
        };
        if let Some(description) = error {
            context.reject(errors::INVALID_REQUEST, description);
        }
        Ok(())
    }
}

/// Checks the client exists and registered the redirect target.
pub struct ValidateClientRedirectUri {
    services: Arc<Services>,
}

#[async_trait]
impl Handler for ValidateClientRedirectUri {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let request = context.transaction.request.clone().unwrap_or_default();
        let (Some(client_id), Some(redirect_uri)) = (request.client_id(), request.redirect_uri())
        else {
            return Ok(());
        };

        match self.services.find_application(client_id).await? {
            None => context.reject(errors::INVALID_REQUEST, "The specified 'client_id' is invalid."),
            Some(application) if !application.has_redirect_uri(redirect_uri) => context.reject(
                errors::INVALID_REQUEST,
                "The specified 'redirect_uri' is not valid for this client application.",
            ),
            Some(_) => {}
        }
        Ok(())
    }
}

pub struct AttachRedirectUri;

#[async_trait]
impl Handler for AttachRedirectUri {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let redirect_uri = context
            .request()
            .and_then(Request::redirect_uri)
            .and_then(parse_redirect_uri);
        context.transaction.redirect_uri = redirect_uri;
        Ok(())
    }
}

pub struct ValidateResponseType;

#[async_trait]
impl Handler for ValidateResponseType {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(response_type) = context.request().and_then(Request::response_type) else {
            context.reject(
                errors::INVALID_REQUEST,
                "The mandatory 'response_type' parameter is missing.",
            );
            return Ok(());
        };
        if !context.options().supports_response_type(response_type) {
            context.reject(
                errors::UNSUPPORTED_RESPONSE_TYPE,
                "The specified 'response_type' is not supported.",
            );
        }
        Ok(())
    }
}

pub struct ValidateResponseMode;

#[async_trait]
impl Handler for ValidateResponseMode {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(request) = context.request() else {
            return Ok(());
        };
        let Some(response_mode) = request.response_mode() else {
            return Ok(());
        };

        let unsupported = !context.options().supports_response_mode(response_mode);
        // Tokens must never travel in a query string.
        let leaks_tokens = response_mode == response_modes::QUERY
            && (request.has_response_type(response_types::TOKEN)
                || request.has_response_type(response_types::ID_TOKEN));

        if unsupported {
            context.reject(
                errors::INVALID_REQUEST,
                "The specified 'response_mode' is unsupported.",
            );
        } else if leaks_tokens {
            context.reject(
                errors::INVALID_REQUEST,
                "The specified 'response_type'/'response_mode' combination is invalid.",
            );
        }
        Ok(())
    }
}

pub struct ValidateScope;

#[async_trait]
impl Handler for ValidateScope {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(request) = context.request() else {
            return Ok(());
        };

        let requires_openid = request.has_response_type(response_types::ID_TOKEN);
        if requires_openid && !request.has_scope(scopes::OPENID) {
            context.reject(
                errors::INVALID_REQUEST,
                "The 'openid' scope is required when requesting an identity token.",
            );
            return Ok(());
        }

        let unsupported = request
            .scope()
            .is_some_and(|scope| split_values(scope).any(|s| !context.options().supports_scope(s)));
        if unsupported {
            context.reject(errors::INVALID_SCOPE, "The specified 'scope' is not supported.");
        }
        Ok(())
    }
}

pub struct ValidateNonce;

#[async_trait]
impl Handler for ValidateNonce {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let missing = context.request().is_some_and(|request| {
            request.has_response_type(response_types::ID_TOKEN) && request.nonce().is_none()
        });
        if missing {
            context.reject(
                errors::INVALID_REQUEST,
                "The mandatory 'nonce' parameter is missing.",
            );
        }
        Ok(())
    }
}

pub struct ValidateCodeChallenge;

#[async_trait]
impl Handler for ValidateCodeChallenge {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(request) = context.request() else {
            return Ok(());
        };
        let code_flow = request.has_response_type(response_types::CODE);
        let challenge = request.code_challenge();
        let method = request.code_challenge_method();

        let error = match (challenge, method) {
            (None, Some(_)) => Some("The 'code_challenge_method' parameter requires a 'code_challenge'."),
            (Some(_), _) if !code_flow => {
                Some("The 'code_challenge' parameter is only valid with the 'code' response type.")
            }
            (Some(_), Some(method))
                if method != code_challenge_methods::S256
                    && method != code_challenge_methods::PLAIN =>
            {
                Some("The specified 'code_challenge_method' is not supported.")
            }
            (None, None) if code_flow && context.options().require_pkce => {
                Some("The mandatory 'code_challenge' parameter is missing.")
            }
            _ => None,
        };
        if let Some(description) = error {
            context.reject(errors::INVALID_REQUEST, description);
        }
        Ok(())
    }
}

pub(crate) fn descriptors(services: &Arc<Services>) -> Vec<HandlerDescriptor> {
    let event = EventKind::Validate(Endpoint::Authorization);
    vec![
        HandlerDescriptor::singleton(event, ValidateClientIdParameter).with_order(VALIDATE_CLIENT_ID),
        HandlerDescriptor::singleton(event, ValidateRedirectUriParameter)
            .with_order(VALIDATE_REDIRECT_URI_PARAMETER),
        HandlerDescriptor::singleton(
            event,
            ValidateClientRedirectUri {
                services: services.clone(),
            },
        )
        .with_order(VALIDATE_CLIENT_REDIRECT_URI)
        .with_filter(filters::require_degraded_mode_disabled),
        HandlerDescriptor::singleton(event, AttachRedirectUri).with_order(ATTACH_REDIRECT_URI),
        HandlerDescriptor::singleton(event, ValidateResponseType).with_order(VALIDATE_RESPONSE_TYPE),
        HandlerDescriptor::singleton(event, ValidateResponseMode).with_order(VALIDATE_RESPONSE_MODE),
        HandlerDescriptor::singleton(event, ValidateScope).with_order(VALIDATE_SCOPE),
        HandlerDescriptor::singleton(event, ValidateNonce).with_order(VALIDATE_NONCE),
        HandlerDescriptor::singleton(event, ValidateCodeChallenge).with_order(VALIDATE_CODE_CHALLENGE),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_uris_must_be_absolute_without_fragment() {
        assert!(parse_redirect_uri("https://app.example/cb?x=1").is_some());
        assert!(parse_redirect_uri("/relative/cb").is_none());
        assert!(parse_redirect_uri("https://app.example/cb#frag").is_none());
        assert!(parse_redirect_uri("mailto:someone@example.org").is_none());
    }
}
