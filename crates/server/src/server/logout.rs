//! RP-initiated logout.
//!
//! Errors are always rendered by the server itself: a logout request is only redirected back to
//! the client application once it fully succeeded.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ServerError;
use crate::handlers::{EventContext, EventKind, Handler, HandlerDescriptor, filters, order};
use crate::protocol::{Request, errors};
use crate::server::Services;
use crate::server::authorization::parse_redirect_uri;
use crate::server::protection::{TokenPayload, TokenType, validate_token};
use crate::transaction::Endpoint;

pub const VALIDATE_POST_LOGOUT_REDIRECT_URI_PARAMETER: i32 = 1_000;
pub const VALIDATE_ID_TOKEN_HINT: i32 = VALIDATE_POST_LOGOUT_REDIRECT_URI_PARAMETER + order::STEP;
pub const VALIDATE_CLIENT_POST_LOGOUT_REDIRECT_URI: i32 = VALIDATE_ID_TOKEN_HINT + order::STEP;
pub const ATTACH_POST_LOGOUT_REDIRECT_URI: i32 = VALIDATE_CLIENT_POST_LOGOUT_REDIRECT_URI + order::STEP;
pub const ATTACH_SIGN_OUT_RESPONSE: i32 = order::LAST;

pub struct ValidatePostLogoutRedirectUriParameter;

#[async_trait]
impl Handler for ValidatePostLogoutRedirectUriParameter {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let invalid = context
            .request()
            .and_then(Request::post_logout_redirect_uri)
            .is_some_and(|value| parse_redirect_uri(value).is_none());
        if invalid {
            context.reject(
                errors::INVALID_REQUEST,
                "The 'post_logout_redirect_uri' parameter must be a valid absolute URL without fragment.",
            );
        }
        Ok(())
    }
}

/// Validates `id_token_hint`, accepting expired identity tokens, and attaches its principal.
pub struct ValidateIdTokenHint;

#[async_trait]
impl Handler for ValidateIdTokenHint {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(hint) = context.request().and_then(Request::id_token_hint).map(str::to_string) else {
            return Ok(());
        };

        let payload =
            TokenPayload::validate(hint, &[TokenType::IdentityToken]).without_lifetime_validation();
        match validate_token(context, payload).await? {
            Ok(principal) => context.transaction.principal = Some(principal),
            Err(_) => context.reject(
                errors::INVALID_REQUEST,
                "The specified 'id_token_hint' is invalid.",
            ),
        }
        Ok(())
    }
}

/// The redirect target must be registered by the client named by `client_id` or by the
/// identity token hint.
pub struct ValidateClientPostLogoutRedirectUri {
    services: Arc<Services>,
}

#[async_trait]
impl Handler for ValidateClientPostLogoutRedirectUri {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let request = context.transaction.request.clone().unwrap_or_default();
        let Some(redirect_uri) = request.post_logout_redirect_uri() else {
            return Ok(());
        };
        let hinted_client = context
            .transaction
            .principal
            .as_ref()
            .and_then(|principal| principal.presenter().map(str::to_string));

        let client_id = match (request.client_id(), hinted_client.as_deref()) {
            (Some(client_id), Some(hinted)) if client_id != hinted => {
                context.reject(
                    errors::INVALID_REQUEST,
                    "The 'client_id' parameter doesn't match the client the 'id_token_hint' was issued to.",
                );
                return Ok(());
            }
            (Some(client_id), _) | (None, Some(client_id)) => client_id.to_string(),
            (None, None) => {
                context.reject(
                    errors::INVALID_REQUEST,
                    "The 'client_id' or 'id_token_hint' parameter is required with 'post_logout_redirect_uri'.",
                );
                return Ok(());
            }
        };

        let registered = self
            .services
            .find_application(&client_id)
            .await?
            .is_some_and(|application| application.has_post_logout_redirect_uri(redirect_uri));
        if !registered {
            context.reject(
                errors::INVALID_REQUEST,
                "The specified 'post_logout_redirect_uri' is not valid for this client application.",
            );
        }
        Ok(())
    }
}

pub struct AttachPostLogoutRedirectUri;

#[async_trait]
impl Handler for AttachPostLogoutRedirectUri {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        context.transaction.redirect_uri = context
            .request()
            .and_then(Request::post_logout_redirect_uri)
            .and_then(parse_redirect_uri);
        Ok(())
    }
}

/// Completes the sign-out when no handler produced a response of its own.
pub struct AttachSignOutResponse;

#[async_trait]
impl Handler for AttachSignOutResponse {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        context.transaction.response_mut();
        Ok(())
    }
}

pub(crate) fn descriptors(services: &Arc<Services>) -> Vec<HandlerDescriptor> {
    let validate = EventKind::Validate(Endpoint::Logout);
    vec![
        HandlerDescriptor::singleton(validate, ValidatePostLogoutRedirectUriParameter)
            .with_order(VALIDATE_POST_LOGOUT_REDIRECT_URI_PARAMETER),
        HandlerDescriptor::singleton(validate, ValidateIdTokenHint).with_order(VALIDATE_ID_TOKEN_HINT),
        HandlerDescriptor::singleton(
            validate,
            ValidateClientPostLogoutRedirectUri {
                services: services.clone(),
            },
        )
        .with_order(VALIDATE_CLIENT_POST_LOGOUT_REDIRECT_URI)
        .with_filter(filters::require_degraded_mode_disabled),
        HandlerDescriptor::singleton(validate, AttachPostLogoutRedirectUri)
            .with_order(ATTACH_POST_LOGOUT_REDIRECT_URI),
        HandlerDescriptor::singleton(EventKind::Handle(Endpoint::Logout), AttachSignOutResponse)
            .with_order(ATTACH_SIGN_OUT_RESPONSE),
    ]
}
