//! Userinfo endpoint: returns the claims of the user an access token was issued for.

use async_trait::async_trait;
use axum::http::header;

use crate::error::ServerError;
use crate::handlers::{EventContext, EventKind, Handler, HandlerDescriptor, order};
use crate::protocol::{Principal, Request, claims, errors, parameters, scopes};
use crate::server::protection::{TokenPayload, TokenType, validate_token};
use crate::server::shared::EXTRACT_CLIENT_CREDENTIALS;
use crate::transaction::Endpoint;

pub const EXTRACT_ACCESS_TOKEN: i32 = EXTRACT_CLIENT_CREDENTIALS;
pub const VALIDATE_ACCESS_TOKEN_PARAMETER: i32 = 1_000;
pub const VALIDATE_ACCESS_TOKEN: i32 = VALIDATE_ACCESS_TOKEN_PARAMETER + order::STEP;
pub const ATTACH_USERINFO_CLAIMS: i32 = order::LAST;

const PROFILE_CLAIMS: [&str; 4] = [
    claims::NAME,
    claims::GIVEN_NAME,
    claims::FAMILY_NAME,
    claims::PREFERRED_USERNAME,
];
const EMAIL_CLAIMS: [&str; 2] = [claims::EMAIL, claims::EMAIL_VERIFIED];

/// Moves a bearer token from the `Authorization` header into the request.
pub struct ExtractAccessToken;

#[async_trait]
impl Handler for ExtractAccessToken {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let bearer = context
            .transaction
            .host()
            .and_then(|host| host.request.header_str(header::AUTHORIZATION))
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string);

        if let (Some(token), Some(request)) = (bearer, context.transaction.request.as_mut()) {
            request.set_if_absent(parameters::ACCESS_TOKEN, token);
        }
        Ok(())
    }
}

pub struct ValidateAccessTokenParameter;

#[async_trait]
impl Handler for ValidateAccessTokenParameter {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        if context.request().and_then(Request::access_token).is_none() {
            context.reject(
                errors::INVALID_REQUEST,
                "The mandatory 'access_token' parameter is missing.",
            );
        }
        Ok(())
    }
}

pub struct ValidateAccessToken;

#[async_trait]
impl Handler for ValidateAccessToken {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(token) = context.request().and_then(Request::access_token).map(str::to_string) else {
            return Ok(());
        };

        match validate_token(context, TokenPayload::validate(token, &[TokenType::AccessToken])).await? {
            Ok(principal) if !principal.has_scope(scopes::OPENID) => context.reject(
                errors::INSUFFICIENT_SCOPE,
                "The 'openid' scope is required to access this resource.",
            ),
            Ok(principal) => context.transaction.principal = Some(principal),
            Err(_) => context.reject(
                errors::INVALID_TOKEN,
                "The specified access token is invalid.",
            ),
        }
        Ok(())
    }
}

/// Builds the userinfo document from the validated principal, filtered by granted scopes.
pub struct AttachUserinfoClaims;

#[async_trait]
impl Handler for AttachUserinfoClaims {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        if context.transaction.response().is_some() {
            return Ok(());
        }
        let Some(principal) = context.transaction.principal.clone() else {
            return Ok(());
        };

        let response = context.transaction.response_mut();
        response.set(claims::SUBJECT, principal.subject().unwrap_or_default());
        if let Some(presenter) = principal.presenter() {
            response.set(claims::AUDIENCE, presenter);
        }
        let mut copy = |names: &[&str], principal: &Principal| {
            for name in names {
                if let Some(value) = principal.claim(name) {
                    response.set(*name, value.clone());
                }
            }
        };
        if principal.has_scope(scopes::PROFILE) {
            copy(&PROFILE_CLAIMS, &principal);
        }
        if principal.has_scope(scopes::EMAIL) {
            copy(&EMAIL_CLAIMS, &principal);
        }
        Ok(())
    }
}

pub(crate) fn descriptors() -> Vec<HandlerDescriptor> {
    let endpoint = Endpoint::Userinfo;
    vec![
        HandlerDescriptor::singleton(EventKind::Extract(endpoint), ExtractAccessToken)
            .with_order(EXTRACT_ACCESS_TOKEN),
        HandlerDescriptor::singleton(EventKind::Validate(endpoint), ValidateAccessTokenParameter)
            .with_order(VALIDATE_ACCESS_TOKEN_PARAMETER),
        HandlerDescriptor::singleton(EventKind::Validate(endpoint), ValidateAccessToken)
            .with_order(VALIDATE_ACCESS_TOKEN),
        HandlerDescriptor::singleton(EventKind::Handle(endpoint), AttachUserinfoClaims)
            .with_order(ATTACH_USERINFO_CLAIMS),
    ]
}
