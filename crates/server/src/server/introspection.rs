//! Token introspection (RFC 7662).
//!
//! Only confidential clients may introspect. A token that fails validation, or that was neither
//! presented by nor issued for the caller, is reported as `{"active": false}` rather than as an
//! error, so callers cannot probe tokens that don't concern them.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::ServerError;
use crate::handlers::{EventContext, EventKind, Handler, HandlerDescriptor, order};
use crate::protocol::{Principal, Request, claims, errors, parameters};
use crate::server::Services;
use crate::server::protection::{TokenPayload, TokenType, validate_token};
use crate::server::shared::{AUTHENTICATE_CLIENT, VALIDATE_CLIENT_ID, client_descriptors};
use crate::transaction::Endpoint;

pub const VALIDATE_TOKEN_PARAMETER: i32 = VALIDATE_CLIENT_ID + order::STEP;
pub const VALIDATE_INTROSPECTED_TOKEN: i32 = AUTHENTICATE_CLIENT + order::STEP;
pub const ATTACH_INTROSPECTION_CLAIMS: i32 = order::LAST;

/// Claims copied verbatim into an active introspection response.
const INTROSPECTED_CLAIMS: [&str; 9] = [
    claims::SUBJECT,
    claims::SCOPE,
    claims::CLIENT_ID,
    claims::EXPIRES_AT,
    claims::ISSUED_AT,
    claims::ISSUER,
    claims::JWT_ID,
    claims::AUDIENCE,
    claims::TOKEN_USAGE,
];

/// Token types tried in order, the hinted one first.
fn candidate_types(hint: Option<&str>) -> Vec<TokenType> {
    let mut types = vec![
        TokenType::AccessToken,
        TokenType::RefreshToken,
        TokenType::IdentityToken,
        TokenType::AuthorizationCode,
    ];
    if let Some(hinted) = hint.and_then(TokenType::from_usage) {
        types.retain(|t| *t != hinted);
        types.insert(0, hinted);
    }
    types
}

/// True when `client_id` presented the token or is one of its audiences.
fn concerns_client(principal: &Principal, client_id: &str) -> bool {
    if principal.presenter() == Some(client_id) {
        return true;
    }
    match principal.claim(claims::AUDIENCE) {
        Some(Value::String(audience)) => audience == client_id,
        Some(Value::Array(audiences)) => audiences.iter().any(|a| a.as_str() == Some(client_id)),
        _ => false,
    }
}

pub struct ValidateTokenParameter;

#[async_trait]
impl Handler for ValidateTokenParameter {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        if context.request().and_then(Request::token).is_none() {
            context.reject(
                errors::INVALID_REQUEST,
                "The mandatory 'token' parameter is missing.",
            );
        }
        Ok(())
    }
}

/// Attaches the principal of the introspected token when it is valid and concerns the caller.
pub struct ValidateIntrospectedToken;

#[async_trait]
impl Handler for ValidateIntrospectedToken {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let request = context.transaction.request.clone().unwrap_or_default();
        let (Some(token), Some(client_id)) = (request.token(), request.client_id()) else {
            return Ok(());
        };

        let types = candidate_types(request.token_type_hint());
        match validate_token(context, TokenPayload::validate(token, &types)).await? {
            Ok(principal) if concerns_client(&principal, client_id) => {
                context.transaction.principal = Some(principal);
            }
            Ok(_) => debug!(client_id, "introspected token belongs to another client"),
            Err(error) => debug!(%error, "introspected token is not active"),
        }
        Ok(())
    }
}

pub struct AttachIntrospectionClaims;

#[async_trait]
impl Handler for AttachIntrospectionClaims {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        if context.transaction.response().is_some() {
            return Ok(());
        }
        let principal = context.transaction.principal.clone();
        let response = context.transaction.response_mut();
        let Some(principal) = principal else {
            response.set(parameters::ACTIVE, false);
            return Ok(());
        };

        response.set(parameters::ACTIVE, true);
        for claim in INTROSPECTED_CLAIMS {
            if let Some(value) = principal.claim(claim) {
                response.set(claim, value.clone());
            }
        }
        if principal.claim_str(claims::TOKEN_USAGE) == Some(TokenType::AccessToken.as_str()) {
            response.set(parameters::TOKEN_TYPE, "Bearer");
        }
        Ok(())
    }
}

pub(crate) fn descriptors(services: &Arc<Services>) -> Vec<HandlerDescriptor> {
    let validate = EventKind::Validate(Endpoint::Introspection);
    let mut descriptors = client_descriptors(services, Endpoint::Introspection, true);
    descriptors.extend([
        HandlerDescriptor::singleton(validate, ValidateTokenParameter)
            .with_order(VALIDATE_TOKEN_PARAMETER),
        HandlerDescriptor::singleton(validate, ValidateIntrospectedToken)
            .with_order(VALIDATE_INTROSPECTED_TOKEN),
        HandlerDescriptor::singleton(
            EventKind::Handle(Endpoint::Introspection),
            AttachIntrospectionClaims,
        )
        .with_order(ATTACH_INTROSPECTION_CLAIMS),
    ]);
    descriptors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hinted_type_is_tried_first() {
        let types = candidate_types(Some("refresh_token"));
        assert_eq!(types[0], TokenType::RefreshToken);
        assert_eq!(types.len(), 4);

        let types = candidate_types(Some("unknown"));
        assert_eq!(types[0], TokenType::AccessToken);
    }

    #[test]
    fn tokens_concern_their_presenter_and_audiences() {
        let mut principal = Principal::with_subject("alice");
        principal.set_claim(claims::CLIENT_ID, "app");
        assert!(concerns_client(&principal, "app"));
        assert!(!concerns_client(&principal, "other"));

        principal.set_claim(claims::AUDIENCE, serde_json::json!(["api", "other"]));
        assert!(concerns_client(&principal, "other"));
    }
}
