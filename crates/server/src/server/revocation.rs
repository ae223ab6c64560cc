//! Token revocation (RFC 7009).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::ServerError;
use crate::handlers::{EventContext, EventKind, Handler, HandlerDescriptor, filters, order};
use crate::protocol::{Request, errors};
use crate::server::Services;
use crate::server::introspection::{VALIDATE_TOKEN_PARAMETER, ValidateTokenParameter};
use crate::server::protection::{TokenPayload, TokenType, validate_token};
use crate::server::shared::{AUTHENTICATE_CLIENT, client_descriptors};
use crate::transaction::Endpoint;

pub const VALIDATE_TOKEN_TYPE_HINT: i32 = VALIDATE_TOKEN_PARAMETER + order::STEP;
pub const VALIDATE_REVOKED_TOKEN: i32 = AUTHENTICATE_CLIENT + order::STEP;
pub const REVOKE_TOKEN: i32 = order::LAST - order::STEP;
pub const ATTACH_REVOCATION_RESPONSE: i32 = order::LAST;

const REVOCABLE_TYPES: [TokenType; 2] = [TokenType::AccessToken, TokenType::RefreshToken];

fn require_no_distributed_cache(context: &EventContext<'_>) -> bool {
    !filters::require_distributed_cache(context)
}

pub struct ValidateTokenTypeHint;

#[async_trait]
impl Handler for ValidateTokenTypeHint {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let unsupported = context
            .request()
            .and_then(Request::token_type_hint)
            .is_some_and(|hint| {
                !TokenType::from_usage(hint).is_some_and(|t| REVOCABLE_TYPES.contains(&t))
            });
        if unsupported {
            context.reject(
                errors::UNSUPPORTED_TOKEN_TYPE,
                "The specified 'token_type_hint' is not supported.",
            );
        }
        Ok(())
    }
}

/// Without a distributed cache nothing can be revoked: self-contained tokens stay valid until
/// they expire.
pub struct RejectUnsupportedRevocation;

#[async_trait]
impl Handler for RejectUnsupportedRevocation {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        context.reject(
            errors::UNSUPPORTED_TOKEN_TYPE,
            "This server doesn't support token revocation.",
        );
        Ok(())
    }
}

/// Attaches the principal of the token when it is valid and was issued to the caller.
///
/// Invalid or foreign tokens still get a successful response.
pub struct ValidateRevokedToken;

#[async_trait]
impl Handler for ValidateRevokedToken {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let request = context.transaction.request.clone().unwrap_or_default();
        let Some(token) = request.token() else {
            return Ok(());
        };

        match validate_token(context, TokenPayload::validate(token, &REVOCABLE_TYPES)).await? {
            Ok(principal) if principal.presenter() == request.client_id() => {
                context.transaction.principal = Some(principal);
            }
            Ok(_) => debug!("revoked token was issued to another client"),
            Err(error) => debug!(%error, "revoked token is already invalid"),
        }
        Ok(())
    }
}

pub struct RevokeToken {
    services: Arc<Services>,
}

#[async_trait]
impl Handler for RevokeToken {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(principal) = context.transaction.principal.as_ref() else {
            return Ok(());
        };
        if self.services.revocation_list()?.revoke_principal(principal).await? {
            info!(
                subject = principal.subject().unwrap_or_default(),
                "token revoked"
            );
        }
        Ok(())
    }
}

/// Revocation answers with an empty JSON document.
pub struct AttachRevocationResponse;

#[async_trait]
impl Handler for AttachRevocationResponse {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        context.transaction.response_mut();
        Ok(())
    }
}

pub(crate) fn descriptors(services: &Arc<Services>) -> Vec<HandlerDescriptor> {
    let validate = EventKind::Validate(Endpoint::Revocation);
    let handle = EventKind::Handle(Endpoint::Revocation);
    let mut descriptors = client_descriptors(services, Endpoint::Revocation, false);
    descriptors.extend([
        HandlerDescriptor::singleton(validate, ValidateTokenParameter)
            .with_order(VALIDATE_TOKEN_PARAMETER),
        HandlerDescriptor::singleton(validate, ValidateTokenTypeHint)
            .with_order(VALIDATE_TOKEN_TYPE_HINT),
        HandlerDescriptor::singleton(validate, RejectUnsupportedRevocation)
            .with_order(order::FIRST)
            .with_filter(require_no_distributed_cache),
        HandlerDescriptor::singleton(validate, ValidateRevokedToken)
            .with_order(VALIDATE_REVOKED_TOKEN),
        HandlerDescriptor::singleton(
            handle,
            RevokeToken {
                services: services.clone(),
            },
        )
        .with_order(REVOKE_TOKEN)
        .with_filter(filters::require_distributed_cache),
        HandlerDescriptor::singleton(handle, AttachRevocationResponse)
            .with_order(ATTACH_REVOCATION_RESPONSE),
    ]);
    descriptors
}
