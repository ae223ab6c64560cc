//! Token issuance for a principal signed in during the Handle stage.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ServerError;
use crate::handlers::{EventContext, EventKind, Handler, HandlerDescriptor, order};
use crate::protocol::{Principal, Request, claims, grant_types, parameters, response_types, scopes};
use crate::server::protection::{TokenType, generate_token};
use crate::transaction::Endpoint;

pub const VALIDATE_SIGN_IN_PRINCIPAL: i32 = 1_000;
pub const ATTACH_GRANTED_SCOPES: i32 = VALIDATE_SIGN_IN_PRINCIPAL + order::STEP;
pub const GENERATE_AUTHORIZATION_CODE: i32 = ATTACH_GRANTED_SCOPES + order::STEP;
pub const GENERATE_ACCESS_TOKEN: i32 = GENERATE_AUTHORIZATION_CODE + order::STEP;
pub const GENERATE_REFRESH_TOKEN: i32 = GENERATE_ACCESS_TOKEN + order::STEP;
pub const GENERATE_IDENTITY_TOKEN: i32 = GENERATE_REFRESH_TOKEN + order::STEP;

const SIGN_IN_ENDPOINTS: [Endpoint; 2] = [Endpoint::Authorization, Endpoint::Token];

/// Claims describing a previously issued token, never copied into a new one.
const TOKEN_CLAIMS: [&str; 12] = [
    claims::JWT_ID,
    claims::ISSUED_AT,
    claims::EXPIRES_AT,
    claims::ISSUER,
    claims::TOKEN_USAGE,
    claims::AUDIENCE,
    claims::AUTHORIZED_PARTY,
    claims::REDIRECT_URI,
    claims::CODE_CHALLENGE,
    claims::CODE_CHALLENGE_METHOD,
    claims::NONCE,
    claims::USER_CODE,
];

/// Copy of `principal` without the claims tied to the token it came from.
pub fn strip_token_claims(principal: &Principal) -> Principal {
    let mut stripped = principal.clone();
    for claim in TOKEN_CLAIMS {
        stripped.remove_claim(claim);
    }
    stripped
}

fn signed_in(context: &EventContext<'_>) -> Result<Principal, ServerError> {
    context
        .transaction
        .sign_in_principal()
        .cloned()
        .ok_or_else(|| ServerError::InvalidPrincipal("no principal was signed in".into()))
}

fn is_client_credentials(request: Option<&Request>) -> bool {
    request.and_then(Request::grant_type) == Some(grant_types::CLIENT_CREDENTIALS)
}

pub struct ValidateSignInPrincipal;

#[async_trait]
impl Handler for ValidateSignInPrincipal {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let principal = signed_in(context)?;
        if principal.subject().is_none_or(str::is_empty) {
            return Err(ServerError::InvalidPrincipal(
                "the mandatory 'sub' claim is missing".into(),
            ));
        }
        Ok(())
    }
}

/// Grants the requested scopes unless the application already chose them, and records the
/// presenter.
pub struct AttachGrantedScopes;

#[async_trait]
impl Handler for AttachGrantedScopes {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let request = context.transaction.request.clone().unwrap_or_default();
        let inherited = context
            .transaction
            .principal
            .as_ref()
            .map(|p| p.scopes().join(" "));

        let Some(principal) = context.transaction.sign_in_principal_mut() else {
            return Ok(());
        };
        if principal.claim_str(claims::SCOPE).is_none() {
            match (request.scope(), inherited) {
                (Some(requested), _) => principal.set_claim(claims::SCOPE, requested),
                (None, Some(inherited)) => principal.set_claim(claims::SCOPE, inherited),
                (None, None) => principal.set_claim(claims::SCOPE, ""),
            };
        }
        if principal.presenter().is_none()
            && let Some(client_id) = request.client_id()
        {
            principal.set_claim(claims::CLIENT_ID, client_id);
        }
        Ok(())
    }
}

pub struct GenerateAuthorizationCode;

#[async_trait]
impl Handler for GenerateAuthorizationCode {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let request = context.transaction.request.clone().unwrap_or_default();
        if !request.has_response_type(response_types::CODE) {
            return Ok(());
        }

        let mut principal = strip_token_claims(&signed_in(context)?);
        let code_claims = [
            (claims::REDIRECT_URI, request.redirect_uri()),
            (claims::CODE_CHALLENGE, request.code_challenge()),
            (claims::CODE_CHALLENGE_METHOD, request.code_challenge_method()),
            (claims::NONCE, request.nonce()),
        ];
        for (claim, value) in code_claims {
            if let Some(value) = value {
                principal.set_claim(claim, value);
            }
        }
        // A challenge without a method means `plain`.
        if request.code_challenge().is_some() && request.code_challenge_method().is_none() {
            principal.set_claim(claims::CODE_CHALLENGE_METHOD, "plain");
        }

        let code = generate_token(context, TokenType::AuthorizationCode, principal).await?;
        context
            .transaction
            .response_mut()
            .set(parameters::CODE, code);
        Ok(())
    }
}

pub struct GenerateAccessToken;

#[async_trait]
impl Handler for GenerateAccessToken {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        if context.endpoint() == Endpoint::Authorization
            && !context
                .request()
                .is_some_and(|r| r.has_response_type(response_types::TOKEN))
        {
            return Ok(());
        }

        let principal = strip_token_claims(&signed_in(context)?);
        let scope = principal.claim_str(claims::SCOPE).map(str::to_string);
        let lifetime = context.options().lifetimes.access_token;

        let token = generate_token(context, TokenType::AccessToken, principal).await?;
        let response = context.transaction.response_mut();
        response.set(parameters::ACCESS_TOKEN, token);
        response.set(parameters::TOKEN_TYPE, "Bearer");
        response.set(parameters::EXPIRES_IN, Value::from(lifetime));
        if let Some(scope) = scope.filter(|s| !s.is_empty()) {
            response.set(parameters::SCOPE, scope);
        }
        Ok(())
    }
}

pub struct GenerateRefreshToken;

#[async_trait]
impl Handler for GenerateRefreshToken {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let principal = strip_token_claims(&signed_in(context)?);
        if !principal.has_scope(scopes::OFFLINE_ACCESS)
            || !context.options().supports_grant_type(grant_types::REFRESH_TOKEN)
            || is_client_credentials(context.request())
        {
            return Ok(());
        }

        let token = generate_token(context, TokenType::RefreshToken, principal).await?;
        context
            .transaction
            .response_mut()
            .set(parameters::REFRESH_TOKEN, token);
        Ok(())
    }
}

pub struct GenerateIdentityToken;

#[async_trait]
impl Handler for GenerateIdentityToken {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let signed_in = signed_in(context)?;
        let request = context.transaction.request.clone().unwrap_or_default();
        if !signed_in.has_scope(scopes::OPENID) || is_client_credentials(Some(&request)) {
            return Ok(());
        }
        if context.endpoint() == Endpoint::Authorization
            && !request.has_response_type(response_types::ID_TOKEN)
        {
            return Ok(());
        }

        // The nonce comes from the authorization request, or from the redeemed code.
        let nonce = match context.endpoint() {
            Endpoint::Authorization => request.nonce().map(str::to_string),
            _ => context
                .transaction
                .principal
                .as_ref()
                .and_then(|p| p.claim_str(claims::NONCE))
                .map(str::to_string),
        };

        let mut principal = strip_token_claims(&signed_in);
        principal.remove_claim(claims::SCOPE);
        if let Some(client_id) = signed_in.presenter() {
            principal
                .set_claim(claims::AUDIENCE, client_id)
                .set_claim(claims::AUTHORIZED_PARTY, client_id);
        }
        if let Some(nonce) = nonce {
            principal.set_claim(claims::NONCE, nonce);
        }

        let token = generate_token(context, TokenType::IdentityToken, principal).await?;
        context
            .transaction
            .response_mut()
            .set(parameters::ID_TOKEN, token);
        Ok(())
    }
}

pub(crate) fn descriptors() -> Vec<HandlerDescriptor> {
    SIGN_IN_ENDPOINTS
        .into_iter()
        .flat_map(|endpoint| {
            let event = EventKind::ProcessSignIn(endpoint);
            let mut descriptors = vec![
                HandlerDescriptor::singleton(event, ValidateSignInPrincipal)
                    .with_order(VALIDATE_SIGN_IN_PRINCIPAL),
                HandlerDescriptor::singleton(event, AttachGrantedScopes)
                    .with_order(ATTACH_GRANTED_SCOPES),
                HandlerDescriptor::singleton(event, GenerateAccessToken)
                    .with_order(GENERATE_ACCESS_TOKEN),
                HandlerDescriptor::singleton(event, GenerateIdentityToken)
                    .with_order(GENERATE_IDENTITY_TOKEN),
            ];
            match endpoint {
                Endpoint::Authorization => descriptors.push(
                    HandlerDescriptor::singleton(event, GenerateAuthorizationCode)
                        .with_order(GENERATE_AUTHORIZATION_CODE),
                ),
                _ => descriptors.push(
                    HandlerDescriptor::singleton(event, GenerateRefreshToken)
                        .with_order(GENERATE_REFRESH_TOKEN),
                ),
            }
            descriptors
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripping_keeps_identity_claims() {
        let mut principal = Principal::with_subject("alice");
        principal
            .set_claim(claims::JWT_ID, "old")
            .set_claim(claims::TOKEN_USAGE, "authorization_code")
            .set_claim(claims::REDIRECT_URI, "https://app.example/cb")
            .set_claim(claims::EMAIL, "alice@example.org");

        let stripped = strip_token_claims(&principal);
        assert_eq!(stripped.subject(), Some("alice"));
        assert_eq!(stripped.claim_str(claims::EMAIL), Some("alice@example.org"));
        assert!(stripped.claim(claims::JWT_ID).is_none());
        assert!(stripped.claim(claims::TOKEN_USAGE).is_none());
        assert!(stripped.claim(claims::REDIRECT_URI).is_none());
    }
}
