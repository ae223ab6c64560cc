//! Token endpoint: authorization code, refresh token, client credentials and device code grants.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ProtocolError, ServerError};
use crate::handlers::{EventContext, EventKind, Handler, HandlerDescriptor, filters, order};
use crate::protocol::{Principal, Request, claims, errors, grant_types, split_values};
use crate::server::Services;
use crate::server::device::{DeviceAuthorizationStatus, DeviceAuthorizations};
use crate::server::protection::{
    EXPIRED_TOKEN_DESCRIPTION, REVOKED_TOKEN_DESCRIPTION, TokenPayload, TokenType, validate_token,
    verify_code_challenge,
};
use crate::server::shared::{AUTHENTICATE_CLIENT, VALIDATE_CLIENT_ID, client_descriptors};
use crate::server::sign_in::strip_token_claims;
use crate::transaction::Endpoint;

pub const VALIDATE_GRANT_TYPE: i32 = VALIDATE_CLIENT_ID + order::STEP;
pub const VALIDATE_GRANT_PARAMETERS: i32 = VALIDATE_GRANT_TYPE + order::STEP;
pub const VALIDATE_CLIENT_TYPE: i32 = AUTHENTICATE_CLIENT + order::STEP;
pub const VALIDATE_GRANT_TOKEN: i32 = VALIDATE_CLIENT_TYPE + order::STEP;
pub const VALIDATE_DEVICE_AUTHORIZATION: i32 = VALIDATE_GRANT_TOKEN + order::STEP;
pub const VALIDATE_PRESENTER: i32 = VALIDATE_DEVICE_AUTHORIZATION + order::STEP;
pub const VALIDATE_REDIRECT_URI: i32 = VALIDATE_PRESENTER + order::STEP;
pub const VALIDATE_CODE_VERIFIER: i32 = VALIDATE_REDIRECT_URI + order::STEP;
pub const VALIDATE_REFRESHED_SCOPES: i32 = VALIDATE_CODE_VERIFIER + order::STEP;
pub const REDEEM_GRANT_TOKEN: i32 = VALIDATE_REFRESHED_SCOPES + order::STEP;

pub const SIGN_IN_VALIDATED_PRINCIPAL: i32 = order::LAST;

fn grant_type(context: &EventContext<'_>) -> Option<String> {
    context
        .request()
        .and_then(Request::grant_type)
        .map(str::to_string)
}

fn is_grant(context: &EventContext<'_>, grant: &str) -> bool {
    context.request().and_then(Request::grant_type) == Some(grant)
}

/// Grants redeeming a token issued earlier by the server.
fn redeems_token(context: &EventContext<'_>) -> bool {
    is_grant(context, grant_types::AUTHORIZATION_CODE)
        || is_grant(context, grant_types::REFRESH_TOKEN)
        || is_grant(context, grant_types::DEVICE_CODE)
}

fn require_device_code_grant(context: &EventContext<'_>) -> bool {
    is_grant(context, grant_types::DEVICE_CODE)
}

fn require_token_grant(context: &EventContext<'_>) -> bool {
    is_grant(context, grant_types::AUTHORIZATION_CODE) || is_grant(context, grant_types::REFRESH_TOKEN)
}

pub struct ValidateGrantType;

#[async_trait]
impl Handler for ValidateGrantType {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        match grant_type(context) {
            None => context.reject(
                errors::INVALID_REQUEST,
                "The mandatory 'grant_type' parameter is missing.",
            ),
            Some(grant) if !context.options().supports_grant_type(&grant) => context.reject(
                errors::UNSUPPORTED_GRANT_TYPE,
                "The specified 'grant_type' is not supported.",
            ),
            Some(_) => {}
        }
        Ok(())
    }
}

pub struct ValidateGrantParameters;

#[async_trait]
impl Handler for ValidateGrantParameters {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(request) = context.request() else {
            return Ok(());
        };
        let missing = match request.grant_type() {
            Some(grant_types::AUTHORIZATION_CODE) if request.code().is_none() => Some("code"),
            Some(grant_types::REFRESH_TOKEN) if request.refresh_token().is_none() => {
                Some("refresh_token")
            }
            Some(grant_types::DEVICE_CODE) if request.device_code().is_none() => Some("device_code"),
            _ => None,
        };
        if let Some(parameter) = missing {
            context.reject(
                errors::INVALID_REQUEST,
                &format!("The mandatory '{parameter}' parameter is missing."),
            );
        }
        Ok(())
    }
}

/// Only confidential clients may use the client credentials grant.
pub struct ValidateClientType {
    services: Arc<Services>,
}

#[async_trait]
impl Handler for ValidateClientType {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        if !is_grant(context, grant_types::CLIENT_CREDENTIALS) {
            return Ok(());
        }
        let Some(client_id) = context.request().and_then(Request::client_id).map(str::to_string) else {
            return Ok(());
        };
        let confidential = self
            .services
            .find_application(&client_id)
            .await?
            .is_some_and(|application| application.is_confidential());
        if !confidential {
            context.reject(
                errors::UNAUTHORIZED_CLIENT,
                "The specified 'grant_type' is not valid for this client application.",
            );
        }
        Ok(())
    }
}

/// Validates the authorization code or refresh token and attaches its principal.
pub struct ValidateGrantToken;

#[async_trait]
impl Handler for ValidateGrantToken {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(request) = context.request() else {
            return Ok(());
        };
        let (token, token_type, description) = match request.grant_type() {
            Some(grant_types::AUTHORIZATION_CODE) => (
                request.code(),
                TokenType::AuthorizationCode,
                "The specified authorization code is invalid.",
            ),
            Some(grant_types::REFRESH_TOKEN) => (
                request.refresh_token(),
                TokenType::RefreshToken,
                "The specified refresh token is invalid.",
            ),
            _ => return Ok(()),
        };
        let Some(token) = token.map(str::to_string) else {
            return Ok(());
        };

        match validate_token(context, TokenPayload::validate(token, &[token_type])).await? {
            Ok(principal) => context.transaction.principal = Some(principal),
            Err(error) => {
                debug!(%error, "grant token rejected");
                context.reject(errors::INVALID_GRANT, description);
            }
        }
        Ok(())
    }
}

/// Resolves the state of a device authorization and, once approved, its principal.
pub struct ValidateDeviceAuthorization {
    services: Arc<Services>,
}

#[async_trait]
impl Handler for ValidateDeviceAuthorization {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(device_code) = context.request().and_then(Request::device_code).map(str::to_string) else {
            return Ok(());
        };

        let device = match validate_token(
            context,
            TokenPayload::validate(device_code, &[TokenType::DeviceCode]),
        )
        .await?
        {
            Ok(principal) => principal,
            // A redeemed device code is revoked, which reads as expired to the polling device.
            Err(error)
                if matches!(
                    error.description.as_deref(),
                    Some(EXPIRED_TOKEN_DESCRIPTION | REVOKED_TOKEN_DESCRIPTION)
                ) =>
            {
                context.reject(errors::EXPIRED_TOKEN, "The specified 'device_code' has expired.");
                return Ok(());
            }
            Err(_) => {
                context.reject(errors::INVALID_GRANT, "The specified 'device_code' is invalid.");
                return Ok(());
            }
        };
        let Some(device_id) = device.claim_str(claims::JWT_ID) else {
            context.reject(errors::INVALID_GRANT, "The specified 'device_code' is invalid.");
            return Ok(());
        };

        let authorizations = DeviceAuthorizations::new(
            self.services.cache()?,
            context.options().lifetimes.device_code,
        );
        let Some(authorization) = authorizations.find(device_id).await? else {
            context.reject(errors::EXPIRED_TOKEN, "The specified 'device_code' has expired.");
            return Ok(());
        };

        let rejection = match authorization.status {
            DeviceAuthorizationStatus::Pending => Some(ProtocolError::new(
                errors::AUTHORIZATION_PENDING,
                "The authorization has not been granted yet.",
            )),
            DeviceAuthorizationStatus::Denied => Some(ProtocolError::new(
                errors::ACCESS_DENIED,
                "The authorization was denied by the user.",
            )),
            DeviceAuthorizationStatus::Approved { principal } => {
                authorizations.remove(device_id, &authorization.user_code).await?;
                let mut principal = strip_token_claims(&principal);
                principal.set_claim(claims::CLIENT_ID, authorization.client_id.as_str());
                if principal.claim_str(claims::SCOPE).is_none() {
                    principal.set_claim(claims::SCOPE, authorization.scope.as_str());
                }
                // Carries the device code identifier so redemption can revoke it.
                principal.set_claim(claims::JWT_ID, device_id);
                if let Some(expires_at) = device.claim(claims::EXPIRES_AT) {
                    principal.set_claim(claims::EXPIRES_AT, expires_at.clone());
                }
                context.transaction.principal = Some(principal);
                None
            }
        };
        if let Some(rejection) = rejection {
            context.reject_with(rejection);
        }
        Ok(())
    }
}

/// The redeemed token must have been issued to the calling client.
pub struct ValidatePresenter;

#[async_trait]
impl Handler for ValidatePresenter {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let client_id = context.request().and_then(Request::client_id);
        let presenter = context.transaction.principal.as_ref().and_then(Principal::presenter);
        let mismatch = match (presenter, client_id) {
            (Some(presenter), Some(client_id)) => presenter != client_id,
            (Some(_), None) => true,
            _ => false,
        };
        if mismatch {
            context.reject(
                errors::INVALID_GRANT,
                "The specified token cannot be used by this client application.",
            );
        }
        Ok(())
    }
}

/// `redirect_uri` must repeat the value used to obtain the code.
pub struct ValidateRedirectUri;

#[async_trait]
impl Handler for ValidateRedirectUri {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let expected = context
            .transaction
            .principal
            .as_ref()
            .and_then(|p| p.claim_str(claims::REDIRECT_URI));
        let Some(expected) = expected else {
            return Ok(());
        };
        let matches = context.request().and_then(Request::redirect_uri) == Some(expected);
        if !matches {
            context.reject(
                errors::INVALID_GRANT,
                "The specified 'redirect_uri' doesn't match the one used to obtain the code.",
            );
        }
        Ok(())
    }
}

pub struct ValidateCodeVerifier;

#[async_trait]
impl Handler for ValidateCodeVerifier {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let principal = context.transaction.principal.as_ref();
        let challenge = principal.and_then(|p| p.claim_str(claims::CODE_CHALLENGE));
        let method = principal
            .and_then(|p| p.claim_str(claims::CODE_CHALLENGE_METHOD))
            .unwrap_or("plain");
        let verifier = context.request().and_then(Request::code_verifier);

        let error = match (challenge, verifier) {
            (None, None) => None,
            (None, Some(_)) => Some((
                errors::INVALID_REQUEST,
                "The 'code_verifier' parameter is not valid for this code.",
            )),
            (Some(_), None) => Some((
                errors::INVALID_REQUEST,
                "The mandatory 'code_verifier' parameter is missing.",
            )),
            (Some(challenge), Some(verifier)) if !verify_code_challenge(verifier, challenge, method) => {
                Some((errors::INVALID_GRANT, "The specified 'code_verifier' is invalid."))
            }
            _ => None,
        };
        if let Some((error, description)) = error {
            context.reject(error, description);
        }
        Ok(())
    }
}

/// A refresh request may narrow the granted scopes, never widen them.
pub struct ValidateRefreshedScopes;

#[async_trait]
impl Handler for ValidateRefreshedScopes {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(requested) = context.request().and_then(Request::scope) else {
            return Ok(());
        };
        let granted = context
            .transaction
            .principal
            .as_ref()
            .map(Principal::scopes)
            .unwrap_or_default();
        if split_values(requested).any(|scope| !granted.contains(&scope)) {
            context.reject(
                errors::INVALID_SCOPE,
                "The specified 'scope' exceeds the scopes originally granted.",
            );
        }
        Ok(())
    }
}

/// Makes codes, refresh tokens and device codes single-use.
pub struct RedeemGrantToken {
    services: Arc<Services>,
}

#[async_trait]
impl Handler for RedeemGrantToken {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(principal) = context.transaction.principal.as_ref() else {
            return Ok(());
        };
        self.services
            .revocation_list()?
            .revoke_principal(principal)
            .await?;
        Ok(())
    }
}

/// Signs in the principal carried by the redeemed code, refresh token or device code.
pub struct SignInValidatedPrincipal;

#[async_trait]
impl Handler for SignInValidatedPrincipal {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        if context.transaction.sign_in_principal().is_some() || context.transaction.response().is_some() {
            return Ok(());
        }
        let Some(validated) = context.transaction.principal.as_ref() else {
            return Ok(());
        };

        let mut principal = strip_token_claims(validated);
        if let Some(scope) = context.request().and_then(Request::scope) {
            principal.set_claim(claims::SCOPE, scope);
        }
        context.transaction.sign_in(principal);
        Ok(())
    }
}

/// Signs the client itself in for the client credentials grant.
///
/// Not registered by default: deployments opt in with [`SignInClientCredentials::descriptor`].
pub struct SignInClientCredentials;

impl SignInClientCredentials {
    pub fn descriptor() -> HandlerDescriptor {
        HandlerDescriptor::singleton(EventKind::Handle(Endpoint::Token), SignInClientCredentials)
    }
}

#[async_trait]
impl Handler for SignInClientCredentials {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        if !is_grant(context, grant_types::CLIENT_CREDENTIALS) {
            return Ok(());
        }
        let Some(request) = context.request() else {
            return Ok(());
        };
        let Some(client_id) = request.client_id().map(str::to_string) else {
            return Ok(());
        };

        let mut principal = Principal::with_subject(client_id.as_str());
        principal.set_claim(claims::CLIENT_ID, client_id);
        principal.set_claim(claims::SCOPE, request.scope().unwrap_or_default());
        context.transaction.sign_in(principal);
        Ok(())
    }
}

pub(crate) fn descriptors(services: &Arc<Services>) -> Vec<HandlerDescriptor> {
    let validate = EventKind::Validate(Endpoint::Token);
    let mut descriptors = client_descriptors(services, Endpoint::Token, false);
    descriptors.extend([
        HandlerDescriptor::singleton(validate, ValidateGrantType).with_order(VALIDATE_GRANT_TYPE),
        HandlerDescriptor::singleton(validate, ValidateGrantParameters)
            .with_order(VALIDATE_GRANT_PARAMETERS),
        HandlerDescriptor::singleton(
            validate,
            ValidateClientType {
                services: services.clone(),
            },
        )
        .with_order(VALIDATE_CLIENT_TYPE)
        .with_filter(filters::require_degraded_mode_disabled),
        HandlerDescriptor::singleton(validate, ValidateGrantToken)
            .with_order(VALIDATE_GRANT_TOKEN)
            .with_filter(require_token_grant),
        HandlerDescriptor::singleton(
            validate,
            ValidateDeviceAuthorization {
                services: services.clone(),
            },
        )
        .with_order(VALIDATE_DEVICE_AUTHORIZATION)
        .with_filter(require_device_code_grant)
        .with_filter(filters::require_distributed_cache),
        HandlerDescriptor::singleton(validate, ValidatePresenter)
            .with_order(VALIDATE_PRESENTER)
            .with_filter(redeems_token),
        HandlerDescriptor::singleton(validate, ValidateRedirectUri)
            .with_order(VALIDATE_REDIRECT_URI)
            .with_filter(redeems_token),
        HandlerDescriptor::singleton(validate, ValidateCodeVerifier)
            .with_order(VALIDATE_CODE_VERIFIER)
            .with_filter(redeems_token),
        HandlerDescriptor::singleton(validate, ValidateRefreshedScopes)
            .with_order(VALIDATE_REFRESHED_SCOPES)
            .with_filter(redeems_token),
        HandlerDescriptor::singleton(
            validate,
            RedeemGrantToken {
                services: services.clone(),
            },
        )
        .with_order(REDEEM_GRANT_TOKEN)
        .with_filter(redeems_token)
        .with_filter(filters::require_distributed_cache),
        HandlerDescriptor::singleton(EventKind::Handle(Endpoint::Token), SignInValidatedPrincipal)
            .with_order(SIGN_IN_VALIDATED_PRINCIPAL)
            .with_filter(redeems_token),
    ]);
    descriptors
}
