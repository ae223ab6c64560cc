//! Token serialization, validation and issuer resolution.
//!
//! Tokens are produced and consumed through two events, [`EventKind::GenerateToken`] and
//! [`EventKind::ValidateToken`], so deployments can add claims or extra checks by registering
//! their own handlers between the defaults below.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::cache::DistributedCache;
use crate::error::{ProtocolError, ServerError};
use crate::handlers::{
    EventContext, EventKind, Handler, HandlerDescriptor, Outcome, filters, order,
};
use crate::host::HostRequest;
use crate::options::{ServerOptions, SigningOptions};
use crate::protocol::{Principal, claims, code_challenge_methods, errors};
use crate::server::Services;
use crate::transaction::Endpoint;

pub const ATTACH_CORE_CLAIMS: i32 = 1_000;
pub const ATTACH_ISSUER_CLAIM: i32 = ATTACH_CORE_CLAIMS + order::STEP;
/// Serialization runs well past the claim handlers so custom claims can still be slotted in.
pub const SERIALIZE_TOKEN: i32 = ATTACH_ISSUER_CLAIM + 100_000;

pub const RESOLVE_VALIDATION_ISSUER: i32 = 1_000;
pub const DESERIALIZE_TOKEN: i32 = RESOLVE_VALIDATION_ISSUER + order::STEP;
pub const VALIDATE_TOKEN_TYPE: i32 = DESERIALIZE_TOKEN + order::STEP;
pub const VALIDATE_TOKEN_REVOCATION: i32 = VALIDATE_TOKEN_TYPE + order::STEP;

const REVOKED_TOKEN_PREFIX: &str = "oidc:revoked-token:";

/// `error_description` of a token refused only because it expired.
pub const EXPIRED_TOKEN_DESCRIPTION: &str = "The specified token is no longer valid.";

/// `error_description` of a token found on the revocation list.
pub const REVOKED_TOKEN_DESCRIPTION: &str = "The specified token has been revoked.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenType {
    AccessToken,
    IdentityToken,
    AuthorizationCode,
    RefreshToken,
    DeviceCode,
}

impl TokenType {
    /// Value of the private `token_usage` claim.
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::AccessToken => "access_token",
            TokenType::IdentityToken => "id_token",
            TokenType::AuthorizationCode => "authorization_code",
            TokenType::RefreshToken => "refresh_token",
            TokenType::DeviceCode => "device_code",
        }
    }

    pub fn from_usage(usage: &str) -> Option<Self> {
        match usage {
            "access_token" => Some(TokenType::AccessToken),
            "id_token" => Some(TokenType::IdentityToken),
            "authorization_code" => Some(TokenType::AuthorizationCode),
            "refresh_token" => Some(TokenType::RefreshToken),
            "device_code" => Some(TokenType::DeviceCode),
            _ => None,
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The token travelling through a `GenerateToken` or `ValidateToken` dispatch.
#[derive(Clone, Debug)]
pub struct TokenPayload {
    pub token_type: Option<TokenType>,
    pub principal: Principal,
    /// The serialized token: the output of generation, the input of validation.
    pub token: Option<String>,
    /// Issuer to stamp (generation) or to expect (validation).
    pub issuer: Option<Url>,
    pub lifetime: Option<Duration>,
    pub expected_types: Vec<TokenType>,
    pub validate_lifetime: bool,
}

impl TokenPayload {
    pub fn generate(token_type: TokenType, principal: Principal) -> Self {
        Self {
            token_type: Some(token_type),
            principal,
            token: None,
            issuer: None,
            lifetime: None,
            expected_types: Vec::new(),
            validate_lifetime: true,
        }
    }

    pub fn validate(token: impl Into<String>, expected_types: &[TokenType]) -> Self {
        Self {
            token_type: None,
            principal: Principal::new(),
            token: Some(token.into()),
            issuer: None,
            lifetime: None,
            expected_types: expected_types.to_vec(),
            validate_lifetime: true,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Accepts expired tokens (used for `id_token_hint`).
    pub fn without_lifetime_validation(mut self) -> Self {
        self.validate_lifetime = false;
        self
    }
}

/// Resolves the issuer of a call: the configured value, or the origin the transport reports
/// (`scheme://host{path_base}`).
pub fn resolve_issuer(options: &ServerOptions, request: &HostRequest) -> Result<Url, ServerError> {
    if let Some(issuer) = &options.issuer {
        return Ok(issuer.clone());
    }

    request.url_under_origin("")
}

/// Checks a PKCE `code_verifier` against the challenge stored with the code.
pub fn verify_code_challenge(verifier: &str, challenge: &str, method: &str) -> bool {
    match method {
        code_challenge_methods::S256 => {
            let hash = Sha256::digest(verifier.as_bytes());
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hash) == challenge
        }
        code_challenge_methods::PLAIN => verifier == challenge,
        _ => false,
    }
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Time left before the principal's `exp`, at least one second.
pub fn remaining_lifetime(principal: &Principal) -> Duration {
    let expires_at = principal
        .claim(claims::EXPIRES_AT)
        .and_then(Value::as_i64)
        .unwrap_or_else(now);
    Duration::from_secs(expires_at.saturating_sub(now()).max(1) as u64)
}

/// Keys used to sign and verify every token the server issues.
pub struct SigningCredentials {
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SigningCredentials {
    pub fn from_options(options: &SigningOptions) -> Result<Self, ServerError> {
        let algorithm = options.algorithm;

        if options.is_symmetric() {
            let secret = match &options.secret {
                Some(secret) => secret.as_bytes().to_vec(),
                None => {
                    warn!("No signing secret configured, using an ephemeral key; tokens won't survive a restart");
                    let mut bytes = [0u8; 32];
                    getrandom::fill(&mut bytes)
                        .map_err(|e| ServerError::SigningCredentials(e.to_string()))?;
                    bytes.to_vec()
                }
            };
            return Ok(Self {
                algorithm,
                encoding: EncodingKey::from_secret(&secret),
                decoding: DecodingKey::from_secret(&secret),
            });
        }

        let (Some(private_pem), Some(public_pem)) =
            (&options.private_key_pem, &options.public_key_pem)
        else {
            return Err(ServerError::SigningCredentials(format!(
                "{algorithm:?} requires both a private and a public PEM key"
            )));
        };
        let (private_pem, public_pem) = (private_pem.as_bytes(), public_pem.as_bytes());

        let keys = match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => EncodingKey::from_rsa_pem(private_pem)
                .and_then(|e| DecodingKey::from_rsa_pem(public_pem).map(|d| (e, d))),
            Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(private_pem)
                .and_then(|e| DecodingKey::from_ec_pem(public_pem).map(|d| (e, d))),
            Algorithm::EdDSA => EncodingKey::from_ed_pem(private_pem)
                .and_then(|e| DecodingKey::from_ed_pem(public_pem).map(|d| (e, d))),
            other => {
                return Err(ServerError::SigningCredentials(format!(
                    "unsupported signing algorithm {other:?}"
                )));
            }
        };
        let (encoding, decoding) =
            keys.map_err(|e| ServerError::SigningCredentials(e.to_string()))?;

        Ok(Self {
            algorithm,
            encoding,
            decoding,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn sign(&self, claims: &Map<String, Value>) -> Result<String, ServerError> {
        Ok(jsonwebtoken::encode(
            &Header::new(self.algorithm),
            claims,
            &self.encoding,
        )?)
    }

    pub fn verify(
        &self,
        token: &str,
        validation: &Validation,
    ) -> Result<Map<String, Value>, jsonwebtoken::errors::Error> {
        jsonwebtoken::decode::<Map<String, Value>>(token, &self.decoding, validation)
            .map(|data| data.claims)
    }

    pub(crate) fn validation(&self, issuer: &Url, validate_lifetime: bool) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[issuer.as_str()]);
        // Identity tokens carry an `aud`; audiences are checked by the endpoints themselves.
        validation.validate_aud = false;
        validation.validate_exp = validate_lifetime;
        validation
    }
}

/// Revoked token identifiers, kept in the distributed cache until the token would expire.
pub struct RevocationList<'a> {
    cache: &'a dyn DistributedCache,
}

impl<'a> RevocationList<'a> {
    pub fn new(cache: &'a dyn DistributedCache) -> Self {
        Self { cache }
    }

    fn key(token_id: &str) -> String {
        format!("{REVOKED_TOKEN_PREFIX}{token_id}")
    }

    pub async fn revoke(&self, token_id: &str, ttl: Duration) -> Result<(), ServerError> {
        self.cache.set(&Self::key(token_id), b"1".to_vec(), ttl).await?;
        Ok(())
    }

    /// Revokes the token a principal was extracted from. Returns false when it has no `jti`.
    pub async fn revoke_principal(&self, principal: &Principal) -> Result<bool, ServerError> {
        let Some(token_id) = principal.claim_str(claims::JWT_ID) else {
            return Ok(false);
        };
        self.revoke(token_id, remaining_lifetime(principal)).await?;
        Ok(true)
    }

    pub async fn is_revoked(&self, token_id: &str) -> Result<bool, ServerError> {
        Ok(self.cache.get(&Self::key(token_id)).await?.is_some())
    }
}

/// Mints a token for `principal` by dispatching `GenerateToken`.
pub async fn generate_token(
    context: &mut EventContext<'_>,
    token_type: TokenType,
    principal: Principal,
) -> Result<String, ServerError> {
    let dispatcher = context.dispatcher();
    let mut nested = EventContext::new(dispatcher, EventKind::GenerateToken, &mut *context.transaction)
        .with_token(TokenPayload::generate(token_type, principal));

    if let Outcome::Rejected(error) = dispatcher.dispatch(&mut nested).await? {
        return Err(ServerError::Configuration(format!(
            "generation of a {token_type} was rejected: {error}"
        )));
    }

    nested
        .token
        .and_then(|payload| payload.token)
        .ok_or_else(|| ServerError::Configuration(format!("no handler serialized the {token_type}")))
}

/// Validates `payload` by dispatching `ValidateToken`. The outer error is fatal; the inner one
/// is the protocol error explaining why the token was refused.
pub async fn validate_token(
    context: &mut EventContext<'_>,
    payload: TokenPayload,
) -> Result<Result<Principal, ProtocolError>, ServerError> {
    let dispatcher = context.dispatcher();
    let mut nested = EventContext::new(dispatcher, EventKind::ValidateToken, &mut *context.transaction)
        .with_token(payload);

    if let Outcome::Rejected(error) = dispatcher.dispatch(&mut nested).await? {
        return Ok(Err(error));
    }

    match nested.token {
        Some(payload) if payload.token_type.is_some() => Ok(Ok(payload.principal)),
        _ => Ok(Err(ProtocolError::new(
            errors::INVALID_TOKEN,
            "The specified token is invalid.",
        ))),
    }
}

fn payload_mut<'c>(context: &'c mut EventContext<'_>) -> Result<&'c mut TokenPayload, ServerError> {
    context.token.as_mut().ok_or_else(|| {
        ServerError::Configuration("token handler invoked without a token payload".into())
    })
}

/// Resolves the issuer of the call from configuration or from the transport.
pub struct InferIssuer;

#[async_trait]
impl Handler for InferIssuer {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let issuer = match (&context.options().issuer, context.transaction.host()) {
            (Some(issuer), _) => issuer.clone(),
            (None, Some(host)) => resolve_issuer(context.options(), &host.request)?,
            (None, None) => return Ok(()),
        };
        context.transaction.set_issuer(issuer)
    }
}

/// Stamps `jti`, `iat`, `exp` and `token_usage`.
pub struct AttachCoreClaims;

#[async_trait]
impl Handler for AttachCoreClaims {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let lifetimes = context.options().lifetimes.clone();
        let payload = payload_mut(context)?;
        let Some(token_type) = payload.token_type else {
            return Err(ServerError::Configuration("token type missing on generation".into()));
        };
        let lifetime = payload
            .lifetime
            .unwrap_or_else(|| lifetimes.for_token(token_type));
        let issued_at = now();

        let principal = &mut payload.principal;
        if principal.claim_str(claims::JWT_ID).is_none() {
            principal.set_claim(claims::JWT_ID, Uuid::new_v4().to_string());
        }
        principal
            .set_claim(claims::ISSUED_AT, issued_at)
            .set_claim(claims::EXPIRES_AT, issued_at + lifetime.as_secs() as i64)
            .set_claim(claims::TOKEN_USAGE, token_type.as_str());
        Ok(())
    }
}

pub struct AttachIssuerClaim;

#[async_trait]
impl Handler for AttachIssuerClaim {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let resolved = context.transaction.effective_issuer().cloned();
        let payload = payload_mut(context)?;
        let issuer = payload
            .issuer
            .clone()
            .or(resolved)
            .ok_or(ServerError::MissingIssuer)?;
        payload.principal.set_claim(claims::ISSUER, issuer.as_str());
        payload.issuer = Some(issuer);
        Ok(())
    }
}

pub struct SerializeToken {
    services: Arc<Services>,
}

#[async_trait]
impl Handler for SerializeToken {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let payload = payload_mut(context)?;
        if payload.principal.claim_str(claims::ISSUER).is_none() {
            return Err(ServerError::MissingIssuer);
        }
        let token = self.services.credentials().sign(payload.principal.claims())?;
        payload.token = Some(token);
        Ok(())
    }
}

/// Injects the expected issuer when the caller didn't set one.
pub struct ResolveValidationIssuer;

#[async_trait]
impl Handler for ResolveValidationIssuer {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let resolved = context.transaction.effective_issuer().cloned();
        let payload = payload_mut(context)?;
        if payload.issuer.is_none() {
            payload.issuer = Some(resolved.ok_or(ServerError::MissingIssuer)?);
        }
        Ok(())
    }
}

pub struct DeserializeToken {
    services: Arc<Services>,
}

#[async_trait]
impl Handler for DeserializeToken {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let payload = payload_mut(context)?;
        let (Some(token), Some(issuer)) = (payload.token.as_deref(), payload.issuer.as_ref()) else {
            return Err(ServerError::MissingIssuer);
        };

        let credentials = self.services.credentials();
        let validation = credentials.validation(issuer, payload.validate_lifetime);
        match credentials.verify(token, &validation) {
            Ok(claims) => {
                payload.principal = Principal::from_claims(claims);
                Ok(())
            }
            Err(error) => {
                debug!(%error, "token deserialization failed");
                let description = match error.kind() {
                    ErrorKind::ExpiredSignature => EXPIRED_TOKEN_DESCRIPTION,
                    _ => "The specified token is invalid.",
                };
                context.reject(errors::INVALID_TOKEN, description);
                Ok(())
            }
        }
    }
}

pub struct ValidateTokenType;

#[async_trait]
impl Handler for ValidateTokenType {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let payload = payload_mut(context)?;
        let token_type = payload
            .principal
            .claim_str(claims::TOKEN_USAGE)
            .and_then(TokenType::from_usage);

        match token_type {
            Some(token_type)
                if payload.expected_types.is_empty()
                    || payload.expected_types.contains(&token_type) =>
            {
                payload.token_type = Some(token_type);
            }
            _ => context.reject(
                errors::INVALID_TOKEN,
                "The specified token is not valid for this operation.",
            ),
        }
        Ok(())
    }
}

pub struct ValidateTokenRevocation {
    services: Arc<Services>,
}

#[async_trait]
impl Handler for ValidateTokenRevocation {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let payload = payload_mut(context)?;
        let Some(token_id) = payload.principal.claim_str(claims::JWT_ID) else {
            return Ok(());
        };
        if self.services.revocation_list()?.is_revoked(token_id).await? {
            context.reject(errors::INVALID_TOKEN, REVOKED_TOKEN_DESCRIPTION);
        }
        Ok(())
    }
}

pub(crate) fn descriptors(services: &Arc<Services>) -> Vec<HandlerDescriptor> {
    let mut descriptors: Vec<HandlerDescriptor> = Endpoint::ALL
        .into_iter()
        .map(|endpoint| {
            HandlerDescriptor::singleton(EventKind::ProcessRequest(endpoint), InferIssuer)
                .with_order(order::STEP)
        })
        .collect();

    descriptors.extend([
        HandlerDescriptor::singleton(EventKind::GenerateToken, AttachCoreClaims)
            .with_order(ATTACH_CORE_CLAIMS),
        HandlerDescriptor::singleton(EventKind::GenerateToken, AttachIssuerClaim)
            .with_order(ATTACH_ISSUER_CLAIM),
        HandlerDescriptor::singleton(
            EventKind::GenerateToken,
            SerializeToken {
                services: services.clone(),
            },
        )
        .with_order(SERIALIZE_TOKEN),
        HandlerDescriptor::singleton(EventKind::ValidateToken, ResolveValidationIssuer)
            .with_order(RESOLVE_VALIDATION_ISSUER),
        HandlerDescriptor::singleton(
            EventKind::ValidateToken,
            DeserializeToken {
                services: services.clone(),
            },
        )
        .with_order(DESERIALIZE_TOKEN),
        HandlerDescriptor::singleton(EventKind::ValidateToken, ValidateTokenType)
            .with_order(VALIDATE_TOKEN_TYPE),
        HandlerDescriptor::singleton(
            EventKind::ValidateToken,
            ValidateTokenRevocation {
                services: services.clone(),
            },
        )
        .with_order(VALIDATE_TOKEN_REVOCATION)
        .with_filter(filters::require_distributed_cache),
    ]);

    descriptors
}
