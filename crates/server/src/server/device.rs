//! Device authorization grant (RFC 8628).
//!
//! The device endpoint mints a `device_code` (a self-contained token) and a short `user_code`.
//! Both point at one pending entry in the distributed cache, which the application approves or
//! denies through [`DeviceAuthorizations`] once the user entered the code on the verification
//! page. The token endpoint polls that entry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::DistributedCache;
use crate::error::ServerError;
use crate::handlers::{EventContext, EventKind, Handler, HandlerDescriptor, filters, order};
use crate::protocol::{Principal, Request, claims, errors, grant_types, parameters, split_values};
use crate::server::Services;
use crate::server::protection::{TokenType, generate_token};
use crate::server::shared::{VALIDATE_CLIENT_ID, client_descriptors};
use crate::transaction::Endpoint;

pub const VALIDATE_DEVICE_GRANT: i32 = VALIDATE_CLIENT_ID + order::STEP;
pub const VALIDATE_DEVICE_SCOPE: i32 = VALIDATE_DEVICE_GRANT + order::STEP;
pub const ISSUE_DEVICE_CODES: i32 = order::LAST;

const DEVICE_AUTHORIZATION_PREFIX: &str = "oidc:device-authorization:";
const USER_CODE_PREFIX: &str = "oidc:user-code:";

/// Consonants only, so codes never spell words and survive being read aloud.
const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ";
const USER_CODE_LENGTH: usize = 8;

/// Bytes at or above this bound are dropped so every letter is equally likely.
const USER_CODE_BYTE_LIMIT: u8 =
    (256 / USER_CODE_ALPHABET.len() * USER_CODE_ALPHABET.len()) as u8;

pub fn generate_user_code() -> Result<String, ServerError> {
    let mut code = String::with_capacity(USER_CODE_LENGTH);
    let mut bytes = [0u8; USER_CODE_LENGTH * 2];
    while code.len() < USER_CODE_LENGTH {
        getrandom::fill(&mut bytes)
            .map_err(|e| ServerError::Configuration(format!("random source unavailable: {e}")))?;
        let missing = USER_CODE_LENGTH - code.len();
        code.extend(user_code_letters(&bytes).take(missing));
    }
    Ok(code)
}

fn user_code_letters(bytes: &[u8]) -> impl Iterator<Item = char> + '_ {
    bytes
        .iter()
        .filter(|b| **b < USER_CODE_BYTE_LIMIT)
        .map(|b| USER_CODE_ALPHABET[*b as usize % USER_CODE_ALPHABET.len()] as char)
}

/// Uppercases a code typed by a user and drops separators (`bcdf-ghjk` → `BCDFGHJK`).
pub fn normalize_user_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeviceAuthorizationStatus {
    Pending,
    Approved { principal: Principal },
    Denied,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub user_code: String,
    pub client_id: String,
    pub scope: String,
    #[serde(flatten)]
    pub status: DeviceAuthorizationStatus,
}

/// Pending device authorizations stored in the distributed cache.
pub struct DeviceAuthorizations<'a> {
    cache: &'a dyn DistributedCache,
    lifetime: Duration,
}

impl<'a> DeviceAuthorizations<'a> {
    pub fn new(cache: &'a dyn DistributedCache, lifetime_seconds: u64) -> Self {
        Self {
            cache,
            lifetime: Duration::from_secs(lifetime_seconds),
        }
    }

    fn device_key(device_id: &str) -> String {
        format!("{DEVICE_AUTHORIZATION_PREFIX}{device_id}")
    }

    fn user_code_key(user_code: &str) -> String {
        format!("{USER_CODE_PREFIX}{}", normalize_user_code(user_code))
    }

    async fn store(&self, device_id: &str, authorization: &DeviceAuthorization) -> Result<(), ServerError> {
        let payload = serde_json::to_vec(authorization)?;
        self.cache
            .set(&Self::device_key(device_id), payload, self.lifetime)
            .await?;
        Ok(())
    }

    pub async fn create(&self, device_id: &str, authorization: &DeviceAuthorization) -> Result<(), ServerError> {
        self.store(device_id, authorization).await?;
        self.cache
            .set(
                &Self::user_code_key(&authorization.user_code),
                device_id.as_bytes().to_vec(),
                self.lifetime,
            )
            .await?;
        Ok(())
    }

    pub async fn find(&self, device_id: &str) -> Result<Option<DeviceAuthorization>, ServerError> {
        match self.cache.get(&Self::device_key(device_id)).await? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
            None => Ok(None),
        }
    }

    /// Looks an authorization up by the code the user typed.
    pub async fn find_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<(String, DeviceAuthorization)>, ServerError> {
        let Some(device_id) = self.cache.get(&Self::user_code_key(user_code)).await? else {
            return Ok(None);
        };
        let device_id = String::from_utf8_lossy(&device_id).into_owned();
        Ok(self
            .find(&device_id)
            .await?
            .map(|authorization| (device_id, authorization)))
    }

    async fn resolve(
        &self,
        user_code: &str,
        status: DeviceAuthorizationStatus,
    ) -> Result<bool, ServerError> {
        let Some((device_id, mut authorization)) = self.find_by_user_code(user_code).await? else {
            return Ok(false);
        };
        if authorization.status != DeviceAuthorizationStatus::Pending {
            return Ok(false);
        }
        authorization.status = status;
        self.store(&device_id, &authorization).await?;
        Ok(true)
    }

    /// Grants the pending authorization to `principal`. Returns false for unknown or already
    /// resolved codes.
    pub async fn approve(&self, user_code: &str, principal: Principal) -> Result<bool, ServerError> {
        let approved = self
            .resolve(user_code, DeviceAuthorizationStatus::Approved { principal })
            .await?;
        if approved {
            info!(user_code = %normalize_user_code(user_code), "device authorization approved");
        }
        Ok(approved)
    }

    pub async fn deny(&self, user_code: &str) -> Result<bool, ServerError> {
        let denied = self
            .resolve(user_code, DeviceAuthorizationStatus::Denied)
            .await?;
        if denied {
            info!(user_code = %normalize_user_code(user_code), "device authorization denied");
        }
        Ok(denied)
    }

    pub async fn remove(&self, device_id: &str, user_code: &str) -> Result<(), ServerError> {
        self.cache.remove(&Self::device_key(device_id)).await?;
        self.cache.remove(&Self::user_code_key(user_code)).await?;
        Ok(())
    }
}

/// The device grant must be enabled for device codes to be redeemable.
pub struct ValidateDeviceGrant;

#[async_trait]
impl Handler for ValidateDeviceGrant {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        if !context.options().supports_grant_type(grant_types::DEVICE_CODE) {
            context.reject(
                errors::UNAUTHORIZED_CLIENT,
                "The device authorization grant is not enabled.",
            );
        }
        Ok(())
    }
}

pub struct ValidateDeviceScope;

#[async_trait]
impl Handler for ValidateDeviceScope {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let unsupported = context
            .request()
            .and_then(Request::scope)
            .is_some_and(|scope| split_values(scope).any(|s| !context.options().supports_scope(s)));
        if unsupported {
            context.reject(errors::INVALID_SCOPE, "The specified 'scope' is not supported.");
        }
        Ok(())
    }
}

/// Mints the device and user codes and records the pending authorization.
pub struct IssueDeviceCodes {
    services: Arc<Services>,
}

#[async_trait]
impl Handler for IssueDeviceCodes {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        if context.transaction.response().is_some() {
            return Ok(());
        }
        let request = context.transaction.request.clone().unwrap_or_default();
        let Some(client_id) = request.client_id() else {
            return Ok(());
        };
        let scope = request.scope().unwrap_or_default();
        let options = context.options();
        let lifetime = options.lifetimes.device_code;
        let interval = options.device.interval_seconds;
        let verification_uri = match &options.device.verification_uri {
            Some(uri) => uri.to_string(),
            None => {
                let issuer = context
                    .transaction
                    .effective_issuer()
                    .ok_or(ServerError::MissingIssuer)?;
                format!("{}/connect/verify", issuer.as_str().trim_end_matches('/'))
            }
        };

        let device_id = Uuid::new_v4().to_string();
        let user_code = generate_user_code()?;
        let mut principal = Principal::new();
        principal
            .set_claim(claims::JWT_ID, device_id.as_str())
            .set_claim(claims::CLIENT_ID, client_id)
            .set_claim(claims::SCOPE, scope);
        let device_code = generate_token(context, TokenType::DeviceCode, principal).await?;

        let authorization = DeviceAuthorization {
            user_code: user_code.clone(),
            client_id: client_id.to_string(),
            scope: scope.to_string(),
            status: DeviceAuthorizationStatus::Pending,
        };
        DeviceAuthorizations::new(self.services.cache()?, lifetime)
            .create(&device_id, &authorization)
            .await?;
        debug!(client_id, "device authorization issued");

        let response = context.transaction.response_mut();
        response.set(parameters::DEVICE_CODE, device_code);
        response.set(parameters::USER_CODE, user_code.as_str());
        response.set(
            parameters::VERIFICATION_URI_COMPLETE,
            format!("{verification_uri}?user_code={user_code}"),
        );
        response.set(parameters::VERIFICATION_URI, verification_uri);
        response.set(parameters::EXPIRES_IN, Value::from(lifetime));
        response.set(parameters::INTERVAL, Value::from(interval));
        Ok(())
    }
}

pub(crate) fn descriptors(services: &Arc<Services>) -> Vec<HandlerDescriptor> {
    let validate = EventKind::Validate(Endpoint::Device);
    let mut descriptors = client_descriptors(services, Endpoint::Device, false);
    descriptors.extend([
        HandlerDescriptor::singleton(validate, ValidateDeviceGrant).with_order(VALIDATE_DEVICE_GRANT),
        HandlerDescriptor::singleton(validate, ValidateDeviceScope).with_order(VALIDATE_DEVICE_SCOPE),
        HandlerDescriptor::singleton(
            EventKind::Handle(Endpoint::Device),
            IssueDeviceCodes {
                services: services.clone(),
            },
        )
        .with_order(ISSUE_DEVICE_CODES)
        .with_filter(filters::require_distributed_cache),
    ]);
    descriptors
}
