//! Runtime options of the server.

use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::Deserialize;
use url::Url;

use crate::protocol::{grant_types, response_modes, response_types, scopes, split_values};
use crate::server::protection::TokenType;
use crate::transaction::Endpoint;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Explicit issuer. When unset, the issuer is inferred from each request's origin.
    pub issuer: Option<Url>,
    /// Path prefix under which the host mounts every endpoint (e.g. `/oauth`).
    pub path_base: String,
    pub endpoints: EndpointPaths,
    pub lifetimes: TokenLifetimes,
    pub request_caching: RequestCachingOptions,
    pub passthrough: PassthroughOptions,
    pub signing: SigningOptions,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub response_modes: Vec<String>,
    pub scopes: Vec<String>,
    pub require_pkce: bool,
    pub device: DeviceOptions,
    #[serde(skip)]
    pub(crate) features: Features,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            issuer: None,
            path_base: String::new(),
            endpoints: EndpointPaths::default(),
            lifetimes: TokenLifetimes::default(),
            request_caching: RequestCachingOptions::default(),
            passthrough: PassthroughOptions::default(),
            signing: SigningOptions::default(),
            grant_types: [
                grant_types::AUTHORIZATION_CODE,
                grant_types::REFRESH_TOKEN,
                grant_types::CLIENT_CREDENTIALS,
            ]
            .map(String::from)
            .to_vec(),
            response_types: [
                response_types::CODE,
                response_types::ID_TOKEN,
                "code id_token",
                "id_token token",
                "code id_token token",
                response_types::NONE,
            ]
            .map(String::from)
            .to_vec(),
            response_modes: [response_modes::QUERY, response_modes::FRAGMENT]
                .map(String::from)
                .to_vec(),
            scopes: [
                scopes::OPENID,
                scopes::PROFILE,
                scopes::EMAIL,
                scopes::OFFLINE_ACCESS,
            ]
            .map(String::from)
            .to_vec(),
            require_pkce: false,
            device: DeviceOptions::default(),
            features: Features::default(),
        }
    }
}

impl ServerOptions {
    pub fn supports_grant_type(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }

    /// Response types are compared as unordered sets of space-delimited values.
    pub fn supports_response_type(&self, response_type: &str) -> bool {
        fn normalize(value: &str) -> Vec<&str> {
            let mut values: Vec<&str> = split_values(value).collect();
            values.sort_unstable();
            values.dedup();
            values
        }
        let requested = normalize(response_type);
        self.response_types
            .iter()
            .any(|supported| normalize(supported) == requested)
    }

    pub fn supports_response_mode(&self, response_mode: &str) -> bool {
        self.response_modes.iter().any(|m| m == response_mode)
    }

    pub fn supports_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn has_distributed_cache(&self) -> bool {
        self.features.distributed_cache
    }

    /// Degraded mode: no application store is registered, client checks are skipped.
    pub fn is_degraded(&self) -> bool {
        !self.features.application_store
    }
}

/// Collaborators registered on the builder, exposed to filters.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Features {
    pub(crate) distributed_cache: bool,
    pub(crate) application_store: bool,
}

/// Relative path of every endpoint. `None` disables the endpoint.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EndpointPaths {
    pub authorization: Option<String>,
    pub token: Option<String>,
    pub introspection: Option<String>,
    pub revocation: Option<String>,
    pub userinfo: Option<String>,
    pub logout: Option<String>,
    pub device: Option<String>,
    pub configuration: Option<String>,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            authorization: Some("/connect/authorize".into()),
            token: Some("/connect/token".into()),
            introspection: Some("/connect/introspect".into()),
            revocation: Some("/connect/revoke".into()),
            userinfo: Some("/connect/userinfo".into()),
            logout: Some("/connect/logout".into()),
            // Opt-in: the device flow needs a distributed cache.
            device: None,
            configuration: Some("/.well-known/openid-configuration".into()),
        }
    }
}

impl EndpointPaths {
    pub fn path(&self, endpoint: Endpoint) -> Option<&str> {
        match endpoint {
            Endpoint::Authorization => self.authorization.as_deref(),
            Endpoint::Token => self.token.as_deref(),
            Endpoint::Introspection => self.introspection.as_deref(),
            Endpoint::Revocation => self.revocation.as_deref(),
            Endpoint::Userinfo => self.userinfo.as_deref(),
            Endpoint::Logout => self.logout.as_deref(),
            Endpoint::Device => self.device.as_deref(),
            Endpoint::Configuration => self.configuration.as_deref(),
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = (Endpoint, &str)> {
        Endpoint::ALL
            .into_iter()
            .filter_map(|endpoint| self.path(endpoint).map(|path| (endpoint, path)))
    }
}

/// Token lifetimes, in seconds.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TokenLifetimes {
    pub access_token: u64,
    pub identity_token: u64,
    pub authorization_code: u64,
    pub refresh_token: u64,
    pub device_code: u64,
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self {
            access_token: 3600,
            identity_token: 1200,
            authorization_code: 300,
            refresh_token: 14 * 86400,
            device_code: 600,
        }
    }
}

impl TokenLifetimes {
    pub fn for_token(&self, token_type: TokenType) -> Duration {
        Duration::from_secs(match token_type {
            TokenType::AccessToken => self.access_token,
            TokenType::IdentityToken => self.identity_token,
            TokenType::AuthorizationCode => self.authorization_code,
            TokenType::RefreshToken => self.refresh_token,
            TokenType::DeviceCode => self.device_code,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RequestCachingOptions {
    pub authorization: bool,
    pub logout: bool,
    pub ttl_seconds: u64,
}

impl Default for RequestCachingOptions {
    fn default() -> Self {
        Self {
            authorization: false,
            logout: false,
            ttl_seconds: 3600,
        }
    }
}

impl RequestCachingOptions {
    pub fn enabled_for(&self, endpoint: Endpoint) -> bool {
        match endpoint {
            Endpoint::Authorization => self.authorization,
            Endpoint::Logout => self.logout,
            _ => false,
        }
    }

    pub fn any_enabled(&self) -> bool {
        self.authorization || self.logout
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PassthroughOptions {
    /// Endpoints whose Handle stage is handed to the host application.
    pub endpoints: Vec<Endpoint>,
    /// Endpoints whose error responses are rendered by the host application.
    pub errors: Vec<Endpoint>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SigningOptions {
    pub algorithm: Algorithm,
    /// Shared secret for the HMAC algorithms.
    pub secret: Option<String>,
    pub private_key_pem: Option<String>,
    pub public_key_pem: Option<String>,
}

impl Default for SigningOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::HS256,
            secret: None,
            private_key_pem: None,
            public_key_pem: None,
        }
    }
}

impl SigningOptions {
    pub fn is_symmetric(&self) -> bool {
        matches!(
            self.algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        )
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// Where users enter their user code. Defaults to `{issuer}/connect/verify`.
    pub verification_uri: Option<Url>,
    pub interval_seconds: u64,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            verification_uri: None,
            interval_seconds: 5,
        }
    }
}
