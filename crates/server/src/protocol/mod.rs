//! OAuth 2.0 / OpenID Connect protocol primitives.

mod message;
mod principal;

pub use message::{Message, Parameter, Request, Response};
pub use principal::Principal;

pub mod parameters {
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const ACTIVE: &str = "active";
    pub const CLIENT_ID: &str = "client_id";
    pub const CLIENT_SECRET: &str = "client_secret";
    pub const CODE: &str = "code";
    pub const CODE_CHALLENGE: &str = "code_challenge";
    pub const CODE_CHALLENGE_METHOD: &str = "code_challenge_method";
    pub const CODE_VERIFIER: &str = "code_verifier";
    pub const DEVICE_CODE: &str = "device_code";
    pub const ERROR: &str = "error";
    pub const ERROR_DESCRIPTION: &str = "error_description";
    pub const ERROR_URI: &str = "error_uri";
    pub const EXPIRES_IN: &str = "expires_in";
    pub const GRANT_TYPE: &str = "grant_type";
    pub const ID_TOKEN: &str = "id_token";
    pub const ID_TOKEN_HINT: &str = "id_token_hint";
    pub const INTERVAL: &str = "interval";
    pub const NONCE: &str = "nonce";
    pub const POST_LOGOUT_REDIRECT_URI: &str = "post_logout_redirect_uri";
    pub const REDIRECT_URI: &str = "redirect_uri";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const REQUEST_ID: &str = "request_id";
    pub const RESPONSE_MODE: &str = "response_mode";
    pub const RESPONSE_TYPE: &str = "response_type";
    pub const SCOPE: &str = "scope";
    pub const STATE: &str = "state";
    pub const TOKEN: &str = "token";
    pub const TOKEN_TYPE: &str = "token_type";
    pub const TOKEN_TYPE_HINT: &str = "token_type_hint";
    pub const USER_CODE: &str = "user_code";
    pub const VERIFICATION_URI: &str = "verification_uri";
    pub const VERIFICATION_URI_COMPLETE: &str = "verification_uri_complete";
}

pub mod errors {
    pub const ACCESS_DENIED: &str = "access_denied";
    pub const AUTHORIZATION_PENDING: &str = "authorization_pending";
    pub const EXPIRED_TOKEN: &str = "expired_token";
    pub const INSUFFICIENT_SCOPE: &str = "insufficient_scope";
    pub const INVALID_CLIENT: &str = "invalid_client";
    pub const INVALID_GRANT: &str = "invalid_grant";
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const INVALID_SCOPE: &str = "invalid_scope";
    pub const INVALID_TOKEN: &str = "invalid_token";
    pub const SERVER_ERROR: &str = "server_error";
    pub const UNAUTHORIZED_CLIENT: &str = "unauthorized_client";
    pub const UNSUPPORTED_GRANT_TYPE: &str = "unsupported_grant_type";
    pub const UNSUPPORTED_RESPONSE_TYPE: &str = "unsupported_response_type";
    pub const UNSUPPORTED_TOKEN_TYPE: &str = "unsupported_token_type";
}

pub mod grant_types {
    pub const AUTHORIZATION_CODE: &str = "authorization_code";
    pub const CLIENT_CREDENTIALS: &str = "client_credentials";
    pub const DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";
    pub const REFRESH_TOKEN: &str = "refresh_token";
}

pub mod response_types {
    pub const CODE: &str = "code";
    pub const ID_TOKEN: &str = "id_token";
    pub const NONE: &str = "none";
    pub const TOKEN: &str = "token";
}

pub mod response_modes {
    pub const FORM_POST: &str = "form_post";
    pub const FRAGMENT: &str = "fragment";
    pub const QUERY: &str = "query";
}

pub mod scopes {
    pub const EMAIL: &str = "email";
    pub const OFFLINE_ACCESS: &str = "offline_access";
    pub const OPENID: &str = "openid";
    pub const PROFILE: &str = "profile";
}

pub mod code_challenge_methods {
    pub const PLAIN: &str = "plain";
    pub const S256: &str = "S256";
}

pub mod claims {
    pub const AUDIENCE: &str = "aud";
    pub const AUTHORIZED_PARTY: &str = "azp";
    pub const CLIENT_ID: &str = "client_id";
    pub const CODE_CHALLENGE: &str = "code_challenge";
    pub const CODE_CHALLENGE_METHOD: &str = "code_challenge_method";
    pub const EMAIL: &str = "email";
    pub const EMAIL_VERIFIED: &str = "email_verified";
    pub const EXPIRES_AT: &str = "exp";
    pub const FAMILY_NAME: &str = "family_name";
    pub const GIVEN_NAME: &str = "given_name";
    pub const ISSUED_AT: &str = "iat";
    pub const ISSUER: &str = "iss";
    pub const JWT_ID: &str = "jti";
    pub const NAME: &str = "name";
    pub const NONCE: &str = "nonce";
    pub const PREFERRED_USERNAME: &str = "preferred_username";
    pub const REDIRECT_URI: &str = "redirect_uri";
    pub const SCOPE: &str = "scope";
    pub const SUBJECT: &str = "sub";
    pub const TOKEN_USAGE: &str = "token_usage";
    pub const USER_CODE: &str = "user_code";
}

/// Splits a space-delimited parameter (`scope`, `response_type`) into its values.
pub fn split_values(value: &str) -> impl Iterator<Item = &str> {
    value.split(' ').filter(|v| !v.is_empty())
}
