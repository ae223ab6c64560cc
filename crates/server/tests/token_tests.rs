//! End-to-end grant flows: authorization code with PKCE, refresh, client credentials and the
//! device flow, plus introspection, revocation and userinfo on the issued tokens.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderValue, Method, StatusCode, header};
use oidc_server::cache::MemoryCache;
use oidc_server::handlers::{EventContext, EventKind, Handler, HandlerDescriptor};
use oidc_server::host::{HostContext, HostRequest};
use oidc_server::protocol::{Principal, Response, errors, grant_types};
use oidc_server::server::token::SignInClientCredentials;
use oidc_server::stores::{Application, ClientType, StaticApplicationStore};
use oidc_server::{Endpoint, OidcServer, ServerError, ServerOptions, Transaction};
use serde_json::Value;
use url::Url;

const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
const REDIRECT_URI: &str = "https://app.example/cb";

/// Stands in for the login page: signs alice in on every authorization request.
struct SignInAlice;

#[async_trait]
impl Handler for SignInAlice {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let mut principal = Principal::with_subject("alice");
        principal
            .set_claim("email", "alice@example.org")
            .set_claim("name", "Alice");
        context.transaction.sign_in(principal);
        Ok(())
    }
}

fn applications() -> Vec<Application> {
    vec![
        Application {
            client_id: "spa".into(),
            client_secret: None,
            client_type: ClientType::Public,
            redirect_uris: vec![REDIRECT_URI.into()],
            post_logout_redirect_uris: Vec::new(),
        },
        Application {
            client_id: "backend".into(),
            client_secret: Some("s3cret".into()),
            client_type: ClientType::Confidential,
            redirect_uris: Vec::new(),
            post_logout_redirect_uris: Vec::new(),
        },
    ]
}

fn build_server() -> OidcServer {
    let mut options = ServerOptions::default();
    options.endpoints.device = Some("/connect/device".into());
    options.grant_types.push(grant_types::DEVICE_CODE.into());

    OidcServer::builder(options)
        .with_cache(Arc::new(MemoryCache::new()))
        .with_application_store(Arc::new(StaticApplicationStore::new(applications())))
        .register(HandlerDescriptor::singleton(
            EventKind::Handle(Endpoint::Authorization),
            SignInAlice,
        ))
        .register(SignInClientCredentials::descriptor())
        .build()
        .expect("server")
}

fn post(path: &str, form: &[(&str, &str)]) -> HostRequest {
    let mut request = HostRequest::new(Method::POST, "https", "id.example.org", path);
    request.form = Some(
        form.iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
    );
    request
}

async fn call(server: &OidcServer, endpoint: Endpoint, request: HostRequest) -> Transaction {
    server
        .process(endpoint, HostContext::new(request))
        .await
        .expect("pipeline")
}

fn response(transaction: &Transaction) -> Response {
    transaction.response().cloned().expect("response")
}

fn status(transaction: &Transaction) -> StatusCode {
    transaction.host().expect("host").response.status
}

fn json_field(response: &Response, name: &str) -> Value {
    response.to_json().get(name).cloned().unwrap_or(Value::Null)
}

async fn authorize(server: &OidcServer, scope: &str) -> String {
    let request = HostRequest::new(Method::GET, "https", "id.example.org", "/connect/authorize")
        .with_query("client_id", "spa")
        .with_query("redirect_uri", REDIRECT_URI)
        .with_query("response_type", "code")
        .with_query("scope", scope)
        .with_query("state", "st")
        .with_query("nonce", "n1")
        .with_query("code_challenge", CHALLENGE)
        .with_query("code_challenge_method", "S256");
    let transaction = call(server, Endpoint::Authorization, request).await;

    let host = transaction.host().expect("host");
    assert_eq!(host.response.status, StatusCode::FOUND);
    let location = Url::parse(host.response.location().expect("location")).expect("url");
    assert!(location.as_str().starts_with(REDIRECT_URI));

    let pairs: Vec<(String, String)> = location.query_pairs().into_owned().collect();
    assert!(pairs.contains(&("state".to_string(), "st".to_string())));
    pairs
        .into_iter()
        .find(|(name, _)| name == "code")
        .map(|(_, code)| code)
        .expect("code")
}

async fn redeem(server: &OidcServer, code: &str) -> Transaction {
    call(
        server,
        Endpoint::Token,
        post(
            "/connect/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", REDIRECT_URI),
                ("client_id", "spa"),
                ("code_verifier", VERIFIER),
            ],
        ),
    )
    .await
}

async fn client_credentials_token(server: &OidcServer) -> String {
    let transaction = call(
        server,
        Endpoint::Token,
        post(
            "/connect/token",
            &[
                ("grant_type", "client_credentials"),
                ("client_id", "backend"),
                ("client_secret", "s3cret"),
                ("scope", "email"),
            ],
        ),
    )
    .await;
    assert_eq!(status(&transaction), StatusCode::OK);
    response(&transaction).access_token().expect("access token").to_string()
}

async fn introspect(server: &OidcServer, token: &str) -> Response {
    let request = post("/connect/introspect", &[("token", token)]).with_header(
        header::AUTHORIZATION,
        HeaderValue::from_static("Basic YmFja2VuZDpzM2NyZXQ="),
    );
    let transaction = call(server, Endpoint::Introspection, request).await;
    assert_eq!(status(&transaction), StatusCode::OK);
    response(&transaction)
}

#[tokio::test]
async fn test_authorization_code_flow_with_pkce() {
    let server = build_server();
    let code = authorize(&server, "openid offline_access email").await;

    let transaction = redeem(&server, &code).await;
    assert_eq!(status(&transaction), StatusCode::OK);
    let host = transaction.host().expect("host");
    assert_eq!(
        host.response.content_type(),
        Some("application/json;charset=UTF-8")
    );
    assert_eq!(
        host.response.headers.get(header::CACHE_CONTROL),
        Some(&HeaderValue::from_static("no-store"))
    );

    let tokens = response(&transaction);
    assert!(tokens.access_token().is_some());
    assert!(tokens.refresh_token().is_some());
    assert!(tokens.id_token().is_some());
    assert_eq!(tokens.get_str("token_type"), Some("Bearer"));
    assert_eq!(json_field(&tokens, "expires_in"), Value::from(3600));
    assert_eq!(tokens.get_str("scope"), Some("openid offline_access email"));
}

#[tokio::test]
async fn test_authorization_codes_are_single_use() {
    let server = build_server();
    let code = authorize(&server, "openid").await;

    assert_eq!(status(&redeem(&server, &code).await), StatusCode::OK);

    let replay = redeem(&server, &code).await;
    assert_eq!(status(&replay), StatusCode::BAD_REQUEST);
    assert_eq!(response(&replay).error(), Some(errors::INVALID_GRANT));
}

#[tokio::test]
async fn test_wrong_code_verifier_is_rejected() {
    let server = build_server();
    let code = authorize(&server, "openid").await;

    let transaction = call(
        &server,
        Endpoint::Token,
        post(
            "/connect/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", REDIRECT_URI),
                ("client_id", "spa"),
                ("code_verifier", "not-the-verifier-that-was-used-for-this-code"),
            ],
        ),
    )
    .await;
    assert_eq!(response(&transaction).error(), Some(errors::INVALID_GRANT));
}

#[tokio::test]
async fn test_code_bound_to_its_redirect_uri() {
    let server = build_server();
    let code = authorize(&server, "openid").await;

    let transaction = call(
        &server,
        Endpoint::Token,
        post(
            "/connect/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", "https://app.example/other"),
                ("client_id", "spa"),
                ("code_verifier", VERIFIER),
            ],
        ),
    )
    .await;
    assert_eq!(response(&transaction).error(), Some(errors::INVALID_GRANT));
}

#[tokio::test]
async fn test_refresh_token_rotation_and_scope_narrowing() {
    let server = build_server();
    let code = authorize(&server, "openid offline_access email").await;
    let tokens = response(&redeem(&server, &code).await);
    let refresh_token = tokens.refresh_token().expect("refresh token").to_string();

    let refreshed = call(
        &server,
        Endpoint::Token,
        post(
            "/connect/token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", "spa"),
                ("scope", "openid"),
            ],
        ),
    )
    .await;
    assert_eq!(status(&refreshed), StatusCode::OK);
    let refreshed = response(&refreshed);
    assert!(refreshed.access_token().is_some());
    assert_eq!(refreshed.get_str("scope"), Some("openid"));
    assert!(refreshed.refresh_token().is_none());

    let replay = call(
        &server,
        Endpoint::Token,
        post(
            "/connect/token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", "spa"),
            ],
        ),
    )
    .await;
    assert_eq!(response(&replay).error(), Some(errors::INVALID_GRANT));
}

#[tokio::test]
async fn test_refresh_cannot_widen_scopes() {
    let server = build_server();
    let code = authorize(&server, "openid offline_access").await;
    let tokens = response(&redeem(&server, &code).await);
    let refresh_token = tokens.refresh_token().expect("refresh token").to_string();

    let transaction = call(
        &server,
        Endpoint::Token,
        post(
            "/connect/token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", "spa"),
                ("scope", "openid profile"),
            ],
        ),
    )
    .await;
    assert_eq!(response(&transaction).error(), Some(errors::INVALID_SCOPE));
}

#[tokio::test]
async fn test_client_credentials_require_a_confidential_client() {
    let server = build_server();
    assert!(!client_credentials_token(&server).await.is_empty());

    let transaction = call(
        &server,
        Endpoint::Token,
        post(
            "/connect/token",
            &[("grant_type", "client_credentials"), ("client_id", "spa")],
        ),
    )
    .await;
    assert_eq!(response(&transaction).error(), Some(errors::UNAUTHORIZED_CLIENT));
}

#[tokio::test]
async fn test_bad_client_secret_is_unauthorized() {
    let server = build_server();
    let transaction = call(
        &server,
        Endpoint::Token,
        post(
            "/connect/token",
            &[
                ("grant_type", "client_credentials"),
                ("client_id", "backend"),
                ("client_secret", "wrong"),
            ],
        ),
    )
    .await;
    assert_eq!(status(&transaction), StatusCode::UNAUTHORIZED);
    assert_eq!(response(&transaction).error(), Some(errors::INVALID_CLIENT));
}

#[tokio::test]
async fn test_unsupported_grant_type() {
    let server = build_server();
    let transaction = call(
        &server,
        Endpoint::Token,
        post("/connect/token", &[("grant_type", "password"), ("client_id", "spa")]),
    )
    .await;
    assert_eq!(
        response(&transaction).error(),
        Some(errors::UNSUPPORTED_GRANT_TYPE)
    );
}

#[tokio::test]
async fn test_token_endpoint_refuses_get() {
    let server = build_server();
    let request = HostRequest::new(Method::GET, "https", "id.example.org", "/connect/token")
        .with_query("grant_type", "client_credentials");
    let transaction = call(&server, Endpoint::Token, request).await;
    assert_eq!(response(&transaction).error(), Some(errors::INVALID_REQUEST));
}

#[tokio::test]
async fn test_introspection_and_revocation() {
    let server = build_server();
    let token = client_credentials_token(&server).await;

    let active = introspect(&server, &token).await;
    assert_eq!(json_field(&active, "active"), Value::Bool(true));
    assert_eq!(json_field(&active, "sub"), Value::from("backend"));
    assert_eq!(json_field(&active, "client_id"), Value::from("backend"));
    assert_eq!(json_field(&active, "scope"), Value::from("email"));
    assert_eq!(json_field(&active, "token_type"), Value::from("Bearer"));
    assert_eq!(
        json_field(&active, "iss"),
        Value::from("https://id.example.org/")
    );

    let revoked = call(
        &server,
        Endpoint::Revocation,
        post(
            "/connect/revoke",
            &[
                ("token", token.as_str()),
                ("client_id", "backend"),
                ("client_secret", "s3cret"),
            ],
        ),
    )
    .await;
    assert_eq!(status(&revoked), StatusCode::OK);
    assert_eq!(transaction_body(&revoked), "{}");

    let inactive = introspect(&server, &token).await;
    assert_eq!(inactive.to_json(), serde_json::json!({ "active": false }));
}

fn transaction_body(transaction: &Transaction) -> String {
    transaction.host().expect("host").response.body_text()
}

#[tokio::test]
async fn test_introspection_hides_tokens_of_other_clients() {
    let server = build_server();
    let code = authorize(&server, "openid").await;
    let tokens = response(&redeem(&server, &code).await);
    let access_token = tokens.access_token().expect("access token");

    let foreign = introspect(&server, access_token).await;
    assert_eq!(json_field(&foreign, "active"), Value::Bool(false));
}

#[tokio::test]
async fn test_public_clients_cannot_introspect() {
    let server = build_server();
    let token = client_credentials_token(&server).await;

    let transaction = call(
        &server,
        Endpoint::Introspection,
        post("/connect/introspect", &[("token", token.as_str()), ("client_id", "spa")]),
    )
    .await;
    assert_eq!(response(&transaction).error(), Some(errors::INVALID_CLIENT));
}

#[tokio::test]
async fn test_unsupported_token_type_hint_on_revocation() {
    let server = build_server();
    let transaction = call(
        &server,
        Endpoint::Revocation,
        post(
            "/connect/revoke",
            &[
                ("token", "whatever"),
                ("token_type_hint", "id_token"),
                ("client_id", "backend"),
                ("client_secret", "s3cret"),
            ],
        ),
    )
    .await;
    assert_eq!(
        response(&transaction).error(),
        Some(errors::UNSUPPORTED_TOKEN_TYPE)
    );
}

#[tokio::test]
async fn test_userinfo_returns_claims_by_scope() {
    let server = build_server();
    let code = authorize(&server, "openid email").await;
    let tokens = response(&redeem(&server, &code).await);
    let access_token = tokens.access_token().expect("access token");

    let request = HostRequest::new(Method::GET, "https", "id.example.org", "/connect/userinfo")
        .with_header(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {access_token}")).expect("header"),
        );
    let transaction = call(&server, Endpoint::Userinfo, request).await;
    assert_eq!(status(&transaction), StatusCode::OK);

    let claims = response(&transaction);
    assert_eq!(json_field(&claims, "sub"), Value::from("alice"));
    assert_eq!(json_field(&claims, "email"), Value::from("alice@example.org"));
    assert_eq!(json_field(&claims, "aud"), Value::from("spa"));
    // `profile` was not granted.
    assert_eq!(json_field(&claims, "name"), Value::Null);
}

#[tokio::test]
async fn test_userinfo_requires_openid_scope() {
    let server = build_server();
    let token = client_credentials_token(&server).await;

    let request = HostRequest::new(Method::GET, "https", "id.example.org", "/connect/userinfo")
        .with_query("access_token", &token);
    let transaction = call(&server, Endpoint::Userinfo, request).await;
    assert_eq!(status(&transaction), StatusCode::FORBIDDEN);
    assert_eq!(response(&transaction).error(), Some(errors::INSUFFICIENT_SCOPE));
}

#[tokio::test]
async fn test_device_flow() {
    let server = build_server();

    let issued = call(
        &server,
        Endpoint::Device,
        post("/connect/device", &[("client_id", "spa"), ("scope", "openid")]),
    )
    .await;
    assert_eq!(status(&issued), StatusCode::OK);
    let issued = response(&issued);
    let device_code = issued.get_str("device_code").expect("device code").to_string();
    let user_code = issued.get_str("user_code").expect("user code").to_string();
    assert_eq!(
        issued.get_str("verification_uri"),
        Some("https://id.example.org/connect/verify")
    );
    assert_eq!(
        issued.get_str("verification_uri_complete"),
        Some(format!("https://id.example.org/connect/verify?user_code={user_code}").as_str())
    );
    assert_eq!(json_field(&issued, "interval"), Value::from(5));

    let poll = || {
        call(
            &server,
            Endpoint::Token,
            post(
                "/connect/token",
                &[
                    ("grant_type", grant_types::DEVICE_CODE),
                    ("device_code", device_code.as_str()),
                    ("client_id", "spa"),
                ],
            ),
        )
    };

    let pending = poll().await;
    assert_eq!(
        response(&pending).error(),
        Some(errors::AUTHORIZATION_PENDING)
    );

    let approved = server
        .device_authorizations()
        .expect("device authorizations")
        .approve(&user_code.to_lowercase(), Principal::with_subject("alice"))
        .await
        .expect("approve");
    assert!(approved);

    let granted = poll().await;
    assert_eq!(status(&granted), StatusCode::OK);
    let tokens = response(&granted);
    assert!(tokens.access_token().is_some());
    assert!(tokens.id_token().is_some());
    assert_eq!(tokens.get_str("scope"), Some("openid"));

    let consumed = poll().await;
    assert_eq!(response(&consumed).error(), Some(errors::EXPIRED_TOKEN));
}

#[tokio::test]
async fn test_denied_device_authorization() {
    let server = build_server();
    let issued = response(
        &call(
            &server,
            Endpoint::Device,
            post("/connect/device", &[("client_id", "spa")]),
        )
        .await,
    );
    let device_code = issued.get_str("device_code").expect("device code").to_string();
    let user_code = issued.get_str("user_code").expect("user code").to_string();

    let authorizations = server.device_authorizations().expect("device authorizations");
    assert!(authorizations.deny(&user_code).await.expect("deny"));

    let transaction = call(
        &server,
        Endpoint::Token,
        post(
            "/connect/token",
            &[
                ("grant_type", grant_types::DEVICE_CODE),
                ("device_code", device_code.as_str()),
                ("client_id", "spa"),
            ],
        ),
    )
    .await;
    assert_eq!(response(&transaction).error(), Some(errors::ACCESS_DENIED));
}
