//! End-to-end tests of the logout endpoint, including request continuation.

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use oidc_server::cache::MemoryCache;
use oidc_server::host::{HostContext, HostRequest};
use oidc_server::protocol::errors;
use oidc_server::stores::{Application, ClientType, StaticApplicationStore};
use oidc_server::{Disposition, Endpoint, OidcServer, ServerOptions, Transaction};
use url::Url;

fn spa() -> Application {
    Application {
        client_id: "spa".into(),
        client_secret: None,
        client_type: ClientType::Public,
        redirect_uris: vec!["https://app.example/cb".into()],
        post_logout_redirect_uris: vec!["https://app.example/after".into()],
    }
}

fn caching_server() -> OidcServer {
    let mut options = ServerOptions::default();
    options.request_caching.logout = true;
    OidcServer::builder(options)
        .with_cache(Arc::new(MemoryCache::new()))
        .build()
        .expect("server")
}

fn server_with_clients() -> OidcServer {
    OidcServer::builder(ServerOptions::default())
        .with_cache(Arc::new(MemoryCache::new()))
        .with_application_store(Arc::new(StaticApplicationStore::new([spa()])))
        .build()
        .expect("server")
}

async fn logout(server: &OidcServer, url: &str) -> Transaction {
    let request = HostRequest::from_url(Method::GET, url).expect("url");
    server
        .process(Endpoint::Logout, HostContext::new(request))
        .await
        .expect("logout pipeline")
}

fn location(transaction: &Transaction) -> Url {
    let host = transaction.host().expect("host");
    Url::parse(host.response.location().expect("location header")).expect("absolute location")
}

#[tokio::test]
async fn test_logout_request_continuation_round_trip() {
    let server = caching_server();

    // First pass: parameters are cached and the user agent is sent back with a request_id.
    let first = logout(&server, "https://example.org/connect/logout?client_id=c1&state=xyz").await;
    assert_eq!(first.disposition(), Disposition::Completed);
    let host = first.host().expect("host");
    assert_eq!(host.response.status, StatusCode::FOUND);

    let redirect = location(&first);
    assert_eq!(redirect.path(), "/connect/logout");
    let pairs: Vec<(String, String)> = redirect.query_pairs().into_owned().collect();
    assert_eq!(pairs.len(), 1, "only the request_id is carried: {pairs:?}");
    assert_eq!(pairs[0].0, "request_id");
    assert_eq!(pairs[0].1.len(), 43);

    // Second pass: the cached parameters are restored and the logout completes.
    let second = logout(&server, redirect.as_str()).await;
    let request = second.request().expect("request");
    assert_eq!(request.client_id(), Some("c1"));
    assert_eq!(request.state(), Some("xyz"));
    assert_eq!(request.request_id(), Some(pairs[0].1.as_str()));
    assert_eq!(second.response().and_then(|r| r.state()), Some("xyz"));

    let host = second.host().expect("host");
    assert_eq!(host.response.status, StatusCode::OK);
    assert!(host.response.body.is_empty());

    // Third pass: the entry was consumed.
    let third = logout(&server, redirect.as_str()).await;
    assert_eq!(
        third.response().and_then(|r| r.error()),
        Some(errors::INVALID_REQUEST)
    );
    let host = third.host().expect("host");
    assert_eq!(host.response.status, StatusCode::BAD_REQUEST);
    assert_eq!(host.response.content_type(), Some("text/plain;charset=UTF-8"));
    assert_eq!(
        host.response.body_text(),
        "error:invalid_request\nerror_description:The specified 'request_id' parameter is invalid."
    );
}

#[tokio::test]
async fn test_unknown_request_id_is_rejected() {
    let server = caching_server();
    let transaction = logout(&server, "https://example.org/connect/logout?request_id=nope").await;

    let response = transaction.response().expect("response");
    assert_eq!(response.error(), Some(errors::INVALID_REQUEST));
    assert_eq!(
        response.error_description(),
        Some("The specified 'request_id' parameter is invalid.")
    );
}

#[tokio::test]
async fn test_logout_without_redirect_returns_empty_ok() {
    let server = server_with_clients();
    let transaction = logout(&server, "https://example.org/connect/logout").await;

    assert_eq!(transaction.disposition(), Disposition::Completed);
    let host = transaction.host().expect("host");
    assert_eq!(host.response.status, StatusCode::OK);
    assert!(host.response.body.is_empty());
}

#[tokio::test]
async fn test_logout_redirects_to_registered_uri_with_state() {
    let server = server_with_clients();
    let transaction = logout(
        &server,
        "https://example.org/connect/logout?client_id=spa&post_logout_redirect_uri=https%3A%2F%2Fapp.example%2Fafter&state=s1",
    )
    .await;

    let host = transaction.host().expect("host");
    assert_eq!(host.response.status, StatusCode::FOUND);
    assert_eq!(location(&transaction).as_str(), "https://app.example/after?state=s1");
}

#[tokio::test]
async fn test_unregistered_post_logout_uri_is_not_redirected() {
    let server = server_with_clients();
    let transaction = logout(
        &server,
        "https://example.org/connect/logout?client_id=spa&post_logout_redirect_uri=https%3A%2F%2Fevil.example%2F",
    )
    .await;

    let host = transaction.host().expect("host");
    assert_eq!(host.response.status, StatusCode::BAD_REQUEST);
    assert!(host.response.location().is_none());
    assert!(host.response.body_text().starts_with("error:invalid_request"));
}

#[tokio::test]
async fn test_post_logout_uri_requires_a_client() {
    let server = server_with_clients();
    let transaction = logout(
        &server,
        "https://example.org/connect/logout?post_logout_redirect_uri=https%3A%2F%2Fapp.example%2Fafter",
    )
    .await;

    assert_eq!(
        transaction.response().and_then(|r| r.error()),
        Some(errors::INVALID_REQUEST)
    );
}
