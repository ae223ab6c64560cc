//! Pipeline behaviour: handler ordering, early termination, passthrough and issuer resolution.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use oidc_server::cache::{CacheError, CacheResult, DistributedCache, MemoryCache};
use oidc_server::handlers::{EventContext, EventKind, Handler, HandlerDescriptor, order};
use oidc_server::host::{HostContext, HostRequest};
use oidc_server::logging::init_test_tracing;
use oidc_server::{Disposition, Endpoint, OidcServer, ServerError, ServerOptions, Transaction};
use url::Url;

struct Recorder {
    label: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Handler for Recorder {
    async fn handle(&self, _context: &mut EventContext<'_>) -> Result<(), ServerError> {
        self.log.lock().expect("log").push(self.label);
        Ok(())
    }
}

/// Answers the call itself and stops the pipeline.
struct AnswerNoContent;

#[async_trait]
impl Handler for AnswerNoContent {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        context.transaction.require_host()?.response.status = StatusCode::NO_CONTENT;
        context.handle_request();
        Ok(())
    }
}

/// A cache whose backend is down.
struct UnreachableCache;

#[async_trait]
impl DistributedCache for UnreachableCache {
    async fn get(&self, _key: &str) -> CacheResult<Option<Vec<u8>>> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> CacheResult<()> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn remove(&self, _key: &str) -> CacheResult<()> {
        Err(CacheError::Backend("connection refused".into()))
    }
}

fn configuration_request() -> HostRequest {
    HostRequest::new(
        Method::GET,
        "https",
        "id.example.org",
        "/.well-known/openid-configuration",
    )
}

fn authorization_request() -> HostRequest {
    HostRequest::new(Method::GET, "https", "id.example.org", "/connect/authorize")
        .with_query("client_id", "c1")
        .with_query("redirect_uri", "https://app.example/cb")
        .with_query("response_type", "code")
}

async fn run(server: &OidcServer, endpoint: Endpoint, request: HostRequest) -> Result<Transaction, ServerError> {
    init_test_tracing();
    server.process(endpoint, HostContext::new(request)).await
}

#[tokio::test]
async fn test_handlers_run_in_ascending_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let event = EventKind::Handle(Endpoint::Configuration);
    let recorder = |label| Recorder {
        label,
        log: log.clone(),
    };

    let server = OidcServer::builder(ServerOptions::default())
        .register(HandlerDescriptor::singleton(event, recorder("A")).with_order(10).with_name("A"))
        .register(HandlerDescriptor::singleton(event, recorder("B")).with_order(20).with_name("B"))
        .register(HandlerDescriptor::singleton(event, recorder("C")).with_order(15).with_name("C"))
        .build()
        .expect("server");

    let transaction = run(&server, Endpoint::Configuration, configuration_request())
        .await
        .expect("pipeline");

    assert_eq!(*log.lock().expect("log"), vec!["A", "C", "B"]);
    assert_eq!(transaction.disposition(), Disposition::Completed);
    assert_eq!(
        server.dispatcher().registry().describe(event),
        vec![
            ("PassthroughRequest", order::FIRST),
            ("A", 10),
            ("C", 15),
            ("B", 20),
            ("AttachConfiguration", order::LAST),
        ]
    );
}

#[tokio::test]
async fn test_handled_request_skips_apply() {
    let server = OidcServer::builder(ServerOptions::default())
        .register(HandlerDescriptor::singleton(
            EventKind::Handle(Endpoint::Configuration),
            AnswerNoContent,
        ))
        .build()
        .expect("server");

    let transaction = run(&server, Endpoint::Configuration, configuration_request())
        .await
        .expect("pipeline");

    assert_eq!(transaction.disposition(), Disposition::Completed);
    let host = transaction.host().expect("host");
    assert_eq!(host.response.status, StatusCode::NO_CONTENT);
    assert!(host.response.content_type().is_none());
    assert!(host.response.body.is_empty());
}

#[tokio::test]
async fn test_authorization_without_application_handler_is_not_handled() {
    let server = OidcServer::builder(ServerOptions::default())
        .build()
        .expect("server");

    let result = run(&server, Endpoint::Authorization, authorization_request()).await;
    assert!(matches!(
        result,
        Err(ServerError::RequestNotHandled(Endpoint::Authorization))
    ));
}

#[tokio::test]
async fn test_removed_default_handler_leaves_request_unhandled() {
    let server = OidcServer::builder(ServerOptions::default())
        .remove("AttachConfiguration")
        .build()
        .expect("server");

    let result = run(&server, Endpoint::Configuration, configuration_request()).await;
    assert!(matches!(
        result,
        Err(ServerError::RequestNotHandled(Endpoint::Configuration))
    ));
}

#[tokio::test]
async fn test_passthrough_endpoint_hands_over_to_the_host() {
    let mut options = ServerOptions::default();
    options.passthrough.endpoints = vec![Endpoint::Authorization];
    let server = OidcServer::builder(options).build().expect("server");

    let transaction = run(&server, Endpoint::Authorization, authorization_request())
        .await
        .expect("pipeline");

    assert_eq!(transaction.disposition(), Disposition::Passthrough);
    assert!(transaction.response().is_none());
    assert_eq!(
        transaction.request().and_then(|r| r.client_id()),
        Some("c1")
    );
}

#[test]
fn test_request_caching_requires_a_cache() {
    let mut options = ServerOptions::default();
    options.request_caching.authorization = true;
    let result = OidcServer::builder(options).build();
    assert!(matches!(result.err(), Some(ServerError::MissingCache)));
}

#[test]
fn test_device_endpoint_requires_a_cache() {
    let mut options = ServerOptions::default();
    options.endpoints.device = Some("/connect/device".into());
    assert!(matches!(
        OidcServer::builder(options.clone()).build().err(),
        Some(ServerError::MissingCache)
    ));

    let server = OidcServer::builder(options)
        .with_cache(Arc::new(MemoryCache::new()))
        .build();
    assert!(server.is_ok());
}

#[tokio::test]
async fn test_issuer_is_inferred_from_the_transport() {
    let server = OidcServer::builder(ServerOptions::default())
        .build()
        .expect("server");
    let request = HostRequest::new(
        Method::GET,
        "https",
        "id.example.org:8443",
        "/.well-known/openid-configuration",
    )
    .with_path_base("/auth");

    let transaction = run(&server, Endpoint::Configuration, request)
        .await
        .expect("pipeline");

    assert_eq!(
        transaction.issuer().map(Url::as_str),
        Some("https://id.example.org:8443/auth")
    );
    let document = transaction.response().expect("response").to_json();
    assert_eq!(document["issuer"], "https://id.example.org:8443/auth");
    assert_eq!(
        document["token_endpoint"],
        "https://id.example.org:8443/auth/connect/token"
    );
}

#[tokio::test]
async fn test_configured_issuer_wins_over_the_transport() {
    let mut options = ServerOptions::default();
    options.issuer = Some(Url::parse("https://login.example.com/").expect("issuer"));
    let server = OidcServer::builder(options).build().expect("server");

    let transaction = run(&server, Endpoint::Configuration, configuration_request())
        .await
        .expect("pipeline");

    assert_eq!(
        transaction.effective_issuer().map(Url::as_str),
        Some("https://login.example.com/")
    );
    let document = transaction.response().expect("response").to_json();
    assert_eq!(
        document["userinfo_endpoint"],
        "https://login.example.com/connect/userinfo"
    );
}

#[tokio::test]
async fn test_missing_host_is_a_fatal_error() {
    let server = OidcServer::builder(ServerOptions::default())
        .build()
        .expect("server");
    let options = Arc::new(server.options().clone());
    let mut transaction = Transaction::new(Endpoint::Configuration, options);

    let result = server.process_transaction(&mut transaction).await;
    assert!(matches!(result, Err(ServerError::MissingTransport)));
}

#[tokio::test]
async fn test_cache_failures_are_fatal() {
    let mut options = ServerOptions::default();
    options.request_caching.logout = true;
    let server = OidcServer::builder(options)
        .with_cache(Arc::new(UnreachableCache))
        .build()
        .expect("server");
    let request = HostRequest::new(Method::GET, "https", "id.example.org", "/connect/logout")
        .with_query("state", "xyz");

    let result = run(&server, Endpoint::Logout, request).await;
    assert!(matches!(
        result,
        Err(ServerError::Cache(CacheError::Backend(_)))
    ));
}
