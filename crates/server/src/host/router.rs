//! axum adapter: mounts every enabled endpoint and bridges axum requests to the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use http_body_util::{BodyExt, Limited};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::host::{HostContext, HostRequest, HostResponse};
use crate::server::OidcServer;
use crate::transaction::{Disposition, Endpoint, Transaction};

/// Largest form body accepted on any endpoint.
pub const MAX_FORM_BYTES: usize = 1024 * 1024;

/// Produces the response of calls the pipeline passed through to the host application.
///
/// A handler that signs a principal in (or attaches an error) hands the transaction back with
/// [`OidcServer::complete`] and renders it with [`transaction_response`].
#[async_trait]
pub trait PassthroughHandler: Send + Sync {
    async fn handle(&self, server: &OidcServer, endpoint: Endpoint, transaction: Transaction) -> Response;
}

#[derive(Clone)]
struct RouterState {
    server: Arc<OidcServer>,
    passthrough: Option<Arc<dyn PassthroughHandler>>,
}

pub fn router(server: Arc<OidcServer>) -> Router {
    build(RouterState {
        server,
        passthrough: None,
    })
}

pub fn router_with_passthrough(
    server: Arc<OidcServer>,
    passthrough: Arc<dyn PassthroughHandler>,
) -> Router {
    build(RouterState {
        server,
        passthrough: Some(passthrough),
    })
}

fn build(state: RouterState) -> Router {
    let options = state.server.options();
    let path_base = options.path_base.trim_end_matches('/').to_string();

    let mut router = Router::new().route("/healthz", get(health));
    for (endpoint, path) in options.endpoints.enabled() {
        let route = format!("{path_base}{path}");
        let endpoint_path = path.to_string();
        let endpoint_base = path_base.clone();
        router = router.route(
            &route,
            any(move |State(state): State<RouterState>, request: Request| {
                let path = endpoint_path.clone();
                let base = endpoint_base.clone();
                async move { process(state, endpoint, &base, &path, request).await }
            }),
        );
    }

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn process(
    state: RouterState,
    endpoint: Endpoint,
    path_base: &str,
    path: &str,
    request: Request,
) -> Response {
    let host = match host_request(path_base, path, request).await {
        Ok(host) => host,
        Err(status) => return status.into_response(),
    };

    let transaction = match state.server.process(endpoint, HostContext::new(host)).await {
        Ok(transaction) => transaction,
        Err(e) => {
            error!(%endpoint, error = %e, "request processing failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match (transaction.disposition(), &state.passthrough) {
        (Disposition::Passthrough, Some(passthrough)) => {
            passthrough.handle(&state.server, endpoint, transaction).await
        }
        (disposition, _) => {
            if disposition == Disposition::Passthrough {
                warn!(%endpoint, "request passed through but no passthrough handler is registered");
            }
            transaction_response(transaction)
        }
    }
}

/// Writes the host response accumulated on `transaction`.
pub fn transaction_response(transaction: Transaction) -> Response {
    match transaction.into_host() {
        Some(host) => into_response(host.response),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Reads the transport-level view of `request`: scheme, host, query string and form body.
pub async fn host_request(path_base: &str, path: &str, request: Request) -> Result<HostRequest, StatusCode> {
    let (parts, body) = request.into_parts();

    let scheme = parts
        .uri
        .scheme_str()
        .map(str::to_string)
        .or_else(|| forwarded_proto(&parts.headers))
        .unwrap_or_else(|| "http".to_string());
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
        .unwrap_or_default()
        .to_string();

    let mut inbound = HostRequest::new(parts.method.clone(), &scheme, &host, path).with_path_base(path_base);
    if let Some(query) = parts.uri.query() {
        inbound.query = url::form_urlencoded::parse(query.as_bytes()).into_owned().collect();
    }

    let is_form = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
    if is_form {
        inbound.form = Some(read_form(body).await?);
    }

    inbound.headers = parts.headers;
    Ok(inbound)
}

fn forwarded_proto(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn read_form(body: Body) -> Result<Vec<(String, String)>, StatusCode> {
    let bytes = Limited::new(body, MAX_FORM_BYTES)
        .collect()
        .await
        .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE)?
        .to_bytes();
    Ok(url::form_urlencoded::parse(&bytes).into_owned().collect())
}

fn into_response(response: HostResponse) -> Response {
    (response.status, response.headers, response.body).into_response()
}
