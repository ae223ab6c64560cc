//! Extract and Apply handlers shared by several endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderValue, Method, StatusCode, header};
use base64::Engine;
use bytes::Bytes;
use tracing::debug;
use url::Url;

use crate::error::ServerError;
use crate::handlers::{EventContext, EventKind, Handler, HandlerDescriptor, filters, order};
use crate::protocol::{Request, Response, errors, parameters, response_modes, response_types};
use crate::server::Services;
use crate::transaction::Endpoint;

pub const EXTRACT_PARAMETERS: i32 = 1_000;
pub const EXTRACT_CLIENT_CREDENTIALS: i32 = EXTRACT_PARAMETERS + order::STEP;

pub const VALIDATE_CLIENT_ID: i32 = 1_000;
/// Client authentication runs after the endpoint's own parameter checks.
pub const AUTHENTICATE_CLIENT: i32 = 50_000;

pub const ATTACH_RESPONSE_STATE: i32 = 500;
pub const REMOVE_CACHED_REQUEST: i32 = 1_000;
pub const PROCESS_EMPTY_RESPONSE: i32 = REMOVE_CACHED_REQUEST + order::STEP;
pub const PROCESS_FORM_POST_RESPONSE: i32 = PROCESS_EMPTY_RESPONSE + order::STEP / 2;
pub const PROCESS_REDIRECT_RESPONSE: i32 = PROCESS_EMPTY_RESPONSE + order::STEP;
pub const PROCESS_PASSTHROUGH_ERROR: i32 = PROCESS_REDIRECT_RESPONSE + order::STEP;
pub const PROCESS_JSON_RESPONSE: i32 = PROCESS_PASSTHROUGH_ERROR + order::STEP;
pub const PROCESS_PLAIN_TEXT_ERROR: i32 = order::LAST;

/// Endpoints answering through a user-agent redirect.
pub const REDIRECT_ENDPOINTS: [Endpoint; 2] = [Endpoint::Authorization, Endpoint::Logout];

/// Endpoints answering with a JSON document.
pub const JSON_ENDPOINTS: [Endpoint; 6] = [
    Endpoint::Token,
    Endpoint::Introspection,
    Endpoint::Revocation,
    Endpoint::Userinfo,
    Endpoint::Device,
    Endpoint::Configuration,
];

fn allowed_methods(endpoint: Endpoint) -> &'static [Method] {
    match endpoint {
        Endpoint::Token | Endpoint::Revocation | Endpoint::Device => &[Method::POST],
        Endpoint::Configuration => &[Method::GET],
        Endpoint::Authorization | Endpoint::Introspection | Endpoint::Userinfo | Endpoint::Logout => {
            &[Method::GET, Method::POST]
        }
    }
}

/// Reads the protocol parameters from the query string (GET) or the form body (POST).
pub struct ExtractParameters {
    methods: &'static [Method],
}

impl ExtractParameters {
    pub fn new(methods: &'static [Method]) -> Self {
        Self { methods }
    }
}

#[async_trait]
impl Handler for ExtractParameters {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let host = context.transaction.require_host()?;
        let method = host.request.method.clone();

        if !self.methods.contains(&method) {
            context.reject(errors::INVALID_REQUEST, "The specified HTTP method is not valid.");
            return Ok(());
        }

        let pairs = if method == Method::GET {
            host.request.query.clone()
        } else {
            match host.request.form.clone() {
                Some(form) => form,
                None => {
                    context.reject(
                        errors::INVALID_REQUEST,
                        "The mandatory 'Content-Type' header must be 'application/x-www-form-urlencoded'.",
                    );
                    return Ok(());
                }
            }
        };

        debug!(parameters = pairs.len(), "protocol request extracted");
        context.transaction.request = Some(Request::from_pairs(pairs));
        Ok(())
    }
}

/// Copies HTTP Basic client credentials into the request.
pub struct ExtractClientCredentials;

#[async_trait]
impl Handler for ExtractClientCredentials {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let credentials = context
            .transaction
            .host()
            .and_then(|host| host.request.header_str(header::AUTHORIZATION))
            .and_then(|value| value.strip_prefix("Basic "))
            .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|decoded| {
                decoded
                    .split_once(':')
                    .map(|(id, secret)| (id.to_string(), secret.to_string()))
            });
        let Some((client_id, client_secret)) = credentials else {
            return Ok(());
        };

        let Some(request) = context.transaction.request.as_mut() else {
            return Ok(());
        };
        if request.client_secret().is_some() {
            context.reject(
                errors::INVALID_REQUEST,
                "Multiple client credentials cannot be specified.",
            );
            return Ok(());
        }
        if request.client_id().is_some_and(|id| id != client_id) {
            context.reject(
                errors::INVALID_REQUEST,
                "The 'client_id' parameter doesn't match the client authentication credentials.",
            );
            return Ok(());
        }
        request.set(parameters::CLIENT_ID, client_id);
        request.set(parameters::CLIENT_SECRET, client_secret);
        Ok(())
    }
}

pub struct ValidateClientIdParameter;

#[async_trait]
impl Handler for ValidateClientIdParameter {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        if context.request().and_then(Request::client_id).is_none() {
            context.reject(
                errors::INVALID_REQUEST,
                "The mandatory 'client_id' parameter is missing.",
            );
        }
        Ok(())
    }
}

/// Checks the client exists and, for confidential clients, its secret.
pub struct AuthenticateClient {
    services: Arc<Services>,
    confidential_only: bool,
}

impl AuthenticateClient {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            confidential_only: false,
        }
    }

    pub fn confidential_only(services: Arc<Services>) -> Self {
        Self {
            services,
            confidential_only: true,
        }
    }
}

#[async_trait]
impl Handler for AuthenticateClient {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some((client_id, secret)) = context.request().and_then(|request| {
            let secret = request.client_secret().map(str::to_string);
            request.client_id().map(|id| (id.to_string(), secret))
        }) else {
            return Ok(());
        };

        let Some(application) = self.services.find_application(&client_id).await? else {
            context.reject(errors::INVALID_CLIENT, "The specified 'client_id' is invalid.");
            return Ok(());
        };

        if !application.is_confidential() {
            if self.confidential_only {
                context.reject(
                    errors::INVALID_CLIENT,
                    "This client application is not allowed to use this endpoint.",
                );
            } else if secret.is_some() {
                context.reject(
                    errors::INVALID_CLIENT,
                    "The 'client_secret' parameter is not valid for this client application.",
                );
            }
            return Ok(());
        }

        match secret {
            Some(secret) if application.validate_client_secret(&secret) => {}
            Some(_) => context.reject(
                errors::INVALID_CLIENT,
                "The specified client credentials are invalid.",
            ),
            None => context.reject(
                errors::INVALID_CLIENT,
                "The 'client_secret' parameter required for this client application is missing.",
            ),
        }
        Ok(())
    }
}

/// Hands the Handle stage over to the host application.
pub struct PassthroughRequest;

#[async_trait]
impl Handler for PassthroughRequest {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        context.pass_through();
        Ok(())
    }
}

/// Echoes the request `state` on the response.
pub struct AttachResponseState;

#[async_trait]
impl Handler for AttachResponseState {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(state) = context.request().and_then(Request::state).map(str::to_string) else {
            return Ok(());
        };
        context
            .transaction
            .response_mut()
            .set_if_absent(parameters::STATE, state);
        Ok(())
    }
}

/// Success without a redirect target: an empty 200.
pub struct ProcessEmptyResponse;

#[async_trait]
impl Handler for ProcessEmptyResponse {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let host = context.transaction.require_host()?;
        host.response.status = StatusCode::OK;
        host.response.body = Bytes::new();
        context.handle_request();
        Ok(())
    }
}

/// Where the response parameters go on the redirect target.
fn redirect_mode(context: &EventContext<'_>) -> &'static str {
    if context.endpoint() != Endpoint::Authorization {
        return response_modes::QUERY;
    }
    let Some(request) = context.request() else {
        return response_modes::QUERY;
    };
    match request.response_mode() {
        Some(response_modes::FRAGMENT) => response_modes::FRAGMENT,
        Some(response_modes::FORM_POST) => response_modes::FORM_POST,
        Some(_) => response_modes::QUERY,
        None if request.response_type() == Some(response_types::CODE)
            || request.response_type() == Some(response_types::NONE) =>
        {
            response_modes::QUERY
        }
        None if request.response_type().is_some() => response_modes::FRAGMENT,
        None => response_modes::QUERY,
    }
}

pub fn require_form_post_response_mode(context: &EventContext<'_>) -> bool {
    redirect_mode(context) == response_modes::FORM_POST
}

/// Redirects the user agent to the validated target, response parameters appended to the
/// query string (or the fragment). Repeated parameters are appended once per value.
pub struct ProcessRedirectResponse;

#[async_trait]
impl Handler for ProcessRedirectResponse {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(mut location) = context.transaction.redirect_uri.clone() else {
            return Ok(());
        };
        let mode = redirect_mode(context);
        let response = context.transaction.response().cloned().unwrap_or_default();
        let pairs = response.to_pairs();

        if mode == response_modes::FRAGMENT {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (name, value) in &pairs {
                serializer.append_pair(name, value);
            }
            location.set_fragment(Some(&serializer.finish()));
        } else if !pairs.is_empty() {
            let mut query = location.query_pairs_mut();
            for (name, value) in &pairs {
                query.append_pair(name, value);
            }
        }

        debug!(location = %location, "redirecting the user agent");
        context.transaction.require_host()?.response.redirect(&location)?;
        context.handle_request();
        Ok(())
    }
}

/// Renders an auto-submitting HTML form posting the response to the redirect target.
pub struct ProcessFormPostResponse;

#[async_trait]
impl Handler for ProcessFormPostResponse {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(location) = context.transaction.redirect_uri.clone() else {
            return Ok(());
        };
        let response = context.transaction.response().cloned().unwrap_or_default();
        let body = render_form_post(&location, &response);

        let host = context.transaction.require_host()?;
        host.response.status = StatusCode::OK;
        host.response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html;charset=UTF-8"),
        );
        insert_no_cache_headers(&mut host.response.headers);
        host.response.body = Bytes::from(body);
        context.handle_request();
        Ok(())
    }
}

fn render_form_post(location: &Url, response: &Response) -> String {
    let inputs: String = response
        .to_pairs()
        .into_iter()
        .map(|(name, value)| {
            format!(
                r#"<input type="hidden" name="{}" value="{}" />"#,
                escape_html(name),
                escape_html(&value)
            )
        })
        .collect();
    format!(
        r#"<!doctype html><html><head><title>Working...</title></head><body><form name="form" method="post" action="{}">{}<noscript><button type="submit">Continue</button></noscript></form><script>document.form.submit();</script></body></html>"#,
        escape_html(location.as_str()),
        inputs
    )
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Leaves error rendering to the host application.
pub struct ProcessPassthroughErrorResponse;

#[async_trait]
impl Handler for ProcessPassthroughErrorResponse {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        context.transaction.require_host()?.response.status = StatusCode::BAD_REQUEST;
        context.pass_through();
        Ok(())
    }
}

fn insert_no_cache_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::EXPIRES,
        HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"),
    );
}

/// Fallback error document: one `key:value` line per parameter.
pub struct ProcessPlainTextErrorResponse;

#[async_trait]
impl Handler for ProcessPlainTextErrorResponse {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let response = context.transaction.response().cloned().unwrap_or_default();
        let body = response
            .iter()
            .filter(|(_, parameter)| !parameter.is_empty())
            .map(|(name, parameter)| format!("{name}:{}", parameter.to_text()))
            .collect::<Vec<_>>()
            .join("\n");

        let host = context.transaction.require_host()?;
        host.response.status = StatusCode::BAD_REQUEST;
        insert_no_cache_headers(&mut host.response.headers);
        host.response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain;charset=UTF-8"),
        );
        host.response.body = Bytes::from(body);
        context.handle_request();
        Ok(())
    }
}

fn error_status(error: Option<&str>) -> StatusCode {
    match error {
        None => StatusCode::OK,
        Some(errors::INVALID_CLIENT) | Some(errors::INVALID_TOKEN) => StatusCode::UNAUTHORIZED,
        Some(errors::INSUFFICIENT_SCOPE) => StatusCode::FORBIDDEN,
        Some(_) => StatusCode::BAD_REQUEST,
    }
}

/// Writes the response as a JSON document.
pub struct ProcessJsonResponse;

#[async_trait]
impl Handler for ProcessJsonResponse {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let endpoint = context.endpoint();
        let response = context.transaction.response().cloned().unwrap_or_default();
        let body = serde_json::to_vec(&response.to_json())?;
        let status = error_status(response.error());

        let challenge = match (endpoint, response.error()) {
            (Endpoint::Userinfo, Some(error)) => {
                let mut challenge = format!(r#"Bearer error="{error}""#);
                if let Some(description) = response.error_description() {
                    challenge.push_str(&format!(r#", error_description="{description}""#));
                }
                Some(HeaderValue::from_str(&challenge)?)
            }
            _ => None,
        };

        let host = context.transaction.require_host()?;
        host.response.status = status;
        let headers = &mut host.response.headers;
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json;charset=UTF-8"),
        );
        if endpoint != Endpoint::Configuration {
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        }
        if let Some(challenge) = challenge {
            headers.insert(header::WWW_AUTHENTICATE, challenge);
        }
        host.response.body = Bytes::from(body);
        context.handle_request();
        Ok(())
    }
}

pub(crate) fn descriptors() -> Vec<HandlerDescriptor> {
    let mut descriptors = Vec::new();

    for endpoint in Endpoint::ALL {
        descriptors.push(
            HandlerDescriptor::singleton(
                EventKind::Extract(endpoint),
                ExtractParameters::new(allowed_methods(endpoint)),
            )
            .with_order(EXTRACT_PARAMETERS),
        );
        descriptors.push(
            HandlerDescriptor::singleton(EventKind::Handle(endpoint), PassthroughRequest)
                .with_order(order::FIRST)
                .with_filter(filters::require_endpoint_passthrough_enabled),
        );
        if endpoint != Endpoint::Configuration {
            descriptors.push(
                HandlerDescriptor::singleton(
                    EventKind::Apply(endpoint),
                    ProcessPassthroughErrorResponse,
                )
                .with_order(PROCESS_PASSTHROUGH_ERROR)
                .with_filter(filters::require_error_response)
                .with_filter(filters::require_error_passthrough_enabled),
            );
        }
    }

    for endpoint in [
        Endpoint::Token,
        Endpoint::Introspection,
        Endpoint::Revocation,
        Endpoint::Device,
    ] {
        descriptors.push(
            HandlerDescriptor::singleton(EventKind::Extract(endpoint), ExtractClientCredentials)
                .with_order(EXTRACT_CLIENT_CREDENTIALS),
        );
    }

    for endpoint in REDIRECT_ENDPOINTS {
        descriptors.extend([
            HandlerDescriptor::singleton(EventKind::Apply(endpoint), AttachResponseState)
                .with_order(ATTACH_RESPONSE_STATE),
            HandlerDescriptor::singleton(EventKind::Apply(endpoint), ProcessPlainTextErrorResponse)
                .with_order(PROCESS_PLAIN_TEXT_ERROR)
                .with_filter(filters::require_error_response),
        ]);
    }

    descriptors.extend([
        HandlerDescriptor::singleton(EventKind::Apply(Endpoint::Logout), ProcessEmptyResponse)
            .with_order(PROCESS_EMPTY_RESPONSE)
            .with_filter(filters::require_no_redirect_uri)
            .with_filter(filters::require_success_response),
        // Logout errors are never sent back to the client application.
        HandlerDescriptor::singleton(EventKind::Apply(Endpoint::Logout), ProcessRedirectResponse)
            .with_order(PROCESS_REDIRECT_RESPONSE)
            .with_filter(filters::require_redirect_uri)
            .with_filter(filters::require_success_response),
        HandlerDescriptor::singleton(
            EventKind::Apply(Endpoint::Authorization),
            ProcessFormPostResponse,
        )
        .with_order(PROCESS_FORM_POST_RESPONSE)
        .with_filter(filters::require_redirect_uri)
        .with_filter(require_form_post_response_mode),
        HandlerDescriptor::singleton(
            EventKind::Apply(Endpoint::Authorization),
            ProcessRedirectResponse,
        )
        .with_order(PROCESS_REDIRECT_RESPONSE)
        .with_filter(filters::require_redirect_uri),
    ]);

    for endpoint in JSON_ENDPOINTS {
        descriptors.push(
            HandlerDescriptor::singleton(EventKind::Apply(endpoint), ProcessJsonResponse)
                .with_order(PROCESS_JSON_RESPONSE),
        );
    }

    descriptors
}

/// Client id and client authentication checks for the endpoints that need them.
pub(crate) fn client_descriptors(
    services: &Arc<Services>,
    endpoint: Endpoint,
    confidential_only: bool,
) -> Vec<HandlerDescriptor> {
    let authenticate = if confidential_only {
        AuthenticateClient::confidential_only(services.clone())
    } else {
        AuthenticateClient::new(services.clone())
    };
    vec![
        HandlerDescriptor::singleton(EventKind::Validate(endpoint), ValidateClientIdParameter)
            .with_order(VALIDATE_CLIENT_ID),
        HandlerDescriptor::singleton(EventKind::Validate(endpoint), authenticate)
            .with_order(AUTHENTICATE_CLIENT)
            .with_filter(filters::require_degraded_mode_disabled),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_post_escapes_values() {
        let mut response = Response::default();
        response.set("state", r#"<script>"x"</script>"#);
        let html = render_form_post(&Url::parse("https://app.example/cb").unwrap(), &response);
        assert!(html.contains("&lt;script&gt;&quot;x&quot;&lt;/script&gt;"));
        assert!(html.contains(r#"action="https://app.example/cb""#));
    }

    #[tokio::test]
    async fn plain_text_errors_keep_one_line_per_parameter() {
        use crate::error::ProtocolError;
        use crate::handlers::{Dispatcher, RegistryBuilder};
        use crate::host::{HostContext, HostRequest};
        use crate::options::ServerOptions;
        use crate::transaction::Transaction;

        let dispatcher = Dispatcher::new(RegistryBuilder::new().build());
        let request = HostRequest::new(Method::GET, "https", "example.org", "/connect/logout");
        let mut transaction = Transaction::new(Endpoint::Logout, Arc::new(ServerOptions::default()))
            .with_host(HostContext::new(request));
        transaction.attach_error(&ProtocolError::new(errors::INVALID_REQUEST, "Bad request."));
        transaction
            .response_mut()
            .set(parameters::STATE, "s1\r\nerror:forged");

        let mut context = EventContext::new(
            &dispatcher,
            EventKind::Apply(Endpoint::Logout),
            &mut transaction,
        );
        ProcessPlainTextErrorResponse.handle(&mut context).await.unwrap();

        let host = transaction.host().unwrap();
        assert_eq!(host.response.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            host.response.body_text(),
            "error:invalid_request\nerror_description:Bad request.\nstate:s1error:forged"
        );
    }

    #[test]
    fn token_errors_map_to_http_statuses() {
        assert_eq!(error_status(None), StatusCode::OK);
        assert_eq!(error_status(Some("invalid_client")), StatusCode::UNAUTHORIZED);
        assert_eq!(error_status(Some("invalid_token")), StatusCode::UNAUTHORIZED);
        assert_eq!(error_status(Some("insufficient_scope")), StatusCode::FORBIDDEN);
        assert_eq!(error_status(Some("invalid_grant")), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn apply_handlers_keep_their_relative_order() {
        assert!(REMOVE_CACHED_REQUEST < PROCESS_EMPTY_RESPONSE);
        assert!(PROCESS_EMPTY_RESPONSE < PROCESS_REDIRECT_RESPONSE);
        assert!(PROCESS_REDIRECT_RESPONSE < PROCESS_PASSTHROUGH_ERROR);
        assert!(PROCESS_PASSTHROUGH_ERROR < PROCESS_PLAIN_TEXT_ERROR);
    }
}
