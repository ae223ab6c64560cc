//! Transport adapter contract.
//!
//! A host adapter turns an inbound call into a [`HostContext`], runs the pipeline, and writes
//! the resulting [`HostResponse`] back through its own stack. Cancellation is the host's
//! concern: dropping the pipeline future abandons the remaining stages.

pub mod router;

use axum::http::uri::Authority;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;
use url::Url;

use crate::error::ServerError;

/// The transport-level view of an inbound call.
#[derive(Clone, Debug)]
pub struct HostRequest {
    pub method: Method,
    pub scheme: String,
    /// `host[:port]` as reported by the transport.
    pub host: Option<String>,
    pub path_base: String,
    /// Path relative to `path_base`.
    pub path: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    /// Decoded `application/x-www-form-urlencoded` body, if any.
    pub form: Option<Vec<(String, String)>>,
}

impl HostRequest {
    pub fn new(method: Method, scheme: &str, host: &str, path: &str) -> Self {
        Self {
            method,
            scheme: scheme.to_string(),
            host: Some(host.to_string()).filter(|h| !h.is_empty()),
            path_base: String::new(),
            path: path.to_string(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            form: None,
        }
    }

    /// Builds a request from an absolute URL, splitting out its query string.
    pub fn from_url(method: Method, url: &str) -> Result<Self, url::ParseError> {
        let url = Url::parse(url)?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };
        let mut request = Self::new(method, url.scheme(), &host, url.path());
        request.query = url.query_pairs().into_owned().collect();
        Ok(request)
    }

    pub fn with_path_base(mut self, path_base: &str) -> Self {
        self.path_base = path_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_form(mut self, name: &str, value: &str) -> Self {
        self.form
            .get_or_insert_with(Vec::new)
            .push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn header_str(&self, name: header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `scheme://host[:port]`. The host must be a bare authority: no userinfo, path, query or
    /// fragment.
    pub fn origin(&self) -> Result<String, ServerError> {
        let host = self
            .host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ServerError::InvalidHost("the host is missing".into()))?;
        let authority: Authority = host
            .parse()
            .map_err(|e| ServerError::InvalidHost(format!("{host}: {e}")))?;
        if host.contains('@') {
            return Err(ServerError::InvalidHost(format!("{host}: userinfo is not allowed")));
        }
        if !matches!(self.scheme.as_str(), "http" | "https") {
            return Err(ServerError::InvalidHost(format!(
                "{}: unsupported scheme",
                self.scheme
            )));
        }
        Ok(format!("{}://{}", self.scheme, authority))
    }

    /// `origin{path_base}{suffix}` as an absolute URL carrying neither query nor fragment.
    pub fn url_under_origin(&self, suffix: &str) -> Result<Url, ServerError> {
        let origin = self.origin()?;
        let url = Url::parse(&format!("{origin}{}{suffix}", self.path_base))
            .map_err(|e| ServerError::InvalidHost(format!("{origin}: {e}")))?;
        if url.query().is_some() || url.fragment().is_some() || !url.username().is_empty() {
            return Err(ServerError::InvalidHost(format!(
                "{url}: not an origin with a path"
            )));
        }
        Ok(url)
    }

    /// `scheme://host{path_base}{path}` without query string.
    pub fn absolute_url(&self) -> Result<Url, ServerError> {
        self.url_under_origin(&self.path)
    }
}

/// The transport-level response sink.
#[derive(Clone, Debug)]
pub struct HostResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Default for HostResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

impl HostResponse {
    pub fn redirect(&mut self, location: &Url) -> Result<(), ServerError> {
        self.status = StatusCode::FOUND;
        self.headers
            .insert(header::LOCATION, HeaderValue::from_str(location.as_str())?);
        Ok(())
    }

    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Clone, Debug)]
pub struct HostContext {
    pub request: HostRequest,
    pub response: HostResponse,
}

impl HostContext {
    pub fn new(request: HostRequest) -> Self {
        Self {
            request,
            response: HostResponse::default(),
        }
    }
}

impl From<HostRequest> for HostContext {
    fn from(request: HostRequest) -> Self {
        Self::new(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_url_splits_query_and_port() {
        let request =
            HostRequest::from_url(Method::GET, "https://example.org:8443/connect/logout?state=xyz")
                .unwrap();
        assert_eq!(request.scheme, "https");
        assert_eq!(request.host.as_deref(), Some("example.org:8443"));
        assert_eq!(request.path, "/connect/logout");
        assert_eq!(request.query, vec![("state".to_string(), "xyz".to_string())]);
    }

    #[test]
    fn hosts_must_be_bare_authorities() {
        for host in [
            "evil.example/x?y=1#f",
            "evil.example?y=1",
            "evil.example#f",
            "user@evil.example",
            "user:pw@evil.example",
            "bad host",
        ] {
            let request = HostRequest::new(Method::GET, "https", host, "/connect/logout");
            assert!(
                matches!(request.origin(), Err(ServerError::InvalidHost(_))),
                "{host} was accepted"
            );
        }

        let request = HostRequest::new(Method::GET, "https", "example.org:8443", "/connect/logout");
        assert_eq!(request.origin().unwrap(), "https://example.org:8443");

        let request = HostRequest::new(Method::GET, "javascript", "example.org", "/");
        assert!(request.origin().is_err());
    }

    #[test]
    fn path_base_cannot_smuggle_a_query() {
        let request = HostRequest::new(Method::GET, "https", "example.org", "/connect/logout")
            .with_path_base("/auth?x=1");
        assert!(matches!(
            request.absolute_url(),
            Err(ServerError::InvalidHost(_))
        ));
    }

    #[test]
    fn absolute_url_requires_a_host() {
        let request = HostRequest::new(Method::GET, "https", "", "/connect/logout");
        assert!(matches!(
            request.absolute_url(),
            Err(ServerError::InvalidHost(_))
        ));
    }
}
