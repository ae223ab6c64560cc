//! Request continuation: carries the parameters of an authorization or logout request across a
//! plain redirect through the distributed cache, keyed by an opaque `request_id`.
//!
//! An entry is stored on the first pass, restored when the `request_id` comes back and removed
//! once the Apply stage runs, so each identifier is honored at most once.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use tracing::debug;

use crate::error::ServerError;
use crate::handlers::{EventContext, EventKind, Handler, HandlerDescriptor, filters, order};
use crate::protocol::{Request, errors, parameters};
use crate::server::Services;
use crate::server::shared::{EXTRACT_CLIENT_CREDENTIALS, REMOVE_CACHED_REQUEST, REDIRECT_ENDPOINTS};
use crate::transaction::Endpoint;

pub const RESTORE_CACHED_REQUEST: i32 = EXTRACT_CLIENT_CREDENTIALS + order::STEP;
pub const CACHE_REQUEST_PARAMETERS: i32 = RESTORE_CACHED_REQUEST + order::STEP;

/// Cache key of a continuation entry, namespaced per endpoint.
pub fn cache_key(endpoint: Endpoint, request_id: &str) -> String {
    format!("oidc:cached-{}-request:{request_id}", endpoint.as_str())
}

/// 256 random bits, URL-safe base64 without padding (43 characters).
pub fn generate_request_id() -> Result<String, ServerError> {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes)
        .map_err(|e| ServerError::Configuration(format!("random source unavailable: {e}")))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

fn request_id(context: &EventContext<'_>) -> Option<String> {
    context
        .request()
        .and_then(Request::request_id)
        .map(str::to_string)
}

/// Merges the cached parameters into the live request. Live values always win.
pub struct RestoreCachedRequest {
    services: Arc<Services>,
}

#[async_trait]
impl Handler for RestoreCachedRequest {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(request_id) = request_id(context) else {
            return Ok(());
        };

        let key = cache_key(context.endpoint(), &request_id);
        let Some(payload) = self.services.cache()?.get(&key).await? else {
            context.reject(
                errors::INVALID_REQUEST,
                "The specified 'request_id' parameter is invalid.",
            );
            return Ok(());
        };

        let cached: Request = serde_json::from_slice(&payload)?;
        if let Some(request) = context.transaction.request.as_mut() {
            let restored = request.merge_missing(cached.into_message());
            debug!(restored, "cached request parameters restored");
        }
        Ok(())
    }
}

/// Stores the request and redirects the user agent to the same endpoint with only the
/// generated `request_id`.
pub struct CacheRequestParameters {
    services: Arc<Services>,
}

#[async_trait]
impl Handler for CacheRequestParameters {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(request) = context.request() else {
            return Ok(());
        };
        if request.is_empty() || request.contains(parameters::REQUEST_ID) {
            return Ok(());
        }

        let payload = serde_json::to_vec(request)?;
        let request_id = generate_request_id()?;
        let key = cache_key(context.endpoint(), &request_id);
        let ttl = context.options().request_caching.ttl();

        self.services.cache()?.set(&key, payload, ttl).await?;

        let host = context.transaction.require_host()?;
        let mut location = host.request.absolute_url()?;
        location
            .query_pairs_mut()
            .append_pair(parameters::REQUEST_ID, &request_id);
        host.response.redirect(&location)?;

        debug!(location = %location, "request parameters cached");
        context.handle_request();
        Ok(())
    }
}

/// Deletes the continuation entry, whatever the outcome of the call.
pub struct RemoveCachedRequest {
    services: Arc<Services>,
}

#[async_trait]
impl Handler for RemoveCachedRequest {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
        let Some(request_id) = request_id(context) else {
            return Ok(());
        };
        self.services
            .cache()?
            .remove(&cache_key(context.endpoint(), &request_id))
            .await?;
        Ok(())
    }
}

pub(crate) fn descriptors(services: &Arc<Services>) -> Vec<HandlerDescriptor> {
    REDIRECT_ENDPOINTS
        .into_iter()
        .flat_map(|endpoint| {
            [
                HandlerDescriptor::singleton(
                    EventKind::Extract(endpoint),
                    RestoreCachedRequest {
                        services: services.clone(),
                    },
                )
                .with_order(RESTORE_CACHED_REQUEST),
                HandlerDescriptor::singleton(
                    EventKind::Extract(endpoint),
                    CacheRequestParameters {
                        services: services.clone(),
                    },
                )
                .with_order(CACHE_REQUEST_PARAMETERS),
                HandlerDescriptor::singleton(
                    EventKind::Apply(endpoint),
                    RemoveCachedRequest {
                        services: services.clone(),
                    },
                )
                .with_order(REMOVE_CACHED_REQUEST),
            ]
        })
        .map(|descriptor| {
            descriptor
                .with_filter(filters::require_request_caching_enabled)
                .with_filter(filters::require_distributed_cache)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_url_safe_and_unique() {
        let first = generate_request_id().unwrap();
        let second = generate_request_id().unwrap();
        assert_eq!(first.len(), 43);
        assert!(
            first
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_ne!(first, second);
    }

    #[test]
    fn keys_are_namespaced_per_endpoint() {
        assert_eq!(
            cache_key(Endpoint::Logout, "abc"),
            "oidc:cached-logout-request:abc"
        );
        assert_eq!(
            cache_key(Endpoint::Authorization, "abc"),
            "oidc:cached-authorization-request:abc"
        );
    }
}
