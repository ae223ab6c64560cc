//! Built-in handler filters.
//!
//! Filters are plain functions over the event context. They must stay cheap and free of side
//! effects: they run on every dispatch.

use crate::handlers::EventContext;

/// The call came through a host transport.
pub fn require_host_transport(context: &EventContext<'_>) -> bool {
    context.transaction.host().is_some()
}

pub fn require_distributed_cache(context: &EventContext<'_>) -> bool {
    context.options().has_distributed_cache()
}

/// An application store is registered, so client checks can run.
pub fn require_degraded_mode_disabled(context: &EventContext<'_>) -> bool {
    !context.options().is_degraded()
}

pub fn require_request_caching_enabled(context: &EventContext<'_>) -> bool {
    context
        .options()
        .request_caching
        .enabled_for(context.endpoint())
}

pub fn require_endpoint_passthrough_enabled(context: &EventContext<'_>) -> bool {
    context
        .options()
        .passthrough
        .endpoints
        .contains(&context.endpoint())
}

pub fn require_error_passthrough_enabled(context: &EventContext<'_>) -> bool {
    context
        .options()
        .passthrough
        .errors
        .contains(&context.endpoint())
}

/// A validated redirect target is known for the call.
pub fn require_redirect_uri(context: &EventContext<'_>) -> bool {
    context.transaction.redirect_uri.is_some()
}

pub fn require_no_redirect_uri(context: &EventContext<'_>) -> bool {
    context.transaction.redirect_uri.is_none()
}

pub fn require_error_response(context: &EventContext<'_>) -> bool {
    context
        .transaction
        .response()
        .is_some_and(|response| response.is_error())
}

pub fn require_success_response(context: &EventContext<'_>) -> bool {
    !require_error_response(context)
}
