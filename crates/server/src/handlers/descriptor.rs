use std::fmt;
use std::sync::Arc;

use crate::handlers::{EventContext, EventKind, Handler};

/// A pure, cheap predicate deciding whether a handler takes part in a dispatch.
pub type Filter = for<'r, 'c> fn(&'r EventContext<'c>) -> bool;

/// Ordering bands. Lower runs first; ties keep registration order.
pub mod order {
    /// Reserved for framework handlers that must run before everything else.
    pub const FIRST: i32 = i32::MIN + 100_000;
    /// Reserved for terminal fallback handlers.
    pub const LAST: i32 = i32::MAX - 100_000;
    /// Gap left between neighbouring default handlers.
    pub const STEP: i32 = 1_000;
}

pub enum Lifetime {
    /// One instance shared by every call.
    Singleton(Arc<dyn Handler>),
    /// A fresh instance per dispatch.
    Transient(Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>),
}

pub struct HandlerDescriptor {
    name: &'static str,
    event: EventKind,
    order: i32,
    filters: Vec<Filter>,
    lifetime: Lifetime,
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("event", &self.event)
            .field("order", &self.order)
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl HandlerDescriptor {
    pub fn singleton<H: Handler + 'static>(event: EventKind, handler: H) -> Self {
        Self {
            name: short_type_name::<H>(),
            event,
            order: 0,
            filters: Vec::new(),
            lifetime: Lifetime::Singleton(Arc::new(handler)),
        }
    }

    pub fn transient<H, F>(event: EventKind, factory: F) -> Self
    where
        H: Handler + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        Self {
            name: short_type_name::<H>(),
            event,
            order: 0,
            filters: Vec::new(),
            lifetime: Lifetime::Transient(Arc::new(move || Box::new(factory()) as Box<dyn Handler>)),
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Adds a filter. All filters must pass for the handler to run.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn event(&self) -> EventKind {
        self.event
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    pub(crate) fn is_applicable(&self, context: &EventContext<'_>) -> bool {
        self.filters.iter().all(|filter| filter(context))
    }

    pub(crate) fn resolve(&self) -> Arc<dyn Handler> {
        match &self.lifetime {
            Lifetime::Singleton(handler) => handler.clone(),
            Lifetime::Transient(factory) => Arc::from(factory()),
        }
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
