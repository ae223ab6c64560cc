use std::collections::HashMap;

use crate::handlers::{EventKind, HandlerDescriptor};

/// Collects descriptors at startup. Consumed into an immutable [`HandlerRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    descriptors: Vec<HandlerDescriptor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: HandlerDescriptor) -> &mut Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Removes every descriptor registered under `name`.
    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.descriptors.retain(|d| d.name() != name);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.iter().any(|d| d.name() == name)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Groups descriptors by event and sorts each group by order (stable, so ties keep
    /// their registration order).
    pub fn build(self) -> HandlerRegistry {
        let mut handlers: HashMap<EventKind, Vec<HandlerDescriptor>> = HashMap::new();
        for descriptor in self.descriptors {
            handlers.entry(descriptor.event()).or_default().push(descriptor);
        }
        for group in handlers.values_mut() {
            group.sort_by_key(HandlerDescriptor::order);
        }
        HandlerRegistry { handlers }
    }
}

/// Immutable catalogue of handlers, shared by every call without locking.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Vec<HandlerDescriptor>>,
}

impl HandlerRegistry {
    /// Descriptors registered for `kind`, in execution order.
    pub fn handlers(&self, kind: EventKind) -> &[HandlerDescriptor] {
        self.handlers.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `(name, order)` pairs for `kind`, in execution order.
    pub fn describe(&self, kind: EventKind) -> Vec<(&'static str, i32)> {
        self.handlers(kind)
            .iter()
            .map(|d| (d.name(), d.order()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
