use tracing::{debug, trace};

use crate::error::ServerError;
use crate::handlers::{EventContext, HandlerRegistry, Outcome};

/// Runs the handlers registered for an event. Performs no I/O of its own.
#[derive(Debug)]
pub struct Dispatcher {
    registry: HandlerRegistry,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Invokes every applicable handler for the context's event, in order, until one of
    /// them ends the dispatch. Fatal handler errors propagate untouched.
    pub async fn dispatch(&self, context: &mut EventContext<'_>) -> Result<Outcome, ServerError> {
        let kind = context.kind();

        for descriptor in self.registry.handlers(kind) {
            if !descriptor.is_applicable(context) {
                trace!(event = %kind, handler = descriptor.name(), "handler excluded by its filters");
                continue;
            }

            trace!(event = %kind, handler = descriptor.name(), order = descriptor.order(), "invoking handler");
            descriptor.resolve().handle(context).await?;

            if context.outcome().is_terminal() {
                debug!(
                    event = %kind,
                    handler = descriptor.name(),
                    outcome = ?context.outcome(),
                    "dispatch ended early"
                );
                break;
            }
        }

        Ok(context.outcome().clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::handlers::{EventKind, Handler, HandlerDescriptor, RegistryBuilder};
    use crate::options::ServerOptions;
    use crate::transaction::{Endpoint, Transaction};

    const EVENT: EventKind = EventKind::Handle(Endpoint::Token);

    #[derive(Clone, Copy)]
    enum Action {
        Continue,
        Skip,
        Handle,
        Reject,
    }

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        action: Action,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError> {
            self.log.lock().unwrap().push(self.label);
            match self.action {
                Action::Continue => {}
                Action::Skip => context.skip_request(),
                Action::Handle => context.handle_request(),
                Action::Reject => context.reject("invalid_request", "rejected by test"),
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Handler for Failing {
        async fn handle(&self, _: &mut EventContext<'_>) -> Result<(), ServerError> {
            Err(ServerError::MissingCache)
        }
    }

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
        order: i32,
        action: Action,
    ) -> HandlerDescriptor {
        HandlerDescriptor::singleton(
            EVENT,
            Recorder {
                label,
                log: log.clone(),
                action,
            },
        )
        .with_order(order)
        .with_name(label)
    }

    async fn run(builder: RegistryBuilder) -> (Outcome, Transaction) {
        let dispatcher = Dispatcher::new(builder.build());
        let mut transaction = Transaction::new(Endpoint::Token, Arc::new(ServerOptions::default()));
        let mut context = EventContext::new(&dispatcher, EVENT, &mut transaction);
        let outcome = dispatcher.dispatch(&mut context).await.unwrap();
        (outcome, transaction)
    }

    #[tokio::test]
    async fn handlers_run_by_order_regardless_of_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = RegistryBuilder::new();
        builder
            .register(recorder(&log, "A", 10, Action::Continue))
            .register(recorder(&log, "B", 20, Action::Continue))
            .register(recorder(&log, "C", 15, Action::Continue));

        let (outcome, _) = run(builder).await;
        assert_eq!(outcome, Outcome::Continue);
        assert_eq!(*log.lock().unwrap(), vec!["A", "C", "B"]);
    }

    #[tokio::test]
    async fn ties_keep_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = RegistryBuilder::new();
        builder
            .register(recorder(&log, "second", 5, Action::Continue))
            .register(recorder(&log, "first", 0, Action::Continue))
            .register(recorder(&log, "third", 5, Action::Continue));

        run(builder).await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn filters_exclude_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = RegistryBuilder::new();
        builder
            .register(recorder(&log, "kept", 1, Action::Continue))
            .register(recorder(&log, "filtered", 2, Action::Continue).with_filter(|_| false));

        run(builder).await;
        assert_eq!(*log.lock().unwrap(), vec!["kept"]);
    }

    #[tokio::test]
    async fn terminal_outcomes_stop_the_dispatch() {
        for (action, expected) in [
            (Action::Skip, Outcome::Skipped),
            (Action::Handle, Outcome::Handled),
        ] {
            let log = Arc::new(Mutex::new(Vec::new()));
            let mut builder = RegistryBuilder::new();
            builder
                .register(recorder(&log, "stopper", 1, action))
                .register(recorder(&log, "never", 2, Action::Continue));

            let (outcome, _) = run(builder).await;
            assert_eq!(outcome, expected);
            assert_eq!(*log.lock().unwrap(), vec!["stopper"]);
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = RegistryBuilder::new();
        builder
            .register(recorder(&log, "rejecter", 1, Action::Reject))
            .register(recorder(&log, "never", 2, Action::Continue));
        let (outcome, _) = run(builder).await;
        assert!(matches!(outcome, Outcome::Rejected(ref e) if e.error == "invalid_request"));
        assert_eq!(*log.lock().unwrap(), vec!["rejecter"]);
    }

    #[tokio::test]
    async fn removed_handlers_never_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = RegistryBuilder::new();
        builder
            .register(recorder(&log, "A", 1, Action::Continue))
            .register(recorder(&log, "B", 2, Action::Continue));
        builder.remove("A");
        assert!(!builder.contains("A"));

        run(builder).await;
        assert_eq!(*log.lock().unwrap(), vec!["B"]);
    }

    #[tokio::test]
    async fn fatal_errors_propagate() {
        let mut builder = RegistryBuilder::new();
        builder.register(HandlerDescriptor::singleton(EVENT, Failing));
        let dispatcher = Dispatcher::new(builder.build());
        let mut transaction = Transaction::new(Endpoint::Token, Arc::new(ServerOptions::default()));
        let mut context = EventContext::new(&dispatcher, EVENT, &mut transaction);

        let result = dispatcher.dispatch(&mut context).await;
        assert!(matches!(result, Err(ServerError::MissingCache)));
    }
}
