//! The request-processing pipeline and its default handlers.
//!
//! Every endpoint runs the same shape: `ProcessRequest` (issuer resolution), then Extract,
//! Validate and Handle, an optional sign-in step, and finally Apply. A rejection in any stage
//! before Apply jumps straight to Apply with the error attached to the response.

pub mod authorization;
pub mod continuation;
pub mod device;
pub mod discovery;
pub mod introspection;
pub mod logout;
pub mod protection;
pub mod revocation;
pub mod shared;
pub mod sign_in;
pub mod token;
pub mod userinfo;

use std::ops::ControlFlow;
use std::sync::Arc;

use tracing::{Instrument, debug, info, info_span, warn};

use crate::cache::DistributedCache;
use crate::error::{ProtocolError, ServerError};
use crate::handlers::{Dispatcher, EventContext, EventKind, HandlerDescriptor, Outcome, RegistryBuilder};
use crate::host::HostContext;
use crate::options::{Features, ServerOptions};
use crate::stores::{Application, ApplicationStore};
use crate::transaction::{Disposition, Endpoint, Stage, Transaction};

use self::device::DeviceAuthorizations;
use self::protection::{RevocationList, SigningCredentials};

/// Process-wide collaborators shared by the default handlers.
pub struct Services {
    cache: Option<Arc<dyn DistributedCache>>,
    applications: Option<Arc<dyn ApplicationStore>>,
    credentials: SigningCredentials,
}

impl Services {
    /// The distributed cache. Handlers needing it are gated by a filter, so reaching this
    /// without one means the registry was wired incorrectly.
    pub fn cache(&self) -> Result<&dyn DistributedCache, ServerError> {
        self.cache.as_deref().ok_or(ServerError::MissingCache)
    }

    pub fn applications(&self) -> Result<&dyn ApplicationStore, ServerError> {
        self.applications
            .as_deref()
            .ok_or_else(|| ServerError::Configuration("no application store is registered".into()))
    }

    pub async fn find_application(&self, client_id: &str) -> Result<Option<Application>, ServerError> {
        Ok(self.applications()?.find_by_client_id(client_id).await?)
    }

    pub fn credentials(&self) -> &SigningCredentials {
        &self.credentials
    }

    pub fn revocation_list(&self) -> Result<RevocationList<'_>, ServerError> {
        Ok(RevocationList::new(self.cache()?))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(cache: Option<Arc<dyn DistributedCache>>) -> Self {
        Self {
            cache,
            applications: None,
            credentials: SigningCredentials::from_options(&Default::default())
                .unwrap_or_else(|e| panic!("{e}")),
        }
    }
}

pub struct ServerBuilder {
    options: ServerOptions,
    cache: Option<Arc<dyn DistributedCache>>,
    applications: Option<Arc<dyn ApplicationStore>>,
    handlers: Vec<HandlerDescriptor>,
    removed: Vec<String>,
}

impl ServerBuilder {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            cache: None,
            applications: None,
            handlers: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn DistributedCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_application_store(mut self, store: Arc<dyn ApplicationStore>) -> Self {
        self.applications = Some(store);
        self
    }

    /// Registers a custom handler next to the defaults.
    pub fn register(mut self, descriptor: HandlerDescriptor) -> Self {
        self.handlers.push(descriptor);
        self
    }

    /// Removes a default handler by name.
    pub fn remove(mut self, name: &str) -> Self {
        self.removed.push(name.to_string());
        self
    }

    pub fn build(self) -> Result<OidcServer, ServerError> {
        let mut options = self.options;

        if self.cache.is_none() {
            if options.request_caching.any_enabled() {
                return Err(ServerError::MissingCache);
            }
            if options.endpoints.device.is_some() {
                return Err(ServerError::MissingCache);
            }
        }

        options.features = Features {
            distributed_cache: self.cache.is_some(),
            application_store: self.applications.is_some(),
        };
        if options.is_degraded() {
            warn!("No application store registered, client checks are disabled (degraded mode)");
        }

        let services = Arc::new(Services {
            credentials: SigningCredentials::from_options(&options.signing)?,
            cache: self.cache,
            applications: self.applications,
        });

        let mut registry = RegistryBuilder::new();
        let defaults = protection::descriptors(&services)
            .into_iter()
            .chain(continuation::descriptors(&services))
            .chain(shared::descriptors())
            .chain(sign_in::descriptors())
            .chain(authorization::descriptors(&services))
            .chain(token::descriptors(&services))
            .chain(introspection::descriptors(&services))
            .chain(revocation::descriptors(&services))
            .chain(userinfo::descriptors())
            .chain(logout::descriptors(&services))
            .chain(device::descriptors(&services))
            .chain(discovery::descriptors());
        for descriptor in defaults {
            registry.register(descriptor);
        }
        for name in &self.removed {
            registry.remove(name);
        }
        for descriptor in self.handlers {
            registry.register(descriptor);
        }

        let registry = registry.build();
        info!(handlers = registry.len(), "OIDC server built");

        Ok(OidcServer {
            options: Arc::new(options),
            dispatcher: Dispatcher::new(registry),
            services,
        })
    }
}

pub struct OidcServer {
    options: Arc<ServerOptions>,
    dispatcher: Dispatcher,
    services: Arc<Services>,
}

impl OidcServer {
    pub fn builder(options: ServerOptions) -> ServerBuilder {
        ServerBuilder::new(options)
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Application API of the device flow (approve/deny pending user codes).
    pub fn device_authorizations(&self) -> Result<DeviceAuthorizations<'_>, ServerError> {
        Ok(DeviceAuthorizations::new(
            self.services.cache()?,
            self.options.lifetimes.device_code,
        ))
    }

    /// Runs one inbound call through the pipeline of `endpoint`.
    pub async fn process(&self, endpoint: Endpoint, host: HostContext) -> Result<Transaction, ServerError> {
        let mut transaction = Transaction::new(endpoint, self.options.clone()).with_host(host);
        self.process_transaction(&mut transaction).await?;
        Ok(transaction)
    }

    pub async fn process_transaction(&self, transaction: &mut Transaction) -> Result<(), ServerError> {
        let span = info_span!(
            "oidc_request",
            endpoint = %transaction.endpoint(),
            transaction_id = %transaction.id()
        );
        self.run(transaction).instrument(span).await
    }

    /// Resumes a call the host application took over.
    ///
    /// Runs sign-in processing when the application signed a principal in, then the Apply
    /// stage, which also consumes the continuation entry the call was restored from. An
    /// application that rejects the call attaches its error with [`Transaction::attach_error`]
    /// before completing.
    pub async fn complete(&self, transaction: &mut Transaction) -> Result<(), ServerError> {
        if transaction.disposition() != Disposition::Passthrough {
            return Err(ServerError::NotPassedThrough(transaction.endpoint()));
        }
        let span = info_span!(
            "oidc_request",
            endpoint = %transaction.endpoint(),
            transaction_id = %transaction.id()
        );
        self.resume(transaction).instrument(span).await
    }

    async fn run(&self, transaction: &mut Transaction) -> Result<(), ServerError> {
        let endpoint = transaction.endpoint();

        let stages = [
            (Stage::Created, EventKind::ProcessRequest(endpoint)),
            (Stage::Extract, EventKind::Extract(endpoint)),
            (Stage::Validate, EventKind::Validate(endpoint)),
            (Stage::Handle, EventKind::Handle(endpoint)),
        ];
        for (stage, kind) in stages {
            transaction.enter(stage);
            if self.run_stage(kind, transaction).await?.is_break() {
                return Ok(());
            }
        }

        self.resume(transaction).await
    }

    /// Sign-in processing and Apply, shared by fresh and resumed calls.
    async fn resume(&self, transaction: &mut Transaction) -> Result<(), ServerError> {
        let endpoint = transaction.endpoint();
        if transaction.sign_in_principal().is_some()
            && self
                .run_stage(EventKind::ProcessSignIn(endpoint), transaction)
                .await?
                .is_break()
        {
            return Ok(());
        }

        if transaction.response().is_none() {
            return Err(ServerError::RequestNotHandled(endpoint));
        }

        self.apply(transaction).await
    }

    /// Dispatches one stage. Breaks when the pipeline must not go on to the next stage.
    async fn run_stage(
        &self,
        kind: EventKind,
        transaction: &mut Transaction,
    ) -> Result<ControlFlow<()>, ServerError> {
        match self.dispatch(kind, transaction).await? {
            Outcome::Continue | Outcome::Skipped => Ok(ControlFlow::Continue(())),
            Outcome::Handled => {
                debug!(event = %kind, "request handled");
                transaction.set_disposition(Disposition::Completed);
                Ok(ControlFlow::Break(()))
            }
            Outcome::PassedThrough => {
                debug!(event = %kind, "request passed through to the host application");
                transaction.set_disposition(Disposition::Passthrough);
                Ok(ControlFlow::Break(()))
            }
            Outcome::Rejected(error) => {
                self.reject(transaction, &error);
                self.apply(transaction).await?;
                Ok(ControlFlow::Break(()))
            }
        }
    }

    fn reject(&self, transaction: &mut Transaction, error: &ProtocolError) {
        info!(
            error = %error.error,
            error_description = error.description.as_deref().unwrap_or_default(),
            stage = ?transaction.stage(),
            "request rejected"
        );
        transaction.attach_error(error);
    }

    async fn apply(&self, transaction: &mut Transaction) -> Result<(), ServerError> {
        let endpoint = transaction.endpoint();
        transaction.enter(Stage::Apply);

        let disposition = match self.dispatch(EventKind::Apply(endpoint), transaction).await? {
            Outcome::Rejected(error) => return Err(ServerError::ApplyRejected(error.to_string())),
            Outcome::PassedThrough => Disposition::Passthrough,
            Outcome::Handled | Outcome::Skipped => Disposition::Completed,
            Outcome::Continue => {
                warn!(%endpoint, "no apply handler produced a response");
                Disposition::Completed
            }
        };

        transaction.set_disposition(disposition);
        transaction.enter(Stage::Completed);
        Ok(())
    }

    async fn dispatch(&self, kind: EventKind, transaction: &mut Transaction) -> Result<Outcome, ServerError> {
        let mut context = EventContext::new(&self.dispatcher, kind, transaction);
        self.dispatcher.dispatch(&mut context).await
    }
}
