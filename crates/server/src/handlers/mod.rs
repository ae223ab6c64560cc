//! Event-driven handler infrastructure.
//!
//! Every piece of protocol logic is a [`Handler`] registered for one [`EventKind`] through a
//! [`HandlerDescriptor`]. The [`Dispatcher`] runs the handlers registered for an event in
//! order, skipping those whose filters don't match, until one of them ends the dispatch.
//!
//! Handlers only get `&self`: a singleton instance is shared by every concurrent call and must
//! keep per-call data on the [`Transaction`], never on itself.

mod descriptor;
mod dispatcher;
pub mod filters;
mod registry;

use std::fmt;

use async_trait::async_trait;

pub use descriptor::{Filter, HandlerDescriptor, Lifetime, order};
pub use dispatcher::Dispatcher;
pub use registry::{HandlerRegistry, RegistryBuilder};

use crate::error::{ProtocolError, ServerError};
use crate::options::ServerOptions;
use crate::protocol::Request;
use crate::server::protection::TokenPayload;
use crate::transaction::{Endpoint, Transaction};

/// Closed set of events handlers can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Runs before Extract; resolves the issuer.
    ProcessRequest(Endpoint),
    Extract(Endpoint),
    Validate(Endpoint),
    Handle(Endpoint),
    Apply(Endpoint),
    /// Runs after Handle when a handler signed a principal in.
    ProcessSignIn(Endpoint),
    GenerateToken,
    ValidateToken,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::ProcessRequest(e) => write!(f, "Process{}Request", e.event_name()),
            EventKind::Extract(e) => write!(f, "Extract{}Request", e.event_name()),
            EventKind::Validate(e) => write!(f, "Validate{}Request", e.event_name()),
            EventKind::Handle(e) => write!(f, "Handle{}Request", e.event_name()),
            EventKind::Apply(e) => write!(f, "Apply{}Response", e.event_name()),
            EventKind::ProcessSignIn(e) => write!(f, "Process{}SignIn", e.event_name()),
            EventKind::GenerateToken => f.write_str("GenerateToken"),
            EventKind::ValidateToken => f.write_str("ValidateToken"),
        }
    }
}

/// How a dispatch ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every applicable handler ran.
    Continue,
    /// The remaining handlers of this event were skipped; the pipeline moves on.
    Skipped,
    /// The whole pipeline stops; the host writes whatever the transaction holds.
    Handled,
    /// The whole pipeline stops; the host application takes over.
    PassedThrough,
    /// The flow is aborted with a protocol error.
    Rejected(ProtocolError),
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Continue)
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, context: &mut EventContext<'_>) -> Result<(), ServerError>;
}

/// The value handed to each handler of one dispatch.
pub struct EventContext<'a> {
    dispatcher: &'a Dispatcher,
    kind: EventKind,
    pub transaction: &'a mut Transaction,
    /// Token being generated or validated (`GenerateToken` / `ValidateToken` only).
    pub token: Option<TokenPayload>,
    outcome: Outcome,
}

impl<'a> EventContext<'a> {
    pub fn new(dispatcher: &'a Dispatcher, kind: EventKind, transaction: &'a mut Transaction) -> Self {
        Self {
            dispatcher,
            kind,
            transaction,
            token: None,
            outcome: Outcome::Continue,
        }
    }

    pub fn with_token(mut self, token: TokenPayload) -> Self {
        self.token = Some(token);
        self
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn endpoint(&self) -> Endpoint {
        self.transaction.endpoint()
    }

    pub fn options(&self) -> &ServerOptions {
        self.transaction.options()
    }

    /// The dispatcher running this event, for handlers raising nested events.
    pub fn dispatcher(&self) -> &'a Dispatcher {
        self.dispatcher
    }

    pub fn request(&self) -> Option<&Request> {
        self.transaction.request.as_ref()
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn into_outcome(self) -> Outcome {
        self.outcome
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.outcome, Outcome::Rejected(_))
    }

    pub fn handle_request(&mut self) {
        self.outcome = Outcome::Handled;
    }

    pub fn skip_request(&mut self) {
        self.outcome = Outcome::Skipped;
    }

    pub fn pass_through(&mut self) {
        self.outcome = Outcome::PassedThrough;
    }

    pub fn reject(&mut self, error: &str, description: &str) {
        self.reject_with(ProtocolError::new(error, description));
    }

    pub fn reject_with(&mut self, error: ProtocolError) {
        self.outcome = Outcome::Rejected(error);
    }
}
