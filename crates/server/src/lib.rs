//! An extensible OAuth 2.0 / OpenID Connect server.
//!
//! Every endpoint is a pipeline of events (Extract, Validate, Handle, Apply) served by ordered,
//! filterable handlers. Deployments customize a flow by registering their own handlers between
//! the defaults, or by removing defaults, on the [`ServerBuilder`].

pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod host;
pub mod logging;
pub mod options;
pub mod protocol;
pub mod server;
pub mod stores;
pub mod transaction;

pub use error::{ProtocolError, ServerError};
pub use options::ServerOptions;
pub use server::{OidcServer, ServerBuilder};
pub use transaction::{Disposition, Endpoint, Transaction};
