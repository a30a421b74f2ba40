//! # tether-core
//!
//! Shared vocabulary for the tether realtime client.
//!
//! - **Envelopes**: [`Envelope`] and the [`EventType`] catalogue, with the flat
//!   JSON wire encoding every transport speaks
//! - **Connection state**: [`ConnectionState`], [`TransportKind`] and the
//!   observable [`ConnectionStatus`] snapshot
//! - **Generations**: [`Generation`] tags that fence off late events from
//!   torn-down transports
//! - **Reconnect policy**: [`ReconnectPolicy`] with capped exponential backoff
//! - **Errors**: [`TransportError`] and [`ClientError`] via `thiserror`
//! - **Auth**: [`Credentials`] and the [`AuthProvider`] seam
//! - **Logging**: subscriber setup and in-memory capture for tests

#![deny(unsafe_code)]

pub mod auth;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod retry;
pub mod state;

pub use auth::{AuthProvider, CredentialStore, Credentials};
pub use envelope::{Envelope, EnvelopeError, EventType};
pub use errors::{ClientError, TransportError, TransportErrorKind};
pub use ids::Generation;
pub use retry::ReconnectPolicy;
pub use state::{ConnectionState, ConnectionStatus, TransportKind, UnknownTransportKind};
