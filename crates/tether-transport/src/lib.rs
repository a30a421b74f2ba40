//! # tether-transport
//!
//! The three interchangeable transports behind [`TransportAdapter`]:
//!
//! - [`RawSocketTransport`]: plain WebSocket carrying JSON envelopes
//! - [`MultiplexedSocketTransport`]: Engine.IO v4 / Socket.IO v5 session that
//!   starts on HTTP long-polling and upgrades to WebSocket when it can
//! - [`PollingTransport`]: periodic HTTP mailbox polling
//!
//! Adapters report back through an [`AdapterSink`]; every event carries the
//! adapter's [`Generation`](tether_core::Generation) so the connection
//! manager can ignore traffic from adapters it has already replaced.

#![deny(unsafe_code)]

pub mod adapter;
pub mod endpoint;
pub mod multiplexed;
pub mod polling;
pub mod raw_socket;

pub use adapter::{
    AdapterEvent, AdapterEventKind, AdapterSink, CloseInfo, DefaultTransportFactory, EventEmitter,
    TransportAdapter, TransportFactory, close_codes,
};
pub use multiplexed::MultiplexedSocketTransport;
pub use polling::PollingTransport;
pub use raw_socket::RawSocketTransport;
