//! # tether-client
//!
//! Resilient realtime connection for mobile-style backends.
//!
//! - **Manager**: a single driver task runs the
//!   `Disconnected → Connecting → Connected → Backoff → Error` state machine,
//!   cascading through transport kinds with capped exponential backoff
//! - **Rooms**: desired subscriptions replayed on every connection
//! - **Dispatcher**: typed and wildcard handlers with panic isolation
//! - **Heartbeat**: ping/pong liveness for socket transports
//!
//! ```text
//! let client = RealtimeClient::builder(settings, auth).build()?;
//! client.on("status_updated", |env| { println!("{env:?}"); Ok(()) });
//! client.join_room("order_42");
//! client.connect();
//! ```

#![deny(unsafe_code)]

pub mod client;
pub mod dispatcher;
pub mod heartbeat;
pub mod manager;
pub mod rooms;

pub use client::{ClientBuilder, RealtimeClient};
pub use dispatcher::{Dispatcher, HandlerHandle, HandlerResult, Route};
pub use heartbeat::{HeartbeatMonitor, HeartbeatResult};
pub use manager::{ErrorHook, StatusHook};
pub use rooms::RoomRegistry;
