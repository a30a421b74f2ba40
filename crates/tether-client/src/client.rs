//! Public client handle and builder.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tether_core::{
    AuthProvider, ClientError, ConnectionState, ConnectionStatus, Envelope, EventType,
};
use tether_settings::{ClientSettings, SettingsError};
use tether_transport::{DefaultTransportFactory, TransportFactory};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::dispatcher::{Dispatcher, HandlerHandle, HandlerResult, Route};
use crate::manager::{Command, DriverParts, Hooks, spawn_driver};
use crate::rooms::RoomRegistry;

/// Builder for [`RealtimeClient`].
pub struct ClientBuilder {
    settings: ClientSettings,
    auth: Arc<dyn AuthProvider>,
    factory: Option<Arc<dyn TransportFactory>>,
    hooks: Hooks,
}

impl ClientBuilder {
    /// Start from `settings` and a credential source.
    pub fn new(settings: ClientSettings, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            settings,
            auth,
            factory: None,
            hooks: Hooks::default(),
        }
    }

    /// Replace the network adapters (tests, custom transports).
    #[must_use]
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Called on terminal failures: [`ClientError::Auth`] and
    /// [`ClientError::Fatal`].
    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    /// Called on retryable transport failures.
    #[must_use]
    pub fn on_diagnostic<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.hooks.on_diagnostic = Some(Arc::new(hook));
        self
    }

    /// Called synchronously on every state transition, including ones a
    /// [`watch`] subscriber would coalesce.
    #[must_use]
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.hooks.on_state_change = Some(Arc::new(hook));
        self
    }

    /// Validate the settings and start the connection driver.
    ///
    /// Must be called inside a tokio runtime. The client starts
    /// `Disconnected`; call [`RealtimeClient::connect`].
    pub fn build(self) -> Result<RealtimeClient, SettingsError> {
        self.settings.validate()?;
        let settings = Arc::new(self.settings);
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(DefaultTransportFactory::new(Arc::clone(&settings))));

        let rooms = Arc::new(RoomRegistry::new());
        let dispatcher = Dispatcher::new();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        drop(spawn_driver(
            DriverParts {
                settings: Arc::clone(&settings),
                auth: self.auth,
                factory,
                rooms: Arc::clone(&rooms),
                dispatcher: dispatcher.clone(),
                status: status_tx,
                hooks: self.hooks,
            },
            commands_rx,
        ));

        Ok(RealtimeClient {
            inner: Arc::new(ClientInner {
                settings,
                commands: commands_tx,
                status: status_rx,
                rooms,
                dispatcher,
            }),
        })
    }
}

struct ClientInner {
    settings: Arc<ClientSettings>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    rooms: Arc<RoomRegistry>,
    dispatcher: Dispatcher,
}

/// Handle to a realtime connection. Cheap to clone; every method is
/// non-blocking. The connection driver stops once the last handle drops.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("status", &*self.inner.status.borrow())
            .field("rooms", &self.inner.rooms.snapshot())
            .finish_non_exhaustive()
    }
}

impl RealtimeClient {
    /// Shorthand for [`ClientBuilder::new`].
    pub fn builder(settings: ClientSettings, auth: Arc<dyn AuthProvider>) -> ClientBuilder {
        ClientBuilder::new(settings, auth)
    }

    fn command(&self, command: Command) {
        if self.inner.commands.send(command).is_err() {
            debug!("connection driver has stopped");
        }
    }

    /// Start connecting. No-op unless `Disconnected`.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Close the connection and stop reconnecting. Desired rooms are kept.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Drop the current connection, reset the attempt counter and start a
    /// fresh cascade. Also the way out of `Error`.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    /// Send an application event. Dropped (with a debug log) unless
    /// connected; there is no outbound queue.
    pub fn send(
        &self,
        event_type: impl Into<EventType>,
        payload: Map<String, Value>,
        room: Option<&str>,
    ) {
        let mut envelope = Envelope::new(event_type.into()).with_payload(payload);
        envelope.room = room.map(str::to_owned);
        self.send_envelope(envelope);
    }

    /// Send a prebuilt envelope.
    pub fn send_envelope(&self, envelope: Envelope) {
        self.command(Command::Send(envelope));
    }

    /// Subscribe to `room`, now if connected and again after every
    /// reconnect.
    pub fn join_room(&self, room: &str) {
        if self.inner.rooms.join(room) {
            self.send_envelope(Envelope::join_room(room));
        }
    }

    /// Unsubscribe from `room`.
    pub fn leave_room(&self, room: &str) {
        if self.inner.rooms.leave(room) {
            self.send_envelope(Envelope::leave_room(room));
        }
    }

    /// Desired rooms in join order.
    pub fn rooms(&self) -> Vec<String> {
        self.inner.rooms.snapshot()
    }

    /// Whether the server acknowledged `room` on the current connection.
    pub fn is_room_acknowledged(&self, room: &str) -> bool {
        self.inner.rooms.is_acknowledged(room)
    }

    /// Handle envelopes of one type.
    pub fn on<F>(&self, event_type: impl Into<EventType>, handler: F) -> HandlerHandle
    where
        F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner
            .dispatcher
            .register(Route::Event(event_type.into()), handler)
    }

    /// Handle every inbound envelope.
    pub fn on_any<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.dispatcher.register(Route::Wildcard, handler)
    }

    /// Latest status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    /// Latest state.
    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    /// Whether traffic can flow right now.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Status change feed. Intermediate states may be coalesced; use
    /// [`ClientBuilder::on_state_change`] to see every transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.clone()
    }

    /// Effective settings.
    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }
}
