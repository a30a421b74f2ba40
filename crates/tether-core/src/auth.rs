//! Credentials and the auth seam.
//!
//! The client never owns a token. It asks an [`AuthProvider`] before every
//! handshake, so a refreshed token is picked up on the next attempt. A
//! provider may also expose a change feed; the client watches it and
//! disconnects when credentials are cleared (logout).

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Identity presented during a handshake.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Stable user id.
    pub user_id: String,
    /// Backend-defined account role (e.g. 1 = provider, 2 = customer).
    pub user_type: u32,
    /// Bearer token.
    pub token: String,
}

impl Credentials {
    /// Bundle an identity.
    pub fn new(user_id: impl Into<String>, user_type: u32, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_type,
            token: token.into(),
        }
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("user_type", &self.user_type)
            .field("token", &"[redacted]")
            .finish()
    }
}

/// Source of credentials for handshakes.
pub trait AuthProvider: Send + Sync {
    /// Current credentials, or `None` when logged out.
    fn credentials(&self) -> Option<Credentials>;

    /// Change feed. `None` means the provider never changes.
    fn subscribe(&self) -> Option<watch::Receiver<Option<Credentials>>> {
        None
    }
}

impl<F> AuthProvider for F
where
    F: Fn() -> Option<Credentials> + Send + Sync,
{
    fn credentials(&self) -> Option<Credentials> {
        self()
    }
}

/// Mutable credential holder backed by a watch channel.
pub struct CredentialStore {
    tx: watch::Sender<Option<Credentials>>,
}

impl CredentialStore {
    /// Create a store with optional initial credentials.
    pub fn new(initial: Option<Credentials>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the credentials (login or token refresh).
    pub fn set(&self, credentials: Credentials) {
        let _ = self.tx.send_replace(Some(credentials));
    }

    /// Drop the credentials (logout).
    pub fn clear(&self) {
        let _ = self.tx.send_replace(None);
    }

    /// Whether credentials are present.
    pub fn is_logged_in(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("credentials", &*self.tx.borrow())
            .finish()
    }
}

impl AuthProvider for CredentialStore {
    fn credentials(&self) -> Option<Credentials> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> Option<watch::Receiver<Option<Credentials>>> {
        Some(self.tx.subscribe())
    }
}
