//! # tether
//!
//! Connection debug console: connects with the given credentials, joins
//! rooms, and prints every state change and inbound envelope as one JSON
//! object per line on stdout. Logs go to stderr.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::json;
use tether_client::RealtimeClient;
use tether_core::logging::{LogFormat, init_subscriber};
use tether_core::{ConnectionState, CredentialStore, Credentials, TransportKind};
use tether_settings::ClientSettings;

/// tether connection debug console.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Watch a tether realtime connection")]
struct Cli {
    /// Backend base URL (overrides settings).
    #[arg(long)]
    endpoint: Option<String>,

    /// User id sent with every handshake.
    #[arg(long, default_value = "debug")]
    user_id: String,

    /// Numeric user type sent with every handshake.
    #[arg(long, default_value_t = 1)]
    user_type: u32,

    /// Bearer token.
    #[arg(long, env = "TETHER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Room to join; repeat for several.
    #[arg(long = "room")]
    rooms: Vec<String>,

    /// Restrict and order the transport cascade, e.g. `polling,raw_socket`.
    #[arg(long = "transport", value_delimiter = ',')]
    transports: Vec<TransportKind>,

    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn load_settings(&self) -> Result<ClientSettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(tether_settings::settings_path);
        let mut settings = tether_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;

        if let Some(endpoint) = &self.endpoint {
            settings.endpoint_url.clone_from(endpoint);
        }
        if !self.transports.is_empty() {
            settings.transports_order.clone_from(&self.transports);
        }
        settings.validate().context("Invalid command line overrides")?;
        Ok(settings)
    }

    fn credentials(&self) -> Result<Credentials> {
        let token = self
            .token
            .as_deref()
            .context("No token given: pass --token or set TETHER_TOKEN")?;
        Ok(Credentials::new(self.user_id.clone(), self.user_type, token))
    }
}

/// Write one JSON line to stdout.
fn emit(value: &serde_json::Value) {
    println!("{value}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let format = if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber(&args.log_level, format);

    let settings = args.load_settings()?;
    let store = Arc::new(CredentialStore::new(Some(args.credentials()?)));

    tracing::info!(
        endpoint = %settings.endpoint_url,
        transports = ?settings.transports_order,
        rooms = ?args.rooms,
        "starting debug console"
    );

    let client = RealtimeClient::builder(settings, store)
        .on_state_change(|status| emit(&json!({ "status": status })))
        .on_diagnostic(|err| emit(&json!({ "diagnostic": err.to_string() })))
        .on_error(|err| emit(&json!({ "error": err.to_string() })))
        .build()
        .context("Failed to build client")?;

    let _printer = client.on_any(|envelope| {
        emit(&json!({ "envelope": envelope.to_wire() }));
        Ok(())
    });

    for room in &args.rooms {
        client.join_room(room);
    }
    client.connect();

    let mut states = client.subscribe_state();
    let terminal = async {
        loop {
            if states.borrow_and_update().state == ConnectionState::Error {
                return true;
            }
            if states.changed().await.is_err() {
                return false;
            }
        }
    };

    let failed = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::info!("interrupted, disconnecting");
            false
        }
        failed = terminal => failed,
    };

    client.disconnect();
    // Give the driver a moment to close the socket cleanly.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    if failed {
        bail!("connection ended in error state");
    }
    Ok(())
}
