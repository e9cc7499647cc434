//! Main Entrypoint for the VoiceLink Client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Spawning the session controller with the HTTP credential client and
//!    the WebSocket transport.
//! 4. Connecting and mirroring lifecycle state to the log until the user
//!    interrupts.

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};
use voicelink_session::config::Config;
use voicelink_session::controller::SessionController;
use voicelink_session::credential::HttpCredentialClient;
use voicelink_session::state::{SessionSnapshot, Status};
use voicelink_session::transport::ws::WsTransport;

/// Logs whatever changed between two consecutive snapshots.
fn report_changes(previous: &SessionSnapshot, current: &SessionSnapshot) {
    if previous.connection.status != current.connection.status
        || previous.connection.status_message != current.connection.status_message
    {
        info!(
            status = ?current.connection.status,
            ready = current.connection.ready_for_speech,
            "{}",
            current.connection.status_message
        );
    }
    if previous.indicators.agent_speaking != current.indicators.agent_speaking {
        info!(speaking = current.indicators.agent_speaking, "agent speech activity");
    }
    if previous.indicators.memory != current.indicators.memory {
        match &current.indicators.memory {
            Some(memory) => info!(
                kind = %memory.kind,
                message = memory.message.as_deref().unwrap_or(""),
                "memory indicator shown"
            ),
            None => info!("memory indicator hidden"),
        }
    }
    if previous.indicators.tool != current.indicators.tool {
        match &current.indicators.tool {
            Some(label) => info!(%label, "tool indicator shown"),
            None => info!("tool indicator hidden"),
        }
    }
    if !previous.indicators.memory_fallback && current.indicators.memory_fallback {
        warn!("agent memory degraded to fallback mode");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Starting session controller...");

    // --- 3. Spawn the Controller ---
    let credentials = Arc::new(HttpCredentialClient::new(config.token_endpoint.clone()));
    let transport = Arc::new(WsTransport::default());
    let controller = SessionController::spawn((&config).into(), credentials, transport);

    // --- 4. Connect and Mirror State ---
    controller.connect(config.preset_id.clone()).await;

    let mut snapshots = controller.watch();
    let mut previous = snapshots.borrow().clone();
    let mut stopping = false;
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = snapshots.borrow().clone();
                report_changes(&previous, &current);
                if stopping && current.connection.status == Status::Disconnected {
                    break;
                }
                previous = current;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                if stopping {
                    warn!("second interrupt, exiting immediately");
                    break;
                }
                info!("Received shutdown signal. Disconnecting...");
                controller.disconnect().await;
                stopping = true;
            }
        }
    }

    // --- 5. Dump the Session Trace and Stop ---
    for entry in controller.debug_log().await {
        info!(at = %entry.at.format("%H:%M:%S%.3f"), "{}", entry.message);
    }
    controller.shutdown().await;
    info!("Client has shut down.");
    Ok(())
}
