//! Run one execution context until ctrl-c or a terminal close.

use std::sync::Arc;

use tokio::sync::mpsc;

use rtmsg_client::{open_store, Handlers, RealTimeService, ServiceConfig, WsConnector};
use rtmsg_core::prelude::*;
use rtmsg_core::Settings;

use crate::output::OutputEvent;

/// Why the runner stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Interrupted,
    ConnectionClosed,
}

pub async fn run_client(settings: &Settings) -> Result<()> {
    info!(
        "Server: {} shard {} ({})",
        settings.server.host_name,
        settings.server.shard_id,
        if settings.server.secure { "wss" } else { "ws" }
    );

    let store = open_store(&settings.store);
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();

    let handlers = Handlers::new()
        .on_auth(|result| OutputEvent::authenticated(result).emit())
        .on_notification(|notification| OutputEvent::notification(notification).emit())
        .on_close(move |code, reason| {
            OutputEvent::closed(code, reason).emit();
            let _ = closed_tx.send(());
        });

    let service = RealTimeService::start(
        &ServiceConfig::from_settings(settings),
        handlers,
        store,
        Arc::new(WsConnector),
    )
    .context("Failed to start client")?;
    OutputEvent::started(service.context_id()).emit();
    service.connect();

    let reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
            StopReason::Interrupted
        }
        _ = closed_rx.recv() => StopReason::ConnectionClosed,
    };
    info!("Stopping ({:?})", reason);

    service.close().await;
    OutputEvent::stopped().emit();

    info!("rtmsg exiting");
    Ok(())
}
