//! Socket boundary.
//!
//! The service talks to sockets through two channels: it sends
//! [`TransportCommand`]s and receives [`SocketEvent`]s. Each socket is tagged
//! with the generation it was opened under, so events still in flight from a
//! superseded socket can be recognised and dropped.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use url::Url;

use rtmsg_core::prelude::*;

use crate::close::CLOSE_ABNORMAL;

/// Close code reported when the peer closed without a status.
pub const CLOSE_NO_STATUS: u16 = 1005;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(Bytes),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Send(Bytes),
    Close { code: u16, reason: String },
}

pub type SocketCommands = mpsc::UnboundedSender<TransportCommand>;
pub type SocketEvents = mpsc::UnboundedSender<SocketEvent>;

/// Opens sockets. Connecting never blocks: the outcome arrives later as an
/// `Open` or `Close` event.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &Url, generation: u64, events: SocketEvents) -> SocketCommands;
}

/// `wss://{host}/shard/{shard}/notifications`, or `ws://` when not secure.
pub fn build_url(host: &str, shard_id: &str, secure: bool) -> Result<Url> {
    let scheme = if secure { "wss" } else { "ws" };
    let url = Url::parse(&format!("{scheme}://{host}/shard/{shard_id}/notifications"))?;
    Ok(url)
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &Url, generation: u64, events: SocketEvents) -> SocketCommands {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(url.clone(), generation, events, cmd_rx));
        cmd_tx
    }
}

async fn run_socket(
    url: Url,
    generation: u64,
    events: SocketEvents,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send(SocketEvent { generation, event });
    };

    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(err) => {
            let err = Error::transport(format!("connect to {url} failed: {err}"));
            warn!("Socket #{}: {}", generation, err);
            emit(TransportEvent::Close {
                code: CLOSE_ABNORMAL,
                reason: err.to_string(),
            });
            return;
        }
    };
    debug!("Socket #{}: connected to {}", generation, url);
    emit(TransportEvent::Open);

    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Binary(data))) => {
                        emit(TransportEvent::Message(data));
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        emit(TransportEvent::Message(Bytes::copy_from_slice(text.as_bytes())));
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((CLOSE_NO_STATUS, String::new()));
                        debug!("Socket #{}: closed by peer ({} {})", generation, code, reason);
                        emit(TransportEvent::Close { code, reason });
                        return;
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong frames are answered by tungstenite
                    }
                    Some(Err(err)) => {
                        warn!("Socket #{}: read error: {}", generation, err);
                        emit(TransportEvent::Close {
                            code: CLOSE_ABNORMAL,
                            reason: err.to_string(),
                        });
                        return;
                    }
                    None => {
                        debug!("Socket #{}: stream ended", generation);
                        emit(TransportEvent::Close {
                            code: CLOSE_ABNORMAL,
                            reason: String::new(),
                        });
                        return;
                    }
                }
            }

            cmd = commands.recv() => {
                match cmd {
                    Some(TransportCommand::Send(data)) => {
                        if let Err(err) = ws_sink.send(WsMessage::Binary(data)).await {
                            warn!("Socket #{}: write error: {}", generation, err);
                            emit(TransportEvent::Close {
                                code: CLOSE_ABNORMAL,
                                reason: err.to_string(),
                            });
                            return;
                        }
                    }
                    Some(TransportCommand::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        let _ = ws_sink.send(WsMessage::Close(Some(frame))).await;
                        let _ = ws_sink.close().await;
                        emit(TransportEvent::Close { code, reason });
                        return;
                    }
                    None => {
                        // Service dropped this socket
                        let _ = ws_sink.send(WsMessage::Close(None)).await;
                        let _ = ws_sink.close().await;
                        return;
                    }
                }
            }
        }
    }
}
