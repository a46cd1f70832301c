//! WebSocket transport for one broker connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use parlor_broker::Broker;
use parlor_core::ids::ConnectionId;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Socket timing for a connection.
#[derive(Clone, Copy, Debug)]
pub struct SocketTimers {
    pub heartbeat_interval: Duration,
    pub write_timeout: Duration,
}

/// Drive a registered connection until either side goes away.
///
/// The writer forwards the outbox to the socket and pings on an interval.
/// The reader feeds text frames to the broker and records pongs. Whichever
/// finishes first ends the other, then the connection is unregistered.
/// Both tasks run inside a `connection` span carrying the connection id.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    broker: Arc<Broker>,
    timers: SocketTimers,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let span = info_span!("connection", connection_id = %connection_id);

    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(timers.heartbeat_interval);
        ping_interval.tick().await;

        loop {
            let outgoing = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(text) => WsMessage::Text(text.into()),
                    // Outbox dropped: the broker let go of this connection.
                    None => {
                        let _ = tokio::time::timeout(
                            timers.write_timeout,
                            ws_tx.send(WsMessage::Close(None)),
                        )
                        .await;
                        break;
                    }
                },
                _ = ping_interval.tick() => {
                    trace!("sending ping");
                    WsMessage::Ping(Vec::new().into())
                }
            };

            match tokio::time::timeout(timers.write_timeout, ws_tx.send(outgoing)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(error = %e, "socket write failed");
                    break;
                }
                Err(_) => {
                    warn!(timeout = ?timers.write_timeout, "socket write timed out");
                    break;
                }
            }
        }
    }
    .instrument(span.clone()));

    let reader_id = connection_id.clone();
    let reader_broker = Arc::clone(&broker);
    let mut reader = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(error = %e, "socket read failed");
                    break;
                }
            };
            match msg {
                WsMessage::Text(text) => {
                    reader_broker.handle_text(&reader_id, text.as_str()).await;
                }
                WsMessage::Binary(_) => reader_broker.handle_binary(&reader_id),
                WsMessage::Pong(_) => reader_broker.record_pong(&reader_id),
                WsMessage::Close(_) => break,
                // axum answers pings itself.
                WsMessage::Ping(_) => {}
            }
        }
    }
    .instrument(span.clone()));

    tokio::select! {
        _ = &mut writer => {},
        _ = &mut reader => {},
    }
    writer.abort();
    reader.abort();

    span.in_scope(|| {
        broker.unregister(&connection_id);
        info!("websocket disconnected");
    });
}
