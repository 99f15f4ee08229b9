use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use sketchmate_shared::protocol::ServerEvent;

use crate::gateway::Gateway;
use crate::session::ConnectionHandle;

/// Server ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A peer that does not answer a ping within this window is dropped.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Drive one websocket until it closes.
///
/// The socket is split: a writer task owns the sink and drains the
/// connection's event queue plus a control queue (pings, pongs, close), while
/// this task reads frames and hands them to the gateway one at a time, so
/// chunks of a transfer are applied in receipt order.
pub async fn run_connection(socket: WebSocket, gateway: Arc<Gateway>) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (conn, events) = ConnectionHandle::channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel::<Message>();

    tracing::info!(connection = %conn.id(), "WebSocket connection opened");

    let writer_handle = tokio::spawn(writer_task(ws_sender, events, control_rx));

    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();
    let ping_tx = control_tx.clone();
    let ping_conn = conn.id();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;
            if ping_tx.send(Message::Ping(b"sm".to_vec())).is_err() {
                break;
            }
            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!(connection = %ping_conn, "Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => gateway.handle_text(&conn, &text).await,
                Message::Binary(data) => gateway.handle_binary(&conn, &data).await,
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = control_tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(connection = %conn.id(), reason = ?frame, "Client initiated close");
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(connection = %conn.id(), error = %e, "WebSocket receive error");
                break;
            }
            None => {
                tracing::info!(connection = %conn.id(), "WebSocket stream ended");
                break;
            }
        }
    }

    writer_handle.abort();
    ping_handle.abort();
    gateway.disconnect(conn.id()).await;

    tracing::info!(connection = %conn.id(), "WebSocket connection closed");
}

async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    mut control: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        let msg = tokio::select! {
            Some(event) = events.recv() => match event.to_json() {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    tracing::error!(error = %e, "Cannot serialize outbound event");
                    continue;
                }
            },
            Some(msg) = control.recv() => msg,
            else => break,
        };

        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}
