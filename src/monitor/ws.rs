use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::dispatcher::Dispatcher;
use super::models::{LogRecord, MONITOR_SERVER_ID, OperatorMessage};
use super::server::AppState;
use super::sessions::{SESSION_QUEUE_CAPACITY, SessionId, Sessions};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Inbound messages queued per connection while a command is running.
const INBOUND_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Identifies the operator for log filtering only.
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.token))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let (sender, receiver) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
    let session = state.sessions.register(token, out_tx).await;
    state.sessions.greet(session).await;

    let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let worker = tokio::spawn(run_command_worker(
        session,
        in_rx,
        state.dispatcher.clone(),
        state.sessions.clone(),
    ));

    run_socket_loop(sender, receiver, out_rx, in_tx).await;

    state.sessions.remove(session).await;
    if let Err(e) = worker.await {
        warn!(session, error = %e, "Command worker failed");
    }
    debug!(session, "Connection closed");
}

/// Parse one inbound text frame.
pub fn decode_message(text: &str) -> Result<OperatorMessage, String> {
    serde_json::from_str(text).map_err(|e| format!("Malformed message: {}", e))
}

/// Run a connection's commands one at a time, in arrival order.
async fn run_command_worker(
    session: SessionId,
    mut inbound: mpsc::Receiver<String>,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<Sessions>,
) {
    while let Some(text) = inbound.recv().await {
        match decode_message(&text) {
            Ok(msg) => dispatcher.handle(session, msg).await,
            Err(e) => {
                sessions
                    .send_to(session, LogRecord::error(MONITOR_SERVER_ID, e))
                    .await;
            }
        }
    }
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Writes queued records to the client and hands text frames to the
/// command worker. The loop exits when the client goes away, misses a
/// Pong for [`PONG_TIMEOUT`], or its session is dropped from the set.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut outbound: mpsc::Receiver<LogRecord>,
    inbound: mpsc::Sender<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("Pong timeout, closing connection");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            record = outbound.recv() => {
                let Some(record) = record else {
                    break;
                };
                match serde_json::to_string(&record) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize log record"),
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = inbound.try_send(text.as_str().to_owned()) {
                            warn!(error = %e, "Dropping operator message");
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
