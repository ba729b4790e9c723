//! WebSocket server: upgrade handling and the per-session socket pumps.

use std::collections::HashMap;
use std::sync::Arc;

use auth::{token_from_parts, TokenKeys};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::bootstrap::{self, BootstrapConfig};
use crate::cache::UpdateCache;
use crate::engine::FanoutEngine;
use crate::session::Session;

/// Shared application state.
pub struct AppState {
    pub engine: Arc<FanoutEngine>,
    pub store: grid_store::GridStore,
    pub cache: Arc<UpdateCache>,
    pub keys: Arc<TokenKeys>,
    pub grid_key: String,
    pub bootstrap: BootstrapConfig,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    format!(
        r#"{{"status":"ok","sessions":{},"dropped":{}}}"#,
        state.engine.session_count(),
        state.engine.dropped_messages()
    )
}

/// Upgrade handler. The session token must arrive as a query parameter or
/// bearer header; validation is signature + expiry only.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let checked =
        token_from_parts(&headers, &query).and_then(|token| state.keys.validate(&token));
    if let Err(err) = checked {
        debug!("Rejected WS token: {err}");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let read_limit = state.engine.config().read_limit;
    ws.max_message_size(read_limit)
        .max_frame_size(read_limit)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Wire one accepted socket into the engine.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let Some(handle) = state.engine.add() else {
        // Full everywhere: close before any STATE frame is sent.
        warn!("No worker capacity, refusing connection");
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let session = handle.session.clone();
    counter!("gateway_connections_total").increment(1);
    info!("Session {} connected", session.id);

    let (ws_tx, ws_rx) = socket.split();

    let write_task = tokio::spawn(write_pump(
        ws_tx,
        handle.queue,
        handle.done,
        session.clone(),
        state.engine.clone(),
    ));

    tokio::spawn(bootstrap::run(
        session.clone(),
        state.store.clone(),
        state.cache.clone(),
        state.grid_key.clone(),
        state.bootstrap.clone(),
    ));

    read_pump(ws_rx, session.clone(), state.engine.clone()).await;

    let _ = write_task.await;
    counter!("gateway_disconnections_total").increment(1);
    info!("Session {} disconnected", session.id);
}

/// Read side: the protocol expects no application payload, so every frame
/// only refreshes liveness. Any error tears the session down.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    session: Arc<Session>,
    engine: Arc<FanoutEngine>,
) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Pong(_)) | Ok(Message::Ping(_)) => session.touch(),
            Ok(Message::Close(_)) => break,
            Ok(_) => session.touch(),
            Err(err) => {
                debug!("Session {} read error: {:?}", session.id, err);
                break;
            }
        }
    }
    engine.remove(&session);
}

/// Write side: the only task that touches the sink. Selects over the
/// session's frame queue, the ping cadence and the done signal; every
/// write carries a deadline.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Bytes>,
    mut done: watch::Receiver<bool>,
    session: Arc<Session>,
    engine: Arc<FanoutEngine>,
) {
    let write_timeout = engine.config().write_timeout;
    let mut ping = tokio::time::interval(engine.config().ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.reset();

    loop {
        tokio::select! {
            biased;

            _ = done.changed() => {
                let _ = timeout(write_timeout, sink.send(Message::Close(None))).await;
                break;
            }

            maybe = queue.recv() => match maybe {
                Some(frame) => {
                    match timeout(write_timeout, sink.send(Message::Binary(frame))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            debug!("Session {} write error: {:?}", session.id, err);
                            break;
                        }
                        Err(_) => {
                            debug!("Session {} write deadline exceeded", session.id);
                            break;
                        }
                    }
                }
                None => break,
            },

            _ = ping.tick() => {
                if timeout(write_timeout, sink.send(Message::Ping(Bytes::new())))
                    .await
                    .map_or(true, |sent| sent.is_err())
                {
                    debug!("Session {} ping failed", session.id);
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    engine.remove(&session);
}
