//! HTTP/WebSocket surface of the relay.
//!
//! Two routes per conversation: `GET /api/conv/{id}` returns the
//! folded log as JSON (the resync read path), and
//! `GET /api/conv/{id}/ws` upgrades to the fragment wire.

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::protocol::ClientFrame;
use crate::registry::{ConversationRegistry, connection_channel};
use crate::relay;
use crate::responder::Responder;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConversationRegistry>,
    pub responder: Arc<dyn Responder>,
}

/// Span maker that tags every request with a fresh id.
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> tower_http::trace::MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/conv/{id}", get(get_log))
        .route("/api/conv/{id}/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Read path: the folded log. Unknown conversations read as empty
/// rather than 404, matching what a fresh attach would see.
async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Vec<crate::protocol::Message>> {
    Json(state.registry.snapshot(&id).await.unwrap_or_default())
}

async fn websocket_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_conversation_ws(socket, state, id))
}

/// One viewer's connection: attach to the conversation, pump outbound
/// frames from the connection channel, parse inbound client frames.
async fn handle_conversation_ws(socket: WebSocket, state: AppState, conversation_id: String) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(conversation = %conversation_id, conn = %connection_id, "Viewer connected");

    let conversation = state.registry.get_or_create(&conversation_id).await;
    let (tx, mut rx) = connection_channel();
    conversation.attach(&connection_id, tx).await;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let sender_task = async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    let input_conversation = conversation.clone();
    let input_connection_id = connection_id.clone();
    let responder = state.responder.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(ClientFrame::Submit(frame)) => {
                            // Generation outlives slow frames on this
                            // socket; run it off the read loop so
                            // keepalives keep flowing.
                            let conversation = input_conversation.clone();
                            let responder = responder.clone();
                            let conn = input_connection_id.clone();
                            tokio::spawn(async move {
                                relay::submit(conversation, responder, frame, &conn).await;
                            });
                        }
                        Ok(ClientFrame::Abort(frame)) => {
                            let aborted = input_conversation.abort_current().await;
                            debug!(
                                conversation = %frame.chat_id,
                                conn = %input_connection_id,
                                aborted,
                                "Abort requested"
                            );
                        }
                        Err(e) => {
                            warn!(
                                conn = %input_connection_id,
                                "Dropping unparseable client frame: {}", e
                            );
                        }
                    }
                }
                Ok(WsMessage::Binary(data)) if data.is_empty() => {
                    // Zero-length keepalive.
                    debug!(conn = %input_connection_id, "Keepalive");
                }
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        _ = sender_task => {}
        _ = input_task => {}
    }

    // The conversation itself stays registered so a reconnecting
    // viewer gets its history back as an init snapshot.
    conversation.detach(&connection_id).await;
    info!(conversation = %conversation_id, conn = %connection_id, "Viewer disconnected");
}
