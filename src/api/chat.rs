//! WebSocket bridge: translates JSON frames to and from the orchestrator's
//! channel-based session protocol.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatEvent, ChatRequest};
use crate::error::ErrorCode;
use crate::state::AppState;

/// GET /api/chat — upgrade to a bidirectional chat session.
pub async fn chat(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let (req_tx, req_rx) = mpsc::channel::<ChatRequest>(16);
    let (ev_tx, mut ev_rx) = mpsc::channel::<ChatEvent>(64);
    let err_tx = ev_tx.clone();
    let cancel = CancellationToken::new();

    let chat = state.chat.clone();
    let session_cancel = cancel.clone();
    let mut session =
        tokio::spawn(async move { chat.run_session(req_rx, ev_tx, session_cancel).await });

    // Events → socket
    let forward = tokio::spawn(async move {
        while let Some(event) = ev_rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Socket → session, until either side finishes
    let mut session_result = None;
    loop {
        tokio::select! {
            result = &mut session => {
                session_result = Some(result);
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ChatRequest>(&text) {
                        Ok(request) => {
                            let is_cancel = matches!(request, ChatRequest::Cancel { .. });
                            if req_tx.send(request).await.is_err() {
                                break;
                            }
                            if is_cancel {
                                // Reaches an in-flight cycle immediately
                                cancel.cancel();
                            }
                        }
                        Err(err) => {
                            let _ = err_tx
                                .send(ChatEvent::Error {
                                    session_id: String::new(),
                                    query_id: None,
                                    error_code: ErrorCode::InvalidArgument,
                                    error_message: format!("malformed chat message: {err}"),
                                })
                                .await;
                            cancel.cancel();
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    // Transport gone; propagate cancellation to the session
                    cancel.cancel();
                    break;
                }
                // Ping/pong and binary frames are ignored
                Some(Ok(_)) => {}
            },
        }
    }

    drop(req_tx);
    let result = match session_result {
        Some(result) => result,
        None => session.await,
    };

    match result {
        Ok(Err(err)) => {
            // Protocol-level rejection: report it, then close
            let _ = err_tx
                .send(ChatEvent::Error {
                    session_id: String::new(),
                    query_id: None,
                    error_code: err.code(),
                    error_message: err.to_string(),
                })
                .await;
        }
        Ok(Ok(())) => {}
        Err(err) => {
            tracing::error!(%err, "chat session task panicked");
        }
    }

    drop(err_tx);
    let _ = forward.await;
}
