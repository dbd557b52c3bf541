use crate::api::{bearer, AppState};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::IntoResponse,
};
use chat_core::{ChatError, Session};
use chat_protocol::{AckPayload, ClientEvent, Envelope, ErrorPayload, ServerEvent};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = bearer(&headers)
        .map(str::to_owned)
        .or(q.token)
        .unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

fn encode(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            warn!(event = event.name(), error = %e, "failed to encode event");
            None
        }
    }
}

async fn reject(mut socket: WebSocket, reason: &str) {
    let event = ServerEvent::Error(ErrorPayload {
        message: reason.into(),
    });
    if let Some(msg) = encode(&event) {
        let _ = socket.send(msg).await;
    }
    let _ = socket.close().await;
}

async fn handle_socket(socket: WebSocket, state: AppState, token: String) {
    let user = match state.hub.authenticate(&token).await {
        Ok(user) => user,
        Err(e) => {
            warn!(code = e.code(), "websocket handshake rejected");
            return reject(socket, e.code()).await;
        }
    };
    let (tx, rx) = unbounded_channel();
    let session = match state.hub.connect(user, tx).await {
        Ok(session) => session,
        Err(e) => return reject(socket, e.code()).await,
    };

    let (mut sender, mut receiver) = socket.split();
    let writer = tokio::spawn(async move {
        let mut events = UnboundedReceiverStream::new(rx);
        while let Some(event) = events.next().await {
            let Some(msg) = encode(&event) else { continue };
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&state, &session, &text).await,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.hub.disconnect(&session);
    let _ = writer.await;
}

async fn handle_frame(state: &AppState, session: &Session, text: &str) {
    let conn = session.connection_id;
    let reply = |event: ServerEvent| {
        state.hub.router().send_to(conn, &event);
    };
    let env: Envelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            debug!(%conn, error = %e, "unparseable frame");
            reply(ServerEvent::Error(ErrorPayload {
                message: ChatError::validation("malformed frame").code().into(),
            }));
            return;
        }
    };
    let event = match ClientEvent::from_envelope(&env) {
        Ok(event) => event,
        Err(e) => {
            debug!(%conn, error = %e, "invalid client event");
            match env.ack {
                Some(id) => reply(ack(id, Err(ChatError::validation(e.to_string())))),
                None => reply(ServerEvent::Error(ErrorPayload {
                    message: e.to_string(),
                })),
            }
            return;
        }
    };
    let wants_ack = event.wants_ack();
    let outcome = state.hub.dispatch(session, event).await;
    if let (Some(id), Some(result), true) = (env.ack, outcome, wants_ack) {
        reply(ack(id, result));
    }
}

fn ack(id: u64, result: chat_core::Reply) -> ServerEvent {
    ServerEvent::Ack(match result {
        Ok(message) => AckPayload {
            id,
            success: true,
            error: None,
            message,
        },
        Err(e) => AckPayload {
            id,
            success: false,
            error: Some(e.code().into()),
            message: None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_carries_error_code() {
        let ServerEvent::Ack(p) = ack(7, Err(ChatError::Superseded)) else {
            panic!("not an ack");
        };
        assert_eq!(p.id, 7);
        assert!(!p.success);
        assert_eq!(p.error.as_deref(), Some("superseded"));
        let ServerEvent::Ack(p) = ack(8, Ok(None)) else {
            panic!("not an ack");
        };
        assert!(p.success);
        assert!(p.error.is_none());
    }
}
