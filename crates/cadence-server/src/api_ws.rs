//! Binary WebSocket transport for agent sessions.
//!
//! Every frame in either direction is one channel-tagged [`Packet`]: an
//! encoded envelope or a PCM16 audio frame. A socket binds to its
//! conversation's session through the session manager; closing the socket
//! detaches it and the session stops once the grace period passes without
//! a reconnect.

use crate::api::{validate_conversation_id, ApiError};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Path,
    },
    response::{IntoResponse, Response},
};
use cadence_agent::Attachment;
use cadence_protocol::{ChannelTransport, Packet};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound frames buffered per connection before the client counts as slow.
const OUTBOUND_QUEUE: usize = 256;

/// Handler for `GET /ws/{conversationId}`.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = validate_conversation_id(&conversation_id) {
        return e.into_response();
    }

    let (transport, outbound) = ChannelTransport::new(OUTBOUND_QUEUE);
    let attachment = match state
        .manager
        .connect(&conversation_id, Arc::new(transport))
        .await
    {
        Ok(attachment) => attachment,
        Err(e) => {
            tracing::warn!(conversation_id = %conversation_id, "websocket connect refused: {}", e);
            return ApiError::from(e).into_response();
        }
    };

    let manager = state.manager.clone();
    let epoch = attachment.epoch;
    let failed_id = conversation_id.clone();
    ws.on_failed_upgrade(move |e| {
        tracing::warn!(conversation_id = %failed_id, "websocket upgrade failed: {}", e);
        tokio::spawn(async move { manager.disconnect(&failed_id, epoch).await });
    })
    .on_upgrade(move |socket| handle_socket(socket, state, attachment, outbound))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    attachment: Attachment,
    mut outbound: mpsc::Receiver<Packet>,
) {
    let session = attachment.session.clone();
    let conversation_id = session.conversation_id().to_string();
    tracing::info!(conversation_id = %conversation_id, epoch = attachment.epoch, "websocket attached");

    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(packet) = outbound.recv().await {
            if sender
                .send(Message::Binary(packet.to_bytes().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(bytes) => session.handle_frame(&bytes).await,
            Message::Text(_) => {
                tracing::warn!(conversation_id = %conversation_id, "ignoring text frame");
            }
            Message::Close(_) => break,
            _ => {}
        }
        if session.is_stopped() {
            break;
        }
    }

    state
        .manager
        .disconnect(&conversation_id, attachment.epoch)
        .await;
    send_task.abort();
    tracing::info!(conversation_id = %conversation_id, "websocket closed");
}
