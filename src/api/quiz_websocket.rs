use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::quiz::{ConnectionHandler, QuizService, ServerMessage};
use crate::storage::UserId;

/// Query string of the upgrade request: `?channel_code=..&user_id=..`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectQuery {
    pub channel_code: String,
    pub user_id: UserId,
}

pub async fn handle_quiz_websocket(
    websocket: WebSocket,
    service: Arc<QuizService>,
    query: ConnectQuery,
) {
    tracing::info!(
        room_id = %query.channel_code,
        user_id = query.user_id,
        "New quiz WebSocket connection established"
    );

    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Spawn task to send messages to client
    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = message.is_close();
            if let Err(e) = ws_sender.send(message).await {
                tracing::error!(error = %e, "Failed to send WebSocket message");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let handler = match ConnectionHandler::admit(
        service,
        &query.channel_code,
        query.user_id,
        tx.clone(),
    )
    .await
    {
        Ok(handler) => handler,
        Err(e) => {
            tracing::warn!(
                room_id = %query.channel_code,
                user_id = query.user_id,
                error = %e,
                "Rejecting WebSocket connection"
            );
            if let Ok(frame) = ServerMessage::error(e.to_string()).to_ws_message() {
                let _ = tx.send(frame);
            }
            let _ = tx.send(Message::close());
            drop(tx);
            let _ = sender_task.await;
            return;
        }
    };
    drop(tx);

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) if message.is_close() => break,
            Ok(message) => {
                if let Ok(text) = message.to_str() {
                    handler.handle_text(text).await;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "WebSocket error");
                break;
            }
        }
    }

    handler.cleanup();
    sender_task.abort();
}
