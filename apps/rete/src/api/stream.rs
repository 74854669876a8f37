//! # Live Event Stream
//!
//! `GET /ws` upgrades to a WebSocket. The client first receives a metrics
//! snapshot, then every action firing and a fresh snapshot after each
//! mutating request. Messages are JSON [`StreamEvent`]s.

use super::{
    AppState,
    types::{StatusResponse, StreamEvent},
};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use tokio::sync::broadcast::error::RecvError;

/// Events buffered per subscriber before a slow client starts losing them.
pub const EVENT_BUFFER: usize = 1024;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

async fn stream_events(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before the snapshot so nothing falls between the two.
    let mut events = state.events.subscribe();

    let snapshot = {
        let network = state.network.read().await;
        StreamEvent::Metrics(StatusResponse::of(&network))
    };
    if send_event(&mut sender, &snapshot).await.is_err() {
        return;
    }
    tracing::debug!(subscribers = state.events.receiver_count(), "stream client connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "stream client lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            message = receiver.next() => match message {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("stream client disconnected");
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &StreamEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => sender.send(Message::Text(text.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode stream event");
            Ok(())
        }
    }
}
