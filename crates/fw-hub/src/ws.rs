use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use fw_core::{
    dashboard::Dashboard,
    events::{ServerEvent, ViewerRequest},
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub dashboard: Arc<Dashboard>,
    pub write_timeout: Duration,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        handle_socket(state, socket).await;
    })
}

pub fn encode_event(event: &ServerEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(event = "ws_encode_failed", name = event.name(), error = %err);
            None
        }
    }
}

pub fn decode_request(text: &str) -> Option<ViewerRequest> {
    if text.len() > MAX_REQUEST_BYTES {
        warn!(event = "ws_request_too_large", bytes = text.len());
        return None;
    }
    match serde_json::from_str(text) {
        Ok(request) => Some(request),
        Err(err) => {
            warn!(event = "ws_request_invalid", error = %err);
            None
        }
    }
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (viewer, mut events) = state.dashboard.viewers().channel();
    let write_timeout = state.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(text) = encode_event(&event) else {
                continue;
            };
            match tokio::time::timeout(write_timeout, ws_sender.send(Message::Text(text))).await {
                Ok(Ok(())) => {}
                _ => return,
            }
        }
    });

    let dashboard = state.dashboard;
    dashboard.connect(viewer.clone()).await;

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "ws_read_error", viewer = viewer.id(), error = %err);
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Some(request) = decode_request(&text) else {
            continue;
        };
        debug!(event = "ws_request", viewer = viewer.id(), request = ?request);
        match request {
            // Actions wait on a daemon reply; keep reading meanwhile.
            ViewerRequest::Action { .. } => {
                let dashboard = dashboard.clone();
                let viewer = viewer.clone();
                tokio::spawn(async move { dashboard.handle(&viewer, request).await });
            }
            request => dashboard.handle(&viewer, request).await,
        }
    }

    dashboard.disconnect(viewer.id()).await;
    write_task.abort();
}
