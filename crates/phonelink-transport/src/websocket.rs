//! WebSocket transport for session event subscribers.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use phonelink_core::{EventHub, PhoneNumber};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::protocol::{ClientMessage, ServerMessage};

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    /// Event hub the sessions publish to.
    pub hub: Arc<EventHub>,
}

impl WsState {
    /// Create new WebSocket state.
    #[must_use]
    pub const fn new(hub: Arc<EventHub>) -> Self {
        Self { hub }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Per-connection subscription state.
struct Connection {
    hub: Arc<EventHub>,
    tx: mpsc::UnboundedSender<ServerMessage>,
    forwarder: Option<JoinHandle<()>>,
}

impl Connection {
    const fn new(hub: Arc<EventHub>, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            hub,
            tx,
            forwarder: None,
        }
    }

    fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Ping => {
                let _ = self.tx.send(ServerMessage::Pong);
            }
            ClientMessage::Subscribe {
                phone,
                country_code,
            } => {
                if phone.is_empty() || !(1..=999).contains(&country_code) {
                    let _ = self.tx.send(ServerMessage::Error {
                        message: format!("Invalid phone number: +{country_code}:{phone}"),
                    });
                    return;
                }
                self.subscribe(PhoneNumber::new(phone, country_code));
            }
            ClientMessage::Unsubscribe => self.unsubscribe(),
        }
    }

    fn subscribe(&mut self, number: PhoneNumber) {
        self.unsubscribe();
        tracing::debug!(phone = %number, "subscriber attached");

        let _ = self.tx.send(ServerMessage::subscribed(&number));

        let mut events = self.hub.history_plus_stream(&number);
        let tx = self.tx.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if tx.send(ServerMessage::event(&number, event)).is_err() {
                    break;
                }
            }
        }));
    }

    fn unsubscribe(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut connection = Connection::new(state.hub, tx);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(client_msg) => connection.handle(client_msg),
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                let _ = connection.tx.send(ServerMessage::Error {
                    message: format!("Invalid message: {e}"),
                });
            }
        }
    }

    drop(connection);
    send_task.abort();
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(hub));
/// ```
#[must_use]
pub fn create_ws_router(hub: Arc<EventHub>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(WsState::new(hub))
}
