//! Live WebSocket feed. Clients authenticate with `?token=`, then join or
//! leave channels by sending `{"action": ...}` messages.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::auth::{principal_for_token, Principal};
use crate::error::AppResult;
use crate::services::broadcaster::{Broadcaster, Channel, SubscriberId};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct WsAuth {
    token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    SubscribeMachine { machine_id: String },
    UnsubscribeMachine { machine_id: String },
    SubscribeAll,
    UnsubscribeAll,
}

fn event(name: &str, data: JsonValue) -> JsonValue {
    json!({ "event": name, "data": data })
}

fn machine_channel(raw: &str) -> Option<(String, Channel)> {
    let id = Uuid::parse_str(raw.trim()).ok()?.to_string();
    let channel = Channel::machine(&id);
    Some((id, channel))
}

/// Applies one client frame and returns the acknowledgement to send back.
fn handle_client_text(broadcaster: &Broadcaster, subscriber: SubscriberId, text: &str) -> JsonValue {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(_) => return event("error", json!({ "message": "Unrecognised message" })),
    };
    match message {
        ClientMessage::SubscribeMachine { machine_id } => match machine_channel(&machine_id) {
            Some((id, channel)) => {
                let room = channel.name();
                broadcaster.join(subscriber, channel);
                event("subscribed", json!({ "machine_id": id, "room": room }))
            }
            None => event(
                "error",
                json!({ "message": "Invalid machine ID format", "machine_id": machine_id }),
            ),
        },
        ClientMessage::UnsubscribeMachine { machine_id } => match machine_channel(&machine_id) {
            Some((id, channel)) => {
                broadcaster.leave(subscriber, &channel);
                event("unsubscribed", json!({ "machine_id": id }))
            }
            None => event(
                "error",
                json!({ "message": "Invalid machine ID format", "machine_id": machine_id }),
            ),
        },
        ClientMessage::SubscribeAll => {
            broadcaster.join(subscriber, Channel::AllMachines);
            event("subscribed_all", json!({ "status": "success" }))
        }
        ClientMessage::UnsubscribeAll => {
            broadcaster.leave(subscriber, &Channel::AllMachines);
            event("unsubscribed_all", json!({ "status": "success" }))
        }
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(auth): Query<WsAuth>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    let principal = principal_for_token(state.identity.as_ref(), auth.token.as_deref()).await?;
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    let broadcaster = state.broadcaster.clone();
    Ok(upgrade.on_upgrade(move |socket| serve_socket(socket, broadcaster, principal)))
}

async fn serve_socket(socket: WebSocket, broadcaster: Broadcaster, principal: Principal) {
    let (subscriber, mut events) = broadcaster.connect();
    let (mut sink, mut stream) = socket.split();
    tracing::info!(subscriber, subject = %principal.subject, "live client connected");

    let hello = event(
        "connected",
        json!({ "status": "success", "message": "Connected to real-time server" }),
    );
    if sink.send(Message::Text(hello.to_string().into())).await.is_err() {
        broadcaster.disconnect(subscriber);
        return;
    }

    loop {
        tokio::select! {
            next = events.recv() => {
                let Some(live) = next else { break };
                let text = match serde_json::to_string(live.as_ref()) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(subscriber, error = %err, "failed to encode live event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_text(&broadcaster, subscriber, text.as_str());
                        if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(subscriber, error = %err, "live socket error");
                        break;
                    }
                }
            }
        }
    }

    broadcaster.disconnect(subscriber);
    tracing::info!(subscriber, "live client disconnected");
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::router as app_router;
    use crate::services::broadcaster::SensorDataEvent;
    use crate::test_support::{call, test_app, VIEWER_TOKEN};
    use axum::http::{Method, StatusCode};
    use chrono::Utc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn client_messages_parse_by_action() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"action":"subscribe_machine","machine_id":"abc"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::SubscribeMachine {
                machine_id: "abc".to_string()
            }
        );
        let parsed: ClientMessage = serde_json::from_str(r#"{"action":"subscribe_all"}"#).unwrap();
        assert_eq!(parsed, ClientMessage::SubscribeAll);
    }

    #[tokio::test]
    async fn subscribe_then_receive_machine_events() {
        let broadcaster = Broadcaster::new(16, 8);
        let cancel = CancellationToken::new();
        let handle = broadcaster.start(cancel.clone()).unwrap();
        let (id, mut rx) = broadcaster.connect();
        let machine = Uuid::new_v4();

        let ack = handle_client_text(
            &broadcaster,
            id,
            &json!({"action": "subscribe_machine", "machine_id": machine.to_string().to_uppercase()})
                .to_string(),
        );
        assert_eq!(ack["event"], "subscribed");
        assert_eq!(ack["data"]["room"], format!("machine_{machine}"));

        broadcaster.broadcast(SensorDataEvent {
            machine_id: machine,
            sensor_type: "Temperature".to_string(),
            location: "Floor 1".to_string(),
            timestamp: Utc::now(),
            temperature: Some(70.0),
            pressure: None,
            speed: None,
        });
        let received = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value = serde_json::to_value(received.as_ref()).unwrap();
        assert_eq!(value["event"], "sensor_data");
        assert_eq!(value["data"]["machine_id"], machine.to_string());

        let ack = handle_client_text(
            &broadcaster,
            id,
            &json!({"action": "unsubscribe_machine", "machine_id": machine.to_string()}).to_string(),
        );
        assert_eq!(ack["event"], "unsubscribed");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn bad_frames_get_error_events() {
        let broadcaster = Broadcaster::new(4, 4);
        let (id, _rx) = broadcaster.connect();
        assert_eq!(handle_client_text(&broadcaster, id, "not json")["event"], "error");
        let ack = handle_client_text(
            &broadcaster,
            id,
            r#"{"action":"subscribe_machine","machine_id":"press-7"}"#,
        );
        assert_eq!(ack["data"]["message"], "Invalid machine ID format");
        let ack = handle_client_text(&broadcaster, id, r#"{"action":"subscribe_all"}"#);
        assert_eq!(ack["event"], "subscribed_all");
    }

    #[tokio::test]
    async fn upgrade_requires_known_token() {
        let app = test_app();
        let router = app_router(app.state);

        let (status, _, _) = call(&router, Method::GET, "/ws", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _, _) = call(&router, Method::GET, "/ws?token=nope", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // a valid token on a plain GET reaches the upgrade extractor, whose
        // rejection body is plain text
        let (status, _, body) = call(
            &router,
            Method::GET,
            &format!("/ws?token={VIEWER_TOKEN}"),
            None,
            None,
        )
        .await;
        assert!(status.is_client_error());
        assert_ne!(status, StatusCode::UNAUTHORIZED);
        assert!(body.is_string());
    }
}
