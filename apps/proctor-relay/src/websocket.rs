use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use proctor_protocol::{ClientMessage, Register, Registered, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::directory::{ConnectionId, Outbound, OutboundSender, Registration};
use crate::relay::RelayError;
use crate::AppState;

pub async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = ConnectionId::new();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    counter!("proctor_relay_connections_total", 1);
    debug!(connection_id = %connection_id, "websocket connection opened");

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Message(message) => {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(connection_id = %connection_id, error = %err, "failed to encode frame");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let frame = CloseFrame {
                        code: close_code::POLICY,
                        reason: reason.into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    let registration_deadline = tokio::time::sleep(state.registration_timeout);
    tokio::pin!(registration_deadline);
    let mut registered = false;

    loop {
        tokio::select! {
            _ = &mut registration_deadline, if !registered => {
                info!(connection_id = %connection_id, "no registration received in time; closing");
                counter!("proctor_relay_registration_timeouts_total", 1);
                let _ = tx.send(Outbound::Close("registration timeout".to_string()));
                let _ = tokio::time::timeout(std::time::Duration::from_secs(1), &mut writer).await;
                break;
            }
            _ = &mut writer => break,
            frame = ws_rx.next() => {
                let Some(frame) = frame else { break };
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            reply(&tx, ServerMessage::error("binary frames must hold UTF-8 JSON"));
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(
                            connection_id = %connection_id,
                            reason = ?frame.map(|f| f.reason.to_string()),
                            "client closed websocket"
                        );
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(connection_id = %connection_id, error = %err, "error receiving message");
                        break;
                    }
                };

                match ClientMessage::from_json(&text) {
                    Ok(message) => handle_client_message(&state, connection_id, &tx, message).await,
                    Err(err) => {
                        debug!(connection_id = %connection_id, error = %err, "rejected frame");
                        reply(&tx, ServerMessage::error(err.to_string()));
                    }
                }
                if !registered {
                    registered = state.relay.directory().session_for(connection_id).is_some();
                }
            }
        }
    }

    let directory = state.relay.directory();
    if let Some(session) = directory.unregister(connection_id) {
        info!(
            user_id = %session.user_id,
            role = %session.role,
            test_id = session.test_id,
            connection_id = %connection_id,
            "session unregistered"
        );
    }
    gauge!("proctor_relay_sessions_active", directory.len() as f64);
    writer.abort();
}

pub(crate) async fn handle_client_message(
    state: &AppState,
    connection_id: ConnectionId,
    tx: &OutboundSender,
    message: ClientMessage,
) {
    let directory = state.relay.directory();
    let message = match message {
        ClientMessage::Register(identity) => {
            register(state, connection_id, tx, identity).await;
            return;
        }
        ClientMessage::Ping => {
            directory.touch(connection_id);
            reply(tx, ServerMessage::Pong);
            return;
        }
        other => other,
    };
    let Some(session) = directory.session_for(connection_id) else {
        reply(
            tx,
            ServerMessage::error(format!("`{}` requires a registered session", message.event())),
        );
        return;
    };

    directory.touch(connection_id);
    let event = message.event();
    let outcome = match message {
        ClientMessage::Signal(signal) => state.relay.relay(&session, signal),
        ClientMessage::StartStream(request) => state.relay.forward_start(&session, request),
        ClientMessage::StopStream(stop) => state.relay.forward_stop(&session, stop),
        ClientMessage::Register(_) | ClientMessage::Ping => return,
    };

    match outcome {
        Ok(_) => {}
        Err(err @ RelayError::NotTeacher) => {
            debug!(user_id = %session.user_id, event, error = %err, "message refused");
            reply(tx, ServerMessage::error(err.to_string()));
        }
        Err(err) => {
            debug!(user_id = %session.user_id, event, error = %err, "message dropped");
        }
    }
}

async fn register(state: &AppState, connection_id: ConnectionId, tx: &OutboundSender, identity: Register) {
    if identity.user_id.trim().is_empty() {
        counter!("proctor_relay_registrations_rejected_total", 1);
        reply(tx, ServerMessage::Registered(Registered::rejected("userId must not be empty")));
        return;
    }
    if !state.catalog.is_active(identity.test_id).await {
        counter!("proctor_relay_registrations_rejected_total", 1);
        info!(user_id = %identity.user_id, test_id = identity.test_id, "registration for inactive test");
        reply(
            tx,
            ServerMessage::Registered(Registered::rejected(format!(
                "test {} is not active",
                identity.test_id
            ))),
        );
        return;
    }

    let directory = state.relay.directory();
    match directory.register(&identity, connection_id, tx.clone()) {
        Registration::Created => info!(
            user_id = %identity.user_id,
            role = %identity.role,
            test_id = identity.test_id,
            connection_id = %connection_id,
            "session registered"
        ),
        Registration::Unchanged => debug!(
            user_id = %identity.user_id,
            connection_id = %connection_id,
            "duplicate registration ignored"
        ),
        Registration::Superseded { previous } => info!(
            user_id = %identity.user_id,
            connection_id = %connection_id,
            previous = %previous,
            "session moved to a new connection"
        ),
    }
    counter!("proctor_relay_registrations_total", 1, "role" => identity.role.as_str());
    gauge!("proctor_relay_sessions_active", directory.len() as f64);
    reply(tx, ServerMessage::Registered(Registered::accepted(connection_id.to_string())));
}

fn reply(tx: &OutboundSender, message: ServerMessage) {
    let _ = tx.send(Outbound::Message(message));
}
