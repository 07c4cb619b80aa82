use std::net::SocketAddr;

use chrono::{Duration, Utc};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::protocol::{
    ChatMessage, ClientMessage, ConnId, EmoteState, Participant, Role, ServerMessage, TrialId,
    MAX_CHAT_LEN,
};
use crate::state::seats::{NoSeatsAvailable, SeatAssignment};
use crate::state::{RelayState, SharedState, WsMessage, WsSender};

const DEFAULT_EMOTE_MS: u64 = 3000;
const MAX_EMOTE_MS: u64 = 60_000;

// ============================================
// Connection handler
// ============================================

/// Drive one WebSocket connection. The connection starts unjoined; a
/// `room:join` binds it to a trial, and everything it held is torn down in a
/// single critical section when the transport drops.
pub async fn handle_socket(
    ws: hyper_tungstenite::WebSocketStream<hyper::upgrade::Upgraded>,
    addr: SocketAddr,
    state: SharedState,
) {
    info!("WebSocket connection established from {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws.split();
    let conn_id: ConnId = uuid::Uuid::new_v4().to_string();

    // Channel for sending messages to this WebSocket.
    let (tx, mut rx) = mpsc::unbounded_channel();
    state
        .relay
        .lock()
        .await
        .senders
        .insert(conn_id.clone(), tx.clone());

    // Forward queued messages to the WebSocket.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Unjoined until a room:join succeeds.
    let mut joined: Option<TrialId> = None;

    loop {
        tokio::select! {
            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                if let Err(e) = handle_message(msg, &conn_id, &mut joined, &state, &tx).await {
                                    warn!("Error handling message from {}: {}", addr, e);
                                    send_error(&tx, e);
                                }
                            }
                            Err(e) => {
                                warn!("Failed to parse message from {}: {}", addr, e);
                                send_error(&tx, format!("Invalid message format: {}", e));
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        info!("Client {} closed connection", addr);
                        break;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = tx.send(WsMessage::Pong(data));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut send_task => break,
        }
    }

    handle_disconnect(&conn_id, joined.take(), &state).await;
    send_task.abort();
}

/// Transport-level teardown: forget the sender and, if the connection was
/// joined, release its seat and membership under one lock acquisition.
pub async fn handle_disconnect(conn_id: &str, joined: Option<TrialId>, state: &SharedState) {
    let mut relay = state.relay.lock().await;
    relay.senders.remove(conn_id);
    if let Some(trial_id) = joined {
        leave_room(&mut relay, conn_id, &trial_id);
        info!("{} disconnected from trial {}", conn_id, trial_id);
    }
}

// ============================================
// Event dispatch
// ============================================

pub async fn handle_message(
    msg: ClientMessage,
    conn_id: &ConnId,
    joined: &mut Option<TrialId>,
    state: &SharedState,
    sender: &WsSender,
) -> Result<(), String> {
    match msg {
        ClientMessage::RoomJoin { trial_id, role, name } => {
            let mut relay = state.relay.lock().await;

            let mut prior_seat = None;
            match joined.take() {
                // Re-joining the current room replaces the entry but keeps the seat.
                Some(prev) if prev == trial_id => {
                    prior_seat = relay
                        .rooms
                        .participant(&prev, conn_id)
                        .and_then(|p| p.seat_key.clone());
                }
                Some(prev) => leave_room(&mut relay, conn_id, &prev),
                None => {}
            }

            relay.rooms.join(
                &trial_id,
                Participant {
                    connection_id: conn_id.clone(),
                    name,
                    role,
                    pose: None,
                    emote: None,
                    seat_key: prior_seat,
                },
            );

            let needs_seat = role == Role::Audience
                && relay
                    .rooms
                    .participant(&trial_id, conn_id)
                    .map_or(false, |p| p.seat_key.is_none());
            if needs_seat {
                match relay.seats.request_seat(&trial_id, conn_id, (0.0, 0.0)) {
                    Ok(assignment) => {
                        if let Some(p) = relay.rooms.participant_mut(&trial_id, conn_id) {
                            p.seat_key = Some(assignment.seat.key.clone());
                        }
                    }
                    Err(NoSeatsAvailable) => {
                        debug!("No free seats in trial {} for {}", trial_id, conn_id);
                    }
                }
            }

            let Some(me) = relay.rooms.participant(&trial_id, conn_id).cloned() else {
                return Err("participant missing right after join".to_owned());
            };
            info!("{} joined trial {} as {:?}", conn_id, trial_id, me.role);

            relay.broadcast(
                &trial_id,
                &ServerMessage::PresenceJoined { participant: me.clone() },
                Some(conn_id.as_str()),
            );

            let participants = relay.rooms.list_others(&trial_id, conn_id);
            send_json(sender, &ServerMessage::RoomJoined { ok: true, myself: me, participants })?;

            *joined = Some(trial_id);
            Ok(())
        }

        ClientMessage::RoomLeave { trial_id } => {
            if joined.as_deref() != Some(trial_id.as_str()) {
                debug!("room:leave from {} for a room it is not in", conn_id);
                return Ok(());
            }
            let mut relay = state.relay.lock().await;
            leave_room(&mut relay, conn_id, &trial_id);
            *joined = None;
            info!("{} left trial {}", conn_id, trial_id);
            Ok(())
        }

        ClientMessage::SeatRequest { trial_id, hint } => {
            if joined.as_deref() != Some(trial_id.as_str()) {
                debug!("seat:request from {} outside its joined room", conn_id);
                return Ok(());
            }
            let mut relay = state.relay.lock().await;
            let hint = hint.map_or((0.0, 0.0), |h| (h.x, h.z));
            match relay.seats.request_seat(&trial_id, conn_id, hint) {
                Ok(SeatAssignment { seat, released }) => {
                    if let Some(seat_key) = released {
                        relay.broadcast(
                            &trial_id,
                            &ServerMessage::SeatFreed { seat_key },
                            Some(conn_id.as_str()),
                        );
                    }
                    if let Some(p) = relay.rooms.participant_mut(&trial_id, conn_id) {
                        p.seat_key = Some(seat.key.clone());
                    }
                    send_json(
                        sender,
                        &ServerMessage::SeatAssigned {
                            ok: true,
                            seat: Some(seat.clone()),
                            reason: None,
                        },
                    )?;
                    relay.broadcast(
                        &trial_id,
                        &ServerMessage::SeatOccupied { connection_id: conn_id.clone(), seat },
                        Some(conn_id.as_str()),
                    );
                }
                Err(NoSeatsAvailable) => {
                    send_json(
                        sender,
                        &ServerMessage::SeatAssigned {
                            ok: false,
                            seat: None,
                            reason: Some("no_seats".to_owned()),
                        },
                    )?;
                }
            }
            Ok(())
        }

        ClientMessage::SeatRelease { trial_id } => {
            if joined.as_deref() != Some(trial_id.as_str()) {
                return Ok(());
            }
            let mut relay = state.relay.lock().await;
            if let Some(seat_key) = relay.seats.release_seat(&trial_id, conn_id) {
                if let Some(p) = relay.rooms.participant_mut(&trial_id, conn_id) {
                    p.seat_key = None;
                }
                relay.broadcast(&trial_id, &ServerMessage::SeatFreed { seat_key }, Some(conn_id.as_str()));
            }
            Ok(())
        }

        ClientMessage::PoseUpdate { trial_id, pose } => {
            if joined.as_deref() != Some(trial_id.as_str()) {
                return Ok(());
            }
            let mut relay = state.relay.lock().await;
            // Fire and forget: no ack, dropped silently for non-members.
            if relay.rooms.update_pose(&trial_id, conn_id, pose) {
                relay.broadcast(
                    &trial_id,
                    &ServerMessage::PoseBroadcast { connection_id: conn_id.clone(), pose },
                    Some(conn_id.as_str()),
                );
            }
            Ok(())
        }

        ClientMessage::EmoteUpdate { trial_id, emote } => {
            if joined.as_deref() != Some(trial_id.as_str()) {
                return Ok(());
            }
            let ms = emote.duration_ms.unwrap_or(DEFAULT_EMOTE_MS).min(MAX_EMOTE_MS);
            let emote = EmoteState {
                kind: emote.kind,
                expires_at: Utc::now() + Duration::milliseconds(ms as i64),
            };
            let mut relay = state.relay.lock().await;
            if relay.rooms.update_emote(&trial_id, conn_id, emote.clone()) {
                relay.broadcast(
                    &trial_id,
                    &ServerMessage::EmoteBroadcast { connection_id: conn_id.clone(), emote },
                    Some(conn_id.as_str()),
                );
            }
            Ok(())
        }

        ClientMessage::ChatMsg { trial_id, payload } => {
            if joined.as_deref() != Some(trial_id.as_str()) {
                return Ok(());
            }
            if payload.text.is_empty() {
                debug!("Dropping empty chat message from {}", conn_id);
                return Ok(());
            }
            let relay = state.relay.lock().await;
            let Some(me) = relay.rooms.participant(&trial_id, conn_id) else {
                return Ok(());
            };
            let message = ChatMessage {
                id: uuid::Uuid::new_v4().to_string(),
                from: me.name.clone(),
                role: me.role,
                text: payload.text.chars().take(MAX_CHAT_LEN).collect(),
                at: Utc::now(),
                position: payload.position.unwrap_or_default(),
            };
            // The sender hears its own message through the same path as
            // everyone else; there is no local echo.
            relay.broadcast(&trial_id, &ServerMessage::Chat(message), None);
            Ok(())
        }

        ClientMessage::JudgeAction { trial_id, action } => {
            if joined.as_deref() != Some(trial_id.as_str()) {
                return Ok(());
            }
            if action.is_empty() {
                return Ok(());
            }
            // The sender's declared role is not checked; any member can
            // trigger a banner.
            let banner = banner_for(&action);
            info!("Judge action '{}' in trial {}", action, trial_id);
            let relay = state.relay.lock().await;
            relay.broadcast(
                &trial_id,
                &ServerMessage::CourtBanner { text: banner.to_owned(), at: Utc::now() },
                None,
            );
            Ok(())
        }
    }
}

/// Release the seat and the membership entry, then notify whoever remains.
/// Runs under the caller's lock, so the two mutations are atomic.
fn leave_room(relay: &mut RelayState, conn_id: &str, trial_id: &str) {
    let freed = relay.seats.release_seat(trial_id, conn_id);
    let outcome = relay.rooms.leave(trial_id, conn_id);
    if let Some(seat_key) = freed {
        relay.broadcast(trial_id, &ServerMessage::SeatFreed { seat_key }, None);
    }
    if outcome.is_some() {
        relay.broadcast(
            trial_id,
            &ServerMessage::PresenceLeft { connection_id: conn_id.to_owned() },
            None,
        );
    }
    if outcome == Some(true) {
        relay.seats.remove_room(trial_id);
        debug!("Room {} emptied, dropping seat layout", trial_id);
    }
}

fn banner_for(action: &str) -> &'static str {
    match action {
        "start" => "Session started",
        "stop" => "Session stopped",
        "call_witness" => "Witness, please step forward",
        _ => "Action",
    }
}

fn send_json(sender: &WsSender, msg: &ServerMessage) -> Result<(), String> {
    let json = serde_json::to_string(msg)
        .map_err(|e| format!("Failed to serialize response: {}", e))?;
    sender
        .send(WsMessage::Text(json))
        .map_err(|e| format!("Failed to send response: {}", e))
}

fn send_error(tx: &WsSender, message: String) {
    let Ok(json) = serde_json::to_string(&ServerMessage::Error { message }) else {
        return;
    };
    let _ = tx.send(WsMessage::Text(json));
}
