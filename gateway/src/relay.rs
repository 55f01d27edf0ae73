use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use common_net::{
    message::{self, SignalEvent, SignalMessage},
    metrics::signaling_metrics,
};
use pocketbase::PocketBaseClient;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    polls::{Poll, PollError},
    HubState,
};

pub const CHAT_COLLECTION: &str = "chat_messages";
pub const POLLS_COLLECTION: &str = "polls";

/// `GET /ws/:session_id?user=<name>` upgrades to the signaling socket.
/// Unknown sessions are rejected before the upgrade so the client gets a
/// plain 404 instead of a dangling socket.
pub async fn ws_handler(
    State(state): State<HubState>,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if state.sessions.read().await.get(&session_id).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let user = params
        .get("user")
        .cloned()
        .unwrap_or_else(|| "anonymous".to_string());

    ws.on_upgrade(move |socket| ws_session(socket, state, session_id, user))
}

/// One connected endpoint. Outbound delivery goes through an unbounded
/// channel owned by the registry; the select loop below is the only task
/// that touches the socket, so sends and receives never race.
async fn ws_session(mut socket: WebSocket, state: HubState, session_id: String, user: String) {
    let endpoint_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    state.groups.join(&session_id, &endpoint_id, tx);
    signaling_metrics().connected_endpoints.inc();
    info!(session_id, endpoint_id, user, "endpoint connected");

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match message::decode(&text) {
                            Ok(msg) => {
                                handle_signal(&state, &session_id, &endpoint_id, &user, msg).await;
                            }
                            Err(err) => {
                                // Malformed frames are dropped, not answered.
                                debug!(%err, session_id, endpoint_id, "undecodable frame dropped");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary and pong frames are ignored
                    Some(Err(err)) => {
                        warn!(%err, session_id, endpoint_id, "socket error");
                        break;
                    }
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if socket.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.groups.leave(&session_id, &endpoint_id);
    signaling_metrics().connected_endpoints.dec();
    info!(session_id, endpoint_id, "endpoint disconnected");
}

/// Route one decoded frame. WebRTC signals go to everyone else in the
/// group; chat echoes back to the sender too; poll commands mutate the
/// board and broadcast the outcome, with failures answered only to the
/// endpoint that issued them.
async fn handle_signal(
    state: &HubState,
    session_id: &str,
    endpoint_id: &str,
    user: &str,
    msg: SignalMessage,
) {
    match msg {
        SignalMessage::Ready { data } => {
            relay_webrtc(state, session_id, endpoint_id, SignalEvent::Ready { data });
        }
        SignalMessage::Offer { data } => {
            relay_webrtc(state, session_id, endpoint_id, SignalEvent::Offer { data });
        }
        SignalMessage::Answer { data } => {
            relay_webrtc(state, session_id, endpoint_id, SignalEvent::Answer { data });
        }
        SignalMessage::IceCandidate { data } => {
            relay_webrtc(
                state,
                session_id,
                endpoint_id,
                SignalEvent::IceCandidate { data },
            );
        }
        SignalMessage::Chat { username, message } => {
            let timestamp = Utc::now().to_rfc3339();
            state.groups.broadcast(
                session_id,
                &SignalEvent::Chat {
                    username: username.clone(),
                    message: message.clone(),
                    timestamp: timestamp.clone(),
                },
                None,
            );
            signaling_metrics().inc_chat_messages();
            mirror_chat(state.pocketbase.clone(), session_id, username, message, timestamp);
        }
        SignalMessage::PollStart { question, options } => {
            match state.polls.start_poll(session_id, &question, &options, user) {
                Ok(poll) => {
                    state.groups.broadcast(
                        session_id,
                        &SignalEvent::PollStart {
                            poll_id: poll.id.clone(),
                            question: poll.question.clone(),
                            options: poll.options.clone(),
                        },
                        None,
                    );
                    mirror_poll_started(state.pocketbase.clone(), session_id, poll);
                }
                Err(err) => reply_poll_error(state, session_id, endpoint_id, err),
            }
        }
        SignalMessage::PollVote { poll_id, option } => {
            match state.polls.cast_vote(session_id, &poll_id, option, user) {
                Ok(results) => {
                    state.groups.broadcast(
                        session_id,
                        &SignalEvent::PollUpdate { poll_id, results },
                        None,
                    );
                }
                Err(err) => reply_poll_error(state, session_id, endpoint_id, err),
            }
        }
        SignalMessage::PollEnd { poll_id } => {
            match state.polls.end_poll(session_id, &poll_id, user) {
                Ok(_poll) => {
                    state.groups.broadcast(
                        session_id,
                        &SignalEvent::PollEnd {
                            poll_id: poll_id.clone(),
                        },
                        None,
                    );
                    mirror_poll_ended(state.pocketbase.clone(), poll_id);
                }
                Err(err) => reply_poll_error(state, session_id, endpoint_id, err),
            }
        }
    }
}

fn relay_webrtc(state: &HubState, session_id: &str, endpoint_id: &str, event: SignalEvent) {
    let delivered = state.groups.broadcast(session_id, &event, Some(endpoint_id));
    signaling_metrics().inc_signals_relayed(delivered as u64);
}

fn reply_poll_error(state: &HubState, session_id: &str, endpoint_id: &str, err: PollError) {
    let code = match err {
        PollError::InvalidInput => "invalid_input",
        PollError::NoActivePoll => "no_active_poll",
        PollError::InvalidOption => "invalid_option",
        PollError::Unauthorized => "unauthorized",
    };
    state.groups.send_to(
        session_id,
        endpoint_id,
        &SignalEvent::Error {
            code: code.to_string(),
            message: err.to_string(),
        },
    );
}

// Chat and poll mirrors are fire-and-forget: the broadcast already
// happened, storage trouble only gets a warning.

fn mirror_chat(
    pocketbase: PocketBaseClient,
    session_id: &str,
    username: String,
    message: String,
    timestamp: String,
) {
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let record = serde_json::json!({
            "session_id": session_id,
            "username": username,
            "message": message,
            "timestamp": timestamp,
        });
        if let Err(err) = pocketbase.create_record(CHAT_COLLECTION, record).await {
            warn!(%err, session_id, "chat mirror failed");
        }
    });
}

fn mirror_poll_started(pocketbase: PocketBaseClient, session_id: &str, poll: Poll) {
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let record = serde_json::json!({
            "id": poll.id,
            "session_id": session_id,
            "question": poll.question,
            "options": poll.options,
            "creator": poll.creator,
            "created_at": poll.created_at,
            "active": true,
        });
        if let Err(err) = pocketbase.create_record(POLLS_COLLECTION, record).await {
            warn!(%err, session_id, "poll mirror create failed");
        }
    });
}

fn mirror_poll_ended(pocketbase: PocketBaseClient, poll_id: String) {
    tokio::spawn(async move {
        let patch = serde_json::json!({ "active": false });
        if let Err(err) = pocketbase
            .update_record(POLLS_COLLECTION, &poll_id, patch)
            .await
        {
            warn!(%err, poll_id, "poll mirror update failed");
        }
    });
}
