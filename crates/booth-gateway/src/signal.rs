use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
};
use booth_common::{now_ms, ClientMessage, Error, IceCandidate, ServerMessage, SessionDescription};
use futures::{stream::StreamExt, SinkExt};
use once_cell::sync::Lazy;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::rooms::{self, JoinRequest, Member};
use crate::security;
use crate::state::AppState;
use crate::store::{RoomEvent, RoomStore};

const WS_OUTBOX_CAPACITY: usize = 128;
const WS_MAX_TEXT_BYTES: usize = 64 * 1024;
const WS_MAX_MESSAGES_PER_MINUTE: u32 = 600;
const MAX_SIGNAL_SDP_BYTES: usize = 32 * 1024;
const MAX_SIGNAL_CANDIDATE_BYTES: usize = 4096;
const MAX_PARTICIPANT_ID_BYTES: usize = 64;
const WS_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

static ACTIVE_WS_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);
static IP_CONNECTIONS: Lazy<Mutex<HashMap<IpAddr, usize>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn active_ws_connections() -> usize {
    ACTIVE_WS_CONNECTIONS.load(Ordering::Relaxed)
}

fn ws_connection_limit() -> usize {
    std::env::var("BOOTH_WS_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(4096)
}

fn ws_max_per_ip() -> usize {
    std::env::var("BOOTH_WS_MAX_PER_IP")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(32)
}

fn release_ip_slot(ip: IpAddr) {
    if let Ok(mut counts) = IP_CONNECTIONS.lock() {
        if let Some(count) = counts.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&ip);
            }
        }
    }
}

fn to_ws_message(msg: &ServerMessage) -> Option<Message> {
    serde_json::to_string(msg).ok().map(Message::Text)
}

async fn send_server(tx: &mpsc::Sender<Message>, msg: &ServerMessage) -> bool {
    let Some(message) = to_ws_message(msg) else {
        return false;
    };
    tx.send(message).await.is_ok()
}

async fn send_error(tx: &mpsc::Sender<Message>, message: impl Into<String>) -> bool {
    send_server(
        tx,
        &ServerMessage::Error {
            message: message.into(),
        },
    )
    .await
}

/// Text shown to the participant for a failed operation.
fn client_error_message(err: &Error) -> String {
    match err {
        Error::Validation(msg) | Error::NotFound(msg) => msg.clone(),
        Error::RateLimited(_) => "Too many requests".to_string(),
        other => {
            warn!("signaling operation failed: {}", other);
            "Unable to complete request".to_string()
        }
    }
}

fn validate_signal(
    to: &str,
    sdp: Option<&SessionDescription>,
    candidate: Option<&IceCandidate>,
) -> Result<(), &'static str> {
    if to.is_empty() || to.len() > MAX_PARTICIPANT_ID_BYTES {
        return Err("Invalid SIGNAL recipient");
    }
    if sdp.is_none() && candidate.is_none() {
        return Err("SIGNAL needs an sdp or a candidate");
    }
    if sdp.is_some_and(|sdp| sdp.sdp.len() > MAX_SIGNAL_SDP_BYTES) {
        return Err("SDP too large");
    }
    if candidate.is_some_and(|c| c.candidate.len() > MAX_SIGNAL_CANDIDATE_BYTES) {
        return Err("Candidate too large");
    }
    Ok(())
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<RoomEvent>>,
) -> Result<RoomEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Messages that bring a lagged participant back in line with the room.
///
/// `known` holds the other participants already announced on this socket and
/// is updated to match the room. Everyone present is re-announced; the client
/// ignores peers it already has.
async fn resync_messages(
    rooms: &RoomStore,
    me: &Member,
    known: &mut BTreeSet<String>,
) -> Vec<ServerMessage> {
    let Some(snapshot) = rooms.snapshot(&me.access_code).await else {
        known.clear();
        return vec![ServerMessage::RoomClosed];
    };
    let present: BTreeSet<String> = snapshot
        .users
        .iter()
        .map(|user| user.participant_id.clone())
        .filter(|id| id != &me.participant_id)
        .collect();

    let mut messages: Vec<ServerMessage> = known
        .difference(&present)
        .map(|participant_id| ServerMessage::UserRemoved {
            participant_id: participant_id.clone(),
        })
        .collect();
    messages.extend(
        snapshot
            .users
            .into_iter()
            .filter(|user| user.participant_id != me.participant_id)
            .map(|user| ServerMessage::UserAdded { user }),
    );
    messages.extend(
        rooms
            .pending_signals(&me.access_code, &me.participant_id)
            .await
            .into_iter()
            .map(|message| ServerMessage::Signal { message }),
    );
    *known = present;
    messages
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !security::ws_origin_allowed(origin) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let ip = security::effective_client_ip(&headers, addr);
    {
        let Ok(mut counts) = IP_CONNECTIONS.lock() else {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        };
        let count = counts.get(&ip).cloned().unwrap_or(0);
        if count >= ws_max_per_ip() {
            return StatusCode::TOO_MANY_REQUESTS.into_response();
        }
        counts.insert(ip, count + 1);
    }

    if active_ws_connections() >= ws_connection_limit() {
        release_ip_slot(ip);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, ip))
        .into_response()
}

async fn handle_socket(stream: WebSocket, state: AppState, ip: IpAddr) {
    ACTIVE_WS_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
    debug!("client connecting from {}", ip);
    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(WS_OUTBOX_CAPACITY);

    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    let mut member: Option<Member> = None;
    let mut events: Option<broadcast::Receiver<RoomEvent>> = None;
    let mut known: BTreeSet<String> = BTreeSet::new();
    let mut ended = false;
    let mut message_window_start = Instant::now();
    let mut message_count: u32 = 0;
    let join_deadline = tokio::time::Instant::now() + WS_JOIN_TIMEOUT;

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            _ = tokio::time::sleep_until(join_deadline), if member.is_none() => {
                let _ = send_error(&tx, "Join timeout").await;
                break;
            }
            event = next_event(&mut events) => {
                let Some(me) = &member else { continue; };
                match event {
                    Ok(RoomEvent::UserAdded(user)) => {
                        if user.participant_id != me.participant_id {
                            known.insert(user.participant_id.clone());
                            let _ = send_server(&tx, &ServerMessage::UserAdded { user }).await;
                        }
                    }
                    Ok(RoomEvent::UserRemoved { participant_id }) => {
                        if participant_id != me.participant_id {
                            known.remove(&participant_id);
                            let _ = send_server(&tx, &ServerMessage::UserRemoved { participant_id }).await;
                        }
                    }
                    Ok(RoomEvent::SignalAdded { to, message }) => {
                        if to == me.participant_id {
                            let _ = send_server(&tx, &ServerMessage::Signal { message }).await;
                        }
                    }
                    Ok(RoomEvent::ChatAdded(message)) => {
                        let _ = send_server(&tx, &ServerMessage::Chat { message }).await;
                    }
                    Ok(RoomEvent::RoomDeleted) => {
                        events = None;
                        let _ = send_server(&tx, &ServerMessage::RoomClosed).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "participant {} lagged {} room events; resending presence and mailbox",
                            me.participant_id, skipped
                        );
                        for msg in resync_messages(&state.rooms, me, &mut known).await {
                            if matches!(msg, ServerMessage::RoomClosed) {
                                events = None;
                            }
                            let _ = send_server(&tx, &msg).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events = None;
                    }
                }
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let Ok(msg) = msg else { break; };

                let now = Instant::now();
                if now.duration_since(message_window_start) >= Duration::from_secs(60) {
                    message_window_start = now;
                    message_count = 0;
                }
                message_count = message_count.saturating_add(1);
                if message_count > WS_MAX_MESSAGES_PER_MINUTE {
                    let _ = send_error(&tx, "Rate limit exceeded").await;
                    break;
                }

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        let _ = send_error(&tx, "Binary messages are not supported").await;
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                if text.len() > WS_MAX_TEXT_BYTES {
                    let _ = send_error(&tx, "Message too large").await;
                    break;
                }

                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("invalid JSON from {}: {}", ip, err);
                        let _ = send_error(&tx, "Invalid JSON").await;
                        break;
                    }
                };

                if let ClientMessage::Join {
                    access_code,
                    display_name,
                    user_agent,
                    customer_id,
                    customer_name,
                    role,
                } = client_msg
                {
                    if member.is_some() {
                        let _ = send_error(&tx, "Already joined").await;
                        continue;
                    }
                    if !security::allow_ws_join_request(&format!("join:{}", ip)) {
                        let _ = send_error(&tx, "Join rate limit exceeded").await;
                        break;
                    }
                    let request = JoinRequest {
                        access_code,
                        display_name,
                        user_agent,
                        customer_id,
                        customer_name,
                        role,
                    };
                    match rooms::join_room(&state, request, now_ms()).await {
                        Ok(joined) => {
                            let me = joined.member;
                            state.connections.write().await.insert(me.participant_id.clone());
                            let _ = send_server(
                                &tx,
                                &ServerMessage::Joined {
                                    participant_id: me.participant_id.clone(),
                                    session_id: me.session_id.clone(),
                                    is_host: me.is_host,
                                    host_id: me.host_id.clone(),
                                    start_time: me.start_time,
                                },
                            )
                            .await;
                            for user in joined.others {
                                known.insert(user.participant_id.clone());
                                let _ = send_server(&tx, &ServerMessage::UserAdded { user }).await;
                            }
                            for message in joined.chat {
                                let _ = send_server(&tx, &ServerMessage::Chat { message }).await;
                            }
                            events = Some(joined.events);
                            member = Some(me);
                        }
                        Err(err) => {
                            let _ = send_error(&tx, client_error_message(&err)).await;
                        }
                    }
                    continue;
                }

                let Some(me) = &member else {
                    let _ = send_error(&tx, "Join required before signaling").await;
                    break;
                };

                match client_msg {
                    ClientMessage::Join { .. } => {}
                    ClientMessage::Signal { to, sdp, candidate } => {
                        if let Err(reason) = validate_signal(&to, sdp.as_ref(), candidate.as_ref()) {
                            let _ = send_error(&tx, reason).await;
                            continue;
                        }
                        if let Err(err) = state
                            .rooms
                            .push_signal(&me.access_code, &me.participant_id, &to, sdp, candidate, now_ms())
                            .await
                        {
                            let _ = send_error(&tx, client_error_message(&err)).await;
                        }
                    }
                    ClientMessage::Consume { message_id } => {
                        state
                            .rooms
                            .consume_signal(&me.access_code, &me.participant_id, &message_id)
                            .await;
                    }
                    ClientMessage::Chat { text } => {
                        if let Err(err) = rooms::post_chat(&state, me, &text, now_ms()).await {
                            let _ = send_error(&tx, client_error_message(&err)).await;
                        }
                    }
                    ClientMessage::Participants { count } => {
                        rooms::report_participants(&state, me, count, now_ms()).await;
                    }
                    ClientMessage::Heartbeat => {
                        rooms::heartbeat(&state, me, now_ms()).await;
                    }
                    ClientMessage::End { reason } => {
                        let (status, duration_ms) = rooms::end_call(&state, me, reason, now_ms()).await;
                        ended = true;
                        let _ = send_server(&tx, &ServerMessage::Ended { status, duration_ms }).await;
                        let _ = tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    if let Some(me) = member {
        if !ended {
            info!("participant {} disconnected without ending", me.participant_id);
            rooms::leave(&state, &me, now_ms()).await;
        }
        state.connections.write().await.remove(&me.participant_id);
    }
    ACTIVE_WS_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    release_ip_slot(ip);
}
