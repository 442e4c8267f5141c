//! End-to-end tests for the signaling socket.
//!
//! Each test starts the gateway on an ephemeral port with an in-memory
//! database and drives it with real WebSocket clients.

use std::net::SocketAddr;
use std::time::Duration;

use booth_common::{ClientMessage, EndReason, Role, ServerMessage, SessionDescription, SessionStatus};
use booth_gateway::{db, router, AppState, GatewayConfig};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_gateway() -> SocketAddr {
    let pool = db::connect("sqlite::memory:", 1)
        .await
        .expect("failed to open test database");
    let state = AppState::new(pool, GatewayConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().expect("listener has no address");
    tokio::spawn(async move {
        axum::serve(
            listener,
            router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("gateway crashed");
    });
    addr
}

async fn connect(addr: SocketAddr) -> Socket {
    let (ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket connect failed");
    ws
}

async fn send(ws: &mut Socket, msg: &ClientMessage) {
    let text = serde_json::to_string(msg).expect("serialize client message");
    ws.send(Message::Text(text)).await.expect("send failed");
}

async fn recv(ws: &mut Socket) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("invalid server message");
        }
    }
}

fn join_msg(code: &str, name: &str) -> ClientMessage {
    ClientMessage::Join {
        access_code: code.to_string(),
        display_name: name.to_string(),
        user_agent: "integration-test".to_string(),
        customer_id: None,
        customer_name: None,
        role: Role::Customer,
    }
}

/// Join and return `(participant_id, is_host, host_id)`.
async fn join(ws: &mut Socket, code: &str, name: &str) -> (String, bool, String) {
    send(ws, &join_msg(code, name)).await;
    match recv(ws).await {
        ServerMessage::Joined {
            participant_id,
            is_host,
            host_id,
            ..
        } => (participant_id, is_host, host_id),
        other => panic!("expected JOINED, got {other:?}"),
    }
}

#[tokio::test]
async fn test_host_and_guest_exchange_offer_then_host_closes_room() {
    let addr = spawn_gateway().await;
    let mut host = connect(addr).await;
    let mut guest = connect(addr).await;

    let (host_id, host_is_host, _) = join(&mut host, "DEMO01", "Ada").await;
    assert!(host_is_host);

    let (guest_id, guest_is_host, seen_host) = join(&mut guest, "demo01", "Bob").await;
    assert!(!guest_is_host);
    assert_eq!(seen_host, host_id);

    match recv(&mut guest).await {
        ServerMessage::UserAdded { user } => assert_eq!(user.participant_id, host_id),
        other => panic!("expected USER_ADDED for host, got {other:?}"),
    }
    match recv(&mut host).await {
        ServerMessage::UserAdded { user } => {
            assert_eq!(user.participant_id, guest_id);
            assert_eq!(user.display_name, "Bob");
        }
        other => panic!("expected USER_ADDED for guest, got {other:?}"),
    }

    send(
        &mut guest,
        &ClientMessage::Signal {
            to: host_id.clone(),
            sdp: Some(SessionDescription::offer("v=0\r\n")),
            candidate: None,
        },
    )
    .await;
    let message_id = match recv(&mut host).await {
        ServerMessage::Signal { message } => {
            assert_eq!(message.from, guest_id);
            assert_eq!(message.sdp, Some(SessionDescription::offer("v=0\r\n")));
            message.message_id
        }
        other => panic!("expected SIGNAL, got {other:?}"),
    };
    send(&mut host, &ClientMessage::Consume { message_id }).await;

    send(
        &mut host,
        &ClientMessage::End {
            reason: EndReason::Hangup,
        },
    )
    .await;
    match recv(&mut host).await {
        ServerMessage::Ended { status, .. } => assert_eq!(status, SessionStatus::Ended),
        other => panic!("expected ENDED, got {other:?}"),
    }
    assert_eq!(recv(&mut guest).await, ServerMessage::RoomClosed);

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/sessions/{host_id}"))
        .await
        .expect("session request failed")
        .json()
        .await
        .expect("session body");
    assert_eq!(body["session"]["status"], "ended");
    assert_eq!(body["session"]["accessCode"], "DEMO01");
}

#[tokio::test]
async fn test_guest_leaving_keeps_room_and_host() {
    let addr = spawn_gateway().await;
    let mut host = connect(addr).await;
    let mut guest = connect(addr).await;

    let (host_id, _, _) = join(&mut host, "TEST01", "Ada").await;
    let (guest_id, _, _) = join(&mut guest, "TEST01", "Bob").await;
    let _ = recv(&mut host).await; // USER_ADDED for the guest

    send(
        &mut guest,
        &ClientMessage::End {
            reason: EndReason::Hangup,
        },
    )
    .await;
    match recv(&mut host).await {
        ServerMessage::UserRemoved { participant_id } => assert_eq!(participant_id, guest_id),
        other => panic!("expected USER_REMOVED, got {other:?}"),
    }

    let mut late = connect(addr).await;
    let (_, late_is_host, late_host) = join(&mut late, "TEST01", "Cy").await;
    assert!(!late_is_host);
    assert_eq!(late_host, host_id);
}

#[tokio::test]
async fn test_invalid_code_keeps_socket_open_for_retry() {
    let addr = spawn_gateway().await;
    let mut ws = connect(addr).await;

    send(&mut ws, &join_msg("AB-12", "Ada")).await;
    match recv(&mut ws).await {
        ServerMessage::Error { message } => assert!(message.contains("6 characters")),
        other => panic!("expected ERROR, got {other:?}"),
    }

    send(&mut ws, &join_msg("NOPE99", "Ada")).await;
    match recv(&mut ws).await {
        ServerMessage::Error { message } => assert_eq!(message, "Invalid access code"),
        other => panic!("expected ERROR, got {other:?}"),
    }

    let (_, is_host, _) = join(&mut ws, "BANK01", "Ada").await;
    assert!(is_host);
}

#[tokio::test]
async fn test_signal_before_join_is_rejected() {
    let addr = spawn_gateway().await;
    let mut ws = connect(addr).await;

    send(
        &mut ws,
        &ClientMessage::Signal {
            to: "someone".into(),
            sdp: Some(SessionDescription::offer("v=0")),
            candidate: None,
        },
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::Error { message } => assert_eq!(message, "Join required before signaling"),
        other => panic!("expected ERROR, got {other:?}"),
    }
}

#[tokio::test]
async fn test_chat_reaches_everyone_and_late_joiners() {
    let addr = spawn_gateway().await;
    let mut host = connect(addr).await;
    let (_, _, _) = join(&mut host, "DEMO01", "Agent Smith").await;

    send(
        &mut host,
        &ClientMessage::Chat {
            text: "Welcome!".into(),
        },
    )
    .await;
    let sent = match recv(&mut host).await {
        ServerMessage::Chat { message } => message,
        other => panic!("expected CHAT echo, got {other:?}"),
    };
    assert_eq!(sent.text, "Welcome!");
    assert_eq!(sent.sender, "Agent Smith");

    let mut guest = connect(addr).await;
    let _ = join(&mut guest, "DEMO01", "Bob").await;
    let _ = recv(&mut guest).await; // USER_ADDED for the host
    match recv(&mut guest).await {
        ServerMessage::Chat { message } => assert_eq!(message, sent),
        other => panic!("expected CHAT history, got {other:?}"),
    }
}

#[tokio::test]
async fn test_health_counts_joined_participants() {
    let addr = spawn_gateway().await;
    let health = move || async move {
        reqwest::get(format!("http://{addr}/health"))
            .await
            .expect("health request failed")
            .json::<serde_json::Value>()
            .await
            .expect("invalid health body")
    };

    let mut idle = connect(addr).await;
    let mut joined = connect(addr).await;
    let _ = join(&mut joined, "DEMO01", "Ada").await;

    let body = health().await;
    assert_eq!(body["joined_participants"], 1);
    assert_eq!(body["active_rooms"], 1);

    send(&mut idle, &join_msg("DEMO01", "Bob")).await;
    assert!(matches!(recv(&mut idle).await, ServerMessage::Joined { .. }));
    assert_eq!(health().await["joined_participants"], 2);
}
