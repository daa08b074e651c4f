//! End-to-end tests driving the assembled router over a real loopback
//! socket: HTTP via `tower::ServiceExt::oneshot`, WebSocket via
//! `tokio-tungstenite` against a locally bound listener. Exercises the
//! scenarios the unit tests below each module can't reach on their own —
//! role gating across a live socket, chat fan-out including the sender,
//! and presence cleanup on disconnect.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use acton_service::auth::login::{Identity, TokenVerifier, UserDirectory};
use acton_service::config::{CollabConfig, Config};
use acton_service::persistence::PersistenceGateway;
use acton_service::role::Role;
use acton_service::state::{AppState, CollabHandles};
use acton_service::websocket::RoomRegistryHandle;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;

const TEST_SECRET: &str = "e2e-test-secret";

fn test_state() -> AppState<CollabConfig> {
    let config = Config::<CollabConfig>::default();
    let persistence = Arc::new(PersistenceGateway::disabled());
    let registry = RoomRegistryHandle::new(persistence.clone());
    let verifier = TokenVerifier::new(Arc::from(TEST_SECRET));
    let collab = CollabHandles {
        registry,
        persistence,
        verifier,
        users: Arc::new(UserDirectory::new()),
        shutting_down: Arc::new(AtomicBool::new(false)),
        allowed_origins: Arc::new(Vec::new()),
    };
    AppState::new(config).with_collab(collab)
}

fn token_for(state: &AppState<CollabConfig>, user_id: &str, username: &str, role: Role) -> String {
    state
        .collab()
        .verifier
        .issue(&Identity {
            user_id: user_id.to_string(),
            username: username.to_string(),
            role,
        })
        .unwrap()
}

/// Binds the router to an ephemeral loopback port and serves it on a
/// background task, returning the address clients should connect to.
async fn spawn_router(state: AppState<CollabConfig>) -> SocketAddr {
    let app = acton_service::router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(
    addr: SocketAddr,
    token: &str,
    room: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let url = format!("ws://{addr}/?token={token}&room={room}");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

fn sync_frame(update: &[u8]) -> tokio_tungstenite::tungstenite::Message {
    let mut buf = Vec::with_capacity(update.len() + 1);
    buf.push(0u8);
    buf.extend_from_slice(update);
    tokio_tungstenite::tungstenite::Message::Binary(buf.into())
}

fn text_edit_update(text: &str) -> Vec<u8> {
    use yrs::updates::encoder::Encode;
    use yrs::{Doc, StateVector, Text, Transact};

    let doc = Doc::new();
    let container = doc.get_or_insert_text("scratch");
    {
        let mut txn = doc.transact_mut();
        container.push(&mut txn, text);
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// E2E scenario 1: health check, then login returns a usable token.
#[tokio::test]
async fn health_then_login() {
    let state = test_state();
    let app = acton_service::router(state);

    let health = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let login = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(json!({"username": "alice"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(login.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(login.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["token"].as_str().is_some());
    assert_eq!(body["user"]["role"], "admin");
}

/// E2E scenario 2: a chat message broadcasts to every socket in the room,
/// including the sender.
#[tokio::test]
async fn chat_broadcasts_to_sender_and_others() {
    let state = test_state();
    let token_a = token_for(&state, "user:a", "alice", Role::Editor);
    let token_b = token_for(&state, "user:b", "bob", Role::Editor);
    let addr = spawn_router(state).await;

    let mut a = connect(addr, &token_a, "room-chat").await;
    let mut b = connect(addr, &token_b, "room-chat").await;

    // Drain each socket's welcome/sync/awareness frames.
    for _ in 0..2 {
        a.next().await.unwrap().unwrap();
        b.next().await.unwrap().unwrap();
    }

    a.send(tokio_tungstenite::tungstenite::Message::Text(
        json!({"type": "chat", "text": "hello room"}).to_string().into(),
    ))
    .await
    .unwrap();

    for socket in [&mut a, &mut b] {
        let msg = socket.next().await.unwrap().unwrap();
        let text = msg.into_text().unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "chat");
        assert_eq!(parsed["text"], "hello room");
        assert_eq!(parsed["username"], "alice");
    }
}

/// E2E scenario 3: a viewer's sync update is rejected with an error frame
/// and never applied; an editor's update is accepted and rebroadcast to
/// the other socket (excluding the sender).
#[tokio::test]
async fn viewer_blocked_editor_accepted() {
    let state = test_state();
    let viewer_token = token_for(&state, "user:v", "viewer-vic", Role::Viewer);
    let editor_token = token_for(&state, "user:e", "editor-eve", Role::Editor);
    let addr = spawn_router(state).await;

    let mut viewer = connect(addr, &viewer_token, "room-edit").await;
    let mut editor = connect(addr, &editor_token, "room-edit").await;
    for _ in 0..2 {
        viewer.next().await.unwrap().unwrap();
        editor.next().await.unwrap().unwrap();
    }

    let update = text_edit_update("blocked");
    viewer.send(sync_frame(&update)).await.unwrap();
    let response = viewer.next().await.unwrap().unwrap();
    let parsed: Value = serde_json::from_str(&response.into_text().unwrap()).unwrap();
    assert_eq!(parsed["type"], "error");

    let update = text_edit_update("accepted");
    editor.send(sync_frame(&update)).await.unwrap();
    let rebroadcast = viewer.next().await.unwrap().unwrap();
    assert!(rebroadcast.is_binary());
    assert_eq!(rebroadcast.into_data()[0], 0u8);
}

/// Admin-only permission change: a viewer is rejected with 403, an admin's
/// call succeeds and is observable via the room's effective-role lookup.
#[tokio::test]
async fn admin_only_permission_change() {
    let state = test_state();
    let admin_token = token_for(&state, "user:admin", "root", Role::Admin);
    let viewer_token = token_for(&state, "user:v2", "viewer-vic", Role::Viewer);
    let app = acton_service::router(state);

    let forbidden = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/projects/room-perms/permissions")
                .header("authorization", format!("Bearer {viewer_token}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"userId": "user:target", "role": "editor"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let ok = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/projects/room-perms/permissions")
                .header("authorization", format!("Bearer {admin_token}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"userId": "user:target", "role": "editor"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
}

/// Admin-only suggestion approval: an editor is rejected, an admin's call
/// on an unknown suggestion id surfaces 404 rather than 403 once the role
/// check passes.
#[tokio::test]
async fn admin_only_suggestion_approval() {
    let state = test_state();
    let editor_token = token_for(&state, "user:e2", "editor-eve", Role::Editor);
    let admin_token = token_for(&state, "user:admin2", "root", Role::Admin);
    let app = acton_service::router(state);

    let forbidden = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/projects/room-sugg/suggestions/s1/approve")
                .header("authorization", format!("Bearer {editor_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let not_found = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/projects/room-sugg/suggestions/s1/approve")
                .header("authorization", format!("Bearer {admin_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
}

/// Presence cleanup: once every socket in a room disconnects, the room
/// tears itself down; a fresh connection to the same room id gets a clean
/// (empty) awareness snapshot rather than stale entries.
#[tokio::test]
async fn presence_cleans_up_after_last_disconnect() {
    let state = test_state();
    let token = token_for(&state, "user:p", "presence-pat", Role::Editor);
    let addr = spawn_router(state).await;

    {
        let mut conn = connect(addr, &token, "room-presence").await;
        conn.next().await.unwrap().unwrap(); // welcome
        conn.next().await.unwrap().unwrap(); // sync
        conn.close(None).await.unwrap();
    }

    // Give the server a moment to process the disconnect and tear the room
    // down before reconnecting.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut conn = connect(addr, &token, "room-presence").await;
    conn.next().await.unwrap().unwrap(); // welcome
    let sync = conn.next().await.unwrap().unwrap();
    assert!(sync.is_binary());
    // No awareness frame should follow for a room with no prior presence.
    let next = tokio::time::timeout(std::time::Duration::from_millis(200), conn.next()).await;
    assert!(next.is_err(), "expected no further frames, presence snapshot should be empty");
}

/// A missing `token` or `room` query parameter must still complete the
/// WebSocket handshake (not a pre-upgrade HTTP 400 from the `Query`
/// extractor) and close with code 1008, per spec.md's accept sequence.
#[tokio::test]
async fn missing_query_params_complete_handshake_then_close_1008() {
    let state = test_state();
    let addr = spawn_router(state).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/?room=room-x"))
        .await
        .expect("handshake should complete even without a token");
    let close = ws.next().await.unwrap().unwrap();
    let tokio_tungstenite::tungstenite::Message::Close(Some(frame)) = close else {
        panic!("expected a close frame, got {close:?}");
    };
    assert_eq!(u16::from(frame.code), 1008);

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/?token=anything"))
        .await
        .expect("handshake should complete even without a room id");
    let close = ws.next().await.unwrap().unwrap();
    let tokio_tungstenite::tungstenite::Message::Close(Some(frame)) = close else {
        panic!("expected a close frame, got {close:?}");
    };
    assert_eq!(u16::from(frame.code), 1008);
}

/// E2E scenario 6: two sockets join a room; A publishes presence for
/// client-id 7, then disconnects. B receives A's awareness update, then a
/// second awareness frame on disconnect whose decoded removed-set contains
/// client-id 7.
#[tokio::test]
async fn presence_removal_is_broadcast_to_the_remaining_peer() {
    use acton_service::crdt::presence::{decode, encode, PresenceChange};

    let state = test_state();
    let token_a = token_for(&state, "user:pa", "presence-a", Role::Editor);
    let token_b = token_for(&state, "user:pb", "presence-b", Role::Editor);
    let addr = spawn_router(state).await;

    let mut a = connect(addr, &token_a, "room-presence-pair").await;
    let mut b = connect(addr, &token_b, "room-presence-pair").await;
    for _ in 0..2 {
        a.next().await.unwrap().unwrap();
        b.next().await.unwrap().unwrap();
    }

    let awareness_update = encode(&[PresenceChange {
        client_id: 7,
        clock: 1,
        state: b"cursor:1".to_vec(),
    }]);
    let mut frame = vec![1u8];
    frame.extend_from_slice(&awareness_update);
    a.send(tokio_tungstenite::tungstenite::Message::Binary(frame.into()))
        .await
        .unwrap();

    let published = b.next().await.unwrap().unwrap();
    assert!(published.is_binary());
    let data = published.into_data();
    assert_eq!(data[0], 1u8);
    let changes = decode(&data[1..]).unwrap();
    assert_eq!(changes, vec![PresenceChange {
        client_id: 7,
        clock: 1,
        state: b"cursor:1".to_vec(),
    }]);

    a.close(None).await.unwrap();

    let removal = b.next().await.unwrap().unwrap();
    assert!(removal.is_binary());
    let data = removal.into_data();
    assert_eq!(data[0], 1u8);
    let removed = decode(&data[1..]).unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].client_id, 7);
    assert!(removed[0].state.is_empty());
}
