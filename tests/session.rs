// tests/session.rs
//
// End-to-end session tests against an in-process websocket server. Each test
// scripts its own server side and observes the session through the state
// watch channel and callbacks.

mod common;

use futures_util::{SinkExt, StreamExt};
use pushstream_connector_rs::auth::Credential;
use pushstream_connector_rs::types::SubscriptionIdentity;
use pushstream_connector_rs::websocket::{
    DisconnectReason, EmptyTokenPolicy, Policy, Session, SessionConfig, SessionState,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::WebSocketStream;
use url::Url;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

/// A session config with short delays so reconnect tests run fast.
fn fast_config(endpoint: Url) -> SessionConfig {
    let mut config = SessionConfig::new(
        endpoint,
        SubscriptionIdentity::Name("it_sub".to_string()),
    );
    config.backoff = Policy {
        rate_limit_delay: Duration::from_millis(200),
        transport_retry_delay: Duration::from_millis(100),
    };
    config.keepalive_interval = Duration::from_millis(100);
    config.keepalive_timeout = Duration::from_secs(1);
    config
}

fn handshake_json(token: Uuid, reconnected: bool) -> String {
    json!({
        "channel": "system",
        "uuid": Uuid::new_v4(),
        "cmd": "init",
        "subscriber_id": Uuid::new_v4(),
        "reconnect_token": token,
        "subscription": { "id": Uuid::new_v4(), "filters": [{ "channel": "match" }] },
        "reconnected": reconnected,
    })
    .to_string()
}

fn event_json(channel: &str) -> String {
    json!({
        "channel": channel,
        "uuid": Uuid::new_v4(),
        "created_timestamp": chrono::Utc::now().timestamp_millis(),
        "payload": { "sequence": 1 },
    })
    .to_string()
}

async fn bind_server() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let endpoint = Url::parse(&format!("ws://{}/v0", addr)).unwrap();
    (listener, endpoint)
}

/// Accepts one upgrade and reports the request URI (path + query) the client
/// connected with.
async fn accept_ws(listener: &TcpListener) -> (WebSocketStream<TcpStream>, String) {
    let (stream, _) = listener.accept().await.unwrap();
    let (uri_tx, uri_rx) = tokio::sync::oneshot::channel();
    let ws = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
        let _ = uri_tx.send(req.uri().to_string());
        Ok(resp)
    })
    .await
    .unwrap();
    (ws, uri_rx.await.unwrap())
}

async fn wait_for_state(rx: &mut watch::Receiver<SessionState>, want: SessionState) {
    timeout(WAIT, async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {}", want));
}

fn noop_event_handler() -> Arc<dyn Fn(pushstream_connector_rs::types::PushEvent) + Send + Sync> {
    Arc::new(|_event| {})
}

#[tokio::test]
async fn fatal_close_terminates_exactly_once_without_retry() {
    common::setup();
    let (listener, endpoint) = bind_server().await;
    let t1 = Uuid::new_v4();

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        loop {
            let (mut ws, uri) = accept_ws(&listener).await;
            let _ = conn_tx.send(uri);
            ws.send(Message::Text(handshake_json(t1, false)))
                .await
                .unwrap();
            // Wait for a keepalive ping, proving the liveness loop runs
            // against the current handle, then close with an app code.
            loop {
                match ws.next().await {
                    Some(Ok(Message::Ping(_))) => break,
                    Some(Ok(_)) => continue,
                    _ => return,
                }
            }
            ws.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Library(4007),
                reason: "unknown subscription".into(),
            })))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        }
    });

    let (term_tx, mut term_rx) = mpsc::unbounded_channel::<DisconnectReason>();
    let session = Session::start(
        fast_config(endpoint),
        Credential::Secret("s3cret".to_string()),
        noop_event_handler(),
        Arc::new(move |reason| {
            let _ = term_tx.send(reason);
        }),
    )
    .unwrap();

    let mut states = session.state_updates();
    wait_for_state(&mut states, SessionState::Active).await;

    // First connect carries the identity but no reconnect token.
    let uri = timeout(WAIT, conn_rx.recv()).await.unwrap().unwrap();
    assert!(uri.contains("subscription_id=it_sub"));
    assert!(!uri.contains("reconnect_token"));

    // Handshake token was stored.
    assert_eq!(session.reconnect_token().await, Some(t1));

    let reason = timeout(WAIT, term_rx.recv()).await.unwrap().unwrap();
    assert_eq!(reason, DisconnectReason::UnknownSubscription);
    wait_for_state(&mut states, SessionState::Terminated).await;
    assert_eq!(session.last_failure().await, Some(reason));

    // Terminated is absorbing: no further connection attempts, no second
    // termination callback.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(conn_rx.try_recv().is_err());
    assert!(term_rx.try_recv().is_err());
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn abrupt_socket_drop_reconnects_with_stored_token() {
    common::setup();
    let (listener, endpoint) = bind_server().await;
    let t1 = Uuid::new_v4();
    let t2 = Uuid::new_v4();

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        // First connection: handshake, one event, then drop the socket with
        // no close frame at all.
        let (mut ws, uri) = accept_ws(&listener).await;
        let _ = conn_tx.send(uri);
        ws.send(Message::Text(handshake_json(t1, false)))
            .await
            .unwrap();
        ws.send(Message::Text(event_json("match"))).await.unwrap();
        drop(ws);

        // Second connection: the client must come back carrying t1.
        let (mut ws, uri) = accept_ws(&listener).await;
        let _ = conn_tx.send(uri);
        ws.send(Message::Text(handshake_json(t2, true)))
            .await
            .unwrap();
        ws.send(Message::Text(event_json("series"))).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();
    let session = Session::start(
        fast_config(endpoint),
        Credential::Secret("s3cret".to_string()),
        Arc::new(move |event| {
            let _ = event_tx.send(event.channel);
        }),
        Arc::new(|reason| panic!("unexpected termination: {}", reason)),
    )
    .unwrap();

    let first_uri = timeout(WAIT, conn_rx.recv()).await.unwrap().unwrap();
    assert!(!first_uri.contains("reconnect_token"));

    let first_event = timeout(WAIT, event_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first_event, "match");

    let second_uri = timeout(WAIT, conn_rx.recv()).await.unwrap().unwrap();
    assert!(second_uri.contains(&format!("reconnect_token={}", t1)));

    // Events keep flowing on the replacement connection, and the restored
    // handshake is visible.
    let second_event = timeout(WAIT, event_rx.recv()).await.unwrap().unwrap();
    assert_eq!(second_event, "series");
    let handshake = session.last_handshake().await.unwrap();
    assert!(handshake.reconnected);
    assert_eq!(session.reconnect_token().await, Some(t2));
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.last_failure().await, None);

    session.stop().await;
}

#[tokio::test]
async fn rejected_reconnect_token_is_dropped_before_next_attempt() {
    common::setup();
    let (listener, endpoint) = bind_server().await;
    let stale = Uuid::new_v4();
    let fresh = Uuid::new_v4();

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        // Reject the stale token before any handshake.
        let (mut ws, uri) = accept_ws(&listener).await;
        let _ = conn_tx.send(uri);
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Library(4008),
            reason: "invalid reconnect token".into(),
        })))
        .await
        .unwrap();
        while ws.next().await.is_some() {}

        // The retry must not repeat the rejected token.
        let (mut ws, uri) = accept_ws(&listener).await;
        let _ = conn_tx.send(uri);
        ws.send(Message::Text(handshake_json(fresh, false)))
            .await
            .unwrap();
        while ws.next().await.is_some() {}
    });

    let mut config = fast_config(endpoint);
    config.reconnect_token = Some(stale);
    let session = Session::start(
        config,
        Credential::Secret("s3cret".to_string()),
        noop_event_handler(),
        Arc::new(|reason| panic!("unexpected termination: {}", reason)),
    )
    .unwrap();

    let first_uri = timeout(WAIT, conn_rx.recv()).await.unwrap().unwrap();
    assert!(first_uri.contains(&format!("reconnect_token={}", stale)));

    let second_uri = timeout(WAIT, conn_rx.recv()).await.unwrap().unwrap();
    assert!(!second_uri.contains("reconnect_token"));

    let mut states = session.state_updates();
    wait_for_state(&mut states, SessionState::Active).await;
    assert_eq!(session.reconnect_token().await, Some(fresh));

    session.stop().await;
}

#[tokio::test]
async fn unauthorized_token_credential_refreshes_and_retries() {
    common::setup();
    let (listener, endpoint) = bind_server().await;
    let t1 = Uuid::new_v4();

    // Token-minting endpoint.
    let mut token_server = mockito::Server::new_async().await;
    let mint = token_server
        .mock("POST", "/oauth/access_token")
        .with_status(200)
        .with_body(r#"{"access_token":"fresh","expires_in":3600,"token_type":"bearer"}"#)
        .create_async()
        .await;
    let token_url = Url::parse(&token_server.url()).unwrap();

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        // First attempt arrives with the stale token; classify it as
        // unauthorized.
        let (mut ws, uri) = accept_ws(&listener).await;
        let _ = conn_tx.send(uri);
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Library(4002),
            reason: "not authorized".into(),
        })))
        .await
        .unwrap();
        while ws.next().await.is_some() {}

        // Second attempt must carry the freshly minted token.
        let (mut ws, uri) = accept_ws(&listener).await;
        let _ = conn_tx.send(uri);
        ws.send(Message::Text(handshake_json(t1, false)))
            .await
            .unwrap();
        while ws.next().await.is_some() {}
    });

    let credential = Credential::Token {
        client_id: "abc".to_string(),
        client_secret: "def".to_string(),
        token_url,
        access_token: Some("stale".to_string()),
    };
    let session = Session::start(
        fast_config(endpoint),
        credential,
        noop_event_handler(),
        Arc::new(|reason| panic!("unexpected termination: {}", reason)),
    )
    .unwrap();

    let first_uri = timeout(WAIT, conn_rx.recv()).await.unwrap().unwrap();
    assert!(first_uri.contains("access_token=stale"));

    let second_uri = timeout(WAIT, conn_rx.recv()).await.unwrap().unwrap();
    assert!(second_uri.contains("access_token=fresh"));

    let mut states = session.state_updates();
    wait_for_state(&mut states, SessionState::Active).await;
    mint.assert_async().await;

    session.stop().await;
}

/// Scripts two connections: the first hands out `token`, then drops the
/// socket; the second answers the reconnect with a nil-token handshake and
/// stays open. Returns the channel reporting each connection's request URI.
fn nil_token_server(listener: TcpListener, token: Uuid) -> mpsc::UnboundedReceiver<String> {
    let (conn_tx, conn_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let (mut ws, uri) = accept_ws(&listener).await;
        let _ = conn_tx.send(uri);
        ws.send(Message::Text(handshake_json(token, false)))
            .await
            .unwrap();
        drop(ws);

        let (mut ws, uri) = accept_ws(&listener).await;
        let _ = conn_tx.send(uri);
        ws.send(Message::Text(handshake_json(Uuid::nil(), true)))
            .await
            .unwrap();
        ws.send(Message::Text(event_json("match"))).await.unwrap();
        while ws.next().await.is_some() {}
    });
    conn_rx
}

#[tokio::test]
async fn nil_handshake_token_clears_the_stored_token_by_default() {
    common::setup();
    let (listener, endpoint) = bind_server().await;
    let t1 = Uuid::new_v4();
    let mut conn_rx = nil_token_server(listener, t1);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();
    let session = Session::start(
        fast_config(endpoint),
        Credential::Secret("s3cret".to_string()),
        Arc::new(move |event| {
            let _ = event_tx.send(event.channel);
        }),
        Arc::new(|reason| panic!("unexpected termination: {}", reason)),
    )
    .unwrap();

    // The reconnect still carries the token from the first handshake.
    let _first_uri = timeout(WAIT, conn_rx.recv()).await.unwrap().unwrap();
    let second_uri = timeout(WAIT, conn_rx.recv()).await.unwrap().unwrap();
    assert!(second_uri.contains(&format!("reconnect_token={}", t1)));

    // Once the nil-token handshake is processed (proven by the event that
    // follows it), the stored token is gone.
    let delivered = timeout(WAIT, event_rx.recv()).await.unwrap().unwrap();
    assert_eq!(delivered, "match");
    assert_eq!(session.reconnect_token().await, None);
    assert_eq!(session.state(), SessionState::Active);

    session.stop().await;
}

#[tokio::test]
async fn retain_policy_keeps_the_token_across_a_nil_handshake() {
    common::setup();
    let (listener, endpoint) = bind_server().await;
    let t1 = Uuid::new_v4();
    let mut conn_rx = nil_token_server(listener, t1);

    let mut config = fast_config(endpoint);
    config.empty_token_policy = EmptyTokenPolicy::Retain;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();
    let session = Session::start(
        config,
        Credential::Secret("s3cret".to_string()),
        Arc::new(move |event| {
            let _ = event_tx.send(event.channel);
        }),
        Arc::new(|reason| panic!("unexpected termination: {}", reason)),
    )
    .unwrap();

    let _first_uri = timeout(WAIT, conn_rx.recv()).await.unwrap().unwrap();
    let _second_uri = timeout(WAIT, conn_rx.recv()).await.unwrap().unwrap();

    let delivered = timeout(WAIT, event_rx.recv()).await.unwrap().unwrap();
    assert_eq!(delivered, "match");
    assert_eq!(session.reconnect_token().await, Some(t1));

    session.stop().await;
}

#[tokio::test]
async fn termination_winds_down_the_keepalive_loop() {
    common::setup();
    let (listener, endpoint) = bind_server().await;

    tokio::spawn(async move {
        let (mut ws, _uri) = accept_ws(&listener).await;
        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Library(4005),
            reason: "missing subscription".into(),
        })))
        .await
        .unwrap();
        while ws.next().await.is_some() {}
    });

    let session = Session::start(
        fast_config(endpoint),
        Credential::Secret("s3cret".to_string()),
        noop_event_handler(),
        Arc::new(|_reason| {}),
    )
    .unwrap();

    let mut states = session.state_updates();
    wait_for_state(&mut states, SessionState::Terminated).await;
    assert_eq!(session.last_failure().await, Some(DisconnectReason::MissingSubscription));
    drop(session);

    // Both background tasks hold the state channel open; it only closes once
    // the keepalive loop has observed Terminated and exited. Many keepalive
    // periods fit in the wait, so a loop that never exits times out here.
    timeout(WAIT, async {
        while states.changed().await.is_ok() {}
    })
    .await
    .expect("keepalive loop kept the session alive after termination");
}

#[tokio::test]
async fn malformed_frames_do_not_stop_delivery() {
    common::setup();
    let (listener, endpoint) = bind_server().await;

    tokio::spawn(async move {
        let (mut ws, _uri) = accept_ws(&listener).await;
        ws.send(Message::Text(handshake_json(Uuid::new_v4(), false)))
            .await
            .unwrap();
        ws.send(Message::Text("this is not json".to_string()))
            .await
            .unwrap();
        ws.send(Message::Text(r#"{"channel":"match"}"#.to_string()))
            .await
            .unwrap();
        ws.send(Message::Text(event_json("match"))).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<String>();
    let session = Session::start(
        fast_config(endpoint),
        Credential::Secret("s3cret".to_string()),
        Arc::new(move |event| {
            let _ = event_tx.send(event.channel);
        }),
        Arc::new(|reason| panic!("unexpected termination: {}", reason)),
    )
    .unwrap();

    // Only the well-formed frame comes through, and the session stays active.
    let delivered = timeout(WAIT, event_rx.recv()).await.unwrap().unwrap();
    assert_eq!(delivered, "match");
    assert!(event_rx.try_recv().is_err());
    assert_eq!(session.state(), SessionState::Active);

    session.stop().await;
}

#[tokio::test]
async fn secret_credential_is_sent_as_header_not_query() {
    common::setup();
    let (listener, endpoint) = bind_server().await;

    let (header_tx, mut header_rx) = mpsc::unbounded_channel::<(String, Option<String>)>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let header_tx = header_tx.clone();
        let mut ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, resp: Response| {
                let secret = req
                    .headers()
                    .get("push-secret")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let _ = header_tx.send((req.uri().to_string(), secret));
                Ok(resp)
            },
        )
        .await
        .unwrap();
        ws.send(Message::Text(handshake_json(Uuid::new_v4(), false)))
            .await
            .unwrap();
        while ws.next().await.is_some() {}
    });

    let session = Session::start(
        fast_config(endpoint),
        Credential::Secret("hush".to_string()),
        noop_event_handler(),
        Arc::new(|reason| panic!("unexpected termination: {}", reason)),
    )
    .unwrap();

    let (uri, secret) = timeout(WAIT, header_rx.recv()).await.unwrap().unwrap();
    assert_eq!(secret.as_deref(), Some("hush"));
    assert!(!uri.contains("access_token"));
    assert!(uri.contains("subscription_id=it_sub"));

    let mut states = session.state_updates();
    wait_for_state(&mut states, SessionState::Active).await;
    session.stop().await;
}
