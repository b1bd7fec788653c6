//! End-to-end tests of the event-stream transport against a local axum
//! server that speaks the engine's progress protocol.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use reelctl_core::auth::signing::sign_token;
use reelctl_core::auth::{AuthConfig, Authenticator};
use reelctl_progress::{
    ChannelConfig, ChannelEvent, ConnectionState, EventStreamTransport, ProgressChannel,
    ProgressUpdate,
};
use tokio::sync::broadcast;

const SECRET: &str = "test-secret";

#[derive(Default)]
struct EngineState {
    /// Reject this many stream requests with 401 before serving.
    reject_first: usize,
    stream_queries: Mutex<Vec<HashMap<String, String>>>,
    heartbeat_auth: Mutex<Vec<String>>,
}

async fn progress_stream(
    State(state): State<Arc<EngineState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let seen = {
        let mut queries = state.stream_queries.lock().unwrap();
        queries.push(query);
        queries.len()
    };
    if seen <= state.reject_first {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let events = futures::stream::iter(vec![
        Ok::<_, Infallible>(Event::default().event("heartbeat").data("{}")),
        Ok(Event::default().data("{broken")),
        Ok(Event::default().data(
            r#"{"fps":23.9,"frame":10,"totalFrames":240,"eta":9.6,"status":"Upscaling"}"#,
        )),
    ])
    .chain(futures::stream::pending());

    Sse::new(events).into_response()
}

async fn heartbeat(State(state): State<Arc<EngineState>>, headers: HeaderMap) -> StatusCode {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.heartbeat_auth.lock().unwrap().push(auth);
    StatusCode::NO_CONTENT
}

async fn start_engine(state: Arc<EngineState>) -> u16 {
    let app = Router::new()
        .route("/progress/stream", get(progress_stream))
        .route("/heartbeat", post(heartbeat))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn authenticator() -> Arc<Authenticator> {
    Arc::new(Authenticator::new(AuthConfig {
        secret: Some(SECRET.to_string()),
        ..AuthConfig::default()
    }))
}

fn channel_config() -> ChannelConfig {
    ChannelConfig {
        reconnect_base: Duration::from_millis(50),
        max_attempts: 3,
        idle_timeout: Duration::from_secs(10),
        heartbeat_interval: Duration::from_millis(200),
        ..ChannelConfig::default()
    }
}

async fn next_progress(rx: &mut broadcast::Receiver<ChannelEvent>) -> ProgressUpdate {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ChannelEvent::Progress(update) = rx.recv().await.unwrap() {
                return update;
            }
        }
    })
    .await
    .expect("no progress event within 5s")
}

#[tokio::test]
async fn delivers_progress_over_signed_stream() {
    let state = Arc::new(EngineState::default());
    let port = start_engine(state.clone()).await;
    let auth = authenticator();

    let channel = ProgressChannel::spawn_with_transport(
        channel_config(),
        auth.clone(),
        Arc::new(EventStreamTransport::new()),
    );
    let mut rx = channel.subscribe();
    channel.connect_to(port).unwrap();

    let update = next_progress(&mut rx).await;
    assert_eq!(update.frame, 10);
    assert_eq!(update.total_frames, 240);
    assert_eq!(update.status.as_deref(), Some("Upscaling"));
    assert_eq!(channel.state(), ConnectionState::Connected);

    let query = state.stream_queries.lock().unwrap()[0].clone();
    let token = &query["auth"];
    let ts: i64 = query["ts"].parse().unwrap();
    assert!(auth.validate_token(token));
    assert_eq!(query["sig"], sign_token(SECRET, token, ts));

    channel.shutdown().await;
}

#[tokio::test]
async fn unauthorized_stream_rotates_token_and_recovers() {
    let state = Arc::new(EngineState {
        reject_first: 1,
        ..EngineState::default()
    });
    let port = start_engine(state.clone()).await;
    let auth = authenticator();

    let channel = ProgressChannel::spawn_with_transport(
        channel_config(),
        auth.clone(),
        Arc::new(EventStreamTransport::new()),
    );
    let mut rx = channel.subscribe();
    channel.connect_to(port).unwrap();

    let update = next_progress(&mut rx).await;
    assert_eq!(update.frame, 10);

    let queries = state.stream_queries.lock().unwrap().clone();
    assert_eq!(queries.len(), 2);
    assert_ne!(queries[0]["auth"], queries[1]["auth"]);
    assert!(!auth.validate_token(&queries[0]["auth"]));
    assert!(auth.validate_token(&queries[1]["auth"]));

    channel.shutdown().await;
}

#[tokio::test]
async fn heartbeats_carry_bearer_token() {
    let state = Arc::new(EngineState::default());
    let port = start_engine(state.clone()).await;
    let auth = authenticator();

    let channel = ProgressChannel::spawn_with_transport(
        channel_config(),
        auth.clone(),
        Arc::new(EventStreamTransport::new()),
    );
    channel.connect_to(port).unwrap();

    let header = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(h) = state.heartbeat_auth.lock().unwrap().first().cloned() {
                return h;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no heartbeat within 5s");

    let token = header.strip_prefix("Bearer ").unwrap();
    assert!(auth.validate_token(token));

    channel.shutdown().await;
}

#[tokio::test]
async fn unreachable_engine_ends_in_connection_failed() {
    // Bind then drop to get a port nothing listens on.
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let channel = ProgressChannel::spawn_with_transport(
        ChannelConfig {
            max_attempts: 2,
            ..channel_config()
        },
        authenticator(),
        Arc::new(EventStreamTransport::new()),
    );
    let mut rx = channel.subscribe();
    channel.connect_to(port).unwrap();

    let attempts = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ChannelEvent::ConnectionFailed { attempts } = rx.recv().await.unwrap() {
                return attempts;
            }
        }
    })
    .await
    .expect("channel never gave up");
    assert_eq!(attempts, 2);

    channel.shutdown().await;
}
