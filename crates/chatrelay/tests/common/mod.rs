//! Test utilities and common setup.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use bytes::Bytes;
use futures::stream;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use chatrelay::api::{self, AppState};
use chatrelay::history::HistoryRepository;
use chatrelay::relay::RelayConfig;
use chatrelay::upstream::{UpstreamClient, UpstreamConfig};

/// Create a test application without an upstream credential (mock replies).
pub async fn test_app() -> Router {
    app_with_upstream(UpstreamConfig::default(), RelayConfig::default()).await
}

/// Create a test application relaying to `endpoint` with a test credential.
pub async fn test_app_with_upstream(endpoint: &str, relay: RelayConfig) -> Router {
    let upstream = UpstreamConfig {
        endpoint: endpoint.to_string(),
        api_key: Some("sk-test".to_string()),
        ..UpstreamConfig::default()
    };
    app_with_upstream(upstream, relay).await
}

async fn app_with_upstream(upstream: UpstreamConfig, relay: RelayConfig) -> Router {
    let history = Arc::new(HistoryRepository::in_memory().await.unwrap());
    let upstream = UpstreamClient::new(&upstream).unwrap();
    api::create_router(AppState::new(upstream, history, relay))
}

/// Serve `app` on an ephemeral local port and return its base URL.
pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// One SSE event carrying a content delta.
pub fn delta_event(content: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({ "choices": [{ "index": 0, "delta": { "content": content } }] })
    )
}

pub const DONE_EVENT: &str = "data: [DONE]\n\n";

/// What the fake provider answers with.
#[derive(Debug, Clone)]
pub enum UpstreamReply {
    /// Event-stream body, one element per body chunk.
    Events(Vec<String>),
    /// Non-streaming completion with this message content.
    Completion(String),
    /// Bare error status.
    Status(StatusCode),
}

#[derive(Clone)]
struct FakeState {
    reply: UpstreamReply,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub authorization: Option<String>,
    pub body: Value,
}

/// A fake OpenAI-compatible provider running on a local port.
pub struct FakeUpstream {
    pub endpoint: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl FakeUpstream {
    pub async fn spawn(reply: UpstreamReply) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = FakeState {
            reply,
            requests: requests.clone(),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(fake_completions))
            .with_state(state);
        let base = serve(app).await;
        Self {
            endpoint: format!("{base}/v1/chat/completions"),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn fake_completions(
    State(state): State<FakeState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state
        .requests
        .lock()
        .unwrap()
        .push(RecordedRequest {
            authorization,
            body,
        });

    match state.reply {
        UpstreamReply::Events(events) => {
            let chunks = events
                .into_iter()
                .map(|event| Ok::<_, std::io::Error>(Bytes::from(event)));
            Response::builder()
                .header(header::CONTENT_TYPE, "text/event-stream")
                .body(Body::from_stream(stream::iter(chunks)))
                .unwrap()
        }
        UpstreamReply::Completion(content) => Json(json!({
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
        }))
        .into_response(),
        UpstreamReply::Status(status) => (status, "provider exploded").into_response(),
    }
}
