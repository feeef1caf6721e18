//! API request handlers.

use axum::{
    Json,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::chat::{ChatReply, ChatRequest, HistoryAppend, MOCK_REPLY, Message};
use crate::relay::relay_text;

use super::error::{ApiError, ApiResult};
use super::session::SessionCookie;
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Forward a conversation upstream and relay the reply.
///
/// Without a credential this answers with the mock reply as JSON and never
/// touches the network. Otherwise the reply is streamed as plain text, or
/// returned as one JSON reply when streaming is disabled.
#[instrument(skip_all)]
pub async fn relay_chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = body?;
    debug!(messages = request.messages.len(), "relay request");

    if !state.upstream.is_configured() {
        debug!("no upstream credential configured, answering with mock reply");
        return Ok(Json(ChatReply {
            reply: Some(MOCK_REPLY.to_string()),
        })
        .into_response());
    }

    let model = request.model.as_deref();

    if !state.relay.stream {
        let reply = state
            .upstream
            .complete(&request.messages, model, request.temperature)
            .await?;
        return Ok(Json(ChatReply { reply }).into_response());
    }

    let upstream = state
        .upstream
        .open_stream(&request.messages, model, request.temperature)
        .await?;
    let body = Body::from_stream(relay_text(upstream, state.relay.framing));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .map_err(|e| ApiError::internal(format!("building relay response: {e}")))
}

/// Replace the caller's stored conversation.
#[instrument(skip_all, fields(sid = %session.id()))]
pub async fn history_append(
    session: SessionCookie,
    State(state): State<AppState>,
    Json(body): Json<HistoryAppend>,
) -> ApiResult<(SessionCookie, &'static str)> {
    debug!(messages = body.messages.len(), "saving conversation");
    state.history.save(session.id(), &body.messages).await?;
    Ok((session, "ok"))
}

/// Return the caller's stored conversation, or `null`.
#[instrument(skip_all, fields(sid = %session.id()))]
pub async fn history_load(
    session: SessionCookie,
    State(state): State<AppState>,
) -> ApiResult<(SessionCookie, Json<Option<Vec<Message>>>)> {
    let messages = state.history.load(session.id()).await?;
    Ok((session, Json(messages)))
}
