//! HTTP transport from the chat client to the relay server.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::cache::LocalCache;
use super::tiers::ConversationTier;
use crate::api::{SESSION_COOKIE, cookie_value};
use crate::chat::{ChatReply, ChatRequest, HistoryAppend, Message};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// What the relay answered with.
pub enum RelayResponse {
    /// `application/json` body.
    Json(ChatReply),
    /// Any other content type: raw reply text, chunk by chunk.
    Stream(ByteStream),
}

impl std::fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(reply) => f.debug_tuple("Json").field(reply).finish(),
            Self::Stream(_) => f.debug_tuple("Stream").finish_non_exhaustive(),
        }
    }
}

/// Sends one chat exchange to the relay.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> Result<RelayResponse, TransportError>;
}

/// reqwest-backed client for a relay server.
///
/// Acts like a browser towards the session cookie: sends it when known and
/// adopts any `sid` the server sets.
#[derive(Debug)]
pub struct RelayClient {
    client: reqwest::Client,
    base_url: String,
    session: RwLock<Option<String>>,
    cache: Option<LocalCache>,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session: RwLock::new(None),
            cache: None,
        })
    }

    /// Restore the session cookie from `cache` and persist new ones there.
    pub async fn with_cache(mut self, cache: LocalCache) -> Self {
        *self.session.get_mut() = cache.load_session().await;
        self.cache = Some(cache);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session.read().await.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn with_session(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.session.read().await.as_deref() {
            Some(sid) => request.header(COOKIE, format!("{SESSION_COOKIE}={sid}")),
            None => request,
        }
    }

    /// Adopt a `sid` from the response's `Set-Cookie` headers, if any.
    async fn capture_session(&self, response: &reqwest::Response) {
        let Some(sid) = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|cookie| cookie_value(cookie, SESSION_COOKIE))
            .filter(|sid| !sid.is_empty())
            .map(str::to_string)
        else {
            return;
        };

        {
            let mut current = self.session.write().await;
            if current.as_deref() == Some(sid.as_str()) {
                return;
            }
            *current = Some(sid.clone());
        }
        debug!("adopted new session cookie");

        if let Some(cache) = &self.cache
            && let Err(err) = cache.store_session(&sid).await
        {
            warn!(error = %err, "session cookie not cached");
        }
    }
}

#[async_trait]
impl ChatTransport for RelayClient {
    async fn send(&self, request: &ChatRequest) -> Result<RelayResponse, TransportError> {
        let builder = self.client.post(self.url("/relay/chat")).json(request);
        let response = self.with_session(builder).await.send().await?;
        self.capture_session(&response).await;

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("application/json"));

        if is_json {
            let reply = response
                .json::<ChatReply>()
                .await
                .map_err(|err| TransportError::InvalidResponse(err.to_string()))?;
            return Ok(RelayResponse::Json(reply));
        }

        // Status is not checked: an error body is shown as reply text.
        let stream = response.bytes_stream().map_err(TransportError::from).boxed();
        Ok(RelayResponse::Stream(stream))
    }
}

#[async_trait]
impl ConversationTier for RelayClient {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn load(&self) -> Result<Option<Vec<Message>>> {
        let builder = self.client.get(self.url("/history/load"));
        let response = self.with_session(builder).await.send().await?;
        self.capture_session(&response).await;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("history load returned {status}");
        }
        Ok(response.json::<Option<Vec<Message>>>().await?)
    }

    async fn save(&self, messages: &[Message]) -> Result<()> {
        let body = HistoryAppend {
            messages: messages.to_vec(),
        };
        let builder = self.client.post(self.url("/history/append")).json(&body);
        let response = self.with_session(builder).await.send().await?;
        self.capture_session(&response).await;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("history append returned {status}");
        }
        Ok(())
    }
}
