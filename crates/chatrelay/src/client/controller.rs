//! Client-side chat exchange.
//!
//! Owns the conversation, gates submissions (empty input, in-flight
//! exchange, cooldown), sends the recent context through a [`ChatTransport`]
//! and grows the assistant reply as streamed text arrives. Every change is
//! mirrored to the local cache; completed exchanges are also saved to the
//! remote history in the background.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::cache::LocalCache;
use super::tiers::ConversationTier;
use super::transport::{ByteStream, ChatTransport, RelayResponse, TransportError};
use crate::chat::{
    ChatRequest, Conversation, DEFAULT_CONTEXT_WINDOW, Message, NETWORK_ERROR_REPLY, NO_REPLY,
    Settings,
};
use crate::relay::Utf8StreamDecoder;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Sending,
}

/// Why a submission was refused. Nothing is appended or sent in these cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendRejected {
    #[error("message is empty")]
    Empty,

    #[error("a reply is still in progress")]
    Busy,

    #[error("please wait {0:?} before sending again")]
    CoolingDown(Duration),
}

/// How an accepted exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// A JSON reply was appended.
    Replied,
    /// A streamed reply completed.
    Streamed,
    /// The network error message was appended.
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    /// Trailing messages sent with each request.
    pub context_window: usize,
    /// Minimum spacing between accepted submissions.
    pub cooldown: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            context_window: DEFAULT_CONTEXT_WINDOW,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

pub struct ChatController {
    transport: Arc<dyn ChatTransport>,
    remote: Option<Arc<dyn ConversationTier>>,
    cache: LocalCache,
    conversation: Conversation,
    settings: Settings,
    state: ExchangeState,
    last_accepted: Option<Instant>,
    options: ControllerOptions,
    updates: watch::Sender<Conversation>,
    pending_saves: Vec<JoinHandle<()>>,
}

impl ChatController {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        cache: LocalCache,
        conversation: Conversation,
        options: ControllerOptions,
    ) -> Self {
        let (updates, _) = watch::channel(conversation.clone());
        Self {
            transport,
            remote: None,
            cache,
            conversation,
            settings: Settings::default(),
            state: ExchangeState::Idle,
            last_accepted: None,
            options,
            updates,
            pending_saves: Vec::new(),
        }
    }

    /// Save completed exchanges to `remote` as well as the local cache.
    pub fn with_remote_history(mut self, remote: Arc<dyn ConversationTier>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings.normalized();
        self
    }

    pub fn apply_settings(&mut self, settings: Settings) {
        self.settings = settings.normalized();
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Receive a snapshot of the conversation after every change.
    pub fn subscribe(&self) -> watch::Receiver<Conversation> {
        self.updates.subscribe()
    }

    pub fn last_assistant(&self) -> Option<&Message> {
        self.conversation.last_assistant()
    }

    pub fn export_json(&self) -> serde_json::Result<String> {
        self.conversation.export_json()
    }

    /// Time left before another submission is accepted.
    pub fn cooldown_remaining(&self) -> Duration {
        self.last_accepted
            .map(|at| self.options.cooldown.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    /// Validate `input`, append it as a user message and build the request.
    ///
    /// On success the controller is `Sending` until the exchange finishes.
    pub async fn submit(&mut self, input: &str) -> Result<ChatRequest, SendRejected> {
        let text = input.trim();
        if text.is_empty() {
            return Err(SendRejected::Empty);
        }
        if self.state == ExchangeState::Sending {
            return Err(SendRejected::Busy);
        }
        let remaining = self.cooldown_remaining();
        if !remaining.is_zero() {
            return Err(SendRejected::CoolingDown(remaining));
        }

        self.last_accepted = Some(Instant::now());
        self.state = ExchangeState::Sending;
        self.conversation.push(Message::user(text));
        self.publish().await;

        Ok(ChatRequest {
            messages: self
                .conversation
                .recent(self.options.context_window)
                .to_vec(),
            model: Some(self.settings.model.clone()),
            temperature: Some(self.settings.temperature),
        })
    }

    /// Submit `input` and run the exchange to completion.
    #[instrument(skip_all, fields(len = input.len()))]
    pub async fn send(&mut self, input: &str) -> Result<ExchangeOutcome, SendRejected> {
        let request = self.submit(input).await?;
        let transport = Arc::clone(&self.transport);
        let outcome = match transport.send(&request).await {
            Ok(RelayResponse::Json(reply)) => {
                let text = reply.reply.unwrap_or_else(|| NO_REPLY.to_string());
                self.conversation.push(Message::assistant(text));
                self.publish().await;
                self.save_remote();
                ExchangeOutcome::Replied
            }
            Ok(RelayResponse::Stream(stream)) => self.stream_reply(stream).await,
            Err(err) => self.fail(err).await,
        };
        self.state = ExchangeState::Idle;
        debug!(?outcome, messages = self.conversation.len(), "exchange finished");
        Ok(outcome)
    }

    async fn stream_reply(&mut self, mut stream: ByteStream) -> ExchangeOutcome {
        let mut decoder = Utf8StreamDecoder::new();
        let mut reply = String::new();

        self.conversation.push(Message::assistant(""));
        self.publish().await;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    let text = decoder.decode(&bytes);
                    if text.is_empty() {
                        continue;
                    }
                    reply.push_str(&text);
                    self.conversation.set_last_content(reply.as_str());
                    self.publish().await;
                }
                Err(err) => return self.fail(err).await,
            }
        }

        let tail = decoder.finish();
        if !tail.is_empty() {
            reply.push_str(&tail);
            self.conversation.set_last_content(reply);
            self.publish().await;
        }

        self.save_remote();
        ExchangeOutcome::Streamed
    }

    async fn fail(&mut self, err: TransportError) -> ExchangeOutcome {
        warn!(error = %err, "chat exchange failed");
        self.conversation.push(Message::assistant(NETWORK_ERROR_REPLY));
        self.publish().await;
        ExchangeOutcome::Failed
    }

    /// Reset to the welcome conversation and drop the cached copy.
    pub async fn clear(&mut self) {
        self.conversation = Conversation::welcome();
        self.updates.send_replace(self.conversation.clone());
        if let Err(err) = self.cache.clear_conversation().await {
            debug!(error = %err, "cached conversation not removed");
        }
        self.save_remote();
    }

    /// Wait for background remote saves to finish.
    pub async fn settle(&mut self) {
        for handle in self.pending_saves.drain(..) {
            if let Err(err) = handle.await {
                debug!(error = %err, "remote save task failed");
            }
        }
    }

    async fn publish(&mut self) {
        self.updates.send_replace(self.conversation.clone());
        if let Err(err) = self
            .cache
            .store_conversation(self.conversation.messages())
            .await
        {
            debug!(error = %err, "conversation not cached");
        }
    }

    fn save_remote(&mut self) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let messages = self.conversation.messages().to_vec();
        self.pending_saves.retain(|handle| !handle.is_finished());
        self.pending_saves.push(tokio::spawn(async move {
            if let Err(err) = remote.save(&messages).await {
                debug!(tier = remote.name(), error = %err, "remote save failed");
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{DEFAULT_MODEL, Role};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    enum Scripted {
        Json(Option<&'static str>),
        Stream(Vec<Result<&'static [u8], ()>>),
        Unreachable,
    }

    fn chunk(bytes: &'static [u8]) -> Result<&'static [u8], ()> {
        Ok(bytes)
    }

    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::default(),
            })
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn send(&self, request: &ChatRequest) -> Result<RelayResponse, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            match self.script.lock().unwrap().pop_front() {
                Some(Scripted::Json(reply)) => Ok(RelayResponse::Json(crate::chat::ChatReply {
                    reply: reply.map(str::to_string),
                })),
                Some(Scripted::Stream(chunks)) => {
                    let items = chunks.into_iter().map(|chunk| match chunk {
                        Ok(bytes) => Ok(Bytes::from_static(bytes)),
                        Err(()) => Err(TransportError::InvalidResponse("reset".into())),
                    });
                    Ok(RelayResponse::Stream(stream::iter(items).boxed()))
                }
                Some(Scripted::Unreachable) | None => {
                    Err(TransportError::InvalidResponse("unreachable".into()))
                }
            }
        }
    }

    #[derive(Default)]
    struct RecordingTier {
        saved: Mutex<Vec<Vec<Message>>>,
    }

    #[async_trait]
    impl ConversationTier for RecordingTier {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn load(&self) -> anyhow::Result<Option<Vec<Message>>> {
            Ok(self.saved.lock().unwrap().last().cloned())
        }

        async fn save(&self, messages: &[Message]) -> anyhow::Result<()> {
            self.saved.lock().unwrap().push(messages.to_vec());
            Ok(())
        }
    }

    fn no_cooldown() -> ControllerOptions {
        ControllerOptions {
            cooldown: Duration::ZERO,
            ..Default::default()
        }
    }

    fn controller(
        transport: Arc<ScriptedTransport>,
        dir: &TempDir,
        options: ControllerOptions,
    ) -> ChatController {
        ChatController::new(
            transport,
            LocalCache::in_dir(dir.path()),
            Conversation::welcome(),
            options,
        )
    }

    #[tokio::test]
    async fn test_json_reply_appended() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Scripted::Json(Some("Hi there"))]);
        let mut chat = controller(transport.clone(), &dir, no_cooldown());

        let outcome = chat.send("  Hello  ").await.unwrap();
        assert_eq!(outcome, ExchangeOutcome::Replied);
        assert_eq!(
            chat.conversation().messages(),
            &[
                Message::welcome(),
                Message::user("Hello"),
                Message::assistant("Hi there")
            ]
        );
        assert_eq!(chat.state(), ExchangeState::Idle);

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model.as_deref(), Some(DEFAULT_MODEL));
        assert_eq!(requests[0].messages.last(), Some(&Message::user("Hello")));
    }

    #[tokio::test]
    async fn test_missing_json_reply_uses_placeholder() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Scripted::Json(None)]);
        let mut chat = controller(transport, &dir, no_cooldown());

        chat.send("Hello").await.unwrap();
        assert_eq!(chat.last_assistant().unwrap().content, NO_REPLY);
    }

    #[tokio::test]
    async fn test_empty_json_reply_kept_as_is() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Scripted::Json(Some(""))]);
        let mut chat = controller(transport, &dir, no_cooldown());

        assert_eq!(chat.send("Hello").await, Ok(ExchangeOutcome::Replied));
        assert_eq!(chat.conversation().len(), 3);
        assert_eq!(chat.last_assistant().unwrap().content, "");
    }

    #[tokio::test]
    async fn test_streamed_reply_grows_in_place() {
        let dir = TempDir::new().unwrap();
        // "é" split across chunks.
        let transport = ScriptedTransport::new(vec![Scripted::Stream(vec![
            chunk(b"caf"),
            chunk(b"\xc3"),
            chunk(b"\xa9 ok"),
        ])]);
        let mut chat = controller(transport, &dir, no_cooldown());
        let mut updates = chat.subscribe();

        let outcome = chat.send("Hello").await.unwrap();
        assert_eq!(outcome, ExchangeOutcome::Streamed);
        assert_eq!(chat.conversation().len(), 3);
        assert_eq!(chat.last_assistant().unwrap().content, "café ok");
        assert!(updates.has_changed().unwrap());
        assert_eq!(
            updates.borrow_and_update().messages().last().map(|m| m.content.clone()),
            Some("café ok".to_string())
        );
    }

    #[tokio::test]
    async fn test_network_error_appends_message() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Scripted::Unreachable]);
        let mut chat = controller(transport, &dir, no_cooldown());

        let outcome = chat.send("Hello").await.unwrap();
        assert_eq!(outcome, ExchangeOutcome::Failed);
        let messages = chat.conversation().messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1], Message::user("Hello"));
        assert_eq!(messages[2], Message::assistant(NETWORK_ERROR_REPLY));
        assert_eq!(chat.state(), ExchangeState::Idle);
    }

    #[tokio::test]
    async fn test_stream_failure_keeps_partial_and_appends_error() {
        let dir = TempDir::new().unwrap();
        let transport =
            ScriptedTransport::new(vec![Scripted::Stream(vec![chunk(b"Hal"), Err(())])]);
        let mut chat = controller(transport, &dir, no_cooldown());

        assert_eq!(chat.send("Hello").await.unwrap(), ExchangeOutcome::Failed);
        let contents: Vec<_> = chat
            .conversation()
            .messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents[2..], ["Hal", NETWORK_ERROR_REPLY]);
    }

    #[tokio::test]
    async fn test_blank_input_rejected_without_changes() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(Vec::new());
        let mut chat = controller(transport.clone(), &dir, no_cooldown());

        assert_eq!(chat.send("   ").await, Err(SendRejected::Empty));
        assert_eq!(chat.conversation(), &Conversation::welcome());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_busy_while_exchange_in_flight() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(Vec::new());
        let mut chat = controller(transport.clone(), &dir, no_cooldown());

        let request = chat.submit("first").await.unwrap();
        assert_eq!(request.messages.last(), Some(&Message::user("first")));
        assert_eq!(chat.state(), ExchangeState::Sending);
        assert!(transport.requests().is_empty());

        assert!(matches!(
            chat.submit("second").await,
            Err(SendRejected::Busy)
        ));
    }

    #[tokio::test]
    async fn test_cooldown_rejects_rapid_resubmission() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![
            Scripted::Json(Some("one")),
            Scripted::Json(Some("two")),
        ]);
        let options = ControllerOptions {
            cooldown: Duration::from_millis(200),
            ..Default::default()
        };
        let mut chat = controller(transport.clone(), &dir, options);

        chat.send("first").await.unwrap();
        assert!(matches!(
            chat.send("second").await,
            Err(SendRejected::CoolingDown(_))
        ));
        assert_eq!(chat.conversation().len(), 3);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(chat.send("second").await, Ok(ExchangeOutcome::Replied));
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_cooldown_is_one_second() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![
            Scripted::Json(Some("one")),
            Scripted::Json(Some("two")),
        ]);
        let mut chat = controller(transport.clone(), &dir, ControllerOptions::default());

        chat.send("first").await.unwrap();

        tokio::time::advance(Duration::from_millis(999)).await;
        match chat.send("second").await {
            Err(SendRejected::CoolingDown(left)) => assert!(left <= Duration::from_millis(1)),
            other => panic!("expected cooldown rejection, got {other:?}"),
        }
        assert_eq!(transport.requests().len(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(chat.send("second").await, Ok(ExchangeOutcome::Replied));
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_context_window_limits_request() {
        let dir = TempDir::new().unwrap();
        let history: Vec<Message> = (0..14).map(|i| Message::user(format!("m{i}"))).collect();
        let transport = ScriptedTransport::new(vec![Scripted::Json(Some("ok"))]);
        let mut chat = ChatController::new(
            transport.clone(),
            LocalCache::in_dir(dir.path()),
            Conversation::from_messages(history),
            no_cooldown(),
        );

        chat.send("latest").await.unwrap();
        let sent = &transport.requests()[0].messages;
        assert_eq!(sent.len(), DEFAULT_CONTEXT_WINDOW);
        assert_eq!(sent.first(), Some(&Message::user("m5")));
        assert_eq!(sent.last(), Some(&Message::user("latest")));
    }

    #[tokio::test]
    async fn test_settings_sent_with_request() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Scripted::Json(Some("ok"))]);
        let mut chat = controller(transport.clone(), &dir, no_cooldown()).with_settings(Settings {
            model: "gpt-4o".into(),
            temperature: 0.2,
        });

        chat.send("Hello").await.unwrap();
        let request = &transport.requests()[0];
        assert_eq!(request.model.as_deref(), Some("gpt-4o"));
        assert_eq!(request.temperature, Some(0.2));
    }

    #[tokio::test]
    async fn test_conversation_mirrored_and_saved_remotely() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Scripted::Stream(vec![chunk(b"Hi")])]);
        let remote = Arc::new(RecordingTier::default());
        let mut chat = controller(transport, &dir, no_cooldown())
            .with_remote_history(remote.clone());

        chat.send("Hello").await.unwrap();
        chat.settle().await;

        let cached = LocalCache::in_dir(dir.path()).load_conversation().await;
        assert_eq!(cached.as_deref(), Some(chat.conversation().messages()));

        let saved = remote.saved.lock().unwrap().clone();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].last().map(|m| m.role), Some(Role::Assistant));
        assert_eq!(saved[0].last().map(|m| m.content.as_str()), Some("Hi"));
    }

    #[tokio::test]
    async fn test_failed_exchange_not_saved_remotely() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Scripted::Unreachable]);
        let remote = Arc::new(RecordingTier::default());
        let mut chat = controller(transport, &dir, no_cooldown())
            .with_remote_history(remote.clone());

        chat.send("Hello").await.unwrap();
        chat.settle().await;
        assert!(remote.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_resets_and_removes_cache() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Scripted::Json(Some("ok"))]);
        let remote = Arc::new(RecordingTier::default());
        let mut chat = controller(transport, &dir, no_cooldown())
            .with_remote_history(remote.clone());

        chat.send("Hello").await.unwrap();
        chat.clear().await;
        chat.settle().await;

        assert_eq!(chat.conversation(), &Conversation::welcome());
        assert_eq!(LocalCache::in_dir(dir.path()).load_conversation().await, None);
        let saved = remote.saved.lock().unwrap().clone();
        assert_eq!(saved.last(), Some(&vec![Message::welcome()]));
    }

    #[tokio::test]
    async fn test_export_json() {
        let dir = TempDir::new().unwrap();
        let chat = controller(ScriptedTransport::new(Vec::new()), &dir, no_cooldown());
        let exported: Vec<Message> = serde_json::from_str(&chat.export_json().unwrap()).unwrap();
        assert_eq!(exported, vec![Message::welcome()]);
    }
}
