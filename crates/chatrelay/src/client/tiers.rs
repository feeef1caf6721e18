//! Priority-ordered conversation sources.
//!
//! At mount the conversation is seeded from the first tier that has one:
//! remote history, then the local cache, then the welcome message.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::cache::LocalCache;
use crate::chat::{Conversation, Message};

/// A place a conversation can be loaded from and saved to.
#[async_trait]
pub trait ConversationTier: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn load(&self) -> Result<Option<Vec<Message>>>;

    async fn save(&self, messages: &[Message]) -> Result<()>;
}

#[async_trait]
impl ConversationTier for LocalCache {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn load(&self) -> Result<Option<Vec<Message>>> {
        Ok(self.load_conversation().await)
    }

    async fn save(&self, messages: &[Message]) -> Result<()> {
        Ok(self.store_conversation(messages).await?)
    }
}

/// Last resort: the fixed welcome conversation. Saving is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct WelcomeTier;

#[async_trait]
impl ConversationTier for WelcomeTier {
    fn name(&self) -> &'static str {
        "welcome"
    }

    async fn load(&self) -> Result<Option<Vec<Message>>> {
        Ok(Some(Conversation::welcome().into_messages()))
    }

    async fn save(&self, _messages: &[Message]) -> Result<()> {
        Ok(())
    }
}

/// First-match-wins lookup over an ordered list of tiers.
#[derive(Clone, Default)]
pub struct TieredHistory {
    tiers: Vec<Arc<dyn ConversationTier>>,
}

impl TieredHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tier with lower priority than those already added.
    pub fn with_tier(mut self, tier: Arc<dyn ConversationTier>) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|tier| tier.name()).collect()
    }

    /// Load from the first tier holding a non-empty conversation.
    ///
    /// Failing and empty tiers fall through; if every tier does, the result
    /// is the welcome conversation.
    pub async fn load(&self) -> Conversation {
        for tier in &self.tiers {
            match tier.load().await {
                Ok(Some(messages)) if !messages.is_empty() => {
                    debug!(tier = tier.name(), messages = messages.len(), "conversation restored");
                    return Conversation::from_messages(messages);
                }
                Ok(_) => debug!(tier = tier.name(), "no stored conversation"),
                Err(err) => debug!(tier = tier.name(), error = %err, "tier unavailable"),
            }
        }
        Conversation::welcome()
    }
}
