//! Chat client.
//!
//! The terminal counterpart of a browser chat page: a controller that runs
//! exchanges against the relay, a local cache mirroring conversation and
//! settings, and tiered history loading at startup.

mod cache;
mod controller;
mod settings;
mod tiers;
mod transport;

pub use cache::{CONVERSATION_KEY, LocalCache, SESSION_KEY, SETTINGS_KEY};
pub use controller::{
    ChatController, ControllerOptions, DEFAULT_COOLDOWN, ExchangeOutcome, ExchangeState,
    SendRejected,
};
pub use settings::SettingsPanel;
pub use tiers::{ConversationTier, TieredHistory, WelcomeTier};
pub use transport::{ByteStream, ChatTransport, RelayClient, RelayResponse, TransportError};
