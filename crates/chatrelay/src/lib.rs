//! Chat relay for OpenAI-compatible completion APIs.
//!
//! The server half forwards conversations to a completion provider and
//! streams the reply back as plain text, keeping per-session history in
//! SQLite. The client half drives exchanges against that server and mirrors
//! state into a local cache.

pub mod api;
pub mod chat;
pub mod client;
pub mod history;
pub mod relay;
pub mod storage;
pub mod upstream;
