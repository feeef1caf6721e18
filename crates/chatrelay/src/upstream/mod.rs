//! Completion provider client.
//!
//! Talks to an OpenAI-compatible `/v1/chat/completions` endpoint, either
//! streaming server-sent events or returning a single buffered reply.

mod client;
mod error;
mod types;

pub use client::{DEFAULT_ENDPOINT, DEFAULT_SYSTEM_PROMPT, UpstreamClient, UpstreamConfig};
pub use error::{UpstreamError, UpstreamResult};
pub use types::*;
