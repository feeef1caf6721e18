//! HTTP API module.
//!
//! Provides the chat relay endpoint and the per-session history endpoints.

mod error;
mod handlers;
mod routes;
mod session;
mod state;

pub use error::{ApiError, ApiResult, INVALID_BODY, UPSTREAM_ERROR_BODY};
pub use routes::create_router;
pub use session::{SESSION_COOKIE, SESSION_MAX_AGE_SECS, SessionCookie, cookie_value};
pub use state::AppState;
