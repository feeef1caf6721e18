//! Session identifier cookie.
//!
//! Every history request carries an opaque `sid` cookie. When absent, a new
//! identifier is minted and returned to the client with a one-year lifetime.

use std::convert::Infallible;

use axum::{
    extract::FromRequestParts,
    http::{HeaderValue, header, request::Parts},
    response::{IntoResponseParts, ResponseParts},
};

pub const SESSION_COOKIE: &str = "sid";
pub const SESSION_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 365;

/// Find a cookie value in a `Cookie` header.
pub fn cookie_value<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// The caller's session identifier, provisioned on first contact.
///
/// Used both as an extractor and as a response part: a freshly minted
/// identifier adds the `Set-Cookie` header, an existing one adds nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    id: String,
    fresh: bool,
}

impl SessionCookie {
    pub fn existing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fresh: false,
        }
    }

    pub fn mint() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            fresh: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn set_cookie_value(&self) -> String {
        format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            SESSION_COOKIE, self.id, SESSION_MAX_AGE_SECS
        )
    }

    fn from_parts(parts: &Parts) -> Self {
        parts
            .headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|cookies| cookie_value(cookies, SESSION_COOKIE))
            .filter(|sid| !sid.is_empty())
            .map(Self::existing)
            .unwrap_or_else(Self::mint)
    }
}

impl<S> FromRequestParts<S> for SessionCookie
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let session = Self::from_parts(parts);
        if session.fresh {
            tracing::debug!(sid = %session.id, "provisioned new session");
        }
        Ok(session)
    }
}

impl IntoResponseParts for SessionCookie {
    type Error = Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        if self.fresh {
            if let Ok(value) = HeaderValue::from_str(&self.set_cookie_value()) {
                res.headers_mut().append(header::SET_COOKIE, value);
            }
        }
        Ok(res)
    }
}
