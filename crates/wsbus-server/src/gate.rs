//! Upgrade gate.
//!
//! Every upgrade request passes the same checks in order: the path prefix,
//! the remote address, then the authenticator. The first failing check
//! decides the HTTP status of the rejection.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use wsbus_core::BoxError;

/// Header consulted when the socket peer address is unavailable.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Future returned by [`Authenticator::authenticate`].
pub type AuthFuture<U> = Pin<Box<dyn Future<Output = Result<Option<U>, BoxError>> + Send>>;

/// Decides whether an upgrade request may proceed.
///
/// Resolving to `Ok(Some(user))` admits the request and binds `user` to the
/// connection. `Ok(None)` and `Err(_)` both reject it with 401.
pub trait Authenticator<U>: Send + Sync + 'static {
    fn authenticate(&self, parts: &Parts, remote_addr: &str) -> AuthFuture<U>;
}

impl<U, F, Fut> Authenticator<U> for F
where
    F: Fn(&Parts, &str) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<U>, BoxError>> + Send + 'static,
{
    fn authenticate(&self, parts: &Parts, remote_addr: &str) -> AuthFuture<U> {
        Box::pin(self(parts, remote_addr))
    }
}

/// Admits every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl<U: Default + Send + 'static> Authenticator<U> for AllowAll {
    fn authenticate(&self, _parts: &Parts, _remote_addr: &str) -> AuthFuture<U> {
        Box::pin(async { Ok(Some(U::default())) })
    }
}

/// Admits requests carrying `Authorization: Bearer <token>`.
#[derive(Clone)]
pub struct BearerToken {
    token: String,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    fn matches(&self, parts: &Parts) -> bool {
        parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|presented| presented.trim() == self.token)
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerToken").finish_non_exhaustive()
    }
}

impl<U: Default + Send + 'static> Authenticator<U> for BearerToken {
    fn authenticate(&self, parts: &Parts, _remote_addr: &str) -> AuthFuture<U> {
        let admitted = self.matches(parts);
        Box::pin(async move { Ok(admitted.then(U::default)) })
    }
}

/// Why an upgrade request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The path does not start with the configured prefix.
    NotFound,
    /// No remote address could be determined.
    BadRequest,
    /// The authenticator refused or failed.
    Unauthorized,
}

impl Rejection {
    pub fn status(self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        self.status().into_response()
    }
}

/// Progress of one upgrade request through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Received,
    Authenticating,
    Established,
    Rejected(Rejection),
}

/// A request that passed the gate.
#[derive(Debug)]
pub struct Admitted<U> {
    pub user: U,
    pub remote_addr: String,
}

pub(crate) fn transition(path: &str, state: HandshakeState) {
    match state {
        HandshakeState::Rejected(rejection) => {
            debug!(path, ?state, status = %rejection.status(), "handshake");
        }
        _ => debug!(path, ?state, "handshake"),
    }
}

/// Returns the peer address: the socket address when known, otherwise the
/// first `x-forwarded-for` entry.
pub fn remote_addr(parts: &Parts) -> Option<String> {
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip().to_string());
    }
    parts
        .headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Runs the gate checks against an upgrade request.
pub async fn check_handshake<U: Send + 'static>(
    parts: &Parts,
    prefix: Option<&str>,
    authenticator: &dyn Authenticator<U>,
) -> Result<Admitted<U>, Rejection> {
    let path = parts.uri.path();
    transition(path, HandshakeState::Received);

    let result = admit(parts, prefix, authenticator).await;
    match &result {
        Ok(_) => transition(path, HandshakeState::Established),
        Err(rejection) => transition(path, HandshakeState::Rejected(*rejection)),
    }
    result
}

async fn admit<U: Send + 'static>(
    parts: &Parts,
    prefix: Option<&str>,
    authenticator: &dyn Authenticator<U>,
) -> Result<Admitted<U>, Rejection> {
    let path = parts.uri.path();
    if let Some(prefix) = prefix {
        if !path.starts_with(prefix) {
            return Err(Rejection::NotFound);
        }
    }

    let remote_addr = remote_addr(parts).ok_or(Rejection::BadRequest)?;

    transition(path, HandshakeState::Authenticating);
    match authenticator.authenticate(parts, &remote_addr).await {
        Ok(Some(user)) => Ok(Admitted { user, remote_addr }),
        Ok(None) => Err(Rejection::Unauthorized),
        Err(e) => {
            warn!(remote_addr = %remote_addr, error = %e, "authenticator failed");
            Err(Rejection::Unauthorized)
        }
    }
}
