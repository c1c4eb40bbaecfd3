//! axum integration: the session middleware and the `Session` extractor.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::gate::{BufferedResponse, CommitGate};
use crate::session::{cookie, Session};

/// State shared by every invocation of [`session_middleware`].
#[derive(Clone)]
pub struct SessionLayerState {
    config: Arc<SessionConfig>,
    cookie_name: Arc<Regex>,
}

impl SessionLayerState {
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::from_shared(Arc::new(config))
    }

    pub fn from_shared(config: Arc<SessionConfig>) -> Result<Self> {
        let pattern = format!(r"^{}\.(.+)$", regex::escape(&config.name));
        let cookie_name = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| SessionError::Configuration(format!("session cookie pattern: {e}")))?;
        Ok(Self { config, cookie_name: Arc::new(cookie_name) })
    }

    pub fn config(&self) -> &Arc<SessionConfig> {
        &self.config
    }

    /// `(key id, value)` of every request cookie named `<name>.<id>`.
    pub fn candidates(&self, headers: &HeaderMap) -> Vec<(String, String)> {
        let values = headers.get_all(header::COOKIE).iter().filter_map(|v| v.to_str().ok());
        cookie::parse_cookie_pairs(values)
            .into_iter()
            .filter_map(|(name, value)| {
                let id = self.cookie_name.captures(&name)?.get(1)?.as_str().to_string();
                Some((id, value))
            })
            .collect()
    }
}

/// Install the session middleware on `router`.
pub fn configure_session(router: Router, config: SessionConfig) -> Result<Router> {
    let state = SessionLayerState::new(config)?;
    Ok(router.layer(middleware::from_fn_with_state(state, session_middleware)))
}

/// Load the session from the request cookies, run the handler, and hold
/// its response head until the session cookies are computed.
///
/// Only the head goes through the [`CommitGate`]. The body is handed back
/// untouched once the gate opens, so streamed bodies flow as the client
/// reads them and keep the connection's own backpressure.
pub async fn session_middleware(
    State(state): State<SessionLayerState>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.extensions().get::<Session>().is_some() {
        debug!("session already loaded, skipping");
        return next.run(request).await;
    }

    let session = Session::new(state.config.clone());
    let candidates = state.candidates(request.headers());
    if !candidates.is_empty() {
        session.initialize_all(candidates).await;
    }
    request.extensions_mut().insert(session.clone());

    let response = next.run(request).await;
    let (mut parts, body) = response.into_parts();

    let gate = CommitGate::new(session.clone(), BufferedResponse::new());
    gate.write_head(parts.status, std::mem::take(&mut parts.headers));
    let head = match gate.finish().await {
        Ok(head) => head,
        Err(err) => return err.into_response(),
    };

    match session.commit_outcome() {
        Some(Ok(_)) => {
            let (status, headers) = head.into_head();
            parts.status = status;
            parts.headers = headers;
            Response::from_parts(parts, body)
        }
        // The gate replaced the head with the failure response
        _ => head.into_response(),
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "session middleware is not installed"))
    }
}
