//! Capability resolution and request tracing middleware.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use parcel_core::auth::{sha256_hex, tokens_match};
use parcel_core::{Capability, Credentials};
use tracing::Instrument;
use uuid::Uuid;

/// Header carrying an upload token.
pub const UPLOAD_TOKEN_HEADER: &str = "x-uploadtoken";

/// Header carrying a client trace ID.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Maximum length for trace IDs.
/// Longer trace IDs are truncated to prevent log bloat and potential log injection.
const MAX_TRACE_ID_LEN: usize = 128;

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a trace ID from a client-provided value.
    ///
    /// Truncated to [`MAX_TRACE_ID_LEN`] characters with non-printable characters removed.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extract bearer token from Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(v[7..].trim())
            } else {
                None
            }
        })
}

fn extract_basic_credentials(headers: &HeaderMap) -> Option<Credentials> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(Credentials::from_basic_header)
}

fn extract_or_generate_trace_id(headers: &HeaderMap) -> TraceId {
    headers
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_else(TraceId::new)
}

/// Whether `token` is the configured admin token.
fn is_admin_token(state: &AppState, token: &str) -> bool {
    let Some(expected) = &state.config.admin.token_hash else {
        return false;
    };
    let expected = expected.strip_prefix("sha256:").unwrap_or(expected);
    tokens_match(&sha256_hex(token.as_bytes()), &expected.to_ascii_lowercase())
}

/// Build the caller's capability from request headers.
///
/// A bearer token that is not the admin token is rejected rather than ignored.
pub fn resolve_capability(state: &AppState, headers: &HeaderMap) -> Result<Capability, ApiError> {
    let mut cap = Capability::none();

    if let Some(token) = headers
        .get(UPLOAD_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        cap.upload_token = Some(token.to_string());
    }

    if let Some(token) = extract_bearer_token(headers) {
        if !is_admin_token(state, token) {
            return Err(ApiError::Unauthorized("invalid admin token".to_string()));
        }
        cap.admin = true;
    } else {
        cap.credentials = extract_basic_credentials(headers);
    }

    Ok(cap)
}

/// Attach a trace ID and the caller's [`Capability`] to the request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(req.headers());
    let span = tracing::info_span!("request", trace_id = %trace_id);

    let cap = resolve_capability(&state, req.headers())?;
    req.extensions_mut().insert(trace_id);
    req.extensions_mut().insert(cap);

    Ok(next.run(req).instrument(span).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use parcel_core::config::AppConfig;
    use parcel_metadata::SqliteStore;
    use parcel_storage::MemoryBackend;
    use std::sync::Arc;

    async fn state() -> AppState {
        let metadata = Arc::new(SqliteStore::in_memory().await.unwrap());
        AppState::new(
            AppConfig::for_testing(),
            Arc::new(MemoryBackend::new()),
            metadata,
        )
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn trace_id_is_sanitized() {
        let id = TraceId::from_client("abc\ndef");
        assert_eq!(id.as_str(), "abcdef");

        let long = "x".repeat(500);
        assert_eq!(TraceId::from_client(&long).as_str().len(), MAX_TRACE_ID_LEN);

        // Only control characters: a fresh ID is generated.
        assert!(!TraceId::from_client("\n\t").as_str().is_empty());
    }

    #[tokio::test]
    async fn admin_bearer_token_is_case_insensitive() {
        let state = state().await;
        let cap = resolve_capability(
            &state,
            &headers(&[("authorization", "bearer test-admin-token")]),
        )
        .unwrap();
        assert!(cap.admin);

        assert!(
            resolve_capability(&state, &headers(&[("authorization", "Bearer nope")])).is_err()
        );
    }

    #[tokio::test]
    async fn upload_token_and_basic_credentials() {
        let state = state().await;
        let basic = Credentials {
            login: "parcel".to_string(),
            password: "secret".to_string(),
        }
        .to_basic_header();
        let cap = resolve_capability(
            &state,
            &headers(&[("x-uploadtoken", "tok"), ("authorization", &basic)]),
        )
        .unwrap();

        assert!(!cap.admin);
        assert_eq!(cap.upload_token.as_deref(), Some("tok"));
        assert_eq!(cap.credentials.unwrap().password, "secret");
    }
}
