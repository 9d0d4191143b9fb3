//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use gpufleet_id::Ulid;

use crate::api::error::ApiError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const AUTHORIZATION_HEADER: &str = "authorization";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Bearer token, if the caller sent one.
    pub bearer: Option<String>,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

impl RequestContext {
    /// Rejects the request unless it carries `expected` as bearer token. No
    /// expected token means authentication is disabled.
    pub fn require_token(&self, expected: Option<&str>) -> Result<(), ApiError> {
        let Some(expected) = expected else {
            return Ok(());
        };
        match self.bearer.as_deref() {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(ApiError::unauthorized("invalid_token", "bearer token rejected")
                .with_request_id(self.request_id.clone())),
            None => Err(
                ApiError::unauthorized("missing_token", "a bearer token is required")
                    .with_request_id(self.request_id.clone()),
            ),
        }
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| format!("req_{}", Ulid::new().to_string().to_lowercase()));

        let bearer = match header_string(&parts.headers, AUTHORIZATION_HEADER) {
            None => None,
            Some(value) => {
                let Some(token) = value.trim().strip_prefix("Bearer ") else {
                    return Err(ApiError::unauthorized(
                        "invalid_authorization",
                        "Authorization must be a Bearer token",
                    )
                    .with_request_id(request_id));
                };
                Some(token.trim().to_string()).filter(|t| !t.is_empty())
            }
        };

        Ok(Self { request_id, bearer })
    }
}
