use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures surfaced to inference clients.
///
/// Messages name the model, never a backend address.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{detail}")]
    BadRequest { code: &'static str, detail: String },

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("no running instance of model '{model}'")]
    NoRoute { model: String },

    #[error("backend for model '{model}' failed: {reason}")]
    BackendUnavailable { model: String, reason: String },

    #[error("backend for model '{model}' did not respond in time")]
    Timeout { model: String },
}

impl ProxyError {
    pub fn bad_request(code: &'static str, detail: impl Into<String>) -> Self {
        ProxyError::BadRequest {
            code,
            detail: detail.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::NoRoute { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BackendUnavailable { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::BadRequest { code, .. } => *code,
            ProxyError::BodyTooLarge { .. } => "body_too_large",
            ProxyError::NoRoute { .. } => "no_instance_available",
            ProxyError::BackendUnavailable { .. } => "backend_unavailable",
            ProxyError::Timeout { .. } => "backend_timeout",
        }
    }

    fn retry_after_seconds(&self) -> u32 {
        match self {
            ProxyError::NoRoute { .. } => 5,
            ProxyError::BackendUnavailable { .. } => 1,
            _ => 0,
        }
    }
}

/// RFC 7807 problem document.
#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    r#type: String,
    title: String,
    status: u16,
    detail: String,
    code: &'static str,
    request_id: String,
    retryable: bool,
    retry_after_seconds: u32,
}

/// A [`ProxyError`] tagged with the request it failed.
#[derive(Debug)]
pub struct ProblemResponse {
    pub error: ProxyError,
    pub request_id: String,
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let code = self.error.code();
        let retry_after = self.error.retry_after_seconds();
        let problem = ProblemDetails {
            r#type: format!("https://gpufleet.dev/problems/{code}"),
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            status: status.as_u16(),
            detail: self.error.to_string(),
            code,
            request_id: self.request_id,
            retryable: retry_after > 0,
            retry_after_seconds: retry_after,
        };

        let mut response = (status, Json(problem)).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        if retry_after > 0 {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ProxyError::bad_request("model_required", "x"), 400)]
    #[case(ProxyError::NoRoute { model: "qwen".into() }, 503)]
    #[case(ProxyError::BackendUnavailable { model: "qwen".into(), reason: "reset".into() }, 502)]
    #[case(ProxyError::Timeout { model: "qwen".into() }, 504)]
    fn status_codes(#[case] error: ProxyError, #[case] status: u16) {
        assert_eq!(error.status().as_u16(), status);
    }

    #[tokio::test]
    async fn no_route_is_retryable_problem() {
        let response = ProblemResponse {
            error: ProxyError::NoRoute {
                model: "qwen".into(),
            },
            request_id: "req_1".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "no_instance_available");
        assert_eq!(body["request_id"], "req_1");
        assert_eq!(body["retryable"], true);
    }
}
