//! Upstream forwarding with retries.
//!
//! Retry rules:
//! - A connect failure sent nothing, so it is retried on another instance
//!   and the failing instance becomes suspect
//! - Any other failure before response headers is retried only for
//!   idempotent methods
//! - Once headers arrive the body is streamed through unbuffered and is
//!   never retried; a failure after that point aborts the client response

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use gpufleet_id::InstanceId;
use gpufleet_types::RouteEndpoint;
use tracing::{debug, warn};

use crate::config::ForwardConfig;
use crate::error::ProxyError;
use crate::routing::{Balancer, InflightGuard, RouteTable};

pub const REVISION_HEADER: &str = "x-model-revision";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Headers that describe one connection rather than the message.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A client request after the model has been resolved.
#[derive(Debug)]
pub struct InferenceRequest {
    pub model: String,
    pub revision: Option<u64>,
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub request_id: String,
}

pub struct Forwarder {
    client: reqwest::Client,
    table: Arc<RouteTable>,
    balancer: Arc<Balancer>,
    config: ForwardConfig,
}

impl Forwarder {
    pub fn new(
        table: Arc<RouteTable>,
        balancer: Arc<Balancer>,
        config: ForwardConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .build()?;
        Ok(Self {
            client,
            table,
            balancer,
            config,
        })
    }

    pub fn config(&self) -> &ForwardConfig {
        &self.config
    }

    /// Sends the request to a running instance of its model.
    pub async fn forward(&self, request: InferenceRequest) -> Result<Response, ProxyError> {
        let candidates = self.table.lookup(&request.model, request.revision);
        if candidates.is_empty() {
            return Err(ProxyError::NoRoute {
                model: request.model,
            });
        }

        let idempotent = is_idempotent(&request.method);
        let headers = upstream_headers(&request.headers, &request.request_id);
        let mut tried: HashSet<InstanceId> = HashSet::new();
        let mut last_error = None;

        for attempt in 1..=self.config.max_attempts {
            let Some(target) = self.balancer.pick(&request.model, &candidates, &tried) else {
                break;
            };
            tried.insert(target.instance_id);
            let inflight = self.balancer.begin(target.instance_id);

            let url = format!("{}{}", target.endpoint.base_url(), request.path_and_query);
            debug!(
                request_id = %request.request_id,
                model = %request.model,
                instance_id = %target.instance_id,
                attempt,
                "Forwarding request"
            );
            let send = self
                .client
                .request(request.method.clone(), url)
                .headers(headers.clone())
                .body(request.body.clone())
                .send();

            let error = match tokio::time::timeout(self.config.response_timeout, send).await {
                Ok(Ok(upstream)) => {
                    return Ok(stream_response(upstream, &target, inflight, &request));
                }
                Ok(Err(e)) if e.is_connect() => {
                    self.balancer.mark_suspect(target.instance_id);
                    warn!(
                        request_id = %request.request_id,
                        instance_id = %target.instance_id,
                        error = %e,
                        "Backend connection failed, trying another instance"
                    );
                    last_error = Some(ProxyError::BackendUnavailable {
                        model: request.model.clone(),
                        reason: "connection refused".to_string(),
                    });
                    continue;
                }
                Ok(Err(e)) if e.is_timeout() => ProxyError::Timeout {
                    model: request.model.clone(),
                },
                Ok(Err(e)) => {
                    warn!(
                        request_id = %request.request_id,
                        instance_id = %target.instance_id,
                        error = %e,
                        "Backend request failed"
                    );
                    ProxyError::BackendUnavailable {
                        model: request.model.clone(),
                        reason: "request failed before a response".to_string(),
                    }
                }
                Err(_) => {
                    warn!(
                        request_id = %request.request_id,
                        instance_id = %target.instance_id,
                        timeout_secs = self.config.response_timeout.as_secs(),
                        "Backend response timed out"
                    );
                    ProxyError::Timeout {
                        model: request.model.clone(),
                    }
                }
            };

            // The backend may have acted on the request.
            if !idempotent {
                return Err(error);
            }
            last_error = Some(error);
        }

        Err(last_error.unwrap_or(ProxyError::NoRoute {
            model: request.model,
        }))
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE | Method::TRACE
    )
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn upstream_headers(client: &HeaderMap, request_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(client.len() + 1);
    for (name, value) in client {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    headers
}

/// Turns the upstream response into the client response without buffering.
fn stream_response(
    upstream: reqwest::Response,
    target: &RouteEndpoint,
    inflight: InflightGuard,
    request: &InferenceRequest,
) -> Response {
    let status = upstream.status();
    let mut headers = HeaderMap::with_capacity(upstream.headers().len() + 2);
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers.insert(REVISION_HEADER, HeaderValue::from(target.revision));
    if let Ok(value) = HeaderValue::from_str(&request.request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    let request_id = request.request_id.clone();
    let instance_id = target.instance_id;
    let body = upstream.bytes_stream().map(move |chunk| {
        // Dropped with the stream: on completion or client disconnect.
        let _inflight = &inflight;
        if let Err(e) = &chunk {
            warn!(
                request_id = %request_id,
                instance_id = %instance_id,
                error = %e,
                "Backend failed mid-response"
            );
        }
        chunk
    });

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::BalancePolicy;
    use gpufleet_types::Endpoint;
    use std::time::Duration;
    use wiremock::matchers::{header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint_of(server: &MockServer) -> Endpoint {
        let addr = server.address();
        Endpoint::new(addr.ip().to_string(), addr.port())
    }

    fn route(endpoint: Endpoint, revision: u64) -> RouteEndpoint {
        RouteEndpoint {
            instance_id: InstanceId::new(),
            revision,
            endpoint,
        }
    }

    fn dead_endpoint() -> Endpoint {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Endpoint::new("127.0.0.1", port)
    }

    fn forwarder(routes: Vec<RouteEndpoint>, config: ForwardConfig) -> Forwarder {
        let table = Arc::new(RouteTable::new());
        for route in routes {
            table.upsert("qwen", route);
        }
        let balancer = Arc::new(Balancer::new(
            BalancePolicy::RoundRobin,
            Duration::from_secs(30),
        ));
        Forwarder::new(table, balancer, config).unwrap()
    }

    fn request(method: Method) -> InferenceRequest {
        InferenceRequest {
            model: "qwen".into(),
            revision: None,
            method,
            path_and_query: "/v1/chat/completions".into(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(br#"{"model":"qwen"}"#),
            request_id: "req_test".into(),
        }
    }

    async fn body_of(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn connect_failure_retries_on_another_instance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header_is("x-request-id", "req_test"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let dead = route(dead_endpoint(), 1);
        let live = route(endpoint_of(&server), 1);
        let forwarder = forwarder(vec![dead.clone(), live], ForwardConfig::default());

        // Whichever instance round-robin starts with, the request lands.
        for _ in 0..2 {
            let response = forwarder.forward(request(Method::POST)).await.unwrap();
            assert_eq!(response.status(), 200);
            assert_eq!(response.headers()[REVISION_HEADER], "1");
            assert_eq!(body_of(response).await, "hello");
        }
        assert!(forwarder.balancer.is_suspect(dead.instance_id));
    }

    #[tokio::test]
    async fn no_instances_is_no_route() {
        let forwarder = forwarder(Vec::new(), ForwardConfig::default());
        let err = forwarder.forward(request(Method::POST)).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoRoute { .. }));
    }

    #[tokio::test]
    async fn all_instances_refusing_is_bad_gateway() {
        let forwarder = forwarder(
            vec![route(dead_endpoint(), 1), route(dead_endpoint(), 1)],
            ForwardConfig::default(),
        );
        let err = forwarder.forward(request(Method::POST)).await.unwrap_err();
        assert!(matches!(err, ProxyError::BackendUnavailable { .. }));

        // Both are suspect now.
        let err = forwarder.forward(request(Method::POST)).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoRoute { .. }));
    }

    #[tokio::test]
    async fn slow_backend_times_out_without_retry_for_post() {
        let mut servers = Vec::new();
        for _ in 0..2 {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
                .mount(&server)
                .await;
            servers.push(server);
        }

        let config = ForwardConfig {
            response_timeout: Duration::from_millis(200),
            ..ForwardConfig::default()
        };
        let forwarder = forwarder(
            servers.iter().map(|s| route(endpoint_of(s), 1)).collect(),
            config,
        );
        let err = forwarder.forward(request(Method::POST)).await.unwrap_err();
        assert!(matches!(err, ProxyError::Timeout { .. }));

        let mut attempts = 0;
        for server in &servers {
            attempts += server.received_requests().await.unwrap().len();
        }
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn idempotent_request_retries_after_timeout() {
        let slow = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&slow)
            .await;
        let fast = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&fast)
            .await;

        let config = ForwardConfig {
            response_timeout: Duration::from_millis(200),
            ..ForwardConfig::default()
        };
        let forwarder = forwarder(
            vec![route(endpoint_of(&slow), 1), route(endpoint_of(&fast), 1)],
            config,
        );
        let response = forwarder.forward(request(Method::GET)).await.unwrap();
        assert_eq!(body_of(response).await, "ok");
    }

    #[tokio::test]
    async fn backend_errors_pass_through_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("engine crashed"))
            .expect(1)
            .mount(&server)
            .await;
        let forwarder = forwarder(vec![route(endpoint_of(&server), 1)], ForwardConfig::default());
        let response = forwarder.forward(request(Method::POST)).await.unwrap();
        assert_eq!(response.status(), 500);
        assert_eq!(body_of(response).await, "engine crashed");
    }

    #[tokio::test]
    async fn revision_pin_selects_matching_instances() {
        let old = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("old"))
            .mount(&old)
            .await;
        let new = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("new"))
            .mount(&new)
            .await;
        let forwarder = forwarder(
            vec![route(endpoint_of(&old), 1), route(endpoint_of(&new), 2)],
            ForwardConfig::default(),
        );

        for _ in 0..3 {
            let mut req = request(Method::POST);
            req.revision = Some(2);
            let response = forwarder.forward(req).await.unwrap();
            assert_eq!(body_of(response).await, "new");
        }
        let mut req = request(Method::POST);
        req.revision = Some(9);
        assert!(matches!(
            forwarder.forward(req).await.unwrap_err(),
            ProxyError::NoRoute { .. }
        ));
    }

    #[tokio::test]
    async fn inflight_count_lasts_until_body_is_consumed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tokens"))
            .mount(&server)
            .await;
        let target = route(endpoint_of(&server), 1);
        let forwarder = forwarder(vec![target.clone()], ForwardConfig::default());

        let response = forwarder.forward(request(Method::POST)).await.unwrap();
        assert_eq!(forwarder.balancer.outstanding(target.instance_id), 1);
        body_of(response).await;
        assert_eq!(forwarder.balancer.outstanding(target.instance_id), 0);
    }
}
