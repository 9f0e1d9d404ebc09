//! Transport over a pluggable HTTP client.
//!
//! The runtime never links an HTTP library itself. Callers wrap whichever
//! client they use (reqwest, hyper, ureq) in [`HttpClient`]; tests use the
//! in-process [`LoopbackClient`].

use crate::endpoint::ServiceEndpoint;
use crate::error::{TransportError, TransportResult};
use crate::request::{RawResponse, RequestDescriptor};
use crate::transport::Transport;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::time::Duration;

/// One HTTP exchange.
///
/// `Err` means nothing came back over the wire. A response with any
/// status, 4xx and 5xx included, is `Ok`.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends `request` and returns whatever the service answered.
    async fn execute(&self, request: &RequestDescriptor) -> Result<RawResponse, String>;

    /// False when the underlying connection pool is known to be unusable.
    fn is_healthy(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Link {
    Open,
    /// Open, but the last exchange failed with this message.
    Degraded(String),
    Closed,
}

/// [`Transport`] that runs each request through an [`HttpClient`] with a
/// deadline.
pub struct HttpTransport<C: HttpClient> {
    client: C,
    timeout: Duration,
    link: RwLock<Link>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Wraps `client`, failing requests that take longer than `timeout`.
    pub fn new(client: C, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            link: RwLock::new(Link::Open),
        }
    }

    /// Uses the deadline configured on `endpoint`.
    pub fn for_endpoint(endpoint: &ServiceEndpoint, client: C) -> Self {
        Self::new(client, endpoint.timeout)
    }

    /// Per-request deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Message of the most recent failed exchange, cleared by the next
    /// exchange that gets a response.
    pub fn last_error(&self) -> Option<String> {
        match &*self.link.read() {
            Link::Degraded(message) => Some(message.clone()),
            Link::Open | Link::Closed => None,
        }
    }

    /// True until [`close`](Self::close) is called, while the client is healthy.
    pub fn is_connected(&self) -> bool {
        *self.link.read() != Link::Closed && self.client.is_healthy()
    }

    /// Refuses every later request.
    pub fn close(&self) {
        *self.link.write() = Link::Closed;
    }

    fn record(&self, outcome: Link) {
        let mut link = self.link.write();
        if *link != Link::Closed {
            *link = outcome;
        }
    }
}

#[async_trait]
impl<C: HttpClient> Transport for HttpTransport<C> {
    async fn send(&self, request: RequestDescriptor) -> TransportResult<RawResponse> {
        if !self.is_connected() {
            return Err(TransportError::network_fatal("transport is not connected"));
        }

        tracing::trace!(method = %request.method, url = %request.url, "http request");
        let exchange = tokio::time::timeout(self.timeout, self.client.execute(&request)).await;

        let response = match exchange {
            Ok(Ok(response)) => response,
            Ok(Err(message)) => {
                self.record(Link::Degraded(message.clone()));
                return Err(TransportError::network_retryable(message));
            }
            Err(_elapsed) => {
                self.record(Link::Degraded("request timed out".into()));
                return Err(TransportError::Timeout);
            }
        };

        self.record(Link::Open);
        tracing::trace!(status = response.status, url = %request.url, "http response");
        response.error_for_status()
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// An in-process service answering requests synchronously.
pub trait LoopbackServer: Send + Sync {
    /// Answers one request.
    fn handle(&self, request: &RequestDescriptor) -> RawResponse;
}

impl<S: LoopbackServer> LoopbackServer for std::sync::Arc<S> {
    fn handle(&self, request: &RequestDescriptor) -> RawResponse {
        (**self).handle(request)
    }
}

/// [`HttpClient`] that hands requests straight to a [`LoopbackServer`].
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Routes every request to `server`.
    pub fn new(server: S) -> Self {
        LoopbackClient { server }
    }

    /// The server behind this client.
    pub fn server(&self) -> &S {
        &self.server
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn execute(&self, request: &RequestDescriptor) -> Result<RawResponse, String> {
        Ok(self.server.handle(request))
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Replays canned outcomes; `None` stands for a refused connection.
    #[derive(Default)]
    struct CannedClient {
        outcomes: Mutex<VecDeque<Option<RawResponse>>>,
        down: AtomicBool,
        latency: Duration,
    }

    impl CannedClient {
        fn then(self, outcome: Option<RawResponse>) -> Self {
            self.outcomes.lock().push_back(outcome);
            self
        }
    }

    #[async_trait]
    impl HttpClient for CannedClient {
        async fn execute(&self, _request: &RequestDescriptor) -> Result<RawResponse, String> {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.outcomes
                .lock()
                .pop_front()
                .flatten()
                .ok_or_else(|| "connection refused".to_string())
        }

        fn is_healthy(&self) -> bool {
            !self.down.load(Ordering::SeqCst)
        }
    }

    fn todos() -> RequestDescriptor {
        ServiceEndpoint::new("https://api.example.com/").get("Todos")
    }

    fn transport(client: CannedClient) -> HttpTransport<CannedClient> {
        HttpTransport::new(client, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn closed_transport_fails_without_calling_client() {
        let http = transport(CannedClient::default().then(Some(RawResponse::ok_json(&json!([])))));
        assert!(http.is_connected());

        http.close();

        assert!(!http.is_connected());
        let err = http.send(todos()).await.unwrap_err();
        assert!(matches!(err, TransportError::Network { retryable: false, .. }));
        assert_eq!(http.client.outcomes.lock().len(), 1);
    }

    #[test]
    fn unhealthy_client_reports_disconnected() {
        let client = CannedClient::default();
        client.down.store(true, Ordering::SeqCst);
        assert!(!transport(client).is_connected());
    }

    #[tokio::test]
    async fn received_error_status_keeps_body() {
        let http = transport(CannedClient::default().then(Some(RawResponse::json(
            500,
            &json!({"ExceptionMessage": "db down"}),
        ))));

        let err = http.send(todos()).await.unwrap_err();

        assert_eq!(err.http_status(), Some(500));
        assert!(err.body().unwrap().contains("db down"));
        assert!(http.last_error().is_none());
    }

    #[tokio::test]
    async fn refused_connection_is_retryable_until_next_response() {
        let http = transport(
            CannedClient::default()
                .then(None)
                .then(Some(RawResponse::ok_json(&json!([{"Id": 1}])))),
        );

        let err = http.send(todos()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(http.last_error().as_deref(), Some("connection refused"));

        assert_eq!(http.send(todos()).await.unwrap().status, 200);
        assert!(http.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_exchange_times_out() {
        let client = CannedClient {
            latency: Duration::from_secs(10),
            ..CannedClient::default()
        }
        .then(Some(RawResponse::ok_json(&json!([]))));
        let http = transport(client);

        assert_eq!(http.send(todos()).await.unwrap_err(), TransportError::Timeout);
        assert_eq!(http.last_error().as_deref(), Some("request timed out"));
    }

    struct ResourceEcho;

    impl LoopbackServer for ResourceEcho {
        fn handle(&self, request: &RequestDescriptor) -> RawResponse {
            RawResponse::ok_json(&json!({ "resource": request.resource }))
        }
    }

    #[tokio::test]
    async fn loopback_routes_to_server() {
        let http = HttpTransport::new(LoopbackClient::new(ResourceEcho), Duration::from_secs(1));
        let request = RequestDescriptor::new(Method::Get, "svc/Orders", "Orders");
        let response = http.send(request).await.unwrap();
        assert_eq!(response.text(), r#"{"resource":"Orders"}"#);
    }
}
