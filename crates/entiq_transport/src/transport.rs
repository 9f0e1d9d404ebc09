//! Transport abstraction and the scripted test double.

use crate::ambient;
use crate::error::{TransportError, TransportResult};
use crate::request::{RawResponse, RequestDescriptor};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// A transport performs one request/response exchange with a service.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, loopback, scripted doubles for tests).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and waits for the raw response.
    ///
    /// Implementations reject non-2xx responses with
    /// [`TransportError::Status`] so callers can inspect status and body.
    async fn send(&self, request: RequestDescriptor) -> TransportResult<RawResponse>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

/// A reply programmed into a [`MockTransport`].
#[derive(Debug)]
pub enum MockReply {
    /// Answer with this response (non-2xx statuses become status errors).
    Respond(RawResponse),
    /// Fail with this error.
    Fail(TransportError),
    /// Stay pending until the matching [`DeferredReply`] is completed.
    Deferred(oneshot::Receiver<TransportResult<RawResponse>>),
}

impl From<RawResponse> for MockReply {
    fn from(response: RawResponse) -> Self {
        MockReply::Respond(response)
    }
}

impl From<TransportError> for MockReply {
    fn from(error: TransportError) -> Self {
        MockReply::Fail(error)
    }
}

/// Completion handle for a deferred mock reply.
#[derive(Debug)]
pub struct DeferredReply {
    sender: oneshot::Sender<TransportResult<RawResponse>>,
}

impl DeferredReply {
    /// Completes the pending call with a response.
    ///
    /// Returns false if the call was already abandoned.
    pub fn respond(self, response: RawResponse) -> bool {
        self.sender.send(Ok(response)).is_ok()
    }

    /// Completes the pending call with an error.
    pub fn fail(self, error: TransportError) -> bool {
        self.sender.send(Err(error)).is_ok()
    }
}

/// A scripted transport for deterministic tests.
///
/// Every `send` consumes the next programmed reply in order. Calling it
/// more often than replies exist rejects with
/// [`TransportError::Exhausted`]. Disabling the double rejects new calls
/// and every call still waiting on a deferred reply.
#[derive(Debug)]
pub struct MockTransport {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<RequestDescriptor>>,
    enabled: watch::Sender<bool>,
}

impl MockTransport {
    /// Creates an enabled mock transport with an empty script.
    pub fn new() -> Self {
        let (enabled, _) = watch::channel(true);
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            enabled,
        }
    }

    /// Creates a mock transport that answers with the given replies in order.
    pub fn with_replies<I, R>(replies: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<MockReply>,
    {
        let transport = Self::new();
        transport
            .replies
            .lock()
            .extend(replies.into_iter().map(Into::into));
        transport
    }

    /// Appends a canned response.
    pub fn push_response(&self, response: RawResponse) {
        self.replies.lock().push_back(MockReply::Respond(response));
    }

    /// Appends a canned JSON response.
    pub fn push_json(&self, status: u16, body: &serde_json::Value) {
        self.push_response(RawResponse::json(status, body));
    }

    /// Appends a canned failure.
    pub fn push_failure(&self, error: TransportError) {
        self.replies.lock().push_back(MockReply::Fail(error));
    }

    /// Appends a reply that stays pending until the returned handle completes it.
    pub fn defer(&self) -> DeferredReply {
        let (sender, receiver) = oneshot::channel();
        self.replies.lock().push_back(MockReply::Deferred(receiver));
        DeferredReply { sender }
    }

    /// Makes this double the process-wide active adapter and enables it.
    pub fn enable(self: &Arc<Self>) {
        self.enabled.send_replace(true);
        let adapter: Arc<dyn Transport> = Arc::clone(self) as Arc<dyn Transport>;
        ambient::install(adapter);
    }

    /// Disables this double.
    ///
    /// New calls reject with [`TransportError::Disabled`]; calls waiting on a
    /// deferred reply reject with [`TransportError::DisabledWhilePending`].
    /// If this double is the active ambient adapter it is removed.
    pub fn disable(&self) {
        self.enabled.send_replace(false);
        ambient::clear_if(self as *const Self as *const ());
    }

    /// Returns true if the double accepts calls.
    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// Returns every request received so far, in order.
    pub fn requests(&self) -> Vec<RequestDescriptor> {
        self.requests.lock().clone()
    }

    /// Returns the number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns the number of replies not yet consumed.
    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }

    async fn wait_deferred(
        &self,
        receiver: oneshot::Receiver<TransportResult<RawResponse>>,
    ) -> TransportResult<RawResponse> {
        let mut enabled = self.enabled.subscribe();
        let disabled = async move {
            let _ = enabled.wait_for(|on| !*on).await;
        };
        tokio::select! {
            reply = receiver => reply.unwrap_or_else(|_| {
                Err(TransportError::Protocol("deferred reply dropped before completion".into()))
            }),
            () = disabled => Err(TransportError::DisabledWhilePending),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: RequestDescriptor) -> TransportResult<RawResponse> {
        if !self.is_enabled() {
            return Err(TransportError::Disabled);
        }

        let calls = {
            let mut requests = self.requests.lock();
            requests.push(request);
            requests.len()
        };

        let reply = self.replies.lock().pop_front();
        let response = match reply {
            None => {
                tracing::debug!(calls, "mock transport exhausted");
                return Err(TransportError::Exhausted { calls });
            }
            Some(MockReply::Respond(response)) => response,
            Some(MockReply::Fail(error)) => return Err(error),
            Some(MockReply::Deferred(receiver)) => self.wait_deferred(receiver).await?,
        };

        response.error_for_status()
    }

    fn name(&self) -> &str {
        "mock"
    }
}
