//! Transport abstraction for sync requests.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tidemark_protocol::{PullRequest, PullResponse, PushRequest, PushResponse};

/// A synchronous request/response channel to the sync server.
///
/// The wire itself is out of scope here: implement this over HTTP, a unix
/// socket, or an in-process loopback, as long as each call either returns
/// the server's complete response or an error. Partial responses must
/// surface as errors, never as truncated payloads — the orchestrator relies
/// on that to keep cancellation from half-applying anything.
pub trait SyncTransport: Send + Sync {
    /// Sends a pull request.
    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse>;

    /// Sends a push request.
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;
}

impl<T: SyncTransport + ?Sized> SyncTransport for std::sync::Arc<T> {
    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        (**self).pull(request)
    }

    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        (**self).push(request)
    }
}

/// A scripted transport for tests.
///
/// Responses are queued and consumed in order; running out of scripted
/// responses is a test bug and returns a fatal transport error. Requests
/// are recorded for assertions.
#[derive(Default)]
pub struct MockTransport {
    pull_responses: Mutex<VecDeque<SyncResult<PullResponse>>>,
    push_responses: Mutex<VecDeque<SyncResult<PushResponse>>>,
    pull_requests: Mutex<Vec<PullRequest>>,
    push_requests: Mutex<Vec<PushRequest>>,
}

impl MockTransport {
    /// Creates an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a pull response.
    pub fn queue_pull(&self, response: SyncResult<PullResponse>) {
        self.pull_responses.lock().push_back(response);
    }

    /// Queues a push response.
    pub fn queue_push(&self, response: SyncResult<PushResponse>) {
        self.push_responses.lock().push_back(response);
    }

    /// Returns every pull request seen so far.
    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.pull_requests.lock().clone()
    }

    /// Returns every push request seen so far.
    pub fn push_requests(&self) -> Vec<PushRequest> {
        self.push_requests.lock().clone()
    }
}

impl SyncTransport for MockTransport {
    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.pull_requests.lock().push(request.clone());
        self.pull_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::transport_fatal("no scripted pull response")))
    }

    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.push_requests.lock().push(request.clone());
        self.push_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::transport_fatal("no scripted push response")))
    }
}
