//! Remote gateway abstraction.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use drawsync_protocol::{Cursor, PullResponse, PushResponse, Record, Scope};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pull/push access to the remote authoritative store.
///
/// This trait abstracts the backend API so the engine can run against
/// HTTP clients, in-process stores, or mocks. Implementations report
/// transient failures as retryable [`SyncError::Network`] errors and
/// credential problems as [`SyncError::Auth`].
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Fetches changes in `scope` after `cursor`.
    async fn pull(&self, scope: &Scope, cursor: Cursor) -> SyncResult<PullResponse>;

    /// Sends local records for `scope`.
    async fn push(&self, scope: &Scope, records: Vec<Record>) -> SyncResult<PushResponse>;

    /// Checks whether the remote is reachable.
    async fn test_connection(&self) -> bool;
}

#[async_trait]
impl<T: RemoteGateway + ?Sized> RemoteGateway for Arc<T> {
    async fn pull(&self, scope: &Scope, cursor: Cursor) -> SyncResult<PullResponse> {
        (**self).pull(scope, cursor).await
    }

    async fn push(&self, scope: &Scope, records: Vec<Record>) -> SyncResult<PushResponse> {
        (**self).push(scope, records).await
    }

    async fn test_connection(&self) -> bool {
        (**self).test_connection().await
    }
}

/// A scripted reply for [`MockGateway`].
#[derive(Debug, Clone)]
pub enum MockReply<T> {
    /// Return this value.
    Respond(T),
    /// Fail with a retryable network error.
    NetworkError(String),
    /// Fail with an authentication error.
    AuthError(String),
    /// Never answer (exercises timeouts).
    Hang,
}

/// A scripted gateway for tests.
///
/// Scripted replies are consumed in order; once a script is empty, pulls
/// return an empty response at the requested cursor and pushes acknowledge
/// every record.
#[derive(Debug, Default)]
pub struct MockGateway {
    connected: AtomicBool,
    pull_script: Mutex<VecDeque<MockReply<PullResponse>>>,
    push_script: Mutex<VecDeque<MockReply<PushResponse>>>,
    pushed: Mutex<Vec<Vec<Record>>>,
    pull_calls: AtomicUsize,
    push_calls: AtomicUsize,
    latency: Mutex<Duration>,
}

impl MockGateway {
    /// Creates a connected mock gateway with empty scripts.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Queues a pull reply.
    pub fn push_pull_reply(&self, reply: MockReply<PullResponse>) {
        self.pull_script.lock().push_back(reply);
    }

    /// Queues a push reply.
    pub fn push_push_reply(&self, reply: MockReply<PushResponse>) {
        self.push_script.lock().push_back(reply);
    }

    /// Adds latency to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Sets the connected state reported by `test_connection`.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of pull calls made.
    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    /// Number of push calls made.
    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Every batch passed to `push`, in call order.
    pub fn pushed_batches(&self) -> Vec<Vec<Record>> {
        self.pushed.lock().clone()
    }

    async fn answer<T>(&self, reply: Option<MockReply<T>>, default: T) -> SyncResult<T> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match reply {
            None => Ok(default),
            Some(MockReply::Respond(value)) => Ok(value),
            Some(MockReply::NetworkError(message)) => Err(SyncError::network_retryable(message)),
            Some(MockReply::AuthError(message)) => Err(SyncError::Auth(message)),
            Some(MockReply::Hang) => std::future::pending().await,
        }
    }
}

#[async_trait]
impl RemoteGateway for MockGateway {
    async fn pull(&self, _scope: &Scope, cursor: Cursor) -> SyncResult<PullResponse> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.pull_script.lock().pop_front();
        self.answer(reply, PullResponse::empty(cursor)).await
    }

    async fn push(&self, _scope: &Scope, records: Vec<Record>) -> SyncResult<PushResponse> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        let default = PushResponse::acked(records.iter().map(|r| r.id.clone()).collect());
        self.pushed.lock().push(records);
        let reply = self.push_script.lock().pop_front();
        self.answer(reply, default).await
    }

    async fn test_connection(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
