//! Completion handles and the retryable unit of work dispatched by the
//! controller's worker (spec §3 "Task", §4.2.2).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use reg_primitives::{RegistryUrl, UrlKey};
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::RegistryError;

/// What a task resolves to: the URL it operated on, or the error that
/// ultimately failed it (after retries were exhausted or the registry
/// closed).
pub type UrlResult = std::result::Result<RegistryUrl, RegistryError>;

/// A cloneable future over a task's eventual [`UrlResult`].
pub type UrlFuture = Shared<BoxFuture<'static, UrlResult>>;

/// What the registry's own `open()`/`close()` resolve to: nothing but
/// success, or the error that made the transition fail.
pub type VoidResult = std::result::Result<(), RegistryError>;

/// A cloneable future over a [`VoidResult`].
pub type VoidFuture = Shared<BoxFuture<'static, VoidResult>>;

/// A one-shot completion handle whose future can be cloned and awaited by
/// multiple callers (`register()` called twice on the same key returns the
/// same future, per spec §4.1). Generic over the resolved value so the
/// same plumbing backs both per-task URL futures and the facade's void
/// open/close futures.
#[derive(Clone)]
pub struct GenericCompletion<T: Clone + Send + 'static> {
    future: Shared<BoxFuture<'static, std::result::Result<T, RegistryError>>>,
    sender: Arc<Mutex<Option<oneshot::Sender<std::result::Result<T, RegistryError>>>>>,
}

impl<T: Clone + Send + 'static> fmt::Debug for GenericCompletion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericCompletion")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for GenericCompletion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> GenericCompletion<T> {
    /// Creates a fresh, unresolved completion handle.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel::<std::result::Result<T, RegistryError>>();
        let future: Pin<Box<dyn Future<Output = std::result::Result<T, RegistryError>> + Send>> =
            Box::pin(async move {
                rx.await
                    .unwrap_or_else(|_| Err(RegistryError::AlreadyClosed))
            });
        Self {
            future: future.shared(),
            sender: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Returns a cloneable future over this completion's eventual result.
    #[must_use]
    pub fn future(&self) -> Shared<BoxFuture<'static, std::result::Result<T, RegistryError>>> {
        self.future.clone()
    }

    /// Resolves the completion. Only the first call has any effect; later
    /// calls are no-ops, matching "executable once" semantics of a task.
    pub fn complete(&self, result: std::result::Result<T, RegistryError>) {
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(result);
        }
    }

    /// Returns `true` once [`GenericCompletion::complete`] has been called.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Completion handle for a task resolving to the [`RegistryUrl`] it operated
/// on (register/deregister/subscribe/unsubscribe).
pub type Completion = GenericCompletion<RegistryUrl>;

/// Completion handle for the facade's `open()`/`close()`, which carry no
/// payload beyond success or failure.
pub type VoidCompletion = GenericCompletion<()>;

/// Distinguishes the four retryable operations a [`Task`] can perform,
/// purely for logging and test assertions — dispatch itself is driven by
/// the task's `body` closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Transmit a local registration to the remote registry.
    Register,
    /// Remove a local registration from the remote registry.
    Deregister,
    /// Start a cluster or config subscription stream.
    Subscribe,
    /// Stop a cluster or config subscription stream.
    Unsubscribe,
    /// Re-attempt the initial or a subsequent connect.
    Reconnect,
}

/// The async body a task runs each time it is dispatched. Returns `Ok(true)`
/// on success, `Ok(false)` to request a retry, and `Err` to request a retry
/// (subject to the retry policy) after logging the failure.
pub type TaskBody = Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<bool, RegistryError>> + Send + Sync>;

/// A single retryable unit of work queued on the dispatcher (spec §3, §4.2.2).
#[derive(Clone)]
pub struct Task {
    kind: TaskKind,
    key: UrlKey,
    completion: Completion,
    body: TaskBody,
    /// When this task becomes eligible to run.
    retry_time: Instant,
    /// Retry budget: `None` means retry forever while the registry stays
    /// open; `Some(n)` means fail after `n` additional retries (used by
    /// `deregister(url, maxRetryTimes)`).
    retries_left: Option<u32>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind)
            .field("key", self.key.key())
            .field("retry_time", &self.retry_time)
            .field("retries_left", &self.retries_left)
            .finish()
    }
}

impl Task {
    /// Creates a new task, immediately eligible to run.
    #[must_use]
    pub fn new(
        kind: TaskKind,
        key: UrlKey,
        completion: Completion,
        body: TaskBody,
        retries_left: Option<u32>,
    ) -> Self {
        Self {
            kind,
            key,
            completion,
            body,
            retry_time: Instant::now(),
            retries_left,
        }
    }

    /// Returns the task's kind.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Returns the identity key this task operates on.
    #[must_use]
    pub fn key(&self) -> &UrlKey {
        &self.key
    }

    /// Returns the URL this task operates on.
    #[must_use]
    pub fn url(&self) -> &RegistryUrl {
        self.key.url()
    }

    /// Returns the instant at which this task becomes eligible to run.
    #[must_use]
    pub const fn retry_time(&self) -> Instant {
        self.retry_time
    }

    /// Returns the completion handle this task will resolve.
    #[must_use]
    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Executes the task body once. On success the completion resolves
    /// with the task's URL. On failure, returns a clone of `self` with a
    /// bumped `retry_time` and decremented budget when the registry is
    /// still open and the budget allows another attempt; otherwise the
    /// completion is failed and `None` is returned.
    pub async fn run(self, is_open: bool, retry_interval: Duration) -> Option<Task> {
        let outcome = (self.body)().await;

        let succeeded = match outcome {
            Ok(true) => true,
            Ok(false) => false,
            Err(ref err) => {
                warn!(kind = ?self.kind, url = %self.key.url(), error = %err, "task body failed");
                false
            }
        };

        if succeeded {
            self.completion.complete(Ok(self.key.url().clone()));
            return None;
        }

        let failure = match outcome {
            Err(err) => err,
            Ok(false) => RegistryError::retryable("task body returned false"),
            Ok(true) => unreachable!(),
        };

        if !is_open {
            self.completion.complete(Err(RegistryError::AlreadyClosed));
            return None;
        }

        match self.retries_left {
            Some(0) => {
                self.completion.complete(Err(failure));
                None
            }
            Some(remaining) => Some(Task {
                retry_time: Instant::now() + retry_interval,
                retries_left: Some(remaining - 1),
                ..self
            }),
            None => Some(Task {
                retry_time: Instant::now() + retry_interval,
                ..self
            }),
        }
    }
}
